/**
 * EVENTS - Diffusion de l'état vers les collaborateurs UI
 *
 * RÔLE :
 * Turns internal state changes into typed events. Knows nothing about the UI
 * technology on the other side (SSE endpoint, desktop widget, test harness).
 *
 * FONCTIONNEMENT :
 * - tokio broadcast channel, bounded
 * - emit() never blocks: no subscriber = event dropped, slow subscriber = lagged
 */

use crate::broker::ConnectionState;
use crate::models::ControlConfig;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KernelEvent {
    TemperatureObserved { value: f64 },
    MotionObserved { detected: bool, alarm_annotated: bool },
    CoolingCommandChanged { on: bool },
    ConfigChanged { snapshot: ControlConfig },
    AlarmRaised,
    OverrideChanged { active: bool, cooling_on: bool },
    ConnectionStateChanged { state: ConnectionState },
    MessageDropped { topic: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<KernelEvent>,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: KernelEvent) {
        if self.tx.send(event).is_err() {
            trace!("event dropped, no subscriber");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KernelEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}
