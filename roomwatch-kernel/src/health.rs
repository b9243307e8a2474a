use crate::broker::ConnectionState;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Serialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub connection_state: ConnectionState,
    pub active_endpoint: Option<String>,
    pub reconnects: u32,
    pub messages_dropped: u32,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    reconnects: Arc<AtomicU32>,
    dropped: Arc<AtomicU32>,
    link: Arc<parking_lot::Mutex<(ConnectionState, Option<String>)>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            reconnects: Arc::new(AtomicU32::new(0)),
            dropped: Arc::new(AtomicU32::new(0)),
            link: Arc::new(parking_lot::Mutex::new((ConnectionState::Disconnected, None))),
        }
    }

    pub fn record_state(&self, state: ConnectionState) {
        let mut link = self.link.lock();
        link.0 = state;
        if state != ConnectionState::Connected {
            link.1 = None;
        }
    }

    pub fn mark_connected(&self, endpoint: String) {
        *self.link.lock() = (ConnectionState::Connected, Some(endpoint));
    }

    pub fn increment_reconnects(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_health(&self) -> KernelHealth {
        let (connection_state, active_endpoint) = self.link.lock().clone();
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            connection_state,
            active_endpoint,
            reconnects: self.reconnects.load(Ordering::Relaxed),
            messages_dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_cleared_when_link_drops() {
        let health = HealthTracker::new();
        health.mark_connected("broker-a:1883".into());
        assert_eq!(health.get_health().active_endpoint.as_deref(), Some("broker-a:1883"));

        health.record_state(ConnectionState::Disconnected);
        health.increment_reconnects();
        let h = health.get_health();
        assert_eq!(h.connection_state, ConnectionState::Disconnected);
        assert_eq!(h.active_endpoint, None);
        assert_eq!(h.reconnects, 1);
    }
}
