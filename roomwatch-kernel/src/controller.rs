/**
 * CONTROLLER - Propriétaire unique de l'état de contrôle
 *
 * RÔLE :
 * Holds the one ControllerState of the process (config, override, last
 * temperature). Every mutation, from the router, the producer or an operator,
 * goes through these methods and the single lock.
 *
 * FONCTIONNEMENT :
 * - cooling commands are decided and published under the same lock, so the
 *   bus sees them in decision order
 * - derived commands are published on every computation, even when unchanged
 * - a failed publish never rolls back the local change
 */

use crate::broker::BusHandle;
use crate::envelope::EnvelopeCodec;
use crate::error::{BusError, ConfigValidationError, ControlError};
use crate::events::{EventBroadcaster, KernelEvent};
use crate::models::{
    format_motion, format_temperature, ConfigPatch, ControlConfig, CoolingCommand, Reading, SensorReading,
};
use crate::policy::{self, Mode};
use crate::router::{TopicMap, TopicRole};
use crate::state::{new_state, ControllerState, Shared, StateSnapshot};
use crate::window::{parse_time_of_day, Clock, SystemClock};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct Controller {
    state: Shared<ControllerState>,
    bus: BusHandle,
    events: EventBroadcaster,
    codec: Arc<EnvelopeCodec>,
    topics: Arc<TopicMap>,
    clock: Arc<dyn Clock>,
    cooling_control: bool,
}

impl Controller {
    pub fn new(
        config: ControlConfig,
        bus: BusHandle,
        events: EventBroadcaster,
        codec: Arc<EnvelopeCodec>,
        topics: TopicMap,
    ) -> Self {
        Self {
            state: new_state(ControllerState::new(config)),
            bus,
            events,
            codec,
            topics: Arc::new(topics),
            clock: Arc::new(SystemClock::default()),
            cooling_control: true,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Whether temperature readings drive published cooling commands
    pub fn with_cooling_control(mut self, enabled: bool) -> Self {
        self.cooling_control = enabled;
        self
    }

    pub fn topics(&self) -> &TopicMap {
        &self.topics
    }

    pub fn codec(&self) -> &EnvelopeCodec {
        &self.codec
    }

    pub fn events(&self) -> &EventBroadcaster {
        &self.events
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.state.lock().snapshot()
    }

    // ---- readings ----

    /// A reading produced on this node: published on its topic, then processed
    /// exactly like one received from the bus.
    pub fn ingest_local(&self, reading: Reading) -> Result<(), BusError> {
        match reading {
            Reading::Temperature(value) => {
                let sent = self.publish(TopicRole::Temperature, &format_temperature(value));
                let derived = self.on_temperature(value);
                sent.and(derived)
            }
            Reading::Motion(detected) => {
                let alarm = self.alarm_for(detected);
                let sent = self.publish(TopicRole::Motion, &format_motion(detected, alarm));
                self.announce_motion(detected, alarm);
                sent
            }
        }
    }

    /// A reading decoded from the bus. Publish failures of derived commands are
    /// logged; the inbound loop carries on.
    pub fn ingest_remote(&self, reading: Reading) {
        match reading {
            Reading::Temperature(value) => {
                if let Err(e) = self.on_temperature(value) {
                    debug!(error = %e, "cooling command not published");
                }
            }
            Reading::Motion(detected) => {
                let alarm = self.alarm_for(detected);
                self.announce_motion(detected, alarm);
            }
        }
    }

    fn on_temperature(&self, value: f64) -> Result<(), BusError> {
        let mut st = self.state.lock();
        st.last_temperature = Some(SensorReading::now(Reading::Temperature(value)));
        let mode = Mode::from(st.override_state);
        let command = self
            .cooling_control
            .then(|| policy::cooling_for_reading(&st.config, mode, value))
            .flatten();

        self.events.emit(KernelEvent::TemperatureObserved { value });
        // guard held until the command is out
        match command {
            Some(cmd) => self.send_cooling(cmd),
            None => Ok(()),
        }
    }

    fn alarm_for(&self, detected: bool) -> bool {
        let cfg = self.state.lock().config.clone();
        policy::alarm_for_motion(&cfg, detected, self.clock.time_of_day())
    }

    fn announce_motion(&self, detected: bool, alarm: bool) {
        self.events.emit(KernelEvent::MotionObserved { detected, alarm_annotated: alarm });
        if alarm {
            info!("motion during alarm hours");
            self.events.emit(KernelEvent::AlarmRaised);
        }
    }

    // ---- operator commands ----

    /// Updates the threshold locally and publishes a `{temp_threshold}` patch
    pub fn set_threshold(&self, threshold: f64) -> Result<(), ControlError> {
        if !threshold.is_finite() {
            return Err(ConfigValidationError::Threshold(threshold).into());
        }
        self.update_config(|cfg| cfg.temp_threshold = threshold);

        let patch = ConfigPatch { temp_threshold: Some(threshold), ..ConfigPatch::default() };
        self.publish(TopicRole::Config, &patch.to_json())?;
        Ok(())
    }

    pub fn set_alert_enabled(&self, enabled: bool) {
        self.update_config(|cfg| cfg.alert_enabled = enabled);
    }

    /// Both bounds are parsed before anything changes
    pub fn set_alarm_window(&self, start: &str, end: &str) -> Result<(), ConfigValidationError> {
        let start = parse_time_of_day(start)?;
        let end = parse_time_of_day(end)?;
        self.update_config(|cfg| {
            cfg.alarm_start = start;
            cfg.alarm_end = end;
        });
        Ok(())
    }

    pub fn set_alarm_enabled(&self, enabled: bool) {
        self.update_config(|cfg| cfg.alarm_enabled = enabled);
    }

    /// Enabling without a cooling value forces cooling off. Releasing the
    /// override re-evaluates the last temperature only on a cooling-control node.
    pub fn set_override(&self, enabled: bool, cooling: Option<bool>) -> Result<(), ControlError> {
        let mut st = self.state.lock();
        st.override_state.active = enabled;
        match (enabled, cooling) {
            (_, Some(on)) => st.override_state.manual_cooling_on = on,
            (true, None) => st.override_state.manual_cooling_on = false,
            (false, None) => {}
        }
        let state = st.override_state;
        let mode = Mode::from(state);
        let last = st.last_temperature_value().filter(|_| self.cooling_control);
        let command = policy::cooling_after_override_change(&st.config, mode, last);

        info!(active = state.active, cooling_on = state.manual_cooling_on, "override changed");
        self.events.emit(KernelEvent::OverrideChanged {
            active: state.active,
            cooling_on: state.manual_cooling_on,
        });
        if let Some(cmd) = command {
            self.send_cooling(cmd)?;
        }
        Ok(())
    }

    /// Publishes the whole current config so every node converges on it
    pub fn republish_config(&self) -> Result<(), ControlError> {
        let patch = ConfigPatch::from(&self.state.lock().config);
        self.publish(TopicRole::Config, &patch.to_json())?;
        Ok(())
    }

    /// Merge of a patch received on the Config topic (last writer wins)
    pub fn apply_remote_config(&self, patch: &ConfigPatch) {
        if patch.is_empty() {
            debug!("config message without known keys");
            return;
        }
        self.update_config(|cfg| cfg.apply(patch));
    }

    // ---- plumbing ----

    fn update_config(&self, change: impl FnOnce(&mut ControlConfig)) {
        let snapshot = {
            let mut st = self.state.lock();
            change(&mut st.config);
            st.config.clone()
        };
        debug!(config = ?snapshot, "config changed");
        self.events.emit(KernelEvent::ConfigChanged { snapshot });
    }

    fn send_cooling(&self, cmd: CoolingCommand) -> Result<(), BusError> {
        self.events.emit(KernelEvent::CoolingCommandChanged { on: cmd.is_on() });
        self.publish(TopicRole::Cooling, cmd.as_wire())
    }

    fn publish(&self, role: TopicRole, payload: &str) -> Result<(), BusError> {
        let topic = self.topics.topic(role);
        self.bus.publish(topic, self.codec.seal(payload)).inspect_err(|e| {
            warn!(topic, %role, error = %e, "publish failed");
        })
    }
}
