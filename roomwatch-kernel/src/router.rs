/**
 * ROUTER - Aiguillage des messages entrants
 *
 * RÔLE :
 * Maps an inbound (topic, bytes) pair onto one of the four topic roles, opens
 * the envelope, decodes the payload and hands it to the controller.
 *
 * FONCTIONNEMENT :
 * - exact topic equality, unknown topics are ignored
 * - any decode failure drops the message: warn log + MessageDropped event +
 *   health counter; the inbound loop keeps running
 * - Cooling payloads are only displayed (CoolingCommandChanged)
 */

use crate::broker::InboundMessage;
use crate::controller::Controller;
use crate::envelope::Envelope;
use crate::error::{ConfigValidationError, DecodeError};
use crate::events::KernelEvent;
use crate::health::HealthTracker;
use crate::models::{parse_motion, parse_temperature, ConfigPatch, CoolingCommand, Reading};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicRole {
    Temperature,
    Motion,
    Cooling,
    Config,
}

impl TopicRole {
    pub const ALL: [TopicRole; 4] = [TopicRole::Temperature, TopicRole::Motion, TopicRole::Cooling, TopicRole::Config];

    pub fn name(self) -> &'static str {
        match self {
            TopicRole::Temperature => "temperature",
            TopicRole::Motion => "motion",
            TopicRole::Cooling => "cooling",
            TopicRole::Config => "config",
        }
    }
}

impl fmt::Display for TopicRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One topic per role for the whole deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicMap {
    pub temperature: String,
    pub motion: String,
    pub cooling: String,
    pub config: String,
}

impl Default for TopicMap {
    fn default() -> Self {
        Self {
            temperature: "public/server-room/temp".into(),
            motion: "public/server-room/motion".into(),
            cooling: "public/server-room/cooling".into(),
            config: "public/server-room/config".into(),
        }
    }
}

impl TopicMap {
    pub fn topic(&self, role: TopicRole) -> &str {
        match role {
            TopicRole::Temperature => &self.temperature,
            TopicRole::Motion => &self.motion,
            TopicRole::Cooling => &self.cooling,
            TopicRole::Config => &self.config,
        }
    }

    pub fn set(&mut self, role: TopicRole, topic: impl Into<String>) {
        let slot = match role {
            TopicRole::Temperature => &mut self.temperature,
            TopicRole::Motion => &mut self.motion,
            TopicRole::Cooling => &mut self.cooling,
            TopicRole::Config => &mut self.config,
        };
        *slot = topic.into();
    }

    pub fn role_of(&self, topic: &str) -> Option<TopicRole> {
        TopicRole::ALL.into_iter().find(|r| self.topic(*r) == topic)
    }

    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        for (i, role) in TopicRole::ALL.iter().enumerate() {
            let topic = self.topic(*role);
            if topic.trim().is_empty() {
                return Err(ConfigValidationError::EmptyTopic(role.name()));
            }
            if TopicRole::ALL[i + 1..].iter().any(|other| self.topic(*other) == topic) {
                return Err(ConfigValidationError::DuplicateTopic(topic.to_string()));
            }
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct TopicRouter {
    controller: Controller,
    health: HealthTracker,
}

impl TopicRouter {
    pub fn new(controller: Controller, health: HealthTracker) -> Self {
        Self { controller, health }
    }

    /// Called by the inbound loop for every message, never fails
    pub fn route(&self, msg: &InboundMessage) {
        let Some(role) = self.controller.topics().role_of(&msg.topic) else {
            debug!(topic = %msg.topic, "ignoring message on unknown topic");
            return;
        };

        if let Err(e) = self.dispatch(role, &msg.payload) {
            warn!(topic = %msg.topic, %role, error = %e, "message dropped");
            self.health.increment_dropped();
            self.controller.events().emit(KernelEvent::MessageDropped {
                topic: msg.topic.clone(),
                reason: e.to_string(),
            });
        }
    }

    fn dispatch(&self, role: TopicRole, payload: &[u8]) -> Result<(), DecodeError> {
        let plaintext = self.controller.codec().open(&Envelope::from_bytes(payload))?;
        debug!(%role, payload = %plaintext, "inbound");

        match role {
            TopicRole::Temperature => {
                let value = parse_temperature(&plaintext)?;
                self.controller.ingest_remote(Reading::Temperature(value));
            }
            TopicRole::Motion => {
                let detected = parse_motion(&plaintext)?;
                self.controller.ingest_remote(Reading::Motion(detected));
            }
            TopicRole::Cooling => {
                let cmd = CoolingCommand::parse(&plaintext)?;
                self.controller.events().emit(KernelEvent::CoolingCommandChanged { on: cmd.is_on() });
            }
            TopicRole::Config => {
                let patch = ConfigPatch::from_json(&plaintext)?;
                self.controller.apply_remote_config(&patch);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BusHandle;
    use crate::envelope::{EnvelopeCodec, SymmetricKey};
    use crate::events::EventBroadcaster;
    use crate::models::ControlConfig;
    use std::sync::Arc;
    use tokio::sync::broadcast;

    fn setup() -> (TopicRouter, Arc<EnvelopeCodec>, broadcast::Receiver<KernelEvent>, HealthTracker) {
        let codec = Arc::new(EnvelopeCodec::encrypted(&SymmetricKey::generate().unwrap()));
        let events = EventBroadcaster::new(64);
        let rx = events.subscribe();
        let controller = Controller::new(
            ControlConfig { temp_threshold: 28.0, ..ControlConfig::default() },
            BusHandle::new(),
            events,
            codec.clone(),
            TopicMap::default(),
        );
        let health = HealthTracker::new();
        (TopicRouter::new(controller, health.clone()), codec, rx, health)
    }

    fn sealed(codec: &EnvelopeCodec, topic: &str, payload: &str) -> InboundMessage {
        InboundMessage { topic: topic.into(), payload: codec.seal(payload).into_bytes() }
    }

    fn drain(rx: &mut broadcast::Receiver<KernelEvent>) -> Vec<KernelEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[test]
    fn test_topic_map_roles() {
        let topics = TopicMap::default();
        assert_eq!(topics.role_of("public/server-room/temp"), Some(TopicRole::Temperature));
        assert_eq!(topics.role_of("public/server-room/temp/"), None);
        assert_eq!(topics.role_of("elsewhere"), None);
        topics.validate().unwrap();

        let mut bad = topics.clone();
        bad.set(TopicRole::Config, "");
        assert_eq!(bad.validate(), Err(ConfigValidationError::EmptyTopic("config")));
    }

    #[test]
    fn test_temperature_is_observed() {
        let (router, codec, mut rx, _) = setup();
        router.route(&sealed(&codec, "public/server-room/temp", "31.5"));
        let events = drain(&mut rx);
        assert!(events.contains(&KernelEvent::TemperatureObserved { value: 31.5 }));
        assert!(events.contains(&KernelEvent::CoolingCommandChanged { on: true }));
    }

    #[test]
    fn test_malformed_config_keeps_threshold() {
        let (router, codec, mut rx, health) = setup();
        router.route(&sealed(&codec, "public/server-room/config", r#"{"tempThreshold": "not-a-number"}"#));

        assert_eq!(router.controller.snapshot().config.temp_threshold, 28.0);
        assert!(matches!(drain(&mut rx).as_slice(), [KernelEvent::MessageDropped { .. }]));
        assert_eq!(health.get_health().messages_dropped, 1);
    }

    #[test]
    fn test_config_patch_is_merged() {
        let (router, codec, mut rx, _) = setup();
        router.route(&sealed(&codec, "public/server-room/config", r#"{"tempThreshold": "30", "alarm_enabled": false}"#));

        let snap = router.controller.snapshot().config;
        assert_eq!(snap.temp_threshold, 30.0);
        assert!(!snap.alarm_enabled);
        assert!(matches!(drain(&mut rx).as_slice(), [KernelEvent::ConfigChanged { .. }]));
    }

    #[test]
    fn test_foreign_key_is_dropped() {
        let (router, _, mut rx, health) = setup();
        let other = EnvelopeCodec::encrypted(&SymmetricKey::generate().unwrap());
        router.route(&sealed(&other, "public/server-room/temp", "30"));
        router.route(&InboundMessage { topic: "public/server-room/motion".into(), payload: b"garbage".to_vec() });

        assert_eq!(health.get_health().messages_dropped, 2);
        assert!(drain(&mut rx).iter().all(|e| matches!(e, KernelEvent::MessageDropped { .. })));
        assert_eq!(router.controller.snapshot().last_temperature, None);
    }

    #[test]
    fn test_cooling_is_displayed() {
        let (router, codec, mut rx, _) = setup();
        router.route(&sealed(&codec, "public/server-room/cooling", "OFF"));
        assert_eq!(drain(&mut rx), vec![KernelEvent::CoolingCommandChanged { on: false }]);
    }

    #[test]
    fn test_unknown_topic_is_ignored() {
        let (router, codec, mut rx, health) = setup();
        router.route(&sealed(&codec, "public/server-room/humidity", "55"));
        assert!(drain(&mut rx).is_empty());
        assert_eq!(health.get_health().messages_dropped, 0);
    }
}
