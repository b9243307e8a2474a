use crate::broker::BrokerEndpoint;
use crate::error::ConfigValidationError;
use crate::models::ControlConfig;
use crate::router::{TopicMap, TopicRole};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct KernelConfig {
    pub mqtt: MqttConf,
    pub topics: TopicMap,
    pub encryption: EncryptionConf,
    /// Control settings in force until an operator or the Config topic changes them
    pub defaults: ControlConfig,
    pub roles: RolesConf,
    pub producer: ProducerConf,
    pub http: HttpConf,
    pub events: EventsConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConf {
    /// Preference order: first is the primary, the rest are fallbacks
    pub brokers: Vec<BrokerEndpoint>,
    pub client_id: Option<String>,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
    pub retry_delay_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct EncryptionConf {
    pub enabled: bool,
    pub key_path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RolesConf {
    /// Derive and publish cooling commands from temperature readings
    pub cooling_control: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ProducerConf {
    pub enabled: bool,
    pub interval_secs: u64,
    pub temperature_min: f64,
    pub temperature_max: f64,
    pub motion_probability: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub enabled: bool,
    pub bind: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct EventsConf {
    pub capacity: usize,
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            brokers: vec![BrokerEndpoint::new("localhost", 1883)],
            client_id: None,
            keep_alive_secs: 30,
            connect_timeout_secs: 5,
            retry_delay_secs: 5,
        }
    }
}

impl MqttConf {
    pub fn client_id(&self) -> String {
        self.client_id.clone().unwrap_or_else(|| {
            let id = uuid::Uuid::new_v4().simple().to_string();
            format!("roomwatch-{}", &id[..8])
        })
    }
}

impl Default for EncryptionConf {
    fn default() -> Self {
        Self { enabled: true, key_path: PathBuf::from("encryption.key") }
    }
}

impl Default for RolesConf {
    fn default() -> Self {
        Self { cooling_control: true }
    }
}

impl Default for ProducerConf {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 5,
            temperature_min: 20.0,
            temperature_max: 30.0,
            motion_probability: 0.5,
        }
    }
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { enabled: true, bind: "0.0.0.0:8080".into() }
    }
}

impl Default for EventsConf {
    fn default() -> Self {
        Self { capacity: 256 }
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            mqtt: MqttConf::default(),
            topics: TopicMap::default(),
            encryption: EncryptionConf::default(),
            defaults: ControlConfig::default(),
            roles: RolesConf::default(),
            producer: ProducerConf::default(),
            http: HttpConf::default(),
            events: EventsConf::default(),
        }
    }
}

impl KernelConfig {
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.mqtt.brokers.is_empty() {
            return Err(ConfigValidationError::NoBrokers);
        }
        if let Some(bad) = self.mqtt.brokers.iter().find(|b| b.host.trim().is_empty() || b.port == 0) {
            return Err(ConfigValidationError::Endpoint(bad.to_string()));
        }
        self.topics.validate()?;
        self.defaults.validate()?;

        let p = &self.producer;
        if p.enabled {
            if p.interval_secs == 0 {
                return Err(ConfigValidationError::Other("producer.interval_secs must be > 0".into()));
            }
            if !(p.temperature_min.is_finite() && p.temperature_max.is_finite() && p.temperature_min <= p.temperature_max) {
                return Err(ConfigValidationError::Other("producer temperature range is empty".into()));
            }
            if !(0.0..=1.0).contains(&p.motion_probability) {
                return Err(ConfigValidationError::Other("producer.motion_probability must be within 0..=1".into()));
            }
        }
        Ok(())
    }

    /// Topics this node listens to. Readings the node produces itself are not
    /// subscribed, it would only receive its own echo.
    pub fn subscriptions(&self) -> Vec<String> {
        let mut roles = vec![TopicRole::Cooling, TopicRole::Config];
        if !self.producer.enabled {
            roles.insert(0, TopicRole::Motion);
            roles.insert(0, TopicRole::Temperature);
        }
        roles.into_iter().map(|r| self.topics.topic(r).to_string()).collect()
    }

    /// `ROOMWATCH_*` variables win over the file
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigValidationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        for (var, role) in [
            ("ROOMWATCH_TOPIC_TEMPERATURE", TopicRole::Temperature),
            ("ROOMWATCH_TOPIC_MOTION", TopicRole::Motion),
            ("ROOMWATCH_TOPIC_COOLING", TopicRole::Cooling),
            ("ROOMWATCH_TOPIC_CONFIG", TopicRole::Config),
        ] {
            if let Some(topic) = lookup(var) {
                self.topics.set(role, topic);
            }
        }

        for (var, slot) in [("ROOMWATCH_PRIMARY_BROKER", 0usize), ("ROOMWATCH_FALLBACK_BROKER", 1)] {
            let Some(raw) = lookup(var) else { continue };
            let mut endpoint = BrokerEndpoint::parse(&raw).ok_or(ConfigValidationError::Endpoint(raw))?;
            match self.mqtt.brokers.get_mut(slot) {
                Some(existing) => {
                    endpoint.credentials = existing.credentials.take();
                    *existing = endpoint;
                }
                None => self.mqtt.brokers.push(endpoint),
            }
        }

        if let Some(path) = lookup("ROOMWATCH_KEY_PATH") {
            self.encryption.key_path = PathBuf::from(path);
        }
        Ok(())
    }
}

pub async fn load_config() -> anyhow::Result<KernelConfig> {
    let path = std::env::var("ROOMWATCH_CONFIG").unwrap_or_else(|_| "roomwatch.yaml".into());
    let mut cfg = read_config_file(Path::new(&path)).await?;
    cfg.apply_env_overrides(|var| std::env::var(var).ok())?;
    cfg.validate().with_context(|| format!("invalid configuration ({path})"))?;
    Ok(cfg)
}

pub async fn read_config_file(path: &Path) -> anyhow::Result<KernelConfig> {
    if !path.exists() {
        warn!("no {}, using default configuration", path.display());
        return Ok(KernelConfig::default());
    }
    let txt = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    if txt.trim().is_empty() {
        return Ok(KernelConfig::default());
    }
    serde_yaml::from_str(&txt).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use time::macros::time;

    const SAMPLE: &str = r#"
mqtt:
  brokers:
    - host: 192.168.12.100
      credentials: { username: node, password: secret }
    - host: test.mosquitto.org
      port: 1884
  retry_delay_secs: 2
topics:
  temperature: site/server-room/temp
  motion: site/server-room/motion
  cooling: site/server-room/cooling
  config: site/server-room/config
defaults:
  temp_threshold: 28.0
  alert_enabled: true
  alarm_start: "22:00"
  alarm_end: "06:00"
  alarm_enabled: false
producer:
  enabled: true
"#;

    #[tokio::test]
    async fn test_read_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roomwatch.yaml");
        std::fs::write(&path, SAMPLE).unwrap();

        let cfg = read_config_file(&path).await.unwrap();
        assert_eq!(cfg.mqtt.brokers.len(), 2);
        assert_eq!(cfg.mqtt.brokers[0].port, 1883);
        assert_eq!(cfg.mqtt.brokers[1].port, 1884);
        assert_eq!(cfg.mqtt.retry_delay_secs, 2);
        assert_eq!(cfg.mqtt.keep_alive_secs, 30);
        assert_eq!(cfg.defaults.alarm_start, time!(22:00));
        assert!(!cfg.defaults.alarm_enabled);
        assert!(cfg.producer.enabled);
        assert_eq!(cfg.producer.interval_secs, 5);
        cfg.validate().unwrap();
    }

    #[tokio::test]
    async fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = read_config_file(&dir.path().join("absent.yaml")).await.unwrap();
        assert_eq!(cfg.mqtt.brokers, vec![BrokerEndpoint::new("localhost", 1883)]);
        assert!(cfg.encryption.enabled);
    }

    #[tokio::test]
    async fn test_bad_alarm_time_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roomwatch.yaml");
        std::fs::write(&path, "defaults:\n  alarm_start: \"25:00\"\n").unwrap();
        assert!(read_config_file(&path).await.is_err());
    }

    #[test]
    fn test_subscriptions_follow_roles() {
        let mut cfg = KernelConfig::default();
        assert_eq!(cfg.subscriptions().len(), 4);
        cfg.producer.enabled = true;
        assert_eq!(
            cfg.subscriptions(),
            vec![cfg.topics.topic(TopicRole::Cooling).to_string(), cfg.topics.topic(TopicRole::Config).to_string()]
        );
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("ROOMWATCH_TOPIC_COOLING", "lab/cooling"),
            ("ROOMWATCH_PRIMARY_BROKER", "10.1.1.1:1999"),
            ("ROOMWATCH_FALLBACK_BROKER", "backup.local"),
        ]);
        let mut cfg = KernelConfig::default();
        cfg.apply_env_overrides(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.topics.topic(TopicRole::Cooling), "lab/cooling");
        assert_eq!(cfg.mqtt.brokers, vec![BrokerEndpoint::new("10.1.1.1", 1999), BrokerEndpoint::new("backup.local", 1883)]);

        let mut cfg = KernelConfig::default();
        let err = cfg.apply_env_overrides(|k| (k == "ROOMWATCH_PRIMARY_BROKER").then(|| "host:xx".to_string()));
        assert!(matches!(err, Err(ConfigValidationError::Endpoint(_))));
    }

    #[test]
    fn test_validation_rejects_bad_configs() {
        let mut cfg = KernelConfig::default();
        cfg.mqtt.brokers.clear();
        assert_eq!(cfg.validate(), Err(ConfigValidationError::NoBrokers));

        let mut cfg = KernelConfig::default();
        cfg.defaults.temp_threshold = f64::NAN;
        assert!(matches!(cfg.validate(), Err(ConfigValidationError::Threshold(_))));

        let mut cfg = KernelConfig::default();
        cfg.topics.set(TopicRole::Motion, cfg.topics.topic(TopicRole::Temperature).to_string());
        assert!(matches!(cfg.validate(), Err(ConfigValidationError::DuplicateTopic(_))));

        let mut cfg = KernelConfig::default();
        cfg.producer.enabled = true;
        cfg.producer.motion_probability = 1.5;
        assert!(cfg.validate().is_err());
    }
}
