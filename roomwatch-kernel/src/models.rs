use crate::error::{ConfigValidationError, DecodeError};
use crate::window::{self, parse_time_of_day};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::macros::time;
use time::{OffsetDateTime, Time};

pub const MOTION_DETECTED: &str = "Motion detected!";
pub const NO_MOTION: &str = "No motion";
pub const ALARM_ANNOTATION: &str = " [ALARM HOURS - Alert triggered!]";

/// Readings outside this range are treated as sensor garbage
pub const PLAUSIBLE_TEMPERATURE: std::ops::RangeInclusive<f64> = -60.0..=150.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Reading {
    Temperature(f64),
    Motion(bool),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    pub reading: Reading,
    pub observed_at: OffsetDateTime,
}

impl SensorReading {
    pub fn now(reading: Reading) -> Self {
        Self { reading, observed_at: OffsetDateTime::now_utc() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoolingCommand {
    #[serde(rename = "ON")]
    On,
    #[serde(rename = "OFF")]
    Off,
}

impl CoolingCommand {
    pub fn from_on(on: bool) -> Self {
        if on { CoolingCommand::On } else { CoolingCommand::Off }
    }

    pub fn is_on(self) -> bool {
        self == CoolingCommand::On
    }

    pub fn as_wire(self) -> &'static str {
        match self {
            CoolingCommand::On => "ON",
            CoolingCommand::Off => "OFF",
        }
    }

    pub fn parse(payload: &str) -> Result<Self, DecodeError> {
        match payload.trim().to_ascii_uppercase().as_str() {
            "ON" => Ok(CoolingCommand::On),
            "OFF" => Ok(CoolingCommand::Off),
            _ => Err(DecodeError::Cooling(payload.to_string())),
        }
    }
}

/// Operator override of the automatic cooling decision
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideState {
    pub active: bool,
    pub manual_cooling_on: bool,
}

/// Live control settings. Converges across nodes through the Config topic
/// (last writer wins).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub temp_threshold: f64,
    pub alert_enabled: bool,
    #[serde(with = "window::hhmm")]
    pub alarm_start: Time,
    #[serde(with = "window::hhmm")]
    pub alarm_end: Time,
    pub alarm_enabled: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            temp_threshold: 25.0,
            alert_enabled: true,
            alarm_start: time!(18:00),
            alarm_end: time!(09:00),
            alarm_enabled: true,
        }
    }
}

impl ControlConfig {
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if !self.temp_threshold.is_finite() {
            return Err(ConfigValidationError::Threshold(self.temp_threshold));
        }
        Ok(())
    }

    /// Overwrites every field the patch carries
    pub fn apply(&mut self, patch: &ConfigPatch) {
        if let Some(v) = patch.temp_threshold {
            self.temp_threshold = v;
        }
        if let Some(v) = patch.alert_enabled {
            self.alert_enabled = v;
        }
        if let Some(v) = patch.alarm_start {
            self.alarm_start = v;
        }
        if let Some(v) = patch.alarm_end {
            self.alarm_end = v;
        }
        if let Some(v) = patch.alarm_enabled {
            self.alarm_enabled = v;
        }
    }
}

/// Partial `ControlConfig` as carried by the Config topic
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigPatch {
    pub temp_threshold: Option<f64>,
    pub alert_enabled: Option<bool>,
    pub alarm_start: Option<Time>,
    pub alarm_end: Option<Time>,
    pub alarm_enabled: Option<bool>,
}

impl ConfigPatch {
    pub fn is_empty(&self) -> bool {
        *self == ConfigPatch::default()
    }

    /// Parses a flat JSON object. Unknown keys are ignored; a known key with an
    /// unusable value rejects the whole patch.
    pub fn from_json(payload: &str) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_str(payload).map_err(|e| DecodeError::Config(e.to_string()))?;
        let Value::Object(map) = value else {
            return Err(DecodeError::Config("expected a JSON object".into()));
        };

        let mut patch = ConfigPatch::default();
        for (key, value) in &map {
            match snake_case(key).as_str() {
                "temp_threshold" => patch.temp_threshold = Some(threshold_value(key, value)?),
                "alert_enabled" => patch.alert_enabled = Some(bool_value(key, value)?),
                "alarm_start" => patch.alarm_start = Some(time_value(key, value)?),
                "alarm_end" => patch.alarm_end = Some(time_value(key, value)?),
                "alarm_enabled" => patch.alarm_enabled = Some(bool_value(key, value)?),
                _ => {}
            }
        }
        Ok(patch)
    }

    pub fn to_json(&self) -> String {
        let mut map = Map::new();
        if let Some(v) = self.temp_threshold {
            map.insert("temp_threshold".into(), Value::from(v));
        }
        if let Some(v) = self.alert_enabled {
            map.insert("alert_enabled".into(), Value::from(v));
        }
        if let Some(v) = self.alarm_start {
            map.insert("alarm_start".into(), Value::from(window::format_time_of_day(v)));
        }
        if let Some(v) = self.alarm_end {
            map.insert("alarm_end".into(), Value::from(window::format_time_of_day(v)));
        }
        if let Some(v) = self.alarm_enabled {
            map.insert("alarm_enabled".into(), Value::from(v));
        }
        Value::Object(map).to_string()
    }
}

impl From<&ControlConfig> for ConfigPatch {
    fn from(cfg: &ControlConfig) -> Self {
        Self {
            temp_threshold: Some(cfg.temp_threshold),
            alert_enabled: Some(cfg.alert_enabled),
            alarm_start: Some(cfg.alarm_start),
            alarm_end: Some(cfg.alarm_end),
            alarm_enabled: Some(cfg.alarm_enabled),
        }
    }
}

// tempThreshold -> temp_threshold
fn snake_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for c in key.chars() {
        if c.is_ascii_uppercase() {
            out.push('_');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

fn threshold_value(key: &str, value: &Value) -> Result<f64, DecodeError> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(v) if v.is_finite() => Ok(v),
        _ => Err(DecodeError::Config(format!("{key}: expected a number, got {value}"))),
    }
}

fn bool_value(key: &str, value: &Value) -> Result<bool, DecodeError> {
    value
        .as_bool()
        .ok_or_else(|| DecodeError::Config(format!("{key}: expected a boolean, got {value}")))
}

fn time_value(key: &str, value: &Value) -> Result<Time, DecodeError> {
    let raw = value
        .as_str()
        .ok_or_else(|| DecodeError::Config(format!("{key}: expected \"HH:MM\", got {value}")))?;
    Ok(parse_time_of_day(raw)?)
}

// ---- wire payloads (plaintext before sealing) ----

pub fn format_temperature(value: f64) -> String {
    format!("{value}")
}

pub fn parse_temperature(payload: &str) -> Result<f64, DecodeError> {
    let value: f64 = payload
        .trim()
        .parse()
        .map_err(|_| DecodeError::Temperature(payload.to_string()))?;
    if !value.is_finite() {
        return Err(DecodeError::Temperature(payload.to_string()));
    }
    if !PLAUSIBLE_TEMPERATURE.contains(&value) {
        return Err(DecodeError::TemperatureRange(value));
    }
    Ok(value)
}

pub fn format_motion(detected: bool, alarm: bool) -> String {
    match (detected, alarm) {
        (true, true) => format!("{MOTION_DETECTED}{ALARM_ANNOTATION}"),
        (true, false) => MOTION_DETECTED.to_string(),
        (false, _) => NO_MOTION.to_string(),
    }
}

/// Accepts any casing of the two phrases, with or without trailing annotation
pub fn parse_motion(payload: &str) -> Result<bool, DecodeError> {
    let lowered = payload.trim().to_lowercase();
    if lowered.starts_with("motion detected") {
        Ok(true)
    } else if lowered.starts_with("no motion") {
        Ok(false)
    } else {
        Err(DecodeError::Motion(payload.to_string()))
    }
}
