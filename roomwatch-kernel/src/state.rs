use crate::models::{ControlConfig, OverrideState, SensorReading};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Everything the decision loop and the producer loop share. Only ever
/// touched through `Shared<ControllerState>`, one writer at a time.
#[derive(Debug, Clone, Default)]
pub struct ControllerState {
    pub config: ControlConfig,
    pub override_state: OverrideState,
    pub last_temperature: Option<SensorReading>,
}

impl ControllerState {
    pub fn new(config: ControlConfig) -> Self {
        Self { config, ..Self::default() }
    }

    pub fn last_temperature_value(&self) -> Option<f64> {
        match self.last_temperature.map(|r| r.reading) {
            Some(crate::models::Reading::Temperature(v)) => Some(v),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            config: self.config.clone(),
            override_state: self.override_state,
            last_temperature: self.last_temperature_value(),
        }
    }
}

/// Consistent copy handed to readers (HTTP, tests)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateSnapshot {
    pub config: ControlConfig,
    pub override_state: OverrideState,
    pub last_temperature: Option<f64>,
}
