//! Error taxonomy shared by the bus, the router and the controller.
//!
//! Only `BusError::BrokerUnavailable` is ever retried automatically (by the
//! connection manager). Everything else is reported to the caller or logged and
//! dropped at the message boundary.

use std::path::PathBuf;
use std::time::Duration;

/// Failures of the broker session or of a publish attempt
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BusError {
    #[error("all broker endpoints failed: {0}")]
    BrokerUnavailable(String),
    #[error("not connected to any broker")]
    NotConnected,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("subscription to '{0}' refused by broker")]
    SubscribeRefused(String),
    #[error("no broker answer within {0:?}")]
    Timeout(Duration),
}

/// A payload that could not be turned into something the kernel understands.
/// Always a dropped message, never a fatal fault.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("envelope rejected: not sealed under this key or corrupted")]
    Cipher,
    #[error("payload is not valid UTF-8")]
    Utf8,
    #[error("invalid temperature payload: {0:?}")]
    Temperature(String),
    #[error("temperature {0} outside the plausible range")]
    TemperatureRange(f64),
    #[error("invalid motion payload: {0:?}")]
    Motion(String),
    #[error("invalid cooling payload: {0:?}")]
    Cooling(String),
    #[error("invalid config payload: {0}")]
    Config(String),
}

/// Rejected configuration value; the previous configuration stays in force
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("invalid time of day {0:?} (expected HH:MM or HH:MM:SS)")]
    TimeOfDay(String),
    #[error("temperature threshold must be a finite number, got {0}")]
    Threshold(f64),
    #[error("at least one broker endpoint is required")]
    NoBrokers,
    #[error("broker endpoint {0:?} is invalid")]
    Endpoint(String),
    #[error("topic for {0} must not be empty")]
    EmptyTopic(&'static str),
    #[error("topic {0:?} is bound to more than one role")]
    DuplicateTopic(String),
    #[error("{0}")]
    Other(String),
}

/// Key file provisioning failures (startup only)
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("key file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("key file {0:?} does not contain a valid key")]
    Invalid(PathBuf),
    #[error("freshly generated key was rejected by the cipher")]
    Generate,
}

impl From<ConfigValidationError> for DecodeError {
    fn from(e: ConfigValidationError) -> Self {
        DecodeError::Config(e.to_string())
    }
}

/// Outcome of an operator command. A `Bus` error means the local change was
/// applied but could not be announced on the bus.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ControlError {
    #[error(transparent)]
    Validation(#[from] ConfigValidationError),
    #[error(transparent)]
    Bus(#[from] BusError),
}
