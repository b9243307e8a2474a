//! Cooling and alarm decisions.
//!
//! Pure functions of (config, override, reading): nothing here is cached, so the
//! same inputs always give the same command.

use crate::models::{ControlConfig, CoolingCommand, OverrideState};
use crate::window::in_window;
use serde::Serialize;
use time::Time;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Mode {
    Automatic,
    ManualOverride { cooling_on: bool },
}

impl From<OverrideState> for Mode {
    fn from(ov: OverrideState) -> Self {
        if ov.active {
            Mode::ManualOverride { cooling_on: ov.manual_cooling_on }
        } else {
            Mode::Automatic
        }
    }
}

/// Strictly above the threshold means ON; equal is OFF
pub fn automatic_command(temperature: f64, threshold: f64) -> CoolingCommand {
    CoolingCommand::from_on(temperature > threshold)
}

/// Command to publish for a new temperature reading. `None` while an override
/// is active: the manual value already stands.
pub fn cooling_for_reading(cfg: &ControlConfig, mode: Mode, temperature: f64) -> Option<CoolingCommand> {
    match mode {
        Mode::Automatic => Some(automatic_command(temperature, cfg.temp_threshold)),
        Mode::ManualOverride { .. } => None,
    }
}

/// Command to publish right after the override state changed. Entering an
/// override publishes the manual value; leaving it re-evaluates the last known
/// temperature, or publishes nothing if none was ever seen.
pub fn cooling_after_override_change(
    cfg: &ControlConfig,
    mode: Mode,
    last_temperature: Option<f64>,
) -> Option<CoolingCommand> {
    match mode {
        Mode::ManualOverride { cooling_on } => Some(CoolingCommand::from_on(cooling_on)),
        Mode::Automatic => last_temperature.map(|t| automatic_command(t, cfg.temp_threshold)),
    }
}

/// Whether detected motion at `now` raises an alarm
pub fn alarm_for_motion(cfg: &ControlConfig, detected: bool, now: Time) -> bool {
    detected && cfg.alarm_enabled && in_window(now, cfg.alarm_start, cfg.alarm_end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::time;

    fn cfg(threshold: f64) -> ControlConfig {
        ControlConfig { temp_threshold: threshold, ..ControlConfig::default() }
    }

    #[test]
    fn test_strict_threshold() {
        for (t, reading, expected) in [
            (28.0, 28.0, CoolingCommand::Off),
            (28.0, 28.01, CoolingCommand::On),
            (28.0, 27.99, CoolingCommand::Off),
            (-5.0, -4.5, CoolingCommand::On),
            (0.0, 0.0, CoolingCommand::Off),
        ] {
            assert_eq!(automatic_command(reading, t), expected, "reading {reading} threshold {t}");
        }
    }

    #[test]
    fn test_override_suppresses_automatic_output() {
        let mode = Mode::ManualOverride { cooling_on: false };
        assert_eq!(cooling_for_reading(&cfg(20.0), mode, 40.0), None);
        assert_eq!(cooling_for_reading(&cfg(20.0), Mode::Automatic, 40.0), Some(CoolingCommand::On));
    }

    #[test]
    fn test_override_transitions() {
        let c = cfg(28.0);
        assert_eq!(
            cooling_after_override_change(&c, Mode::ManualOverride { cooling_on: true }, Some(10.0)),
            Some(CoolingCommand::On)
        );
        assert_eq!(cooling_after_override_change(&c, Mode::Automatic, Some(31.0)), Some(CoolingCommand::On));
        assert_eq!(cooling_after_override_change(&c, Mode::Automatic, Some(28.0)), Some(CoolingCommand::Off));
        assert_eq!(cooling_after_override_change(&c, Mode::Automatic, None), None);
    }

    #[test]
    fn test_mode_from_override_state() {
        assert_eq!(Mode::from(OverrideState::default()), Mode::Automatic);
        let ov = OverrideState { active: true, manual_cooling_on: true };
        assert_eq!(Mode::from(ov), Mode::ManualOverride { cooling_on: true });
    }

    #[test]
    fn test_alarm_needs_motion_enabled_flag_and_window() {
        let mut c = ControlConfig { alarm_start: time!(18:00), alarm_end: time!(09:00), ..ControlConfig::default() };
        assert!(alarm_for_motion(&c, true, time!(23:00)));
        assert!(!alarm_for_motion(&c, false, time!(23:00)));
        assert!(!alarm_for_motion(&c, true, time!(12:00)));

        c.alarm_enabled = false;
        for now in [time!(23:00), time!(03:00), time!(12:00), time!(18:00)] {
            assert!(!alarm_for_motion(&c, true, now));
        }
    }
}
