//! Alarm time windows.
//!
//! A window is `[start, end]` in wall-clock time of day. When `start > end` the
//! window wraps midnight (e.g. 18:00 → 09:00 covers the night).

use crate::error::ConfigValidationError;
use time::macros::format_description;
use time::{OffsetDateTime, Time, UtcOffset};
use tracing::warn;

/// True when `now` falls inside the window. Both bounds are inclusive.
pub fn in_window(now: Time, start: Time, end: Time) -> bool {
    if start <= end {
        start <= now && now <= end
    } else {
        now >= start || now <= end
    }
}

/// Parses `HH:MM` or `HH:MM:SS`
pub fn parse_time_of_day(raw: &str) -> Result<Time, ConfigValidationError> {
    let trimmed = raw.trim();
    let parsed = match trimmed.len() {
        5 => Time::parse(trimmed, format_description!("[hour]:[minute]")),
        8 => Time::parse(trimmed, format_description!("[hour]:[minute]:[second]")),
        _ => return Err(ConfigValidationError::TimeOfDay(raw.to_string())),
    };
    parsed.map_err(|_| ConfigValidationError::TimeOfDay(raw.to_string()))
}

/// `HH:MM`, or `HH:MM:SS` when seconds are set
pub fn format_time_of_day(t: Time) -> String {
    if t.second() == 0 {
        format!("{:02}:{:02}", t.hour(), t.minute())
    } else {
        format!("{:02}:{:02}:{:02}", t.hour(), t.minute(), t.second())
    }
}

/// Serde adapter for `Time` fields stored as `"HH:MM"` strings
pub mod hhmm {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::Time;

    pub fn serialize<S: Serializer>(t: &Time, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_time_of_day(*t))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Time, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_time_of_day(&raw).map_err(serde::de::Error::custom)
    }
}

/// Source of the current time of day
pub trait Clock: Send + Sync {
    fn time_of_day(&self) -> Time;
}

/// Wall clock at a fixed UTC offset
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    offset: UtcOffset,
}

impl SystemClock {
    pub fn with_offset(offset: UtcOffset) -> Self {
        Self { offset }
    }

    /// Captures the local offset. Must run before the runtime starts its worker
    /// threads: on unix the offset cannot be read from a multi-threaded process.
    pub fn detect() -> Self {
        let offset = UtcOffset::current_local_offset().unwrap_or_else(|e| {
            warn!("local offset unavailable ({e}), alarm windows evaluated in UTC");
            UtcOffset::UTC
        });
        Self { offset }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::with_offset(UtcOffset::UTC)
    }
}

impl Clock for SystemClock {
    fn time_of_day(&self) -> Time {
        OffsetDateTime::now_utc().to_offset(self.offset).time()
    }
}

/// Clock pinned to one instant (tests, replays)
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub Time);

impl Clock for FixedClock {
    fn time_of_day(&self) -> Time {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::time;

    #[test]
    fn test_overnight_window() {
        let (start, end) = (time!(18:00), time!(09:00));
        assert!(in_window(time!(23:00), start, end));
        assert!(in_window(time!(03:00), start, end));
        assert!(in_window(time!(18:00), start, end));
        assert!(in_window(time!(09:00), start, end));
        assert!(in_window(time!(00:00), start, end));
        assert!(!in_window(time!(12:00), start, end));
        assert!(!in_window(time!(09:00:01), start, end));
        assert!(!in_window(time!(17:59:59), start, end));
    }

    #[test]
    fn test_same_day_window() {
        let (start, end) = (time!(09:00), time!(17:00));
        assert!(in_window(time!(09:00), start, end));
        assert!(in_window(time!(12:30), start, end));
        assert!(in_window(time!(17:00), start, end));
        assert!(!in_window(time!(08:59), start, end));
        assert!(!in_window(time!(23:00), start, end));
    }

    #[test]
    fn test_degenerate_window_is_single_instant() {
        let at = time!(06:30);
        assert!(in_window(at, at, at));
        assert!(!in_window(time!(06:31), at, at));
        assert!(!in_window(time!(06:29), at, at));
    }

    #[test]
    fn test_parse_time_of_day() {
        assert_eq!(parse_time_of_day("18:00").unwrap(), time!(18:00));
        assert_eq!(parse_time_of_day(" 09:15:30 ").unwrap(), time!(09:15:30));
        for bad in ["", "9:00", "24:00", "12:60", "noon", "12-00", "12:00:00:00"] {
            assert!(parse_time_of_day(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_system_clock_applies_offset() {
        let utc = SystemClock::default().time_of_day();
        let east = SystemClock::with_offset(time::macros::offset!(+3)).time_of_day();
        let diff = (east - utc).whole_minutes().rem_euclid(24 * 60);
        // both reads may straddle a minute boundary
        assert!((179..=181).contains(&diff), "{diff}");
    }

    #[test]
    fn test_format_time_of_day() {
        assert_eq!(format_time_of_day(time!(07:05)), "07:05");
        assert_eq!(format_time_of_day(time!(07:05:09)), "07:05:09");
    }
}
