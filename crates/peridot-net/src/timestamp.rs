//! Microsecond wall-clock timestamps for telemetry and message callbacks.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{Local, TimeZone};

/// Microseconds per second.
pub const MICROS_PER_SECOND: i64 = 1_000_000;

/// A wall-clock instant with microsecond resolution.
///
/// The zero value is "invalid" (never produced by [`Timestamp::now`]) and is
/// what a default-constructed timestamp holds before the first poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    micros: i64,
}

impl Timestamp {
    /// Returns the current wall-clock time.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_micros() as i64);
        Self { micros }
    }

    /// Creates a timestamp from microseconds since the Unix epoch.
    pub const fn from_micros(micros: i64) -> Self {
        Self { micros }
    }

    /// Microseconds since the Unix epoch.
    pub const fn micros(self) -> i64 {
        self.micros
    }

    /// Whole seconds since the Unix epoch.
    pub const fn secs(self) -> i64 {
        self.micros / MICROS_PER_SECOND
    }

    /// Returns true unless this is the default (zero) timestamp.
    pub const fn is_valid(self) -> bool {
        self.micros != 0
    }

    /// Returns this timestamp shifted by the given number of microseconds.
    pub const fn add_micros(self, delta: i64) -> Self {
        Self {
            micros: self.micros + delta,
        }
    }

    /// Formats as `YYYY/MM/DD HH:MM:SS.uuuuuu` in local time.
    pub fn to_formatted_string(self) -> String {
        let secs = self.micros.div_euclid(MICROS_PER_SECOND);
        let sub_micros = self.micros.rem_euclid(MICROS_PER_SECOND) as u32;
        match Local.timestamp_opt(secs, sub_micros * 1_000).single() {
            Some(dt) => dt.format("%Y/%m/%d %H:%M:%S%.6f").to_string(),
            None => format!("<invalid timestamp {}us>", self.micros),
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_formatted_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_valid_and_monotonic_enough() {
        let a = Timestamp::now();
        let b = Timestamp::now();
        assert!(a.is_valid());
        assert!(b >= a);
    }

    #[test]
    fn default_is_invalid() {
        assert!(!Timestamp::default().is_valid());
    }

    #[test]
    fn micros_round_trip() {
        let ts = Timestamp::from_micros(1_700_000_123_456_789);
        assert_eq!(ts.micros(), 1_700_000_123_456_789);
        assert_eq!(ts.secs(), 1_700_000_123);
    }

    #[test]
    fn add_micros_shifts() {
        let ts = Timestamp::from_micros(10);
        assert_eq!(ts.add_micros(5).micros(), 15);
        assert_eq!(ts.add_micros(-5).micros(), 5);
    }

    #[test]
    fn formatted_string_shape() {
        // 2023/11/14 ~ 22:13:20 UTC; only check the shape since the string is
        // rendered in local time.
        let s = Timestamp::from_micros(1_700_000_000_123_456).to_formatted_string();
        assert_eq!(s.len(), "YYYY/MM/DD HH:MM:SS.uuuuuu".len());
        assert_eq!(&s[4..5], "/");
        assert_eq!(&s[7..8], "/");
        assert_eq!(&s[10..11], " ");
        assert_eq!(&s[13..14], ":");
        assert_eq!(&s[16..17], ":");
        assert_eq!(&s[19..20], ".");
        assert!(s.ends_with("123456"));
    }
}
