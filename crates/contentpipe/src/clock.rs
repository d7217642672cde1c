//! Wall-clock abstraction and the SQL timestamp format.
//!
//! Every timestamp the engine persists goes through [`sql_timestamp`] so that
//! the TEXT columns compare lexicographically in the same order as the
//! instants they encode (fixed-width UTC, microsecond precision, `Z` suffix).
//! Scheduling, lease expiry, and backoff all read the clock through the
//! [`Clock`] trait so tests can drive time by hand.

use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};

/// Source of "now" for scheduling decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Hand-advanced clock for tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Render a timestamp in the engine's canonical SQL TEXT format.
pub fn sql_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a timestamp previously written by [`sql_timestamp`].
///
/// Accepts any RFC 3339 offset for robustness against hand-edited rows.
pub fn parse_sql_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamp_round_trip() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 14, 1, 59, 26).unwrap();
        let s = sql_timestamp(ts);
        assert_eq!(parse_sql_timestamp(&s), Some(ts));
    }

    #[test]
    fn lexicographic_order_matches_chronological() {
        let base = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut stamps: Vec<String> = (0..50)
            .map(|i| sql_timestamp(base + chrono::Duration::microseconds(i * 777)))
            .collect();
        let chronological = stamps.clone();
        stamps.sort();
        assert_eq!(stamps, chronological);
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
        let before = clock.now();
        clock.advance(chrono::Duration::seconds(90));
        assert_eq!(clock.now() - before, chrono::Duration::seconds(90));
    }
}
