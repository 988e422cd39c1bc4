//! Wall-clock access
//!
//! The scheduler works on whole seconds since the Unix epoch. Time is read
//! through the [`Clock`] trait so the loop, downtimes and tests agree on
//! what "now" is.

use chrono::{Local, TimeZone};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch
pub type Timestamp = i64;

/// Source of the current time
pub trait Clock: Send + Sync {
    /// Current time in whole seconds
    fn now(&self) -> Timestamp;

    /// Current time with sub-second precision
    fn now_precise(&self) -> f64 {
        self.now() as f64
    }
}

/// The system wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as Timestamp)
            .unwrap_or_default()
    }

    fn now_precise(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }
}

/// A clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: Timestamp) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    /// Jump to an absolute time (backwards jumps allowed)
    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    /// Move forward by `secs` seconds
    pub fn advance(&self, secs: i64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

/// Format a timestamp as a short local date-time string
pub fn format_timestamp(ts: Timestamp) -> String {
    match Local.timestamp_opt(ts, 0).single() {
        Some(dt) => dt.format("%m-%d-%Y %H:%M:%S").to_string(),
        None => ts.to_string(),
    }
}

/// Break a number of seconds into days, hours, minutes and seconds
pub fn time_breakdown(secs: u64) -> (u64, u64, u64, u64) {
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    (days, hours, minutes, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock() {
        let clock = SystemClock;
        assert!(clock.now() > 1_600_000_000);
        assert!(clock.now_precise() > 1_600_000_000.0);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(20_000);
        assert_eq!(clock.now(), 20_000);
        clock.advance(5);
        assert_eq!(clock.now(), 20_005);
        clock.set(100);
        assert_eq!(clock.now(), 100);
    }

    #[test]
    fn test_time_breakdown() {
        assert_eq!(time_breakdown(0), (0, 0, 0, 0));
        assert_eq!(time_breakdown(90_061), (1, 1, 1, 1));
    }
}
