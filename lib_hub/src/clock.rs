//! # Injectable Clock Abstraction
//!
//! Every timestamp and timeout in the hub (acknowledgment deadlines, circuit
//! breaker cool-downs, failure-pattern expiry, stale-connection detection) is
//! computed against a `Clock` trait object rather than calling
//! `Utc::now()` directly. This allows the time-dependent test scenarios to
//! fast-forward a `ManualClock` instead of sleeping for real minutes or days.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;

/// A source of "now". Implementations must be cheap and thread-safe; the hub
/// calls this on every delivery attempt and every maintenance tick.
pub trait Clock: Send + Sync {
    /// Returns the current moment in UTC.
    fn now(&self) -> DateTime<Utc>;
}

/// The production clock, backed by the system time.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A manually advanced clock for deterministic tests.
///
/// Starts at a fixed instant and only moves when `advance` is called, so a
/// test can jump past a 5-minute cool-down or a 7-day pattern expiry window
/// in a single statement.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Creates a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Moves the clock forward by `delta`.
    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.lock().expect("ManualClock lock poisoned");
        *now += delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("ManualClock lock poisoned")
    }
}
