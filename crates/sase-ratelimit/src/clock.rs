//! Wall clock abstraction
//!
//! Classification timestamps are epoch seconds with sub-second precision.
//! Expiry is computed against whatever [`Clock`] the service is built with,
//! so tests can move time forward without sleeping.

use parking_lot::Mutex;

/// Source of the current time in epoch seconds
pub trait Clock: Send + Sync {
    /// Current time as seconds since the Unix epoch
    fn now(&self) -> f64;
}

/// Real system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
    }
}

/// Manually driven clock for simulations and tests
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<f64>,
}

impl ManualClock {
    /// Create a clock frozen at `start`
    pub fn new(start: f64) -> Self {
        Self { now: Mutex::new(start) }
    }

    /// Move time forward by `secs`
    pub fn advance(&self, secs: f64) {
        *self.now.lock() += secs;
    }

    /// Jump to an absolute time
    pub fn set(&self, now: f64) {
        *self.now.lock() = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock()
    }
}
