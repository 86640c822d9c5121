//! Time source used for expiry decisions.
//!
//! Expiry timestamps are stored in epoch seconds and in-progress expiries in
//! epoch milliseconds. Everything that compares against "now" goes through a
//! [`Clock`] so tests can move time explicitly.

use std::sync::Arc;

use chrono::Utc;

/// A source of the current wall-clock time.
pub trait Clock: Send + Sync {
    /// Current time in epoch milliseconds.
    fn now_millis(&self) -> i64;

    /// Current time in epoch seconds.
    fn now_secs(&self) -> i64 {
        self.now_millis().div_euclid(1000)
    }
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}
