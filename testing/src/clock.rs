//! A clock that only moves when told to.
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//! use lambda_idempotency::Clock;
//! use lambda_idempotency_testing::ManualClock;
//!
//! let clock = ManualClock::at_secs(1_000);
//! clock.advance(Duration::from_millis(1_500));
//! assert_eq!(clock.now_millis(), 1_001_500);
//! assert_eq!(clock.now_secs(), 1_001);
//! ```

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lambda_idempotency::{Clock, SharedClock};

/// Epoch milliseconds the default clock starts at (2024-01-01T00:00:00Z).
pub const DEFAULT_START_MILLIS: i64 = 1_704_067_200_000;

/// Manually advanced clock.
///
/// Share one instance between the engine, the backend and the cache so they
/// agree on the current time.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    /// Creates a clock reading `millis` since the epoch.
    pub fn new(millis: i64) -> Self {
        Self {
            millis: AtomicI64::new(millis),
        }
    }

    /// Creates a clock reading `secs` since the epoch.
    pub fn at_secs(secs: i64) -> Self {
        Self::new(secs * 1_000)
    }

    /// Creates a shared clock starting at [`DEFAULT_START_MILLIS`].
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        let by = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.millis.fetch_add(by, Ordering::SeqCst);
    }

    /// Moves the clock forward by whole seconds.
    pub fn advance_secs(&self, secs: u64) {
        self.advance(Duration::from_secs(secs));
    }

    /// Sets the clock to an absolute reading.
    pub fn set_millis(&self, millis: i64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    /// Returns a type-erased handle to this clock.
    pub fn as_shared(self: &Arc<Self>) -> SharedClock {
        self.clone()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(DEFAULT_START_MILLIS)
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_and_set() {
        let clock = ManualClock::new(0);
        clock.advance_secs(2);
        assert_eq!(clock.now_millis(), 2_000);
        clock.set_millis(999);
        assert_eq!(clock.now_secs(), 0);
    }

    #[test]
    fn test_shared_handles_see_same_time() {
        let clock = ManualClock::shared();
        let handle = clock.as_shared();
        clock.advance(Duration::from_millis(5));
        assert_eq!(handle.now_millis(), DEFAULT_START_MILLIS + 5);
    }
}
