//! Process-local cache of completed idempotency records.
//!
//! Uses moka with LRU eviction. The cache is owned by whoever builds it and
//! handed to [`Idempotency`](crate::Idempotency) explicitly; clone the
//! `LocalCache` to share it between engines in one process.

use std::sync::Arc;

use moka::policy::EvictionPolicy;
use moka::sync::Cache;

use crate::clock::SharedClock;
use crate::record::{DataRecord, RecordStatus};
use crate::types::IdempotencyKey;

/// Default number of records kept.
pub const DEFAULT_MAX_ITEMS: u64 = 256;

/// Bounded LRU map from idempotency key to record snapshot.
///
/// In-progress records are never stored and expired records are never
/// returned.
#[derive(Clone)]
pub struct LocalCache {
    cache: Cache<IdempotencyKey, Arc<DataRecord>>,
    clock: SharedClock,
}

impl LocalCache {
    /// Creates a cache holding at most `max_items` records.
    pub fn new(max_items: u64, clock: SharedClock) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(max_items)
                .eviction_policy(EvictionPolicy::lru())
                .build(),
            clock,
        }
    }

    /// Returns the cached record, evicting it first if it has expired.
    pub fn get(&self, key: &IdempotencyKey) -> Option<DataRecord> {
        let record = self.cache.get(key)?;
        if record.is_expired(self.clock.now_secs()) {
            tracing::debug!(idempotency_key = %key, "Removing expired local cache record");
            self.cache.invalidate(key);
            return None;
        }
        Some(record.as_ref().clone())
    }

    /// Caches a record. In-progress and already expired records are ignored.
    pub fn put(&self, record: &DataRecord) {
        if record.status != RecordStatus::Completed {
            return;
        }
        if record.is_expired(self.clock.now_secs()) {
            return;
        }
        self.cache
            .insert(record.idempotency_key.clone(), Arc::new(record.clone()));
    }

    /// Removes a record.
    pub fn delete(&self, key: &IdempotencyKey) {
        self.cache.invalidate(key);
    }

    /// Approximate number of cached records.
    pub fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }
}

impl std::fmt::Debug for LocalCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCache")
            .field("entry_count", &self.cache.entry_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use std::sync::atomic::{AtomicI64, Ordering};

    struct TestClock(AtomicI64);

    impl Clock for TestClock {
        fn now_millis(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn setup(max_items: u64) -> (LocalCache, Arc<TestClock>) {
        let clock = Arc::new(TestClock(AtomicI64::new(1_000_000)));
        (LocalCache::new(max_items, clock.clone()), clock)
    }

    fn completed(key: &str, expiry: i64) -> DataRecord {
        DataRecord::new(IdempotencyKey::from(key), RecordStatus::Completed)
            .with_expiry(expiry)
            .with_response_data("{}")
    }

    #[test]
    fn test_put_get_delete() {
        let (cache, _) = setup(8);
        let record = completed("fn#1", 2_000);
        cache.put(&record);
        assert_eq!(cache.get(&record.idempotency_key), Some(record.clone()));
        cache.delete(&record.idempotency_key);
        assert_eq!(cache.get(&record.idempotency_key), None);
    }

    #[test]
    fn test_in_progress_never_cached() {
        let (cache, _) = setup(8);
        let record = DataRecord::new(IdempotencyKey::from("fn#1"), RecordStatus::InProgress)
            .with_expiry(2_000);
        cache.put(&record);
        assert_eq!(cache.get(&record.idempotency_key), None);
    }

    #[test]
    fn test_expired_entry_is_evicted_on_get() {
        let (cache, clock) = setup(8);
        let record = completed("fn#1", 1_500);
        cache.put(&record);
        assert!(cache.get(&record.idempotency_key).is_some());

        clock.0.store(1_501_000, Ordering::SeqCst);
        assert_eq!(cache.get(&record.idempotency_key), None);
        assert_eq!(cache.entry_count(), 0);
    }

    #[test]
    fn test_capacity_is_bounded() {
        let (cache, _) = setup(4);
        for i in 0..32 {
            cache.put(&completed(&format!("fn#{i}"), 2_000));
        }
        assert!(cache.entry_count() <= 4);
    }

    #[test]
    fn test_clones_share_entries() {
        let (cache, _) = setup(8);
        let other = cache.clone();
        let record = completed("fn#1", 2_000);
        cache.put(&record);
        assert!(other.get(&record.idempotency_key).is_some());
    }
}
