//! In-process backend.
//!
//! Records live in a `HashMap` behind a mutex, so the conditional write is
//! atomic within one process. Useful for local runs and tests; it provides no
//! coordination across processes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::clock::{SharedClock, SystemClock};
use crate::error::{IdempotencyError, IdempotencyResult};
use crate::persistence::{PersistenceBackend, WriteOutcome};
use crate::record::DataRecord;
use crate::types::IdempotencyKey;

/// Backend holding records in memory.
pub struct InMemoryBackend {
    records: Mutex<HashMap<IdempotencyKey, DataRecord>>,
    clock: SharedClock,
}

impl InMemoryBackend {
    /// Creates an empty backend using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates an empty backend that judges expiry with `clock`.
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn records(&self) -> IdempotencyResult<MutexGuard<'_, HashMap<IdempotencyKey, DataRecord>>> {
        self.records
            .lock()
            .map_err(|e| IdempotencyError::persistence("in-memory store lock poisoned", e.to_string()))
    }

    /// Inserts a record unconditionally, replacing any existing one.
    pub fn insert(&self, record: DataRecord) -> IdempotencyResult<()> {
        self.records()?.insert(record.idempotency_key.clone(), record);
        Ok(())
    }

    /// Returns a copy of the stored record, if any.
    pub fn snapshot(&self, key: &IdempotencyKey) -> Option<DataRecord> {
        self.records().ok()?.get(key).cloned()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records().map(|r| r.len()).unwrap_or_default()
    }

    /// Returns true if no records are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PersistenceBackend for InMemoryBackend {
    async fn save_in_progress(&self, record: &DataRecord) -> IdempotencyResult<WriteOutcome> {
        let now_millis = self.clock.now_millis();
        let mut records = self.records()?;
        if let Some(existing) = records.get(&record.idempotency_key) {
            if !existing.is_replaceable(now_millis) {
                return Ok(WriteOutcome::Conflict);
            }
        }
        records.insert(record.idempotency_key.clone(), record.clone());
        Ok(WriteOutcome::Created)
    }

    async fn get_record(&self, key: &IdempotencyKey) -> IdempotencyResult<DataRecord> {
        self.records()?
            .get(key)
            .cloned()
            .ok_or_else(|| IdempotencyError::ItemNotFound {
                idempotency_key: key.clone(),
            })
    }

    async fn save_success(&self, record: &DataRecord) -> IdempotencyResult<()> {
        self.insert(record.clone())
    }

    async fn delete_record(&self, key: &IdempotencyKey) -> IdempotencyResult<()> {
        self.records()?.remove(key);
        Ok(())
    }
}
