//! Recording persistence backend with fault injection.
//!
//! [`MockBackend`] stores records in an [`InMemoryBackend`], records every
//! call it receives and can be told to fail upcoming calls.
//!
//! # Examples
//!
//! ```
//! use lambda_idempotency::IdempotencyError;
//! use lambda_idempotency_testing::{ManualClock, MockBackend};
//!
//! let clock = ManualClock::shared();
//! let backend = MockBackend::new(clock.as_shared())
//!     .with_save_success_error(IdempotencyError::persistence("throttled", "slow down"));
//! assert!(backend.calls().is_empty());
//! ```

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use lambda_idempotency::persistence::InMemoryBackend;
use lambda_idempotency::{
    DataRecord, IdempotencyError, IdempotencyKey, IdempotencyResult, PersistenceBackend,
    SharedClock, WriteOutcome,
};

/// A call received by [`MockBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    /// `save_in_progress` with the record it was given.
    SaveInProgress(DataRecord),
    /// `get_record` for a key.
    GetRecord(IdempotencyKey),
    /// `save_success` with the record it was given.
    SaveSuccess(DataRecord),
    /// `delete_record` for a key.
    DeleteRecord(IdempotencyKey),
}

/// Which backend operation a queued fault applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendOp {
    /// `save_in_progress`
    SaveInProgress,
    /// `get_record`
    GetRecord,
    /// `save_success`
    SaveSuccess,
    /// `delete_record`
    DeleteRecord,
}

impl BackendCall {
    /// The operation this call was made to.
    pub fn op(&self) -> BackendOp {
        match self {
            Self::SaveInProgress(_) => BackendOp::SaveInProgress,
            Self::GetRecord(_) => BackendOp::GetRecord,
            Self::SaveSuccess(_) => BackendOp::SaveSuccess,
            Self::DeleteRecord(_) => BackendOp::DeleteRecord,
        }
    }
}

#[derive(Default)]
struct Faults {
    save_in_progress: VecDeque<IdempotencyError>,
    get_record: VecDeque<IdempotencyError>,
    save_success: VecDeque<IdempotencyError>,
    delete_record: VecDeque<IdempotencyError>,
}

impl Faults {
    fn queue(&mut self, op: BackendOp) -> &mut VecDeque<IdempotencyError> {
        match op {
            BackendOp::SaveInProgress => &mut self.save_in_progress,
            BackendOp::GetRecord => &mut self.get_record,
            BackendOp::SaveSuccess => &mut self.save_success,
            BackendOp::DeleteRecord => &mut self.delete_record,
        }
    }
}

/// Mock implementation of [`PersistenceBackend`] for testing.
///
/// Queued errors are returned in order, one per call to the matching
/// operation; once a queue is empty calls reach the in-memory store. A
/// `get_record` delay can be set to widen race windows.
pub struct MockBackend {
    store: InMemoryBackend,
    calls: Mutex<Vec<BackendCall>>,
    faults: Mutex<Faults>,
    get_record_delay: Option<Duration>,
}

impl MockBackend {
    /// Creates an empty backend judging expiry with `clock`.
    pub fn new(clock: SharedClock) -> Self {
        Self {
            store: InMemoryBackend::with_clock(clock),
            calls: Mutex::new(Vec::new()),
            faults: Mutex::new(Faults::default()),
            get_record_delay: None,
        }
    }

    /// Queues an error for the next call to `op`.
    pub fn with_error(self, op: BackendOp, error: IdempotencyError) -> Self {
        self.push_error(op, error);
        self
    }

    /// Queues an error for the next `save_in_progress`.
    pub fn with_save_in_progress_error(self, error: IdempotencyError) -> Self {
        self.with_error(BackendOp::SaveInProgress, error)
    }

    /// Queues an error for the next `get_record`.
    pub fn with_get_record_error(self, error: IdempotencyError) -> Self {
        self.with_error(BackendOp::GetRecord, error)
    }

    /// Queues an error for the next `save_success`.
    pub fn with_save_success_error(self, error: IdempotencyError) -> Self {
        self.with_error(BackendOp::SaveSuccess, error)
    }

    /// Queues an error for the next `delete_record`.
    pub fn with_delete_record_error(self, error: IdempotencyError) -> Self {
        self.with_error(BackendOp::DeleteRecord, error)
    }

    /// Sleeps before answering each `get_record`.
    pub fn with_get_record_delay(mut self, delay: Duration) -> Self {
        self.get_record_delay = Some(delay);
        self
    }

    /// Queues an error after construction.
    pub fn push_error(&self, op: BackendOp, error: IdempotencyError) {
        lock(&self.faults).queue(op).push_back(error);
    }

    /// The underlying store.
    pub fn store(&self) -> &InMemoryBackend {
        &self.store
    }

    /// All calls received so far.
    pub fn calls(&self) -> Vec<BackendCall> {
        lock(&self.calls).clone()
    }

    /// Number of calls received for `op`.
    pub fn call_count(&self, op: BackendOp) -> usize {
        lock(&self.calls).iter().filter(|c| c.op() == op).count()
    }

    /// Clears the call log.
    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    fn record(&self, call: BackendCall) -> IdempotencyResult<()> {
        let op = call.op();
        tracing::trace!(?op, "MockBackend call");
        lock(&self.calls).push(call);
        match lock(&self.faults).queue(op).pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl PersistenceBackend for MockBackend {
    async fn save_in_progress(&self, record: &DataRecord) -> IdempotencyResult<WriteOutcome> {
        self.record(BackendCall::SaveInProgress(record.clone()))?;
        self.store.save_in_progress(record).await
    }

    async fn get_record(&self, key: &IdempotencyKey) -> IdempotencyResult<DataRecord> {
        if let Some(delay) = self.get_record_delay {
            tokio::time::sleep(delay).await;
        }
        self.record(BackendCall::GetRecord(key.clone()))?;
        self.store.get_record(key).await
    }

    async fn save_success(&self, record: &DataRecord) -> IdempotencyResult<()> {
        self.record(BackendCall::SaveSuccess(record.clone()))?;
        self.store.save_success(record).await
    }

    async fn delete_record(&self, key: &IdempotencyKey) -> IdempotencyResult<()> {
        self.record(BackendCall::DeleteRecord(key.clone()))?;
        self.store.delete_record(key).await
    }
}
