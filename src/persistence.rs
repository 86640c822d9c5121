//! Persistence backends for idempotency records.
//!
//! The backend is the only coordination point between concurrent invocations.
//! Every implementation must perform [`PersistenceBackend::save_in_progress`]
//! as one conditional write that succeeds only when:
//!
//! - no record exists for the key, or
//! - the existing record's expiry has passed, or
//! - the existing record is in progress and its in-progress expiry has passed.
//!
//! # Bindings
//!
//! - [`dynamodb::DynamoDbBackend`] - conditional `PutItem`
//! - [`redis::RedisBackend`] - hash claim with a follow-up TTL
//! - [`memory::InMemoryBackend`] - a mutex-guarded map for local runs and tests

pub mod dynamodb;
pub mod memory;
pub mod redis;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::IdempotencyResult;
use crate::record::DataRecord;
use crate::types::IdempotencyKey;

pub use dynamodb::{DynamoDbBackend, DynamoDbConfig};
pub use memory::InMemoryBackend;
pub use redis::{HashStore, RedisBackend, RedisConfig, RedisHashStore};

/// Result of a conditional save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The record was written and the caller now holds the key.
    Created,
    /// The condition failed. The caller must read the record to learn its state.
    Conflict,
}

/// Storage for idempotency records.
///
/// Implementations translate their own failures into
/// [`IdempotencyError::PersistenceLayer`](crate::IdempotencyError::PersistenceLayer).
#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    /// Writes an in-progress record if the key is free, expired or orphaned.
    ///
    /// # Arguments
    ///
    /// * `record` - The in-progress record, with its expiry and optional in-progress expiry set
    ///
    /// # Returns
    ///
    /// [`WriteOutcome::Created`] if this call now holds the key,
    /// [`WriteOutcome::Conflict`] if another record blocks it.
    async fn save_in_progress(&self, record: &DataRecord) -> IdempotencyResult<WriteOutcome>;

    /// Reads a record.
    ///
    /// # Returns
    ///
    /// The stored record, or
    /// [`IdempotencyError::ItemNotFound`](crate::IdempotencyError::ItemNotFound) if absent.
    async fn get_record(&self, key: &IdempotencyKey) -> IdempotencyResult<DataRecord>;

    /// Overwrites a record with its completed form.
    async fn save_success(&self, record: &DataRecord) -> IdempotencyResult<()>;

    /// Deletes a record. Deleting an absent record is not an error.
    async fn delete_record(&self, key: &IdempotencyKey) -> IdempotencyResult<()>;
}

/// Shared backend handle used by the engine.
pub type SharedPersistenceBackend = Arc<dyn PersistenceBackend>;

#[async_trait]
impl<T: PersistenceBackend + ?Sized> PersistenceBackend for Arc<T> {
    async fn save_in_progress(&self, record: &DataRecord) -> IdempotencyResult<WriteOutcome> {
        (**self).save_in_progress(record).await
    }

    async fn get_record(&self, key: &IdempotencyKey) -> IdempotencyResult<DataRecord> {
        (**self).get_record(key).await
    }

    async fn save_success(&self, record: &DataRecord) -> IdempotencyResult<()> {
        (**self).save_success(record).await
    }

    async fn delete_record(&self, key: &IdempotencyKey) -> IdempotencyResult<()> {
        (**self).delete_record(key).await
    }
}
