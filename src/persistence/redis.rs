//! Redis persistence backend.
//!
//! One hash per record, keyed by the idempotency key, with the fields
//! `status`, `data`, `in_progress_expiration` and `validation`. The record
//! expiry is the key's TTL.
//!
//! Redis has no multi-field conditional put, so an in-progress save works in
//! steps:
//!
//! 1. `HSETNX key status INPROGRESS` claims the key atomically.
//! 2. On success the remaining fields and the TTL are written in one
//!    `MULTI`/`EXEC` pipeline.
//! 3. On failure the hash and its TTL are read. A completed record, or an
//!    in-progress one whose in-progress expiry has not passed, is a conflict.
//!    Anything else is an orphan: the caller that wins `SET key:lock NX EX`
//!    replaces it with `DEL`, `HSET` and `EXPIRE` in one `MULTI`/`EXEC`, and
//!    everyone else gets a conflict. The key never goes missing during the
//!    replacement, so a concurrent `HSETNX` cannot claim it.
//!
//! A process that dies between steps 1 and 2 leaves a hash with no TTL. Such
//! a record never expires on its own and blocks its key until it is deleted.
//! This is a known gap of the two-step write.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::{Mutex, MutexGuard, OnceCell};

use crate::clock::{SharedClock, SystemClock};
use crate::error::{IdempotencyError, IdempotencyResult};
use crate::persistence::{PersistenceBackend, WriteOutcome};
use crate::record::{DataRecord, RecordStatus};
use crate::types::IdempotencyKey;

/// Upper bound on the orphan lock lifetime, seconds.
pub const MAX_ORPHAN_LOCK_SECONDS: i64 = 10;

/// Hash operations the Redis backend needs.
///
/// [`RedisHashStore`] talks to a server; tests can supply an in-memory
/// implementation.
#[async_trait]
pub trait HashStore: Send + Sync {
    /// Returns true if replies are decoded as text.
    fn decodes_responses(&self) -> bool;

    /// `HSETNX key field value`; true if the field was set.
    async fn claim(&self, key: &str, field: &str, value: &str) -> IdempotencyResult<bool>;

    /// `HSET key fields...` followed by `EXPIRE key ttl` when a TTL is given.
    ///
    /// Either part may be empty; the `HSET` is skipped when there are no fields.
    async fn write(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl_seconds: Option<i64>,
    ) -> IdempotencyResult<()>;

    /// `HGETALL key` and `TTL key`. The TTL is -2 for a missing key and -1
    /// for a key without expiry.
    async fn read(&self, key: &str) -> IdempotencyResult<(HashMap<String, String>, i64)>;

    /// `SET key token NX EX ttl`; true if the lock was taken.
    async fn lock(&self, key: &str, token: &str, ttl_seconds: i64) -> IdempotencyResult<bool>;

    /// `DEL key`, `HSET key fields...` and `EXPIRE key ttl` as one transaction.
    async fn replace(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl_seconds: Option<i64>,
    ) -> IdempotencyResult<()>;

    /// `DEL key`.
    async fn delete(&self, key: &str) -> IdempotencyResult<()>;
}

/// [`HashStore`] backed by a Redis server.
///
/// The connection is opened on first use and shared by every call through
/// an async mutex.
pub struct RedisHashStore {
    client: redis::Client,
    connection: OnceCell<Mutex<ConnectionManager>>,
    decode_responses: bool,
}

impl RedisHashStore {
    /// Creates a store for a client. No connection is made yet.
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            connection: OnceCell::new(),
            decode_responses: true,
        }
    }

    /// Creates a store from a URL such as `redis://localhost:6379/0`.
    pub fn open(url: &str) -> IdempotencyResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| IdempotencyError::configuration(format!("invalid Redis URL: {e}")))?;
        Ok(Self::new(client))
    }

    /// Sets whether replies are decoded as text.
    pub fn with_decode_responses(mut self, decode_responses: bool) -> Self {
        self.decode_responses = decode_responses;
        self
    }

    async fn connection(&self) -> IdempotencyResult<MutexGuard<'_, ConnectionManager>> {
        let connection = self
            .connection
            .get_or_try_init(|| async {
                ConnectionManager::new(self.client.clone())
                    .await
                    .map(Mutex::new)
            })
            .await
            .map_err(|e| IdempotencyError::persistence("Failed to connect to Redis", e))?;
        Ok(connection.lock().await)
    }
}

#[async_trait]
impl HashStore for RedisHashStore {
    fn decodes_responses(&self) -> bool {
        self.decode_responses
    }

    async fn claim(&self, key: &str, field: &str, value: &str) -> IdempotencyResult<bool> {
        let mut guard = self.connection().await?;
        let conn = &mut *guard;
        let claimed: bool = conn
            .hset_nx(key, field, value)
            .await
            .map_err(|e| IdempotencyError::persistence("Redis HSETNX failed", e))?;
        Ok(claimed)
    }

    async fn write(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl_seconds: Option<i64>,
    ) -> IdempotencyResult<()> {
        if fields.is_empty() && ttl_seconds.is_none() {
            return Ok(());
        }
        let mut guard = self.connection().await?;
        let conn = &mut *guard;
        let mut pipe = redis::pipe();
        pipe.atomic();
        if !fields.is_empty() {
            pipe.hset_multiple(key, fields).ignore();
        }
        if let Some(ttl) = ttl_seconds {
            pipe.expire(key, ttl).ignore();
        }
        let _: () = pipe
            .query_async(conn)
            .await
            .map_err(|e| IdempotencyError::persistence("Redis HSET/EXPIRE failed", e))?;
        Ok(())
    }

    async fn read(&self, key: &str) -> IdempotencyResult<(HashMap<String, String>, i64)> {
        let mut guard = self.connection().await?;
        let conn = &mut *guard;
        let (fields, ttl): (HashMap<String, String>, i64) = redis::pipe()
            .hgetall(key)
            .ttl(key)
            .query_async(conn)
            .await
            .map_err(|e| IdempotencyError::persistence("Redis HGETALL/TTL failed", e))?;
        Ok((fields, ttl))
    }

    async fn lock(&self, key: &str, token: &str, ttl_seconds: i64) -> IdempotencyResult<bool> {
        let mut guard = self.connection().await?;
        let conn = &mut *guard;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds)
            .query_async(conn)
            .await
            .map_err(|e| IdempotencyError::persistence("Redis SET NX failed", e))?;
        Ok(reply.is_some())
    }

    async fn replace(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl_seconds: Option<i64>,
    ) -> IdempotencyResult<()> {
        let mut guard = self.connection().await?;
        let conn = &mut *guard;
        let mut pipe = redis::pipe();
        pipe.atomic().del(key).ignore();
        if !fields.is_empty() {
            pipe.hset_multiple(key, fields).ignore();
        }
        if let Some(ttl) = ttl_seconds {
            pipe.expire(key, ttl).ignore();
        }
        let _: () = pipe
            .query_async(conn)
            .await
            .map_err(|e| IdempotencyError::persistence("Redis DEL/HSET/EXPIRE failed", e))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> IdempotencyResult<()> {
        let mut guard = self.connection().await?;
        let conn = &mut *guard;
        let _: () = conn
            .del(key)
            .await
            .map_err(|e| IdempotencyError::persistence("Redis DEL failed", e))?;
        Ok(())
    }
}

/// Hash field names.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// In-progress expiry field, epoch milliseconds
    pub in_progress_expiry_attr: String,
    /// Status field
    pub status_attr: String,
    /// Serialized result field
    pub data_attr: String,
    /// Payload hash field
    pub validation_key_attr: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            in_progress_expiry_attr: "in_progress_expiration".to_string(),
            status_attr: "status".to_string(),
            data_attr: "data".to_string(),
            validation_key_attr: "validation".to_string(),
        }
    }
}

impl RedisConfig {
    /// Sets the in-progress expiry field.
    pub fn with_in_progress_expiry_attr(mut self, attr: impl Into<String>) -> Self {
        self.in_progress_expiry_attr = attr.into();
        self
    }

    /// Sets the status field.
    pub fn with_status_attr(mut self, attr: impl Into<String>) -> Self {
        self.status_attr = attr.into();
        self
    }

    /// Sets the result field.
    pub fn with_data_attr(mut self, attr: impl Into<String>) -> Self {
        self.data_attr = attr.into();
        self
    }

    /// Sets the payload hash field.
    pub fn with_validation_key_attr(mut self, attr: impl Into<String>) -> Self {
        self.validation_key_attr = attr.into();
        self
    }
}

/// Backend storing records as Redis hashes.
pub struct RedisBackend {
    store: Arc<dyn HashStore>,
    config: RedisConfig,
    clock: SharedClock,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("config", &self.config)
            .finish()
    }
}

impl RedisBackend {
    /// Creates a backend over a hash store.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the store does not decode replies as text.
    pub fn new(store: Arc<dyn HashStore>, config: RedisConfig) -> IdempotencyResult<Self> {
        if !store.decodes_responses() {
            return Err(IdempotencyError::configuration(
                "Redis client must decode responses as text",
            ));
        }
        Ok(Self {
            store,
            config,
            clock: Arc::new(SystemClock),
        })
    }

    /// Creates a backend connected to `url`.
    pub fn from_url(url: &str, config: RedisConfig) -> IdempotencyResult<Self> {
        Self::new(Arc::new(RedisHashStore::open(url)?), config)
    }

    /// Replaces the clock used to compute TTLs and judge orphans.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    fn ttl_for(&self, record: &DataRecord) -> Option<i64> {
        record
            .expiry_timestamp
            .map(|expiry| (expiry - self.clock.now_secs()).max(1))
    }

    fn in_progress_fields(&self, record: &DataRecord) -> Vec<(String, String)> {
        let c = &self.config;
        let mut fields = Vec::new();
        if let Some(in_progress_expiry) = record.in_progress_expiry_timestamp {
            fields.push((c.in_progress_expiry_attr.clone(), in_progress_expiry.to_string()));
        }
        if let Some(hash) = &record.payload_hash {
            fields.push((c.validation_key_attr.clone(), hash.clone()));
        }
        fields
    }

    fn fields_to_record(
        &self,
        key: &IdempotencyKey,
        fields: &HashMap<String, String>,
        ttl: i64,
    ) -> IdempotencyResult<DataRecord> {
        let c = &self.config;
        let status = fields
            .get(&c.status_attr)
            .map(String::as_str)
            .unwrap_or_default()
            .parse::<RecordStatus>()?;
        let mut record = DataRecord::new(key.clone(), status)
            .with_in_progress_expiry(
                fields
                    .get(&c.in_progress_expiry_attr)
                    .and_then(|v| v.parse::<i64>().ok()),
            )
            .with_payload_hash(fields.get(&c.validation_key_attr).cloned());
        record.response_data = fields.get(&c.data_attr).cloned();
        if ttl >= 0 {
            record.expiry_timestamp = Some(self.clock.now_secs() + ttl);
        }
        Ok(record)
    }

    async fn overwrite_orphan(&self, record: &DataRecord) -> IdempotencyResult<WriteOutcome> {
        let key = record.idempotency_key.as_str();
        let ttl = self.ttl_for(record);
        let lock_seconds = ttl
            .unwrap_or(MAX_ORPHAN_LOCK_SECONDS)
            .min(MAX_ORPHAN_LOCK_SECONDS);
        let token = uuid::Uuid::new_v4().to_string();
        let lock_key = format!("{key}:lock");

        tracing::debug!(idempotency_key = %record.idempotency_key, "Acquiring lock to overwrite orphan record");
        if !self.store.lock(&lock_key, &token, lock_seconds).await? {
            tracing::debug!(idempotency_key = %record.idempotency_key, "Orphan lock held by another caller");
            return Ok(WriteOutcome::Conflict);
        }

        // The lock is left to expire so a racing caller cannot repair the same orphan twice.
        let mut fields = vec![(
            self.config.status_attr.clone(),
            RecordStatus::InProgress.as_str().to_string(),
        )];
        fields.extend(self.in_progress_fields(record));
        self.store.replace(key, &fields, ttl).await?;
        Ok(WriteOutcome::Created)
    }
}

#[async_trait]
impl PersistenceBackend for RedisBackend {
    async fn save_in_progress(&self, record: &DataRecord) -> IdempotencyResult<WriteOutcome> {
        let key = record.idempotency_key.as_str();
        tracing::debug!(idempotency_key = %record.idempotency_key, "Putting in progress record on Redis");

        let claimed = self
            .store
            .claim(key, &self.config.status_attr, RecordStatus::InProgress.as_str())
            .await?;
        if claimed {
            let fields = self.in_progress_fields(record);
            self.store.write(key, &fields, self.ttl_for(record)).await?;
            return Ok(WriteOutcome::Created);
        }

        let (fields, ttl) = self.store.read(key).await?;
        if !fields.is_empty() {
            if let Ok(existing) = self.fields_to_record(&record.idempotency_key, &fields, ttl) {
                if !existing.is_replaceable(self.clock.now_millis()) {
                    return Ok(WriteOutcome::Conflict);
                }
            }
        }
        self.overwrite_orphan(record).await
    }

    async fn get_record(&self, key: &IdempotencyKey) -> IdempotencyResult<DataRecord> {
        let (fields, ttl) = self.store.read(key.as_str()).await?;
        if fields.is_empty() {
            return Err(IdempotencyError::ItemNotFound {
                idempotency_key: key.clone(),
            });
        }
        self.fields_to_record(key, &fields, ttl)
    }

    async fn save_success(&self, record: &DataRecord) -> IdempotencyResult<()> {
        let c = &self.config;
        tracing::debug!(idempotency_key = %record.idempotency_key, "Updating record on Redis");
        let mut fields = vec![
            (c.status_attr.clone(), RecordStatus::Completed.as_str().to_string()),
            (
                c.data_attr.clone(),
                record.response_data.clone().unwrap_or_default(),
            ),
        ];
        if let Some(hash) = &record.payload_hash {
            fields.push((c.validation_key_attr.clone(), hash.clone()));
        }
        self.store
            .write(record.idempotency_key.as_str(), &fields, self.ttl_for(record))
            .await
    }

    async fn delete_record(&self, key: &IdempotencyKey) -> IdempotencyResult<()> {
        tracing::debug!(idempotency_key = %key, "Deleting record on Redis");
        self.store.delete(key.as_str()).await
    }
}
