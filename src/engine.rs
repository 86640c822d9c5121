//! The idempotency engine.
//!
//! [`Idempotency::run`] guarantees that, for one idempotency key, the wrapped
//! function runs at most once while its record is alive. Each call is one or
//! more attempts of this state machine:
//!
//! ```text
//! NotStarted -> SavingInProgress -> WrappedCallRunning -> Completed
//!                                |                     \-> RolledBack | Failed
//!                                \-> ReturningCachedResult -> Completed
//!                                \-> Failed
//! ```
//!
//! An attempt that observes an inconsistent store (a record that vanished or
//! expired between the conditional write and the read) is repeated from key
//! derivation, up to `max_retries` extra times.

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::cache::LocalCache;
use crate::clock::{SharedClock, SystemClock};
use crate::config::{lambda_function_name, IdempotencyConfig};
use crate::error::{BoxError, IdempotencyError, IdempotencyResult};
use crate::key::KeyDeriver;
use crate::persistence::{SharedPersistenceBackend, WriteOutcome};
use crate::record::{DataRecord, IdempotentHookData, RecordStatus};
use crate::serdes::{JsonSerDes, SerDes, SerDesContext};
use crate::types::IdempotencyKey;
use crate::validation::PayloadValidator;

/// Default name of the wrapped callable, used in key namespaces.
pub const DEFAULT_FUNCTION_NAME: &str = "handler";

/// State of one orchestration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    /// Nothing done yet.
    NotStarted,
    /// Writing the in-progress record.
    SavingInProgress,
    /// This attempt holds the key and is running the wrapped function.
    WrappedCallRunning,
    /// A completed record was found and its result is being replayed.
    ReturningCachedResult,
    /// The attempt ended with an error and left the store as it was.
    Failed,
    /// The attempt returned a result.
    Completed,
    /// The wrapped function failed and the in-progress record was deleted.
    RolledBack,
}

fn transition(key: &IdempotencyKey, attempt: u32, state: AttemptState) {
    tracing::debug!(idempotency_key = %key, attempt, state = ?state, "Idempotency state transition");
}

/// Builder for [`Idempotency`].
pub struct IdempotencyBuilder {
    backend: SharedPersistenceBackend,
    config: IdempotencyConfig,
    function_name: String,
    clock: Option<SharedClock>,
    cache: Option<LocalCache>,
}

impl IdempotencyBuilder {
    /// Sets the configuration.
    pub fn with_config(mut self, config: IdempotencyConfig) -> Self {
        self.config = config;
        self
    }

    /// Names the wrapped callable. Callables with different names never share records.
    pub fn with_function_name(mut self, function_name: impl Into<String>) -> Self {
        self.function_name = function_name.into();
        self
    }

    /// Replaces the system clock.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Uses an existing cache instead of creating one.
    ///
    /// Passing the same `LocalCache` to several engines lets them share
    /// completed records within the process. Setting a cache enables caching
    /// regardless of `use_local_cache`.
    pub fn with_local_cache(mut self, cache: LocalCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Validates the configuration and builds the engine.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError::Configuration`] for unparseable expressions
    /// or out-of-range settings.
    pub fn build(self) -> IdempotencyResult<Idempotency> {
        self.config.validate()?;
        if self.function_name.is_empty() {
            return Err(IdempotencyError::configuration("function name cannot be empty"));
        }

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let namespace = match lambda_function_name() {
            Some(lambda) => format!("{lambda}.{}", self.function_name),
            None => self.function_name.clone(),
        };
        let deriver = KeyDeriver::new(
            namespace,
            self.config.event_key()?,
            self.config.hash_function,
            self.config.raise_on_no_idempotency_key,
        );
        let validator =
            PayloadValidator::new(self.config.payload_validation()?, self.config.hash_function);
        let cache = match self.cache {
            Some(cache) => Some(cache),
            None if self.config.use_local_cache => Some(LocalCache::new(
                self.config.local_cache_max_items,
                clock.clone(),
            )),
            None => None,
        };

        Ok(Idempotency {
            config: Arc::new(self.config),
            backend: self.backend,
            deriver,
            validator,
            cache,
            clock,
            function_name: self.function_name,
        })
    }
}

/// Runs functions at most once per idempotency key.
///
/// Cloning is cheap; clones share the backend, the cache and the configuration.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use lambda_idempotency::{Idempotency, IdempotencyConfig, BoxError};
/// use lambda_idempotency::persistence::{DynamoDbBackend, DynamoDbConfig};
/// use serde_json::json;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = DynamoDbBackend::from_env(DynamoDbConfig::new("idempotency")).await?;
/// let idempotency = Idempotency::builder(Arc::new(backend))
///     .with_function_name("create_order")
///     .with_config(IdempotencyConfig::default().with_event_key_expression("order_id"))
///     .build()?;
///
/// let event = json!({"order_id": "A1", "amount": 10});
/// let receipt: String = idempotency
///     .run(&event, || async { Ok::<_, BoxError>("charged".to_string()) })
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Idempotency {
    config: Arc<IdempotencyConfig>,
    backend: SharedPersistenceBackend,
    deriver: KeyDeriver,
    validator: PayloadValidator,
    cache: Option<LocalCache>,
    clock: SharedClock,
    function_name: String,
}

impl std::fmt::Debug for Idempotency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Idempotency")
            .field("namespace", &self.deriver.namespace())
            .field("config", &self.config)
            .field("local_cache", &self.cache.is_some())
            .finish()
    }
}

impl Idempotency {
    /// Starts building an engine over a backend.
    pub fn builder(backend: SharedPersistenceBackend) -> IdempotencyBuilder {
        IdempotencyBuilder {
            backend,
            config: IdempotencyConfig::default(),
            function_name: DEFAULT_FUNCTION_NAME.to_string(),
            clock: None,
            cache: None,
        }
    }

    /// The frozen configuration.
    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    /// The local cache, if enabled.
    pub fn local_cache(&self) -> Option<&LocalCache> {
        self.cache.as_ref()
    }

    /// Derives the idempotency key for a payload.
    pub fn idempotency_key<P>(&self, payload: &P) -> IdempotencyResult<IdempotencyKey>
    where
        P: Serialize + ?Sized,
    {
        let payload = serde_json::to_value(payload)?;
        self.deriver.derive(&payload)
    }

    /// Runs `f` at most once for the payload's idempotency key.
    ///
    /// # Arguments
    ///
    /// * `payload` - The request; the key and validation hash are derived from it
    /// * `f` - The side-effecting function
    ///
    /// # Returns
    ///
    /// The function's result, either live or replayed from the store.
    ///
    /// # Errors
    ///
    /// - [`IdempotencyError::AlreadyInProgress`] if another invocation holds the key
    /// - [`IdempotencyError::PayloadValidation`] if the key was used with a different payload
    /// - [`IdempotencyError::Handler`] carrying the function's own error
    /// - [`IdempotencyError::PersistenceLayer`] if the store failed
    pub async fn run<P, T, F, Fut>(&self, payload: &P, f: F) -> IdempotencyResult<T>
    where
        P: Serialize + ?Sized,
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, BoxError>> + Send,
    {
        let serdes = JsonSerDes::<T>::new();
        self.run_with_serdes(payload, &serdes, self.config.remaining_time_budget_millis, f)
            .await
    }

    /// Like [`run`](Self::run), narrowing the in-progress expiry to the
    /// caller's remaining invocation time.
    pub async fn run_with_remaining_time<P, T, F, Fut>(
        &self,
        payload: &P,
        remaining_millis: u64,
        f: F,
    ) -> IdempotencyResult<T>
    where
        P: Serialize + ?Sized,
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, BoxError>> + Send,
    {
        let serdes = JsonSerDes::<T>::new();
        self.run_with_serdes(payload, &serdes, Some(remaining_millis), f)
            .await
    }

    /// Like [`run`](Self::run) with a custom result encoding.
    pub async fn run_with_serdes<P, T, F, Fut>(
        &self,
        payload: &P,
        serdes: &dyn SerDes<T>,
        remaining_millis: Option<u64>,
        f: F,
    ) -> IdempotencyResult<T>
    where
        P: Serialize + ?Sized,
        T: Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, BoxError>> + Send,
    {
        if self.config.disabled {
            tracing::debug!("Idempotency is disabled, calling the function directly");
            return f().await.map_err(IdempotencyError::Handler);
        }

        let payload = serde_json::to_value(payload)?;
        let mut f = Some(f);
        let mut attempt = 0;
        loop {
            match self
                .attempt(&payload, serdes, remaining_millis, attempt, &mut f)
                .await
            {
                Err(error) if error.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    tracing::warn!(attempt, error = %error, "Retrying idempotent call");
                }
                result => return result,
            }
        }
    }

    /// Deletes the record for a payload's key.
    ///
    /// # Returns
    ///
    /// The key that was deleted.
    pub async fn delete_record<P>(&self, payload: &P) -> IdempotencyResult<IdempotencyKey>
    where
        P: Serialize + ?Sized,
    {
        let key = self.idempotency_key(payload)?;
        self.backend
            .delete_record(&key)
            .await
            .map_err(|e| e.or_persistence("Failed to delete record from idempotency store"))?;
        if let Some(cache) = &self.cache {
            cache.delete(&key);
        }
        tracing::debug!(idempotency_key = %key, "Deleted idempotency record");
        Ok(key)
    }

    async fn attempt<T, F, Fut>(
        &self,
        payload: &Value,
        serdes: &dyn SerDes<T>,
        remaining_millis: Option<u64>,
        attempt: u32,
        f: &mut Option<F>,
    ) -> IdempotencyResult<T>
    where
        T: Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, BoxError>> + Send,
    {
        let key = self.deriver.derive(payload)?;
        let payload_hash = self.validator.compute(payload);
        let context = SerDesContext::new(key.clone(), self.function_name.clone());
        transition(&key, attempt, AttemptState::NotStarted);

        if let Some(record) = self.cache.as_ref().and_then(|cache| cache.get(&key)) {
            self.validator.check(&record, &payload_hash)?;
            transition(&key, attempt, AttemptState::ReturningCachedResult);
            let result = self.replay(&record, serdes, &context);
            transition(&key, attempt, AttemptState::Completed);
            return result;
        }

        let now_millis = self.clock.now_millis();
        let record = DataRecord::new(key.clone(), RecordStatus::InProgress)
            .with_expiry(self.expiry_timestamp())
            .with_in_progress_expiry(remaining_millis.map(|ms| {
                now_millis.saturating_add(i64::try_from(ms).unwrap_or(i64::MAX))
            }))
            .with_payload_hash(Some(payload_hash.clone()));

        transition(&key, attempt, AttemptState::SavingInProgress);
        let outcome = self
            .backend
            .save_in_progress(&record)
            .await
            .map_err(|e| e.or_persistence("Failed to save in progress record to idempotency store"))?;

        match outcome {
            WriteOutcome::Created => {
                let f = f.take().ok_or_else(|| {
                    IdempotencyError::inconsistent("wrapped function was already invoked")
                })?;
                self.call_wrapped(record, serdes, &context, attempt, f).await
            }
            WriteOutcome::Conflict => {
                let result = self
                    .resolve_conflict(&key, &payload_hash, serdes, &context, attempt)
                    .await;
                if result.is_err() {
                    transition(&key, attempt, AttemptState::Failed);
                }
                result
            }
        }
    }

    async fn call_wrapped<T, F, Fut>(
        &self,
        record: DataRecord,
        serdes: &dyn SerDes<T>,
        context: &SerDesContext,
        attempt: u32,
        f: F,
    ) -> IdempotencyResult<T>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, BoxError>> + Send,
    {
        let key = record.idempotency_key.clone();
        transition(&key, attempt, AttemptState::WrappedCallRunning);

        match f().await {
            Ok(value) => {
                // A result that cannot be stored leaves the in-progress record to expire.
                let data = serdes.serialize(&value, context)?;
                let completed = DataRecord::new(key.clone(), RecordStatus::Completed)
                    .with_expiry(self.expiry_timestamp())
                    .with_response_data(data)
                    .with_payload_hash(record.payload_hash);
                self.backend.save_success(&completed).await.map_err(|e| {
                    e.or_persistence("Failed to update record state to success in idempotency store")
                })?;
                if let Some(cache) = &self.cache {
                    cache.put(&completed);
                }
                transition(&key, attempt, AttemptState::Completed);
                Ok(value)
            }
            Err(error) => {
                if self.config.is_retryable(error.as_ref()) {
                    self.backend.delete_record(&key).await.map_err(|e| {
                        e.or_persistence("Failed to delete record from idempotency store")
                    })?;
                    if let Some(cache) = &self.cache {
                        cache.delete(&key);
                    }
                    transition(&key, attempt, AttemptState::RolledBack);
                } else {
                    tracing::debug!(
                        idempotency_key = %key,
                        "Non-retryable error, leaving in progress record to expire"
                    );
                    transition(&key, attempt, AttemptState::Failed);
                }
                Err(IdempotencyError::Handler(error))
            }
        }
    }

    async fn resolve_conflict<T>(
        &self,
        key: &IdempotencyKey,
        payload_hash: &str,
        serdes: &dyn SerDes<T>,
        context: &SerDesContext,
        attempt: u32,
    ) -> IdempotencyResult<T> {
        let record = match self.backend.get_record(key).await {
            Ok(record) => record,
            Err(IdempotencyError::ItemNotFound { .. }) => {
                return Err(IdempotencyError::inconsistent(format!(
                    "record for {key} vanished after a conflicting write"
                )));
            }
            Err(e) => return Err(e.or_persistence("Failed to get record from idempotency store")),
        };

        self.validator.check(&record, payload_hash)?;

        match record.status_at(self.clock.now_secs()) {
            RecordStatus::Expired => Err(IdempotencyError::inconsistent(format!(
                "record for {key} expired after a conflicting write"
            ))),
            RecordStatus::InProgress => {
                if record.is_in_progress_expired(self.clock.now_millis()) {
                    return Err(IdempotencyError::inconsistent(format!(
                        "in progress record for {key} expired after a conflicting write"
                    )));
                }
                Err(IdempotencyError::AlreadyInProgress {
                    idempotency_key: key.clone(),
                })
            }
            RecordStatus::Completed => {
                if let Some(cache) = &self.cache {
                    cache.put(&record);
                }
                transition(key, attempt, AttemptState::ReturningCachedResult);
                let result = self.replay(&record, serdes, context);
                if result.is_ok() {
                    transition(key, attempt, AttemptState::Completed);
                }
                result
            }
        }
    }

    fn replay<T>(
        &self,
        record: &DataRecord,
        serdes: &dyn SerDes<T>,
        context: &SerDesContext,
    ) -> IdempotencyResult<T> {
        let data = record.response_data.as_deref().ok_or_else(|| {
            IdempotencyError::serialization(format!(
                "completed record {} has no stored result",
                record.idempotency_key
            ))
        })?;

        match &self.config.response_hook {
            Some(hook) => {
                let value: Value = serde_json::from_str(data)?;
                let hooked = hook(value, &IdempotentHookData::from(record));
                let data = serde_json::to_string(&hooked)?;
                Ok(serdes.deserialize(&data, context)?)
            }
            None => Ok(serdes.deserialize(data, context)?),
        }
    }

    fn expiry_timestamp(&self) -> i64 {
        let expires_after = i64::try_from(self.config.expires_after_seconds).unwrap_or(i64::MAX);
        self.clock.now_secs().saturating_add(expires_after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryBackend;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn engine(config: IdempotencyConfig) -> (Idempotency, Arc<InMemoryBackend>) {
        let backend = Arc::new(InMemoryBackend::new());
        let engine = Idempotency::builder(backend.clone())
            .with_function_name("charge")
            .with_config(config.with_disabled(false))
            .build()
            .unwrap();
        (engine, backend)
    }

    #[tokio::test]
    async fn test_second_call_replays_without_invoking() {
        let (engine, backend) =
            engine(IdempotencyConfig::default().with_event_key_expression("order_id"));
        let calls = AtomicUsize::new(0);
        let payload = json!({"order_id": "A1"});

        for _ in 0..2 {
            let counter = &calls;
            let result: Value = engine
                .run(&payload, move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, BoxError>(json!({"status": "ok"}))
                })
                .await
                .unwrap();
            assert_eq!(result, json!({"status": "ok"}));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let key = engine.idempotency_key(&payload).unwrap();
        let stored = backend.snapshot(&key).unwrap();
        assert_eq!(stored.status, RecordStatus::Completed);
        assert_eq!(stored.response_data.as_deref(), Some(r#"{"status":"ok"}"#));
    }

    #[tokio::test]
    async fn test_disabled_bypasses_store() {
        let backend = Arc::new(InMemoryBackend::new());
        let engine = Idempotency::builder(backend.clone())
            .with_config(IdempotencyConfig::default().with_disabled(true))
            .build()
            .unwrap();
        let value: u32 = engine.run(&json!({}), || async { Ok::<_, BoxError>(7) }).await.unwrap();
        assert_eq!(value, 7);
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_handler_error_passes_through() {
        let (engine, _) = engine(IdempotencyConfig::default());
        let err = engine
            .run(&json!({"a": 1}), || async { Err::<(), BoxError>("declined".into()) })
            .await
            .unwrap_err();
        assert!(err.is_handler_error());
        assert_eq!(err.to_string(), "declined");
    }

    #[tokio::test]
    async fn test_response_hook_sees_replayed_result() {
        let config = IdempotencyConfig::default().with_response_hook(|mut value, data| {
            value["replayed_key"] = json!(data.idempotency_key.as_str());
            value
        });
        let (engine, _) = engine(config);
        let payload = json!({"id": 1});

        let first: Value = engine.run(&payload, || async { Ok::<_, BoxError>(json!({"n": 1})) }).await.unwrap();
        assert_eq!(first, json!({"n": 1}));

        let second: Value = engine.run(&payload, || async { Ok::<_, BoxError>(json!({"n": 2})) }).await.unwrap();
        let key = engine.idempotency_key(&payload).unwrap();
        assert_eq!(second, json!({"n": 1, "replayed_key": key.as_str()}));
    }

    #[test]
    fn test_build_rejects_bad_expression() {
        let backend = Arc::new(InMemoryBackend::new());
        let err = Idempotency::builder(backend)
            .with_config(IdempotencyConfig::default().with_event_key_expression("[a"))
            .build()
            .unwrap_err();
        assert!(matches!(err, IdempotencyError::Configuration { .. }));
    }

    #[test]
    fn test_build_rejects_empty_function_name() {
        let backend = Arc::new(InMemoryBackend::new());
        assert!(Idempotency::builder(backend)
            .with_function_name("")
            .build()
            .is_err());
    }
}
