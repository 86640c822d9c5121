//! Shared test utilities for integration tests.
//!
//! Provides a harness wiring an engine to a [`MockBackend`] and a
//! [`ManualClock`], wrapped-function helpers that count invocations, and
//! proptest strategies for payloads.

#![allow(dead_code)] // These utilities are used by other integration test files

use std::future::{ready, Ready};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use lambda_idempotency::{
    BoxError, DataRecord, Idempotency, IdempotencyConfig, IdempotencyKey, RecordStatus,
    SharedPersistenceBackend,
};
use lambda_idempotency_testing::{ManualClock, MockBackend};
use proptest::prelude::*;
use serde_json::{json, Value};

pub const FUNCTION_NAME: &str = "process_order";

// =============================================================================
// Harness
// =============================================================================

/// An engine plus the clock and backend it runs against.
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub backend: Arc<MockBackend>,
    pub engine: Idempotency,
}

impl Harness {
    /// Builds a harness around `config`.
    pub fn new(config: IdempotencyConfig) -> Self {
        let clock = ManualClock::shared();
        let backend = Arc::new(MockBackend::new(clock.as_shared()));
        let engine = engine_for(backend.clone(), &clock, config);
        Self {
            clock,
            backend,
            engine,
        }
    }

    /// The key the engine derives for `payload`.
    pub fn key(&self, payload: &Value) -> IdempotencyKey {
        self.engine.idempotency_key(payload).unwrap()
    }

    /// The stored record for `payload`, if any.
    pub fn stored(&self, payload: &Value) -> Option<DataRecord> {
        self.backend.store().snapshot(&self.key(payload))
    }

    /// Current clock reading in seconds.
    pub fn now_secs(&self) -> i64 {
        use lambda_idempotency::Clock;
        self.clock.now_secs()
    }

    /// Current clock reading in milliseconds.
    pub fn now_millis(&self) -> i64 {
        use lambda_idempotency::Clock;
        self.clock.now_millis()
    }
}

/// Builds an engine named [`FUNCTION_NAME`] over any backend.
pub fn engine_for(
    backend: SharedPersistenceBackend,
    clock: &Arc<ManualClock>,
    config: IdempotencyConfig,
) -> Idempotency {
    Idempotency::builder(backend)
        .with_function_name(FUNCTION_NAME)
        .with_clock(clock.as_shared())
        .with_config(config)
        .build()
        .unwrap()
}

/// Default configuration with the environment kill switch forced off.
pub fn base_config() -> IdempotencyConfig {
    IdempotencyConfig::default().with_disabled(false)
}

/// Configuration keyed on `order_id`.
pub fn order_config() -> IdempotencyConfig {
    base_config().with_event_key_expression("order_id")
}

pub fn order(order_id: &str, amount: u64) -> Value {
    json!({"order_id": order_id, "amount": amount, "currency": "EUR"})
}

/// An in-progress record for `key` that expires well after the harness start.
pub fn in_progress_record(harness: &Harness, payload: &Value) -> DataRecord {
    DataRecord::new(harness.key(payload), RecordStatus::InProgress)
        .with_expiry(harness.now_secs() + 3_600)
}

// =============================================================================
// Wrapped Functions
// =============================================================================

/// A wrapped function that bumps `calls` and returns `result`.
pub fn counted<T>(
    calls: &Arc<AtomicUsize>,
    result: Result<T, BoxError>,
) -> impl FnOnce() -> Ready<Result<T, BoxError>> + Send
where
    T: Send,
{
    let calls = calls.clone();
    move || {
        calls.fetch_add(1, Ordering::SeqCst);
        ready(result)
    }
}

pub fn call_count(calls: &Arc<AtomicUsize>) -> usize {
    calls.load(Ordering::SeqCst)
}

/// Error type used to exercise non-retryable classification.
#[derive(Debug, thiserror::Error)]
#[error("card declined: {0}")]
pub struct CardDeclined(pub String);

/// Error type that stays retryable.
#[derive(Debug, thiserror::Error)]
#[error("gateway timeout")]
pub struct GatewayTimeout;

/// Installs a test subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// =============================================================================
// Proptest Strategies
// =============================================================================

/// Strategy for order identifiers.
pub fn order_id_strategy() -> impl Strategy<Value = String> {
    "[a-z0-9]{1,12}"
}

/// Strategy for flat JSON payloads with an `order_id` and extra fields.
pub fn order_payload_strategy() -> impl Strategy<Value = Value> {
    (
        order_id_strategy(),
        0u64..10_000,
        prop::collection::btree_map("[a-z]{1,6}", any::<i32>(), 0..4),
    )
        .prop_map(|(order_id, amount, extra)| {
            let mut payload = json!({"order_id": order_id, "amount": amount});
            for (k, v) in extra {
                if k != "order_id" && k != "amount" {
                    payload[k] = json!(v);
                }
            }
            payload
        })
}
