//! Integration tests for concurrent callers.
//!
//! These tests verify that concurrent invocations sharing a key run the
//! wrapped function once, that losers observe the winner's in-progress claim,
//! and that distinct keys do not block each other.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lambda_idempotency::persistence::{RedisBackend, RedisConfig};
use lambda_idempotency::{BoxError, Idempotency, IdempotencyError};
use lambda_idempotency_testing::{ManualClock, MemoryHashStore};
use tokio::sync::{oneshot, Barrier};

use common::*;

const CALLERS: usize = 16;

type RaceResults = Vec<Result<u32, IdempotencyError>>;

/// Starts one task per payload, releases them together and collects results.
async fn race(
    engine: &Idempotency,
    payloads: Vec<serde_json::Value>,
) -> (Arc<AtomicUsize>, RaceResults) {
    let calls = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(payloads.len()));
    let mut handles = Vec::new();

    for payload in payloads {
        let engine = engine.clone();
        let calls = calls.clone();
        let barrier = barrier.clone();
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            engine
                .run(&payload, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok::<_, BoxError>(42u32)
                })
                .await
        }));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }
    (calls, results)
}

fn assert_single_execution(calls: &Arc<AtomicUsize>, results: &[Result<u32, IdempotencyError>]) {
    assert_eq!(call_count(calls), 1);
    let mut winners = 0;
    for result in results {
        match result {
            Ok(value) => {
                assert_eq!(*value, 42);
                winners += 1;
            }
            Err(error) => assert!(error.is_already_in_progress(), "unexpected error: {error}"),
        }
    }
    assert!(winners >= 1);
}

// =============================================================================
// Two Callers
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_second_caller_sees_in_progress_then_replays() {
    let h = Harness::new(order_config());
    let payload = order("A1", 10);
    let (started_tx, started_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel::<()>();

    let engine = h.engine.clone();
    let first_payload = payload.clone();
    let first = tokio::spawn(async move {
        engine
            .run(&first_payload, move || async move {
                let _ = started_tx.send(());
                let _ = release_rx.await;
                Ok::<_, BoxError>("charged".to_string())
            })
            .await
    });

    started_rx.await.unwrap();
    let err = h
        .engine
        .run(&payload, || async { Ok::<_, BoxError>("charged twice".to_string()) })
        .await
        .unwrap_err();
    assert!(err.is_already_in_progress());

    release_tx.send(()).unwrap();
    assert_eq!(first.await.unwrap().unwrap(), "charged");

    let replayed: String = h
        .engine
        .run(&payload, || async { Ok::<_, BoxError>("charged twice".to_string()) })
        .await
        .unwrap();
    assert_eq!(replayed, "charged");
}

// =============================================================================
// Many Callers
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_execute_once() {
    let h = Harness::new(order_config());
    let payloads = vec![order("A1", 10); CALLERS];

    let (calls, results) = race(&h.engine, payloads).await;

    assert_single_execution(&calls, &results);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distinct_keys_run_in_parallel() {
    let h = Harness::new(order_config());
    let payloads = (0..8).map(|i| order(&format!("order-{i}"), 10)).collect();

    let (calls, results) = race(&h.engine, payloads).await;

    assert_eq!(call_count(&calls), 8);
    assert!(results.iter().all(|r| matches!(r, Ok(42))));
    assert_eq!(h.backend.store().len(), 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_execute_once_on_redis() {
    let clock = ManualClock::shared();
    let store = Arc::new(MemoryHashStore::new(clock.as_shared()));
    let backend = RedisBackend::new(store, RedisConfig::default())
        .unwrap()
        .with_clock(clock.as_shared());
    let engine = engine_for(Arc::new(backend), &clock, order_config());

    let (calls, results) = race(&engine, vec![order("A1", 10); CALLERS]).await;

    assert_single_execution(&calls, &results);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rolled_back_claim_is_free_for_next_caller() {
    let h = Harness::new(order_config());
    let payload = order("A1", 10);

    let err = h
        .engine
        .run(&payload, || async { Err::<u32, BoxError>(Box::new(GatewayTimeout)) })
        .await
        .unwrap_err();
    assert!(err.is_handler_error());

    let (calls, results) = race(&h.engine, vec![payload; CALLERS]).await;
    assert_single_execution(&calls, &results);
}
