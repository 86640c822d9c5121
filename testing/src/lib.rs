//! Testing utilities for lambda-idempotency
//!
//! # Features
//!
//! - **ManualClock**: A clock tests advance by hand to drive expiry
//! - **MockBackend**: A recording persistence backend with fault injection
//! - **MemoryHashStore**: An in-memory Redis stand-in for the Redis backend
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use lambda_idempotency::{BoxError, Idempotency, IdempotencyConfig};
//! use lambda_idempotency_testing::{BackendOp, ManualClock, MockBackend};
//! use serde_json::json;
//!
//! # tokio_test_block_on(async {
//! let clock = ManualClock::shared();
//! let backend = Arc::new(MockBackend::new(clock.as_shared()));
//! let idempotency = Idempotency::builder(backend.clone())
//!     .with_clock(clock.as_shared())
//!     .with_config(IdempotencyConfig::default().with_disabled(false))
//!     .build()
//!     .unwrap();
//!
//! let value: u32 = idempotency
//!     .run(&json!({"id": 1}), || async { Ok::<_, BoxError>(1) })
//!     .await
//!     .unwrap();
//! assert_eq!(value, 1);
//! assert_eq!(backend.call_count(BackendOp::SaveSuccess), 1);
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```

pub mod clock;
pub mod hash_store;
pub mod mock_backend;

pub use clock::{ManualClock, DEFAULT_START_MILLIS};
pub use hash_store::MemoryHashStore;
pub use mock_backend::{BackendCall, BackendOp, MockBackend};
