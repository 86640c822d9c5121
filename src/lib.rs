//! # Idempotency for Lambda Rust Handlers
//!
//! This crate makes a side-effecting function safe to retry: for a given
//! idempotency key, the function runs at most once while its record lives in
//! a persistence store, and every later call with the same key gets the stored
//! result back.
//!
//! ## Overview
//!
//! Each call derives a key from the request payload, then claims the key in
//! the store with a conditional write. The invocation that wins the claim runs
//! the function and records its result. Invocations that lose the claim either
//! replay the recorded result or fail with
//! [`IdempotencyError::AlreadyInProgress`] while the winner is still running.
//!
//! ### Key Features
//!
//! - **Key Derivation**: Select the part of the payload that identifies a
//!   request with a JMESPath-style expression such as `[user_id, body.order_id]`.
//! - **Payload Validation**: Reject a reused key whose payload changed in the
//!   fields that matter.
//! - **Crash Recovery**: Records of invocations that ran out of time are taken
//!   over by the next caller instead of blocking the key until expiry.
//! - **Rollback**: A retryable failure deletes the claim so the next call runs
//!   the function again.
//! - **Local Cache**: Completed results can be kept in an in-process LRU cache.
//! - **Pluggable Stores**: DynamoDB and Redis bindings, plus an in-memory store.
//!
//! ## Getting Started
//!
//! ```toml
//! [dependencies]
//! lambda-idempotency = "0.1"
//! tokio = { version = "1.0", features = ["full"] }
//! serde = { version = "1.0", features = ["derive"] }
//! ```
//!
//! ### Basic Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use lambda_idempotency::{BoxError, Idempotency, IdempotencyConfig};
//! use lambda_idempotency::persistence::{DynamoDbBackend, DynamoDbConfig};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Payment {
//!     payment_id: String,
//!     amount: u64,
//! }
//!
//! #[derive(Serialize, Deserialize)]
//! struct Receipt {
//!     confirmation: String,
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = DynamoDbBackend::from_env(DynamoDbConfig::new("idempotency")).await?;
//! let idempotency = Idempotency::builder(Arc::new(backend))
//!     .with_function_name("charge")
//!     .with_config(
//!         IdempotencyConfig::default()
//!             .with_event_key_expression("payment_id")
//!             .with_payload_validation_expression("amount")
//!             .with_expires_after_seconds(3600),
//!     )
//!     .build()?;
//!
//! let payment = Payment { payment_id: "p-1".into(), amount: 10 };
//! let receipt: Receipt = idempotency
//!     .run(&payment, || async {
//!         Ok::<_, BoxError>(Receipt { confirmation: "c-42".into() })
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Redis
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use lambda_idempotency::Idempotency;
//! use lambda_idempotency::persistence::{RedisBackend, RedisConfig};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = RedisBackend::from_url("redis://127.0.0.1/", RedisConfig::default())?;
//! let idempotency = Idempotency::builder(Arc::new(backend)).build()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! All operations return [`IdempotencyResult`]. The wrapped function's own
//! errors come back unchanged inside [`IdempotencyError::Handler`]; use
//! [`IdempotencyError::into_handler_error`] to recover them.
//!
//! ## Disabling
//!
//! Setting `POWERTOOLS_IDEMPOTENCY_DISABLED=true` makes every call run the
//! function directly without touching the store.

pub mod cache;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod expression;
pub mod key;
pub mod persistence;
pub mod record;
pub mod serdes;
pub mod types;
pub mod validation;

// Re-export main types at crate root
pub use cache::LocalCache;
pub use clock::{Clock, SharedClock, SystemClock};
pub use config::*;
pub use engine::{AttemptState, Idempotency, IdempotencyBuilder, DEFAULT_FUNCTION_NAME};
pub use error::{BoxError, IdempotencyError, IdempotencyResult};
pub use expression::{Expression, ExpressionError};
pub use key::{HashFunction, KeyDeriver};
pub use persistence::{PersistenceBackend, SharedPersistenceBackend, WriteOutcome};
pub use record::{DataRecord, IdempotentHookData, RecordStatus};
pub use serdes::{JsonSerDes, SerDes, SerDesContext, SerDesError, SerDesErrorKind};
pub use types::{IdempotencyKey, ValidationError};
pub use validation::PayloadValidator;
