//! Error types for idempotent execution.
//!
//! This module defines the error taxonomy surfaced by [`Idempotency::run`](crate::Idempotency::run)
//! and the persistence layer. Callers are expected to react differently to each
//! family of error:
//!
//! - [`IdempotencyError::AlreadyInProgress`] - someone else is handling this request; back off and retry
//! - [`IdempotencyError::PersistenceLayer`] - the store is unhealthy; alert
//! - [`IdempotencyError::PayloadValidation`] - a key was reused with a different request; reject
//!
//! # Type Aliases
//!
//! - [`IdempotencyResult<T>`] - result type used throughout the crate
//! - [`BoxError`] - the error type returned by wrapped functions

use thiserror::Error;

use crate::types::IdempotencyKey;

/// Boxed error returned by wrapped functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for idempotency operations.
///
/// # Expanded Form
///
/// ```rust,ignore
/// type IdempotencyResult<T> = Result<T, IdempotencyError>;
/// ```
pub type IdempotencyResult<T> = Result<T, IdempotencyError>;

/// The main error type for the idempotency layer.
#[derive(Debug, Error)]
pub enum IdempotencyError {
    /// No idempotency key could be derived and the configuration forbids
    /// proceeding without one.
    #[error("No data found to create a hashed idempotency key using expression '{expression}'")]
    KeyDerivation {
        /// The key extraction expression that produced no material
        expression: String,
    },

    /// The stored payload hash disagrees with the current request.
    #[error("Payload does not match stored record for idempotency key {idempotency_key}")]
    PayloadValidation {
        /// The key whose stored payload hash differs
        idempotency_key: IdempotencyKey,
    },

    /// A point read found no record for the key.
    ///
    /// Only escapes the engine through [`delete_record`](crate::Idempotency::delete_record)
    /// style administrative calls; during orchestration it is promoted to
    /// [`IdempotencyError::InconsistentState`].
    #[error("No idempotency record found for key {idempotency_key}")]
    ItemNotFound {
        /// The key that was looked up
        idempotency_key: IdempotencyKey,
    },

    /// Another invocation currently holds the key.
    #[error("Execution already in progress with idempotency key: {idempotency_key}")]
    AlreadyInProgress {
        /// The key held by the concurrent invocation
        idempotency_key: IdempotencyKey,
    },

    /// The store reported states that cannot all be true at once, usually
    /// because another writer changed the record between two calls.
    #[error("Inconsistent idempotency state: {message}")]
    InconsistentState {
        /// What was observed
        message: String,
    },

    /// Unexpected failure talking to the persistence backend.
    #[error("Persistence layer error: {message}")]
    PersistenceLayer {
        /// What the engine was doing when the backend failed
        message: String,
        /// The original backend error
        #[source]
        source: BoxError,
    },

    /// A stored record carried a status this crate does not know.
    #[error("Invalid idempotency record status: {status}")]
    InvalidStatus {
        /// The raw status value found in the store
        status: String,
    },

    /// Invalid configuration detected at construction time.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the problem
        message: String,
    },

    /// A result could not be serialized for storage or deserialized on replay.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the failure
        message: String,
    },

    /// The wrapped function failed. The original error is carried unchanged.
    #[error(transparent)]
    Handler(BoxError),
}

impl IdempotencyError {
    /// Creates a new InconsistentState error.
    pub fn inconsistent(message: impl Into<String>) -> Self {
        Self::InconsistentState {
            message: message.into(),
        }
    }

    /// Creates a new PersistenceLayer error wrapping a backend failure.
    pub fn persistence(
        message: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::PersistenceLayer {
            message: message.into(),
            source: source.into(),
        }
    }

    /// Creates a new Configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new Serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Returns true if the engine retries this error internally.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::InconsistentState { .. })
    }

    /// Returns true if this error came from the wrapped function.
    pub fn is_handler_error(&self) -> bool {
        matches!(self, Self::Handler(_))
    }

    /// Returns true if another invocation holds the key.
    pub fn is_already_in_progress(&self) -> bool {
        matches!(self, Self::AlreadyInProgress { .. })
    }

    /// Returns the wrapped function's error, if this is one.
    pub fn into_handler_error(self) -> Option<BoxError> {
        match self {
            Self::Handler(error) => Some(error),
            _ => None,
        }
    }

    /// Wraps any error other than the taxonomy's own in a PersistenceLayer error.
    ///
    /// Errors that already belong to the taxonomy pass through untouched so
    /// backends can return precise variants while the engine still guarantees
    /// nothing unexpected leaks out.
    pub(crate) fn or_persistence(self, message: &str) -> Self {
        match self {
            Self::PersistenceLayer { .. }
            | Self::ItemNotFound { .. }
            | Self::PayloadValidation { .. }
            | Self::KeyDerivation { .. }
            | Self::AlreadyInProgress { .. }
            | Self::InconsistentState { .. }
            | Self::InvalidStatus { .. }
            | Self::Configuration { .. }
            | Self::Serialization { .. } => self,
            Self::Handler(source) => Self::PersistenceLayer {
                message: message.to_string(),
                source,
            },
        }
    }
}

impl From<serde_json::Error> for IdempotencyError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization {
            message: error.to_string(),
        }
    }
}
