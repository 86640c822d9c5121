//! Encoding of wrapped-function results for storage.
//!
//! Results are stored as strings in the `data` field of a completed record.
//! [`JsonSerDes`] is used by [`Idempotency::run`](crate::Idempotency::run);
//! implement [`SerDes`] and call
//! [`Idempotency::run_with_serdes`](crate::Idempotency::run_with_serdes) to store
//! results in another format.
//!
//! # Example
//!
//! ```rust
//! use lambda_idempotency::serdes::{JsonSerDes, SerDes, SerDesContext};
//! use lambda_idempotency::types::IdempotencyKey;
//!
//! let serdes = JsonSerDes::<Vec<u32>>::new();
//! let context = SerDesContext::new(IdempotencyKey::from("fn#1"), "fn");
//! let stored = serdes.serialize(&vec![1, 2], &context).unwrap();
//! assert_eq!(stored, "[1,2]");
//! assert_eq!(serdes.deserialize(&stored, &context).unwrap(), vec![1, 2]);
//! ```

use std::fmt;
use std::marker::PhantomData;

use serde::{de::DeserializeOwned, Serialize};

use crate::error::IdempotencyError;
use crate::types::IdempotencyKey;

/// Error type for result encoding failures.
#[derive(Debug, Clone)]
pub struct SerDesError {
    /// Which direction failed
    pub kind: SerDesErrorKind,
    /// Descriptive error message
    pub message: String,
}

/// The kind of SerDes error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerDesErrorKind {
    /// Error while storing a result
    Serialization,
    /// Error while replaying a stored result
    Deserialization,
}

impl SerDesError {
    /// Creates a new serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self {
            kind: SerDesErrorKind::Serialization,
            message: message.into(),
        }
    }

    /// Creates a new deserialization error.
    pub fn deserialization(message: impl Into<String>) -> Self {
        Self {
            kind: SerDesErrorKind::Deserialization,
            message: message.into(),
        }
    }
}

impl fmt::Display for SerDesError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            SerDesErrorKind::Serialization => write!(f, "failed to store result: {}", self.message),
            SerDesErrorKind::Deserialization => {
                write!(f, "failed to replay stored result: {}", self.message)
            }
        }
    }
}

impl std::error::Error for SerDesError {}

impl From<SerDesError> for IdempotencyError {
    fn from(error: SerDesError) -> Self {
        IdempotencyError::serialization(error.to_string())
    }
}

/// The record a result belongs to.
#[derive(Debug, Clone)]
pub struct SerDesContext {
    /// Key of the record holding the result
    pub idempotency_key: IdempotencyKey,
    /// Name of the wrapped function
    pub function_name: String,
}

impl SerDesContext {
    /// Creates a new SerDesContext.
    pub fn new(idempotency_key: IdempotencyKey, function_name: impl Into<String>) -> Self {
        Self {
            idempotency_key,
            function_name: function_name.into(),
        }
    }
}

/// Converts results to and from their stored form.
///
/// Implementations must be `Send + Sync` so one instance can serve
/// concurrent runs.
pub trait SerDes<T>: Send + Sync {
    /// Encodes a result for storage.
    ///
    /// # Arguments
    ///
    /// * `value` - The wrapped function's result
    /// * `context` - The record being completed
    fn serialize(&self, value: &T, context: &SerDesContext) -> Result<String, SerDesError>;

    /// Decodes a stored result.
    ///
    /// # Arguments
    ///
    /// * `data` - The stored string
    /// * `context` - The record being replayed
    fn deserialize(&self, data: &str, context: &SerDesContext) -> Result<T, SerDesError>;
}

/// JSON encoding through serde_json.
pub struct JsonSerDes<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonSerDes<T> {
    /// Creates a new JsonSerDes instance.
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonSerDes<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonSerDes<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for JsonSerDes<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonSerDes").finish()
    }
}

impl<T> SerDes<T> for JsonSerDes<T>
where
    T: Serialize + DeserializeOwned,
{
    fn serialize(&self, value: &T, _context: &SerDesContext) -> Result<String, SerDesError> {
        serde_json::to_string(value).map_err(|e| SerDesError::serialization(e.to_string()))
    }

    fn deserialize(&self, data: &str, _context: &SerDesContext) -> Result<T, SerDesError> {
        serde_json::from_str(data).map_err(|e| SerDesError::deserialization(e.to_string()))
    }
}
