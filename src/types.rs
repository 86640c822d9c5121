//! Newtype wrappers for idempotency identifiers.
//!
//! # Example
//!
//! ```rust
//! use lambda_idempotency::types::IdempotencyKey;
//!
//! let key = IdempotencyKey::from("orders.create#4f2a");
//! assert_eq!(key.namespace(), "orders.create");
//! assert_eq!(key.digest(), "4f2a");
//!
//! assert!(IdempotencyKey::new("").is_err());
//! ```

use std::fmt;
use std::ops::Deref;

use serde::{Deserialize, Serialize};

/// Error returned when newtype validation fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// The type name that failed validation
    pub type_name: &'static str,
    /// Description of the validation failure
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// The identifier of one idempotency ledger entry, `"{namespace}#{digest}"`.
///
/// The namespace names the deployed function and the wrapped callable, so
/// two callables that share a table never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Creates a new `IdempotencyKey` with validation.
    ///
    /// Returns an error if the value is empty.
    pub fn new(key: impl Into<String>) -> Result<Self, ValidationError> {
        let key = key.into();
        if key.is_empty() {
            return Err(ValidationError {
                type_name: "IdempotencyKey",
                message: "value cannot be empty".to_string(),
            });
        }
        Ok(Self(key))
    }

    /// Joins a namespace and a digest into a key.
    pub fn compose(namespace: &str, digest: &str) -> Self {
        Self(format!("{namespace}#{digest}"))
    }

    /// Returns the part before the last `#`, or the whole key if there is none.
    pub fn namespace(&self) -> &str {
        match self.0.rsplit_once('#') {
            Some((namespace, _)) => namespace,
            None => &self.0,
        }
    }

    /// Returns the part after the last `#`, or an empty string if there is none.
    pub fn digest(&self) -> &str {
        match self.0.rsplit_once('#') {
            Some((_, digest)) => digest,
            None => "",
        }
    }

    /// Returns the inner string value.
    #[inline]
    pub fn into_inner(self) -> String {
        self.0
    }

    /// Returns a reference to the inner string.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Deref for IdempotencyKey {
    type Target = str;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<str> for IdempotencyKey {
    #[inline]
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<String> for IdempotencyKey {
    #[inline]
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for IdempotencyKey {
    #[inline]
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_new_rejects_empty() {
        let err = IdempotencyKey::new("").unwrap_err();
        assert_eq!(err.type_name, "IdempotencyKey");
        assert!(IdempotencyKey::new("fn#1").is_ok());
    }

    #[test]
    fn test_compose_and_split() {
        let key = IdempotencyKey::compose("checkout.charge", "abc123");
        assert_eq!(key.as_str(), "checkout.charge#abc123");
        assert_eq!(key.namespace(), "checkout.charge");
        assert_eq!(key.digest(), "abc123");
    }

    #[test]
    fn test_split_without_separator() {
        let key = IdempotencyKey::from("plain");
        assert_eq!(key.namespace(), "plain");
        assert_eq!(key.digest(), "");
    }

    #[test]
    fn test_serde_transparent() {
        let key = IdempotencyKey::from("fn#1");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"fn#1\"");
        let back: IdempotencyKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn test_usable_as_map_key() {
        let mut map = HashMap::new();
        map.insert(IdempotencyKey::from("fn#1"), 1);
        assert_eq!(map.get(&IdempotencyKey::from("fn#1")), Some(&1));
    }
}
