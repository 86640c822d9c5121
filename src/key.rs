//! Idempotency key derivation.
//!
//! A key is derived in three steps:
//!
//! 1. The key expression selects the identifying part of the payload.
//! 2. The selection is rendered as canonical JSON (object keys sorted at every
//!    level, no insignificant whitespace) and hashed with the configured
//!    [`HashFunction`].
//! 3. The hex digest is prefixed with the caller's namespace: `"{namespace}#{digest}"`.
//!
//! # Example
//!
//! ```rust
//! use lambda_idempotency::expression::Expression;
//! use lambda_idempotency::key::{HashFunction, KeyDeriver};
//! use serde_json::json;
//!
//! let deriver = KeyDeriver::new(
//!     "orders.create",
//!     Expression::parse("order_id").unwrap(),
//!     HashFunction::default(),
//!     false,
//! );
//! let key = deriver.derive(&json!({"order_id": "A1", "noise": 1})).unwrap();
//! assert!(key.as_str().starts_with("orders.create#"));
//! ```

use std::fmt;
use std::str::FromStr;

use blake2::digest::consts::U16;
use blake2::{Blake2b, Blake2b512, Digest};
use serde_json::Value;
use sha2::{Sha256, Sha512};

use crate::error::{IdempotencyError, IdempotencyResult};
use crate::expression::Expression;
use crate::types::IdempotencyKey;

type Blake2b128 = Blake2b<U16>;

/// Hash algorithm used for idempotency keys and payload validation digests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HashFunction {
    /// BLAKE2b with a 16-byte output.
    #[default]
    Blake2b128,
    /// BLAKE2b with a 64-byte output.
    Blake2b512,
    /// SHA-256.
    Sha256,
    /// SHA-512.
    Sha512,
}

impl HashFunction {
    /// The name accepted by [`FromStr`].
    pub fn name(&self) -> &'static str {
        match self {
            Self::Blake2b128 => "blake2b-128",
            Self::Blake2b512 => "blake2b-512",
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    /// Hashes bytes and returns the lowercase hex digest.
    pub fn hex_digest(&self, data: &[u8]) -> String {
        match self {
            Self::Blake2b128 => hex::encode(Blake2b128::digest(data)),
            Self::Blake2b512 => hex::encode(Blake2b512::digest(data)),
            Self::Sha256 => hex::encode(Sha256::digest(data)),
            Self::Sha512 => hex::encode(Sha512::digest(data)),
        }
    }
}

impl fmt::Display for HashFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashFunction {
    type Err = IdempotencyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "blake2b-128" | "blake2b128" => Ok(Self::Blake2b128),
            "blake2b-512" | "blake2b512" | "blake2b" => Ok(Self::Blake2b512),
            "sha256" | "sha-256" => Ok(Self::Sha256),
            "sha512" | "sha-512" => Ok(Self::Sha512),
            other => Err(IdempotencyError::configuration(format!(
                "unsupported hash function '{other}'"
            ))),
        }
    }
}

/// Renders a value as canonical JSON.
///
/// Object keys are sorted at every depth regardless of how the `Map` was
/// built, so the output does not depend on serde_json feature flags.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Returns true if the extracted material carries no identifying data.
///
/// Null, the empty string, the empty object, and arrays that are empty or
/// hold only nulls count as missing. An object with keys is never missing,
/// whatever its values. Numbers and booleans never are.
pub fn is_missing(material: &Value) -> bool {
    match material {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.iter().all(Value::is_null),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Derives idempotency keys from payloads.
#[derive(Debug, Clone)]
pub struct KeyDeriver {
    namespace: String,
    expression: Expression,
    hash_function: HashFunction,
    raise_on_missing: bool,
}

impl KeyDeriver {
    /// Creates a new KeyDeriver.
    ///
    /// # Arguments
    ///
    /// * `namespace` - Identifies the deployed function and wrapped callable
    /// * `expression` - Selects the identifying part of the payload
    /// * `hash_function` - Digest algorithm
    /// * `raise_on_missing` - Fail instead of warning when the selection is empty
    pub fn new(
        namespace: impl Into<String>,
        expression: Expression,
        hash_function: HashFunction,
        raise_on_missing: bool,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            expression,
            hash_function,
            raise_on_missing,
        }
    }

    /// The namespace prefixed to every key.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Applies the key expression to a payload.
    ///
    /// # Returns
    ///
    /// The selected material. Empty material is an error only when
    /// `raise_on_missing` is set; otherwise a warning is logged and the
    /// empty material is returned, so every keyless call maps to one record.
    pub fn extract(&self, payload: &Value) -> IdempotencyResult<Value> {
        let material = self.expression.search(payload);
        if is_missing(&material) {
            if self.raise_on_missing {
                return Err(IdempotencyError::KeyDerivation {
                    expression: self.expression.to_string(),
                });
            }
            tracing::warn!(
                expression = %self.expression,
                namespace = %self.namespace,
                "No idempotency key value found, hashing empty material"
            );
        }
        Ok(material)
    }

    /// Hashes key material into a hex digest.
    pub fn hash(&self, material: &Value) -> String {
        self.hash_function.hex_digest(canonical_json(material).as_bytes())
    }

    /// Derives the full idempotency key for a payload.
    pub fn derive(&self, payload: &Value) -> IdempotencyResult<IdempotencyKey> {
        let material = self.extract(payload)?;
        let digest = self.hash(&material);
        Ok(IdempotencyKey::compose(&self.namespace, &digest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn deriver(expression: &str, raise: bool) -> KeyDeriver {
        KeyDeriver::new(
            "fn.handler",
            Expression::parse(expression).unwrap(),
            HashFunction::default(),
            raise,
        )
    }

    #[test]
    fn test_hash_lengths() {
        assert_eq!(HashFunction::Blake2b128.hex_digest(b"x").len(), 32);
        assert_eq!(HashFunction::Blake2b512.hex_digest(b"x").len(), 128);
        assert_eq!(HashFunction::Sha256.hex_digest(b"x").len(), 64);
        assert_eq!(HashFunction::Sha512.hex_digest(b"x").len(), 128);
    }

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            HashFunction::Sha256.hex_digest(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_hash_function_names_round_trip() {
        for f in [
            HashFunction::Blake2b128,
            HashFunction::Blake2b512,
            HashFunction::Sha256,
            HashFunction::Sha512,
        ] {
            assert_eq!(f.name().parse::<HashFunction>().unwrap(), f);
        }
        assert!("md5".parse::<HashFunction>().is_err());
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let value = json!({"b": {"z": 1, "a": [ {"y": 2, "x": 1} ]}, "a": "s"});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":"s","b":{"a":[{"x":1,"y":2}],"z":1}}"#
        );
    }

    #[test]
    fn test_derive_ignores_unselected_fields() {
        let d = deriver("order_id", false);
        let a = d.derive(&json!({"order_id": "A1", "ts": 1})).unwrap();
        let b = d.derive(&json!({"order_id": "A1", "ts": 2})).unwrap();
        let c = d.derive(&json!({"order_id": "A2", "ts": 1})).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.namespace(), "fn.handler");
        assert_eq!(a.digest().len(), 32);
    }

    #[test]
    fn test_namespaces_separate_callables() {
        let expr = Expression::parse("order_id").unwrap();
        let one = KeyDeriver::new("fn.one", expr.clone(), HashFunction::default(), false);
        let two = KeyDeriver::new("fn.two", expr, HashFunction::default(), false);
        let payload = json!({"order_id": "A1"});
        assert_ne!(one.derive(&payload).unwrap(), two.derive(&payload).unwrap());
    }

    #[test]
    fn test_missing_key_raises_when_configured() {
        let err = deriver("order_id", true).derive(&json!({"other": 1})).unwrap_err();
        assert!(matches!(err, IdempotencyError::KeyDerivation { ref expression } if expression == "order_id"));
    }

    #[test]
    fn test_missing_keys_collide_when_not_raising() {
        let d = deriver("order_id", false);
        let a = d.derive(&json!({"other": 1})).unwrap();
        let b = d.derive(&json!({"different": 2})).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_multi_select_hash_of_nulls_is_hashed() {
        let d = deriver("{id: order_id, user: user_id}", true);
        let a = d.derive(&json!({"other": 1})).unwrap();
        let b = d.derive(&json!({"different": 2})).unwrap();
        assert_eq!(a, b);
        assert!(matches!(
            deriver("[order_id, user_id]", true).derive(&json!({"other": 1})),
            Err(IdempotencyError::KeyDerivation { .. })
        ));
    }

    #[test]
    fn test_is_missing() {
        assert!(is_missing(&Value::Null));
        assert!(is_missing(&json!("")));
        assert!(is_missing(&json!([null, null])));
        assert!(is_missing(&json!({})));
        assert!(!is_missing(&json!({"a": null})));
        assert!(!is_missing(&json!(0)));
        assert!(!is_missing(&json!(false)));
        assert!(!is_missing(&json!([null, 1])));
    }

    proptest! {
        #[test]
        fn prop_key_order_does_not_change_digest(a in any::<i64>(), b in "[a-z]{0,10}") {
            let d = deriver("", false);
            let first: Value = serde_json::from_str(&format!(r#"{{"a":{a},"b":"{b}"}}"#)).unwrap();
            let second: Value = serde_json::from_str(&format!(r#"{{"b":"{b}","a":{a}}}"#)).unwrap();
            prop_assert_eq!(d.derive(&first).unwrap(), d.derive(&second).unwrap());
        }

        #[test]
        fn prop_digest_is_lowercase_hex(s in ".*") {
            let digest = deriver("", false).hash(&json!(s));
            prop_assert!(digest.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
        }
    }
}
