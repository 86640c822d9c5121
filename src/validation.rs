//! Payload validation for reused idempotency keys.
//!
//! When a key is reused, the validation digest of the new payload is compared
//! against the digest stored with the record. A mismatch means the same key
//! is being applied to a different request.

use serde_json::Value;

use crate::error::{IdempotencyError, IdempotencyResult};
use crate::expression::Expression;
use crate::key::{canonical_json, HashFunction};
use crate::record::DataRecord;

/// Computes and checks payload validation digests.
#[derive(Debug, Clone)]
pub struct PayloadValidator {
    expression: Option<Expression>,
    hash_function: HashFunction,
}

impl PayloadValidator {
    /// Creates a validator. `None` disables validation.
    pub fn new(expression: Option<Expression>, hash_function: HashFunction) -> Self {
        Self {
            expression,
            hash_function,
        }
    }

    /// A validator that never validates.
    pub fn disabled() -> Self {
        Self::new(None, HashFunction::default())
    }

    /// Returns true if validation is enabled.
    pub fn is_enabled(&self) -> bool {
        self.expression.is_some()
    }

    /// Computes the validation digest of a payload.
    ///
    /// Returns an empty string when validation is disabled.
    pub fn compute(&self, payload: &Value) -> String {
        match &self.expression {
            Some(expression) => {
                let material = expression.search(payload);
                self.hash_function
                    .hex_digest(canonical_json(&material).as_bytes())
            }
            None => String::new(),
        }
    }

    /// Checks a stored digest against a computed one.
    ///
    /// An empty digest on either side always matches.
    pub fn validate(stored: &str, computed: &str) -> bool {
        stored.is_empty() || computed.is_empty() || stored == computed
    }

    /// Checks a record read from the store or cache against the current payload digest.
    pub fn check(&self, record: &DataRecord, computed: &str) -> IdempotencyResult<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let stored = record.payload_hash.as_deref().unwrap_or_default();
        if Self::validate(stored, computed) {
            Ok(())
        } else {
            tracing::warn!(
                idempotency_key = %record.idempotency_key,
                "Payload does not match stored record"
            );
            Err(IdempotencyError::PayloadValidation {
                idempotency_key: record.idempotency_key.clone(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordStatus;
    use crate::types::IdempotencyKey;
    use serde_json::json;

    fn record_with_hash(hash: Option<&str>) -> DataRecord {
        DataRecord::new(IdempotencyKey::from("fn#1"), RecordStatus::Completed)
            .with_payload_hash(hash.map(str::to_string))
    }

    #[test]
    fn test_disabled_computes_empty_digest() {
        let validator = PayloadValidator::disabled();
        assert!(!validator.is_enabled());
        assert_eq!(validator.compute(&json!({"a": 1})), "");
        assert!(validator.check(&record_with_hash(Some("abc")), "def").is_ok());
    }

    #[test]
    fn test_enabled_detects_drift() {
        let validator = PayloadValidator::new(
            Some(Expression::parse("[amount, currency]").unwrap()),
            HashFunction::Sha256,
        );
        let original = validator.compute(&json!({"amount": 10, "currency": "EUR", "note": "x"}));
        let same = validator.compute(&json!({"amount": 10, "currency": "EUR", "note": "y"}));
        let drifted = validator.compute(&json!({"amount": 11, "currency": "EUR"}));
        assert_eq!(original, same);

        let record = record_with_hash(Some(&original));
        assert!(validator.check(&record, &same).is_ok());
        let err = validator.check(&record, &drifted).unwrap_err();
        assert!(matches!(err, IdempotencyError::PayloadValidation { .. }));
    }

    #[test]
    fn test_empty_digest_always_matches() {
        assert!(PayloadValidator::validate("", "abc"));
        assert!(PayloadValidator::validate("abc", ""));
        assert!(PayloadValidator::validate("abc", "abc"));
        assert!(!PayloadValidator::validate("abc", "abd"));
    }

    #[test]
    fn test_record_without_stored_hash_matches() {
        let validator =
            PayloadValidator::new(Some(Expression::parse("amount").unwrap()), HashFunction::default());
        let computed = validator.compute(&json!({"amount": 5}));
        assert!(validator.check(&record_with_hash(None), &computed).is_ok());
    }
}
