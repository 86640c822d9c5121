//! Configuration for idempotent execution.
//!
//! [`IdempotencyConfig`] is a plain settings struct. It is checked and frozen
//! when handed to [`IdempotencyBuilder::with_config`](crate::IdempotencyBuilder::with_config);
//! after that no field can change for the lifetime of the engine.
//!
//! ## Environment
//!
//! - `POWERTOOLS_IDEMPOTENCY_DISABLED` - when truthy, `run` calls the function directly
//! - `AWS_LAMBDA_FUNCTION_NAME` - prefixes key namespaces and the DynamoDB static partition value
//!
//! ## Example
//!
//! ```rust
//! use lambda_idempotency::config::IdempotencyConfig;
//! use lambda_idempotency::key::HashFunction;
//!
//! let config = IdempotencyConfig::default()
//!     .with_event_key_expression("order_id")
//!     .with_payload_validation_expression("[amount, currency]")
//!     .with_expires_after_seconds(300)
//!     .with_local_cache(128)
//!     .with_hash_function(HashFunction::Sha256);
//! assert_eq!(config.expires_after_seconds, 300);
//! ```

use std::error::Error as StdError;
use std::sync::Arc;

use serde_json::Value;

use crate::cache::DEFAULT_MAX_ITEMS;
use crate::error::{IdempotencyError, IdempotencyResult};
use crate::expression::Expression;
use crate::key::HashFunction;
use crate::record::IdempotentHookData;

/// Environment variable that bypasses idempotency when truthy.
pub const DISABLED_ENV: &str = "POWERTOOLS_IDEMPOTENCY_DISABLED";

/// Environment variable holding the deployed function's name.
pub const FUNCTION_NAME_ENV: &str = "AWS_LAMBDA_FUNCTION_NAME";

/// Default record lifetime, seconds.
pub const DEFAULT_EXPIRES_AFTER_SECONDS: u64 = 3600;

/// Default number of extra attempts after an inconsistent state.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Returns the deployed function's name, if running in Lambda.
pub fn lambda_function_name() -> Option<String> {
    std::env::var(FUNCTION_NAME_ENV)
        .ok()
        .filter(|name| !name.is_empty())
}

/// Returns true if idempotency is disabled through the environment.
pub fn disabled_from_env() -> bool {
    std::env::var(DISABLED_ENV)
        .map(|value| is_truthy(&value))
        .unwrap_or(false)
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "y" | "yes" | "t" | "true" | "on"
    )
}

/// Transforms a stored result before it is replayed.
pub type ResponseHook = Arc<dyn Fn(Value, &IdempotentHookData) -> Value + Send + Sync>;

/// Decides whether an error from the wrapped function is non-retryable.
pub type ErrorClassifier = Arc<dyn Fn(&(dyn StdError + Send + Sync + 'static)) -> bool + Send + Sync>;

/// Settings for idempotent execution.
#[derive(Clone)]
pub struct IdempotencyConfig {
    /// Selects the identifying part of the payload; empty selects all of it.
    pub event_key_expression: String,
    /// Selects the part of the payload that must not change under a reused key.
    pub payload_validation_expression: Option<String>,
    /// Fail with a key derivation error instead of warning when the key selection is empty.
    pub raise_on_no_idempotency_key: bool,
    /// Record lifetime, seconds.
    pub expires_after_seconds: u64,
    /// Keep completed records in a process-local cache.
    pub use_local_cache: bool,
    /// Capacity of the local cache.
    pub local_cache_max_items: u64,
    /// Digest algorithm for keys and validation hashes.
    pub hash_function: HashFunction,
    /// Remaining invocation time; narrows the in-progress expiry when set.
    pub remaining_time_budget_millis: Option<u64>,
    /// Extra attempts after an inconsistent state.
    pub max_retries: u32,
    /// Call the wrapped function directly, with no persistence.
    pub disabled: bool,
    /// Invoked with every replayed result.
    pub response_hook: Option<ResponseHook>,
    /// Errors matching any classifier leave the in-progress record in place.
    pub non_retryable_errors: Vec<ErrorClassifier>,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            event_key_expression: String::new(),
            payload_validation_expression: None,
            raise_on_no_idempotency_key: false,
            expires_after_seconds: DEFAULT_EXPIRES_AFTER_SECONDS,
            use_local_cache: false,
            local_cache_max_items: DEFAULT_MAX_ITEMS,
            hash_function: HashFunction::default(),
            remaining_time_budget_millis: None,
            max_retries: DEFAULT_MAX_RETRIES,
            disabled: disabled_from_env(),
            response_hook: None,
            non_retryable_errors: Vec::new(),
        }
    }
}

impl std::fmt::Debug for IdempotencyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyConfig")
            .field("event_key_expression", &self.event_key_expression)
            .field("payload_validation_expression", &self.payload_validation_expression)
            .field("raise_on_no_idempotency_key", &self.raise_on_no_idempotency_key)
            .field("expires_after_seconds", &self.expires_after_seconds)
            .field("use_local_cache", &self.use_local_cache)
            .field("local_cache_max_items", &self.local_cache_max_items)
            .field("hash_function", &self.hash_function)
            .field("remaining_time_budget_millis", &self.remaining_time_budget_millis)
            .field("max_retries", &self.max_retries)
            .field("disabled", &self.disabled)
            .field("response_hook", &self.response_hook.is_some())
            .field("non_retryable_errors", &self.non_retryable_errors.len())
            .finish()
    }
}

impl IdempotencyConfig {
    /// Creates a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the key expression.
    pub fn with_event_key_expression(mut self, expression: impl Into<String>) -> Self {
        self.event_key_expression = expression.into();
        self
    }

    /// Enables payload validation with the given expression.
    pub fn with_payload_validation_expression(mut self, expression: impl Into<String>) -> Self {
        self.payload_validation_expression = Some(expression.into());
        self
    }

    /// Sets whether an empty key selection is an error.
    pub fn with_raise_on_no_idempotency_key(mut self, raise: bool) -> Self {
        self.raise_on_no_idempotency_key = raise;
        self
    }

    /// Sets the record lifetime.
    pub fn with_expires_after_seconds(mut self, seconds: u64) -> Self {
        self.expires_after_seconds = seconds;
        self
    }

    /// Enables the local cache with the given capacity.
    pub fn with_local_cache(mut self, max_items: u64) -> Self {
        self.use_local_cache = true;
        self.local_cache_max_items = max_items;
        self
    }

    /// Sets the digest algorithm.
    pub fn with_hash_function(mut self, hash_function: HashFunction) -> Self {
        self.hash_function = hash_function;
        self
    }

    /// Sets the default remaining-time budget.
    pub fn with_remaining_time_budget_millis(mut self, millis: u64) -> Self {
        self.remaining_time_budget_millis = Some(millis);
        self
    }

    /// Sets the number of extra attempts after an inconsistent state.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Overrides the environment's disabled flag.
    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    /// Installs a hook applied to every replayed result.
    pub fn with_response_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(Value, &IdempotentHookData) -> Value + Send + Sync + 'static,
    {
        self.response_hook = Some(Arc::new(hook));
        self
    }

    /// Marks errors of type `E` as non-retryable.
    ///
    /// When the wrapped function fails with a non-retryable error its
    /// in-progress record is kept until it expires; every other error deletes
    /// the record so the request can be retried.
    pub fn with_non_retryable<E>(mut self) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        self.non_retryable_errors
            .push(Arc::new(|error: &(dyn StdError + Send + Sync + 'static)| {
                error.is::<E>()
            }));
        self
    }

    /// Marks errors accepted by `classifier` as non-retryable.
    pub fn with_non_retryable_classifier<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&(dyn StdError + Send + Sync + 'static)) -> bool + Send + Sync + 'static,
    {
        self.non_retryable_errors.push(Arc::new(classifier));
        self
    }

    /// Returns true if a wrapped-function error should roll back the record.
    pub fn is_retryable(&self, error: &(dyn StdError + Send + Sync + 'static)) -> bool {
        !self
            .non_retryable_errors
            .iter()
            .any(|classifier| classifier(error))
    }

    /// Parses the key expression.
    pub fn event_key(&self) -> IdempotencyResult<Expression> {
        Expression::parse(&self.event_key_expression)
            .map_err(|e| IdempotencyError::configuration(e.to_string()))
    }

    /// Parses the validation expression, if any.
    pub fn payload_validation(&self) -> IdempotencyResult<Option<Expression>> {
        self.payload_validation_expression
            .as_deref()
            .map(Expression::parse)
            .transpose()
            .map_err(|e| IdempotencyError::configuration(e.to_string()))
    }

    /// Checks the settings.
    pub fn validate(&self) -> IdempotencyResult<()> {
        self.event_key()?;
        self.payload_validation()?;
        if self.expires_after_seconds == 0 {
            return Err(IdempotencyError::configuration(
                "expires_after_seconds must be greater than zero",
            ));
        }
        if self.use_local_cache && self.local_cache_max_items == 0 {
            return Err(IdempotencyError::configuration(
                "local_cache_max_items must be greater than zero when the local cache is enabled",
            ));
        }
        Ok(())
    }
}
