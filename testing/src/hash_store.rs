//! In-memory stand-in for a Redis server.
//!
//! [`MemoryHashStore`] implements [`HashStore`] with Redis semantics for the
//! handful of commands the Redis backend issues, including key TTLs measured
//! against a [`Clock`](lambda_idempotency::Clock). It can also simulate a
//! process that dies right after claiming a key.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use lambda_idempotency::persistence::HashStore;
use lambda_idempotency::{IdempotencyError, IdempotencyResult, SharedClock};

#[derive(Debug, Clone, Default)]
struct Entry {
    fields: HashMap<String, String>,
    expires_at_millis: Option<i64>,
}

/// Hash store kept in process memory.
pub struct MemoryHashStore {
    entries: Mutex<HashMap<String, Entry>>,
    clock: SharedClock,
    decode_responses: bool,
    crash_after_claim: AtomicBool,
}

impl MemoryHashStore {
    /// Creates an empty store that expires keys by `clock`.
    pub fn new(clock: SharedClock) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            decode_responses: true,
            crash_after_claim: AtomicBool::new(false),
        }
    }

    /// Sets whether the store claims to decode replies as text.
    pub fn with_decode_responses(mut self, decode_responses: bool) -> Self {
        self.decode_responses = decode_responses;
        self
    }

    /// Makes the write following the next successful claim fail, leaving
    /// the claimed hash without a TTL.
    pub fn crash_after_next_claim(&self) {
        self.crash_after_claim.store(true, Ordering::SeqCst);
    }

    /// Returns the live fields of a key, if present.
    pub fn fields(&self, key: &str) -> Option<HashMap<String, String>> {
        self.live().get(key).map(|e| e.fields.clone())
    }

    /// Redis `TTL` for a key: -2 if missing, -1 if it has no expiry.
    pub fn ttl(&self, key: &str) -> i64 {
        let now = self.clock.now_millis();
        match self.live().get(key) {
            None => -2,
            Some(Entry {
                expires_at_millis: None,
                ..
            }) => -1,
            Some(Entry {
                expires_at_millis: Some(at),
                ..
            }) => (at - now + 500) / 1_000,
        }
    }

    /// Returns true if the key exists and has not expired.
    pub fn contains(&self, key: &str) -> bool {
        self.live().contains_key(key)
    }

    fn live(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        let now = self.clock.now_millis();
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.retain(|_, e| e.expires_at_millis.map_or(true, |at| at > now));
        entries
    }
}

#[async_trait]
impl HashStore for MemoryHashStore {
    fn decodes_responses(&self) -> bool {
        self.decode_responses
    }

    async fn claim(&self, key: &str, field: &str, value: &str) -> IdempotencyResult<bool> {
        let mut entries = self.live();
        let entry = entries.entry(key.to_string()).or_default();
        if entry.fields.contains_key(field) {
            return Ok(false);
        }
        entry.fields.insert(field.to_string(), value.to_string());
        Ok(true)
    }

    async fn write(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl_seconds: Option<i64>,
    ) -> IdempotencyResult<()> {
        if self.crash_after_claim.swap(false, Ordering::SeqCst) {
            return Err(IdempotencyError::persistence(
                "Failed to write record to Redis",
                "connection closed",
            ));
        }
        let now = self.clock.now_millis();
        let mut entries = self.live();
        if !fields.is_empty() {
            let entry = entries.entry(key.to_string()).or_default();
            for (field, value) in fields {
                entry.fields.insert(field.clone(), value.clone());
            }
        }
        if let (Some(ttl), Some(entry)) = (ttl_seconds, entries.get_mut(key)) {
            entry.expires_at_millis = Some(now + ttl * 1_000);
        }
        Ok(())
    }

    async fn read(&self, key: &str) -> IdempotencyResult<(HashMap<String, String>, i64)> {
        let fields = self.fields(key).unwrap_or_default();
        Ok((fields, self.ttl(key)))
    }

    async fn lock(&self, key: &str, token: &str, ttl_seconds: i64) -> IdempotencyResult<bool> {
        let now = self.clock.now_millis();
        let mut entries = self.live();
        if entries.contains_key(key) {
            return Ok(false);
        }
        let mut entry = Entry {
            expires_at_millis: Some(now + ttl_seconds * 1_000),
            ..Entry::default()
        };
        entry.fields.insert("value".to_string(), token.to_string());
        entries.insert(key.to_string(), entry);
        Ok(true)
    }

    async fn replace(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl_seconds: Option<i64>,
    ) -> IdempotencyResult<()> {
        let now = self.clock.now_millis();
        let mut entries = self.live();
        entries.remove(key);
        if !fields.is_empty() {
            entries.insert(
                key.to_string(),
                Entry {
                    fields: fields.iter().cloned().collect(),
                    expires_at_millis: ttl_seconds.map(|ttl| now + ttl * 1_000),
                },
            );
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> IdempotencyResult<()> {
        self.live().remove(key);
        Ok(())
    }
}
