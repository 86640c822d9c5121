//! The idempotency ledger entry.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::IdempotencyError;
use crate::types::IdempotencyKey;

/// Status of an idempotency record.
///
/// Only `InProgress` and `Completed` are ever written to a store. `Expired`
/// is derived at read time from the record's expiry timestamp and wins over
/// whatever status was stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordStatus {
    /// An invocation holds the key.
    #[serde(rename = "INPROGRESS")]
    InProgress,
    /// The wrapped function finished and its result is stored.
    Completed,
    /// The record outlived its expiry.
    Expired,
}

impl RecordStatus {
    /// The wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "INPROGRESS",
            Self::Completed => "COMPLETED",
            Self::Expired => "EXPIRED",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = IdempotencyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INPROGRESS" => Ok(Self::InProgress),
            "COMPLETED" => Ok(Self::Completed),
            "EXPIRED" => Ok(Self::Expired),
            other => Err(IdempotencyError::InvalidStatus {
                status: other.to_string(),
            }),
        }
    }
}

/// One idempotency ledger entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRecord {
    /// `"{namespace}#{digest}"`
    pub idempotency_key: IdempotencyKey,
    /// The stored status; see [`DataRecord::status_at`] for the effective one
    pub status: RecordStatus,
    /// Epoch seconds after which the record is expired
    pub expiry_timestamp: Option<i64>,
    /// Epoch milliseconds after which an in-progress record is orphaned
    pub in_progress_expiry_timestamp: Option<i64>,
    /// Serialized result, only present on completed records
    pub response_data: Option<String>,
    /// Payload validation digest, only present when validation is enabled
    pub payload_hash: Option<String>,
}

impl DataRecord {
    /// Creates a record with no timestamps, data or hash.
    pub fn new(idempotency_key: IdempotencyKey, status: RecordStatus) -> Self {
        Self {
            idempotency_key,
            status,
            expiry_timestamp: None,
            in_progress_expiry_timestamp: None,
            response_data: None,
            payload_hash: None,
        }
    }

    /// Sets the expiry timestamp (epoch seconds).
    pub fn with_expiry(mut self, expiry_timestamp: i64) -> Self {
        self.expiry_timestamp = Some(expiry_timestamp);
        self
    }

    /// Sets the in-progress expiry timestamp (epoch milliseconds).
    pub fn with_in_progress_expiry(mut self, in_progress_expiry_timestamp: Option<i64>) -> Self {
        self.in_progress_expiry_timestamp = in_progress_expiry_timestamp;
        self
    }

    /// Sets the serialized result.
    pub fn with_response_data(mut self, response_data: impl Into<String>) -> Self {
        self.response_data = Some(response_data.into());
        self
    }

    /// Sets the payload hash. Empty hashes are stored as `None`.
    pub fn with_payload_hash(mut self, payload_hash: Option<String>) -> Self {
        self.payload_hash = payload_hash.filter(|h| !h.is_empty());
        self
    }

    /// Returns true if the main expiry has passed at `now_secs`.
    pub fn is_expired(&self, now_secs: i64) -> bool {
        self.expiry_timestamp
            .is_some_and(|expiry| now_secs > expiry)
    }

    /// Returns true if the in-progress expiry is set and has passed at `now_millis`.
    pub fn is_in_progress_expired(&self, now_millis: i64) -> bool {
        self.in_progress_expiry_timestamp
            .is_some_and(|expiry| expiry < now_millis)
    }

    /// The effective status at a point in time.
    pub fn status_at(&self, now_secs: i64) -> RecordStatus {
        if self.is_expired(now_secs) {
            RecordStatus::Expired
        } else {
            self.status
        }
    }

    /// Returns true if a save-in-progress may overwrite this record.
    ///
    /// Mirrors the conditional write every backend performs: the record is
    /// expired, or it is in progress and its in-progress expiry has passed.
    pub fn is_replaceable(&self, now_millis: i64) -> bool {
        let now_secs = now_millis.div_euclid(1000);
        self.is_expired(now_secs)
            || (self.status == RecordStatus::InProgress && self.is_in_progress_expired(now_millis))
    }
}

/// Information handed to a response hook when a stored result is replayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotentHookData {
    /// The record's key
    pub idempotency_key: IdempotencyKey,
    /// The record's stored status
    pub status: RecordStatus,
    /// The record's expiry, epoch seconds
    pub expiry_timestamp: Option<i64>,
}

impl From<&DataRecord> for IdempotentHookData {
    fn from(record: &DataRecord) -> Self {
        Self {
            idempotency_key: record.idempotency_key.clone(),
            status: record.status,
            expiry_timestamp: record.expiry_timestamp,
        }
    }
}
