//! Cache entry structure and persisted record format
//!
//! Entries are persisted under `cache_<logical-key>` as JSON objects of the
//! form `{ "data", "timestamp", "expiresAt", "version" }`, with both
//! instants as epoch milliseconds. Records written before versioning
//! existed have no `version` field and are read back as version 1.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, SyncError};

/// Prefix under which cache records are stored in the origin store.
pub const CACHE_KEY_PREFIX: &str = "cache_";

/// Version assigned to persisted records that predate versioning.
pub const INITIAL_VERSION: u64 = 1;

fn initial_version() -> u64 {
    INITIAL_VERSION
}

/// Builds the store key for a logical cache key.
pub fn record_key(logical_key: &str) -> String {
    format!("{}{}", CACHE_KEY_PREFIX, logical_key)
}

/// The raw persisted form of a cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRecord {
    /// The cached payload, kept as arbitrary JSON.
    pub data: serde_json::Value,
    /// Write instant, epoch milliseconds.
    pub timestamp: i64,
    /// Expiry instant, epoch milliseconds.
    pub expires_at: i64,
    /// Monotonic version of this record's key.
    #[serde(default = "initial_version")]
    pub version: u64,
}

impl StoredRecord {
    /// Parses a persisted record from its raw JSON form.
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| SyncError::SerializationError(e.to_string()))
    }

    /// Serializes this record to its raw JSON form.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| SyncError::SerializationError(e.to_string()))
    }

    /// Whether the TTL axis has run out at `now`.
    ///
    /// A record is fresh strictly before its expiry instant, so an entry
    /// read at exactly `expiresAt` is already expired.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now.timestamp_millis() >= self.expires_at
    }

    /// Whether the record is usable at `now` for a reader holding
    /// `watermark` as the minimum acceptable version.
    ///
    /// Both axes must hold: the TTL has not run out, and the record's
    /// version has not been invalidated out from under it.
    pub fn is_fresh(&self, now: DateTime<Utc>, watermark: u64) -> bool {
        !self.is_expired(now) && self.version >= watermark
    }

    /// Write instant as a UTC timestamp.
    pub fn created_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.timestamp).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Expiry instant as a UTC timestamp.
    pub fn expiry(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.expires_at).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// A typed cache entry, decoded from its persisted record.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    /// Logical key, without the store prefix.
    pub key: String,
    /// The cached payload.
    pub data: T,
    /// When the entry was written.
    pub created_at: DateTime<Utc>,
    /// When the entry's TTL runs out.
    pub expires_at: DateTime<Utc>,
    /// Version of the entry.
    pub version: u64,
}

impl<T: Serialize> CacheEntry<T> {
    /// Creates a new entry expiring exactly `ttl` after `now`.
    pub fn new(key: impl Into<String>, data: T, ttl: Duration, version: u64) -> Result<Self> {
        if ttl.is_zero() {
            return Err(SyncError::ConfigError(
                "ttl must be greater than zero".to_string(),
            ));
        }
        let created_at = Utc::now();
        let expires_at = created_at + chrono::Duration::milliseconds(ttl.as_millis() as i64);
        Ok(Self {
            key: key.into(),
            data,
            created_at,
            expires_at,
            version,
        })
    }

    /// Converts this entry into its persisted form.
    pub fn to_record(&self) -> Result<StoredRecord> {
        let data = serde_json::to_value(&self.data)
            .map_err(|e| SyncError::SerializationError(e.to_string()))?;
        Ok(StoredRecord {
            data,
            timestamp: self.created_at.timestamp_millis(),
            expires_at: self.expires_at.timestamp_millis(),
            version: self.version,
        })
    }
}

impl<T: DeserializeOwned> CacheEntry<T> {
    /// Decodes a persisted record into a typed entry.
    pub fn from_record(key: impl Into<String>, record: &StoredRecord) -> Result<Self> {
        let data = serde_json::from_value(record.data.clone())
            .map_err(|e| SyncError::SerializationError(e.to_string()))?;
        Ok(Self {
            key: key.into(),
            data,
            created_at: record.created_at(),
            expires_at: record.expiry(),
            version: record.version,
        })
    }
}

impl<T> CacheEntry<T> {
    /// Whether the TTL axis has run out.
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Remaining time before expiry, zero once expired.
    pub fn time_to_live(&self) -> Duration {
        (self.expires_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::from_secs(0))
    }

    /// Age of the entry since it was written.
    pub fn age(&self) -> Duration {
        (Utc::now() - self.created_at)
            .to_std()
            .unwrap_or(Duration::from_secs(0))
    }
}
