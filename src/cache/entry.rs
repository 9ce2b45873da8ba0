//! Cache entry codec: a typed value plus its sync metadata, stored as two
//! JSON strings.

use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Sync bookkeeping kept beside every cached value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetadata {
  /// When the value was last written, locally or from a fetch
  #[serde(with = "chrono::serde::ts_milliseconds")]
  pub last_sync_at: DateTime<Utc>,
  /// Write stamp in epoch milliseconds, strictly increasing per key
  pub version: i64,
  pub is_dirty: bool,
  /// Local deletion waiting to reach the remote store
  #[serde(default)]
  pub is_deleted: bool,
}

impl CacheMetadata {
  /// Metadata for a write happening at `now`.
  pub fn stamp(now: DateTime<Utc>, previous: Option<&CacheMetadata>, dirty: bool) -> Self {
    let mut version = now.timestamp_millis();
    if let Some(prev) = previous {
      if version <= prev.version {
        version = prev.version + 1;
      }
    }

    Self {
      last_sync_at: now,
      version,
      is_dirty: dirty,
      is_deleted: false,
    }
  }

  /// Whether the entry can be served without asking the remote store.
  pub fn is_valid(&self, now: DateTime<Utc>, window: Duration) -> bool {
    now - self.last_sync_at < window
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
  pub value: T,
  pub metadata: CacheMetadata,
}

pub fn encode_value<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
  serde_json::to_string(value)
}

pub fn encode_metadata(metadata: &CacheMetadata) -> Result<String, serde_json::Error> {
  serde_json::to_string(metadata)
}

pub fn decode_metadata(raw: &str) -> Result<CacheMetadata, serde_json::Error> {
  serde_json::from_str(raw)
}

/// Decode both halves; either one failing makes the whole entry unusable.
pub fn decode<T: DeserializeOwned>(
  value_raw: &str,
  meta_raw: &str,
) -> Result<CacheEntry<T>, serde_json::Error> {
  let metadata = decode_metadata(meta_raw)?;
  let value = serde_json::from_str(value_raw)?;
  Ok(CacheEntry { value, metadata })
}
