//! Typed cache over the raw store.
//!
//! Every dirty write is also an enqueue: this is the single point where a
//! local change becomes something the sync engine must eventually push.

use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::entry::{self, CacheEntry, CacheMetadata};
use super::key::{is_meta_key, CacheKey};
use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::models::EntityType;
use crate::store::{RawStore, RawStoreError};
use crate::sync::PendingQueue;

#[derive(Error, Debug)]
pub enum CacheError {
  #[error("on-device storage is full, could not save '{key}'")]
  QuotaExceeded { key: String },
  #[error("failed to encode '{key}': {source}")]
  Encode {
    key: String,
    #[source]
    source: serde_json::Error,
  },
  #[error(transparent)]
  Store(RawStoreError),
}

/// What a cache clear removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClearReport {
  pub removed: usize,
  /// Entries that still held unsynced local changes
  pub discarded_dirty: usize,
}

pub struct Cache {
  raw: Arc<dyn RawStore>,
  queue: Arc<PendingQueue>,
  diagnostics: Arc<Diagnostics>,
}

impl Cache {
  pub fn new(raw: Arc<dyn RawStore>, queue: Arc<PendingQueue>, diagnostics: Arc<Diagnostics>) -> Self {
    Self {
      raw,
      queue,
      diagnostics,
    }
  }

  /// Read a live entry. Missing, corrupt and deleted entries all read as `None`.
  pub fn read<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<CacheEntry<T>> {
    self
      .read_any::<T>(key)
      .filter(|entry| !entry.metadata.is_deleted)
  }

  /// Read an entry as raw JSON, tombstones included.
  pub fn read_json(&self, key: &CacheKey) -> Option<CacheEntry<Value>> {
    self.read_any(key)
  }

  fn read_any<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<CacheEntry<T>> {
    let key_str = key.to_string();
    let value_raw = self.raw_get(&key_str)?;
    let meta_raw = self.raw_get(&key.meta_key())?;

    match entry::decode(&value_raw, &meta_raw) {
      Ok(entry) => Some(entry),
      Err(e) => {
        debug!(key = %key_str, error = %e, "failed to decode cache entry");
        self
          .diagnostics
          .record(DiagnosticKind::CacheCorrupt { key: key_str });
        None
      }
    }
  }

  pub fn metadata(&self, key: &CacheKey) -> Option<CacheMetadata> {
    let meta_raw = self.raw_get(&key.meta_key())?;
    match entry::decode_metadata(&meta_raw) {
      Ok(meta) => Some(meta),
      Err(_) => {
        self.diagnostics.record(DiagnosticKind::CacheCorrupt {
          key: key.to_string(),
        });
        None
      }
    }
  }

  pub fn is_dirty(&self, key: &CacheKey) -> bool {
    self.metadata(key).is_some_and(|meta| meta.is_dirty)
  }

  /// Store `value` under `key`, stamping fresh metadata.
  ///
  /// `dirty` writes are enqueued for sync; clean writes come from the remote.
  pub fn write<T: Serialize>(
    &self,
    key: &CacheKey,
    value: &T,
    dirty: bool,
  ) -> Result<CacheMetadata, CacheError> {
    self.put(key, value, dirty, false)
  }

  /// Record a local deletion that still has to reach the remote store.
  pub fn write_tombstone(&self, key: &CacheKey) -> Result<CacheMetadata, CacheError> {
    self.put(key, &Value::Null, true, true)
  }

  fn put<T: Serialize>(
    &self,
    key: &CacheKey,
    value: &T,
    dirty: bool,
    deleted: bool,
  ) -> Result<CacheMetadata, CacheError> {
    let key_str = key.to_string();
    let meta_key = key.meta_key();

    let value_raw = entry::encode_value(value).map_err(|source| CacheError::Encode {
      key: key_str.clone(),
      source,
    })?;

    let previous_value = self
      .raw
      .get(&key_str)
      .map_err(|e| self.store_error(&key_str, e))?;
    let previous_meta = self
      .raw
      .get(&meta_key)
      .ok()
      .flatten()
      .and_then(|raw| entry::decode_metadata(&raw).ok());

    let mut metadata = CacheMetadata::stamp(Utc::now(), previous_meta.as_ref(), dirty);
    metadata.is_deleted = deleted;
    let meta_raw = entry::encode_metadata(&metadata).map_err(|source| CacheError::Encode {
      key: meta_key.clone(),
      source,
    })?;

    self
      .raw
      .set(&key_str, &value_raw)
      .map_err(|e| self.store_error(&key_str, e))?;

    if let Err(e) = self.raw.set(&meta_key, &meta_raw) {
      // Put the old value back so both halves describe the same write
      let restored = match &previous_value {
        Some(prev) => self.raw.set(&key_str, prev),
        None => self.raw.remove(&key_str),
      };
      if let Err(restore_err) = restored {
        warn!(key = %key_str, error = %restore_err, "failed to roll back cache value");
      }
      return Err(self.store_error(&key_str, e));
    }

    if dirty {
      self.queue.enqueue(&key_str);
    }

    Ok(metadata)
  }

  /// Flip the dirty flag after a confirmed push of `version`.
  ///
  /// Returns `false` without touching anything when a newer write has landed
  /// since, so that write stays dirty and queued.
  pub fn mark_clean(&self, key: &CacheKey, version: i64) -> Result<bool, CacheError> {
    let Some(mut metadata) = self.metadata(key) else {
      return Ok(false);
    };
    if metadata.version != version {
      return Ok(false);
    }

    metadata.is_dirty = false;
    self.put_metadata(key, &metadata)?;
    Ok(true)
  }

  /// Mark an existing entry dirty again and enqueue it.
  pub fn mark_dirty(&self, key: &CacheKey) -> Result<bool, CacheError> {
    let Some(metadata) = self.metadata(key) else {
      return Ok(false);
    };

    let next = CacheMetadata {
      version: CacheMetadata::stamp(Utc::now(), Some(&metadata), true).version,
      is_dirty: true,
      ..metadata
    };
    self.put_metadata(key, &next)?;
    self.queue.enqueue(&key.to_string());
    Ok(true)
  }

  /// Remove a tombstone once the remote deletion of `version` is confirmed.
  pub fn purge(&self, key: &CacheKey, version: i64) -> Result<bool, CacheError> {
    match self.metadata(key) {
      Some(meta) if meta.is_deleted && meta.version == version => {
        self.remove(key)?;
        Ok(true)
      }
      _ => Ok(false),
    }
  }

  /// Remove both halves of an entry and forget any pending sync for it.
  pub fn remove(&self, key: &CacheKey) -> Result<(), CacheError> {
    let key_str = key.to_string();
    self
      .raw
      .remove(&key_str)
      .and_then(|_| self.raw.remove(&key.meta_key()))
      .map_err(CacheError::Store)?;
    self.queue.remove(&key_str);
    Ok(())
  }

  fn put_metadata(&self, key: &CacheKey, metadata: &CacheMetadata) -> Result<(), CacheError> {
    let meta_key = key.meta_key();
    let raw = entry::encode_metadata(metadata).map_err(|source| CacheError::Encode {
      key: meta_key.clone(),
      source,
    })?;
    self
      .raw
      .set(&meta_key, &raw)
      .map_err(|e| self.store_error(&meta_key, e))
  }

  /// Live members of an owner's collection.
  pub fn list<T: DeserializeOwned>(&self, entity: EntityType, owner: &str) -> Vec<CacheEntry<T>> {
    let prefix = CacheKey::collection_prefix(entity, owner);
    self
      .keys()
      .into_iter()
      .filter(|key| key.record.is_some() && key.to_string().starts_with(&prefix))
      .filter_map(|key| self.read(&key))
      .collect()
  }

  /// Every cache key present in the raw store.
  pub fn keys(&self) -> Vec<CacheKey> {
    match self.raw.keys() {
      Ok(raw_keys) => raw_keys
        .iter()
        .filter(|k| !is_meta_key(k))
        .filter_map(|k| CacheKey::parse(k))
        .collect(),
      Err(e) => {
        warn!(error = %e, "failed to list cache keys");
        Vec::new()
      }
    }
  }

  pub fn dirty_keys(&self) -> Vec<CacheKey> {
    self
      .keys()
      .into_iter()
      .filter(|key| self.is_dirty(key))
      .collect()
  }

  /// Re-enqueue every dirty entry, e.g. after a restart.
  pub fn restore_pending(&self) -> usize {
    let dirty = self.dirty_keys();
    for key in &dirty {
      self.queue.enqueue(&key.to_string());
    }
    if !dirty.is_empty() {
      info!(count = dirty.len(), "restored unsynced cache entries");
    }
    dirty.len()
  }

  /// Remove every entry of `owner`, or of every owner when `None`.
  pub fn clear(&self, owner: Option<&str>) -> Result<ClearReport, CacheError> {
    let mut report = ClearReport::default();

    for key in self.keys() {
      if owner.is_some_and(|o| o != key.owner) {
        continue;
      }
      if self.is_dirty(&key) {
        report.discarded_dirty += 1;
      }
      self.remove(&key)?;
      report.removed += 1;
    }

    // Metadata halves whose value half is already gone
    if let Ok(raw_keys) = self.raw.keys() {
      for meta_key in raw_keys.iter().filter(|k| is_meta_key(k)) {
        let value_key = &meta_key[..meta_key.len() - "_meta".len()];
        let orphan = self.raw.get(value_key).ok().flatten().is_none();
        let owned = match CacheKey::parse(value_key) {
          Some(key) => owner.map_or(true, |o| o == key.owner),
          None => owner.is_none(),
        };
        if orphan && owned {
          self.raw.remove(meta_key).map_err(CacheError::Store)?;
        }
      }
    }

    if report.discarded_dirty > 0 {
      warn!(
        discarded = report.discarded_dirty,
        "cleared cache entries that were never synced"
      );
    }
    Ok(report)
  }

  fn raw_get(&self, key: &str) -> Option<String> {
    match self.raw.get(key) {
      Ok(value) => value,
      Err(e) => {
        warn!(key = %key, error = %e, "raw store read failed");
        None
      }
    }
  }

  fn store_error(&self, key: &str, e: RawStoreError) -> CacheError {
    match e {
      RawStoreError::QuotaExceeded { .. } => {
        self.diagnostics.record(DiagnosticKind::QuotaExceeded {
          key: key.to_string(),
        });
        CacheError::QuotaExceeded {
          key: key.to_string(),
        }
      }
      other => CacheError::Store(other),
    }
  }
}
