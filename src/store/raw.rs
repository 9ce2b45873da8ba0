//! Raw store trait and the in-memory implementation.

use std::collections::BTreeMap;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RawStoreError {
  #[error("storage quota exceeded writing '{key}' ({needed} bytes needed, capacity {capacity})")]
  QuotaExceeded {
    key: String,
    needed: u64,
    capacity: u64,
  },
  #[error("raw store backend error: {0}")]
  Backend(String),
}

/// Synchronous string key/value primitive.
pub trait RawStore: Send + Sync {
  fn get(&self, key: &str) -> Result<Option<String>, RawStoreError>;

  /// Fails with [`RawStoreError::QuotaExceeded`] when the medium is full.
  fn set(&self, key: &str, value: &str) -> Result<(), RawStoreError>;

  /// Removing a missing key is not an error.
  fn remove(&self, key: &str) -> Result<(), RawStoreError>;

  fn keys(&self) -> Result<Vec<String>, RawStoreError>;
}

/// Size a key/value pair occupies against the capacity bound.
pub(super) fn footprint(key: &str, value: &str) -> u64 {
  (key.len() + value.len()) as u64
}

/// In-process store, used for `--ephemeral` runs and tests.
#[derive(Default)]
pub struct MemoryRawStore {
  data: Mutex<BTreeMap<String, String>>,
  capacity_bytes: Option<u64>,
}

impl MemoryRawStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_capacity(capacity_bytes: u64) -> Self {
    Self {
      data: Mutex::new(BTreeMap::new()),
      capacity_bytes: Some(capacity_bytes),
    }
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>, RawStoreError> {
    self
      .data
      .lock()
      .map_err(|e| RawStoreError::Backend(format!("Lock poisoned: {}", e)))
  }
}

impl RawStore for MemoryRawStore {
  fn get(&self, key: &str) -> Result<Option<String>, RawStoreError> {
    Ok(self.lock()?.get(key).cloned())
  }

  fn set(&self, key: &str, value: &str) -> Result<(), RawStoreError> {
    let mut data = self.lock()?;

    if let Some(capacity) = self.capacity_bytes {
      let used: u64 = data
        .iter()
        .filter(|(k, _)| k.as_str() != key)
        .map(|(k, v)| footprint(k, v))
        .sum();
      let needed = used + footprint(key, value);
      if needed > capacity {
        return Err(RawStoreError::QuotaExceeded {
          key: key.to_string(),
          needed,
          capacity,
        });
      }
    }

    data.insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<(), RawStoreError> {
    self.lock()?.remove(key);
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>, RawStoreError> {
    Ok(self.lock()?.keys().cloned().collect())
  }
}
