//! SQLite-backed raw store.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::raw::{footprint, RawStore, RawStoreError};

/// Raw store persisted in a single SQLite table.
pub struct SqliteRawStore {
  conn: Mutex<Connection>,
  capacity_bytes: Option<u64>,
}

impl SqliteRawStore {
  /// Open the store at `path`, or at the default location when `None`.
  pub fn open(path: Option<&Path>, capacity_bytes: Option<u64>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    let store = Self {
      conn: Mutex::new(conn),
      capacity_bytes,
    };
    store.run_migrations()?;

    Ok(store)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("tradekeep").join("cache.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(KV_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, RawStoreError> {
    self
      .conn
      .lock()
      .map_err(|e| RawStoreError::Backend(format!("Lock poisoned: {}", e)))
  }
}

const KV_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

fn backend(context: &str, key: &str, e: rusqlite::Error) -> RawStoreError {
  RawStoreError::Backend(format!("{} '{}': {}", context, key, e))
}

fn is_disk_full(e: &rusqlite::Error) -> bool {
  matches!(e, rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::DiskFull)
}

impl RawStore for SqliteRawStore {
  fn get(&self, key: &str) -> Result<Option<String>, RawStoreError> {
    let conn = self.lock()?;
    conn
      .query_row("SELECT value FROM kv WHERE key = ?", params![key], |row| {
        row.get(0)
      })
      .optional()
      .map_err(|e| backend("Failed to read", key, e))
  }

  fn set(&self, key: &str, value: &str) -> Result<(), RawStoreError> {
    let conn = self.lock()?;

    if let Some(capacity) = self.capacity_bytes {
      let used: i64 = conn
        .query_row(
          "SELECT COALESCE(SUM(length(CAST(key AS BLOB)) + length(CAST(value AS BLOB))), 0)
           FROM kv WHERE key != ?",
          params![key],
          |row| row.get(0),
        )
        .map_err(|e| backend("Failed to measure usage before writing", key, e))?;
      let needed = used.max(0) as u64 + footprint(key, value);
      if needed > capacity {
        return Err(RawStoreError::QuotaExceeded {
          key: key.to_string(),
          needed,
          capacity,
        });
      }
    }

    conn
      .execute(
        "INSERT OR REPLACE INTO kv (key, value) VALUES (?, ?)",
        params![key, value],
      )
      .map_err(|e| {
        if is_disk_full(&e) {
          RawStoreError::QuotaExceeded {
            key: key.to_string(),
            needed: footprint(key, value),
            capacity: self.capacity_bytes.unwrap_or(0),
          }
        } else {
          backend("Failed to write", key, e)
        }
      })?;

    Ok(())
  }

  fn remove(&self, key: &str) -> Result<(), RawStoreError> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM kv WHERE key = ?", params![key])
      .map_err(|e| backend("Failed to delete", key, e))?;
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>, RawStoreError> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT key FROM kv ORDER BY key")
      .map_err(|e| RawStoreError::Backend(format!("Failed to prepare key scan: {}", e)))?;

    let keys = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| RawStoreError::Backend(format!("Failed to scan keys: {}", e)))?
      .collect::<Result<Vec<String>, _>>()
      .map_err(|e| RawStoreError::Backend(format!("Failed to read key: {}", e)))?;

    Ok(keys)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_values_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");

    {
      let store = SqliteRawStore::open(Some(&path), None).unwrap();
      store.set("cache_progress_u1", "{\"xp\":10}").unwrap();
    }

    let store = SqliteRawStore::open(Some(&path), None).unwrap();
    assert_eq!(
      store.get("cache_progress_u1").unwrap().as_deref(),
      Some("{\"xp\":10}")
    );
    assert_eq!(store.keys().unwrap(), vec!["cache_progress_u1".to_string()]);
  }

  #[test]
  fn test_capacity_bound_reports_quota_exceeded() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteRawStore::open(Some(&dir.path().join("cache.db")), Some(16)).unwrap();

    store.set("a", "0123456789").unwrap();
    let err = store.set("b", "0123456789").unwrap_err();
    assert!(matches!(err, RawStoreError::QuotaExceeded { ref key, .. } if key == "b"));

    // Rewriting an existing key is measured without its previous value
    store.set("a", "9876543210").unwrap();
  }

  #[test]
  fn test_remove_missing_key_is_ok() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteRawStore::open(Some(&dir.path().join("cache.db")), None).unwrap();
    store.remove("nope").unwrap();
    assert_eq!(store.get("nope").unwrap(), None);
  }
}
