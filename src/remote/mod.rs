//! Contract with the remote durable store.
//!
//! The sync engine and cache-miss reads only see [`RemoteClient`]. Records
//! travel as JSON rows so the engine can push any cached entity without
//! knowing its concrete type.

mod rest;
#[cfg(test)]
pub mod stub;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::models::EntityType;

pub use rest::RestRemote;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
  /// Network-level failure: no route, refused, timed out
  #[error("remote unreachable: {0}")]
  Unreachable(String),
  /// The backend answered but refused (auth, validation, server error)
  #[error("remote rejected request ({status}): {message}")]
  Rejected { status: u16, message: String },
  #[error("failed to decode remote response: {0}")]
  Decode(String),
}

#[async_trait]
pub trait RemoteClient: Send + Sync {
  /// All rows of `entity` owned by `owner_id`. Never retried automatically.
  async fn fetch_all(&self, entity: EntityType, owner_id: &str) -> Result<Vec<Value>, RemoteError>;

  /// Insert or replace by record identity; safe to repeat.
  async fn upsert(&self, entity: EntityType, record: &Value) -> Result<(), RemoteError>;

  async fn delete(&self, entity: EntityType, id: &str) -> Result<(), RemoteError>;

  /// Cheap reachability check used by the connectivity probe.
  async fn ping(&self) -> Result<(), RemoteError>;
}
