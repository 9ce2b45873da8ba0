//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};

use super::key::CacheKey;
use crate::models::EntityType;

/// Trait for records that can be cached and synced.
///
/// Every record belongs to an owner. Collection members also carry their own
/// id; singletons return `None` from [`Cacheable::record_id`].
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned {
  /// Entity kind used for key scoping and remote table lookup
  fn entity_type() -> EntityType;

  fn owner_id(&self) -> &str;

  fn record_id(&self) -> Option<&str>;

  fn cache_key(&self) -> CacheKey {
    match self.record_id() {
      Some(id) => CacheKey::record(Self::entity_type(), self.owner_id(), id),
      None => CacheKey::owner(Self::entity_type(), self.owner_id()),
    }
  }
}

/// Result from a read, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cache data still inside the validity window.
  pub fn fresh(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::CacheFresh,
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at,
    }
  }

  /// Create a new cache result when no remote store is configured.
  pub fn cache_only(data: T, cached_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source: CacheSource::CacheOnly,
      cached_at,
    }
  }
}

/// Indicates where read data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Remote fetch failed, serving whatever the cache holds
  Offline,
  /// No remote store configured
  CacheOnly,
}

impl std::fmt::Display for CacheSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      CacheSource::Network => write!(f, "network"),
      CacheSource::CacheFresh => write!(f, "cache"),
      CacheSource::Offline => write!(f, "offline cache"),
      CacheSource::CacheOnly => write!(f, "local only"),
    }
  }
}
