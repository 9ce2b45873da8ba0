//! On-device cache with sync bookkeeping.
//!
//! This module provides the typed layer between the facade and the raw store:
//! - Scoped keys per `(entity, owner, record)` with a `_meta` sibling
//! - Metadata carrying last sync time, a per-key version and a dirty flag
//! - Dirty writes that feed the sync engine's pending queue
//! - Tombstones for deletions that have not reached the remote store yet

mod entry;
mod key;
mod layer;
mod traits;

pub use key::CacheKey;
pub use layer::{Cache, CacheError, ClearReport};
pub use traits::{CacheResult, CacheSource, Cacheable};

#[cfg(test)]
pub use entry::{encode_metadata, encode_value, CacheMetadata};
