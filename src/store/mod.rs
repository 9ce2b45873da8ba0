//! On-device key/value persistence underneath the cache.
//!
//! The raw store is deliberately dumb: synchronous string get/set/remove over
//! a medium with finite capacity. Everything typed lives in [`crate::cache`].

mod raw;
mod sqlite;

pub use raw::{MemoryRawStore, RawStore, RawStoreError};
pub use sqlite::SqliteRawStore;
