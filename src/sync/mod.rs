//! Eventual reconciliation of local writes with the remote store.
//!
//! The conflict policy is local-wins: a dirty cache entry overwrites the
//! remote row without comparing versions.

mod engine;
mod queue;
mod retry;

pub use engine::{PassMode, PassReport, PassSkip, SyncEngine, SyncError, SyncSettings};
pub use queue::{DeadLetter, PendingQueue};
pub use retry::RetryPolicy;
