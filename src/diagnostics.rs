//! Structured record of silent degradations.
//!
//! Reads fall back to stale data and background pushes fail without bothering
//! the user; each such event lands here so the status surface can show it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::{debug, warn};

const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DiagnosticKind {
  /// A read served cached data because the remote fetch failed
  StaleFallback { key: String, error: String },
  /// A background push failed and will be retried
  SyncFailed {
    key: String,
    error: String,
    attempt: u32,
  },
  /// A key ran out of retries
  DeadLettered { key: String, attempts: u32 },
  /// An unreadable cache entry was treated as absent
  CacheCorrupt { key: String },
  /// The on-device store refused a write
  QuotaExceeded { key: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticEvent {
  pub at: DateTime<Utc>,
  #[serde(flatten)]
  pub kind: DiagnosticKind,
}

/// Bounded ring of recent events.
pub struct Diagnostics {
  events: Mutex<VecDeque<DiagnosticEvent>>,
  capacity: usize,
}

impl Default for Diagnostics {
  fn default() -> Self {
    Self::with_capacity(DEFAULT_CAPACITY)
  }
}

impl Diagnostics {
  pub fn with_capacity(capacity: usize) -> Self {
    Self {
      events: Mutex::new(VecDeque::with_capacity(capacity)),
      capacity: capacity.max(1),
    }
  }

  pub fn record(&self, kind: DiagnosticKind) {
    match &kind {
      DiagnosticKind::StaleFallback { key, error } => {
        warn!(key = %key, error = %error, "remote read failed, serving cached data")
      }
      DiagnosticKind::SyncFailed {
        key,
        error,
        attempt,
      } => debug!(key = %key, error = %error, attempt, "push failed, will retry"),
      DiagnosticKind::DeadLettered { key, attempts } => {
        warn!(key = %key, attempts, "giving up on key until next forced sync")
      }
      DiagnosticKind::CacheCorrupt { key } => warn!(key = %key, "corrupt cache entry"),
      DiagnosticKind::QuotaExceeded { key } => warn!(key = %key, "cache write refused: quota exceeded"),
    }

    let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
    if events.len() == self.capacity {
      events.pop_front();
    }
    events.push_back(DiagnosticEvent {
      at: Utc::now(),
      kind,
    });
  }

  /// Oldest first.
  pub fn recent(&self) -> Vec<DiagnosticEvent> {
    self
      .events
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .iter()
      .cloned()
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_ring_drops_oldest() {
    let diagnostics = Diagnostics::with_capacity(2);
    for i in 0..3 {
      diagnostics.record(DiagnosticKind::CacheCorrupt {
        key: format!("k{}", i),
      });
    }

    let keys: Vec<_> = diagnostics
      .recent()
      .into_iter()
      .map(|e| match e.kind {
        DiagnosticKind::CacheCorrupt { key } => key,
        other => panic!("unexpected event {:?}", other),
      })
      .collect();
    assert_eq!(keys, vec!["k1", "k2"]);
  }

  #[test]
  fn test_event_serializes_with_kind_tag() {
    let diagnostics = Diagnostics::default();
    diagnostics.record(DiagnosticKind::StaleFallback {
      key: "cache_progress_u1".into(),
      error: "remote unreachable".into(),
    });

    let json = serde_json::to_value(&diagnostics.recent()[0]).unwrap();
    assert_eq!(json["kind"], "staleFallback");
    assert_eq!(json["key"], "cache_progress_u1");
    assert!(json["at"].is_string());
  }
}
