//! Pending set of dirty cache keys.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::retry::RetryPolicy;

#[derive(Debug, Clone, Default)]
struct PendingState {
  attempts: u32,
  next_attempt_at: Option<Instant>,
  dead_lettered: bool,
  last_error: Option<String>,
}

/// What happened to a key after a failed push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
  Retry { attempt: u32, delay: Duration },
  DeadLettered { attempts: u32 },
}

/// A dead-lettered key and the error that put it there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
  pub key: String,
  pub attempts: u32,
  pub last_error: Option<String>,
}

/// Keys whose local value has not yet been confirmed by the remote store.
///
/// Membership is the authoritative "not yet durable" signal: a dirty cache
/// entry is always present here. Enqueueing is idempotent and wakes the
/// sync engine's debounce trigger.
#[derive(Default)]
pub struct PendingQueue {
  entries: Mutex<BTreeMap<String, PendingState>>,
  wake: Notify,
}

impl PendingQueue {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, BTreeMap<String, PendingState>> {
    self.entries.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Add `key`, or give an already queued key a fresh retry budget.
  pub fn enqueue(&self, key: &str) {
    self.lock().insert(key.to_string(), PendingState::default());
    self.wake.notify_one();
  }

  pub fn remove(&self, key: &str) -> bool {
    self.lock().remove(key).is_some()
  }

  pub fn contains(&self, key: &str) -> bool {
    self.lock().contains_key(key)
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().is_empty()
  }

  /// Keys a pass should visit now.
  ///
  /// Background passes skip dead letters and keys still backing off;
  /// `include_waiting` takes everything.
  pub fn snapshot(&self, now: Instant, include_waiting: bool) -> Vec<String> {
    self
      .lock()
      .iter()
      .filter(|(_, state)| {
        include_waiting
          || (!state.dead_lettered && state.next_attempt_at.map_or(true, |at| at <= now))
      })
      .map(|(key, _)| key.clone())
      .collect()
  }

  /// Record a failed push and schedule the next attempt.
  ///
  /// Returns `None` when the key has left the queue in the meantime.
  pub fn record_failure(
    &self,
    key: &str,
    error: &str,
    policy: &RetryPolicy,
    now: Instant,
  ) -> Option<FailureOutcome> {
    let mut entries = self.lock();
    let state = entries.get_mut(key)?;

    state.attempts = state.attempts.saturating_add(1);
    state.last_error = Some(error.to_string());

    if policy.is_exhausted(state.attempts) {
      state.dead_lettered = true;
      state.next_attempt_at = None;
      return Some(FailureOutcome::DeadLettered {
        attempts: state.attempts,
      });
    }

    let delay = policy.delay_for(state.attempts);
    state.next_attempt_at = Some(now + delay);
    Some(FailureOutcome::Retry {
      attempt: state.attempts,
      delay,
    })
  }

  pub fn dead_letters(&self) -> Vec<DeadLetter> {
    self
      .lock()
      .iter()
      .filter(|(_, state)| state.dead_lettered)
      .map(|(key, state)| DeadLetter {
        key: key.clone(),
        attempts: state.attempts,
        last_error: state.last_error.clone(),
      })
      .collect()
  }

  /// Resolves after the next enqueue (or immediately if one is pending).
  pub async fn enqueued(&self) {
    self.wake.notified().await
  }
}
