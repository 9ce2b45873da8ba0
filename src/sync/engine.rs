//! Background reconciliation of dirty cache entries with the remote store.
//!
//! Three triggers feed the same pass: a debounce after each enqueue, a
//! periodic safety net, and every offline -> online transition. A single
//! engine-wide lock keeps at most one pass in flight.

use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::queue::{FailureOutcome, PendingQueue};
use super::retry::RetryPolicy;
use crate::cache::{Cache, CacheError, CacheKey};
use crate::connectivity::{ConnectivityMonitor, SubscriptionId};
use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::remote::RemoteClient;

#[derive(Error, Debug)]
pub enum SyncError {
  #[error("remote store is not configured")]
  NotConfigured,
  #[error("cannot sync while offline")]
  Offline,
  #[error("{failed} of {attempted} records failed to sync, first error: {first_error}")]
  Incomplete {
    failed: usize,
    attempted: usize,
    first_error: String,
  },
  #[error(transparent)]
  Cache(#[from] CacheError),
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
  pub debounce: Duration,
  pub periodic: Duration,
  pub retry: RetryPolicy,
}

impl Default for SyncSettings {
  fn default() -> Self {
    Self {
      debounce: Duration::from_secs(1),
      periodic: Duration::from_secs(120),
      retry: RetryPolicy::default(),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassMode {
  /// Timer-driven: skips when busy and honours backoff and dead letters
  Background,
  /// User-driven: waits for a running pass and retries every queued key
  Forced,
}

/// Why a pass did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassSkip {
  InProgress,
  Offline,
  Empty,
  /// Every queued key is backing off or dead-lettered
  NothingDue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedKey {
  pub key: String,
  pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
  pub skipped: Option<PassSkip>,
  pub attempted: usize,
  pub pushed: usize,
  pub deleted: usize,
  /// Queued keys whose entry was already clean or gone
  pub dropped_clean: usize,
  /// Pushes that succeeded but were overtaken by a newer local write
  pub superseded: usize,
  /// Unsynced entries whose value could no longer be decoded
  pub dropped_corrupt: usize,
  pub failed: Vec<FailedKey>,
}

impl PassReport {
  fn skipped(reason: PassSkip) -> Self {
    Self {
      skipped: Some(reason),
      ..Self::default()
    }
  }
}

/// Clears the in-progress flag even if the pass future is dropped.
struct InProgress<'a>(&'a AtomicBool);

impl<'a> InProgress<'a> {
  fn enter(flag: &'a AtomicBool) -> Self {
    flag.store(true, Ordering::SeqCst);
    Self(flag)
  }
}

impl Drop for InProgress<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

struct Shared {
  cache: Arc<Cache>,
  queue: Arc<PendingQueue>,
  remote: Arc<dyn RemoteClient>,
  monitor: ConnectivityMonitor,
  diagnostics: Arc<Diagnostics>,
  settings: SyncSettings,
  pass_lock: tokio::sync::Mutex<()>,
  in_progress: AtomicBool,
}

struct Running {
  shutdown: watch::Sender<bool>,
  tasks: Vec<JoinHandle<()>>,
  subscription: SubscriptionId,
}

pub struct SyncEngine {
  shared: Arc<Shared>,
  running: Mutex<Option<Running>>,
}

impl SyncEngine {
  pub fn new(
    cache: Arc<Cache>,
    queue: Arc<PendingQueue>,
    remote: Arc<dyn RemoteClient>,
    monitor: ConnectivityMonitor,
    diagnostics: Arc<Diagnostics>,
    settings: SyncSettings,
  ) -> Self {
    Self {
      shared: Arc::new(Shared {
        cache,
        queue,
        remote,
        monitor,
        diagnostics,
        settings,
        pass_lock: tokio::sync::Mutex::new(()),
        in_progress: AtomicBool::new(false),
      }),
      running: Mutex::new(None),
    }
  }

  pub fn is_syncing(&self) -> bool {
    self.shared.in_progress.load(Ordering::SeqCst)
  }

  pub fn is_running(&self) -> bool {
    self
      .running
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .is_some()
  }

  /// Run one reconciliation pass over the current queue snapshot.
  pub async fn run_pass(&self, mode: PassMode) -> PassReport {
    self.shared.run_pass(mode).await
  }

  /// Spawn the debounce, periodic and reconnection triggers.
  ///
  /// Calling `start` on a running engine does nothing.
  pub fn start(&self) {
    let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
    if running.is_some() {
      return;
    }

    let (shutdown, shutdown_rx) = watch::channel(false);
    let reconnect = Arc::new(Notify::new());
    let subscription = {
      let reconnect = reconnect.clone();
      self
        .shared
        .monitor
        .subscribe(move || reconnect.notify_one())
    };

    let tasks = vec![
      tokio::spawn(debounce_loop(self.shared.clone(), shutdown_rx.clone())),
      tokio::spawn(periodic_loop(self.shared.clone(), shutdown_rx.clone())),
      tokio::spawn(reconnect_loop(self.shared.clone(), reconnect, shutdown_rx)),
    ];

    info!(
      debounce_ms = self.shared.settings.debounce.as_millis() as u64,
      periodic_secs = self.shared.settings.periodic.as_secs(),
      "sync engine started"
    );
    *running = Some(Running {
      shutdown,
      tasks,
      subscription,
    });
  }

  /// Stop the triggers and wait for them to finish.
  ///
  /// A pass already in flight completes before this returns.
  pub async fn stop(&self) {
    let running = self
      .running
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .take();
    let Some(running) = running else {
      return;
    };

    self.shared.monitor.unsubscribe(running.subscription);
    let _ = running.shutdown.send(true);
    for result in join_all(running.tasks).await {
      if let Err(e) = result {
        warn!(error = %e, "sync task ended abnormally");
      }
    }
    info!("sync engine stopped");
  }
}

impl Shared {
  async fn run_pass(&self, mode: PassMode) -> PassReport {
    if !self.monitor.is_online() {
      return PassReport::skipped(PassSkip::Offline);
    }
    if self.queue.is_empty() {
      return PassReport::skipped(PassSkip::Empty);
    }

    let _guard = match mode {
      PassMode::Background => match self.pass_lock.try_lock() {
        Ok(guard) => guard,
        Err(_) => return PassReport::skipped(PassSkip::InProgress),
      },
      PassMode::Forced => self.pass_lock.lock().await,
    };
    let _in_progress = InProgress::enter(&self.in_progress);

    self.reconcile(mode).await
  }

  async fn reconcile(&self, mode: PassMode) -> PassReport {
    let snapshot = self
      .queue
      .snapshot(Instant::now(), mode == PassMode::Forced);
    if snapshot.is_empty() {
      return PassReport::skipped(PassSkip::NothingDue);
    }

    debug!(keys = snapshot.len(), ?mode, "starting reconciliation pass");
    let mut report = PassReport::default();

    for key_str in snapshot {
      let Some(key) = CacheKey::parse(&key_str) else {
        warn!(key = %key_str, "dropping unparsable key from sync queue");
        self.queue.remove(&key_str);
        continue;
      };

      // Read fresh: the value may have changed since it was enqueued
      let entry = match self.cache.read_json(&key) {
        Some(entry) if entry.metadata.is_dirty => entry,
        None if self.cache.is_dirty(&key) => {
          // Dirty metadata over an unreadable value: nothing valid to push
          match self.cache.remove(&key) {
            Ok(()) => {
              warn!(key = %key_str, "discarded unsynced entry with unreadable value");
              report.dropped_corrupt += 1;
            }
            Err(e) => warn!(key = %key_str, error = %e, "failed to discard unreadable entry"),
          }
          continue;
        }
        _ => {
          self.queue.remove(&key_str);
          report.dropped_clean += 1;
          continue;
        }
      };

      report.attempted += 1;
      let version = entry.metadata.version;
      let deleting = entry.metadata.is_deleted;
      let pushed = if deleting {
        self.remote.delete(key.entity, key.remote_id()).await
      } else {
        self.remote.upsert(key.entity, &entry.value).await
      };

      match pushed {
        Ok(()) => {
          let settled = if deleting {
            self.cache.purge(&key, version)
          } else {
            self.cache.mark_clean(&key, version)
          };
          match settled {
            Ok(true) => {
              self.queue.remove(&key_str);
              if deleting {
                report.deleted += 1;
              } else {
                report.pushed += 1;
              }
              debug!(key = %key_str, "synced");
            }
            Ok(false) => {
              report.superseded += 1;
              debug!(key = %key_str, "newer local write landed during push, keeping it queued");
            }
            Err(e) => {
              warn!(key = %key_str, error = %e, "pushed but could not mark entry clean");
              report.failed.push(FailedKey {
                key: key_str,
                error: e.to_string(),
              });
            }
          }
        }
        Err(e) => {
          let error = e.to_string();
          let outcome =
            self
              .queue
              .record_failure(&key_str, &error, &self.settings.retry, Instant::now());
          match outcome {
            Some(FailureOutcome::Retry { attempt, .. }) => {
              self.diagnostics.record(DiagnosticKind::SyncFailed {
                key: key_str.clone(),
                error: error.clone(),
                attempt,
              })
            }
            Some(FailureOutcome::DeadLettered { attempts }) => {
              self.diagnostics.record(DiagnosticKind::DeadLettered {
                key: key_str.clone(),
                attempts,
              })
            }
            None => {}
          }
          report.failed.push(FailedKey {
            key: key_str,
            error,
          });
        }
      }
    }

    info!(
      attempted = report.attempted,
      pushed = report.pushed,
      deleted = report.deleted,
      failed = report.failed.len(),
      "reconciliation pass finished"
    );
    report
  }
}

async fn debounce_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
  loop {
    tokio::select! {
      _ = shared.queue.enqueued() => {}
      _ = shutdown.changed() => break,
    }
    loop {
      tokio::select! {
        _ = tokio::time::sleep(shared.settings.debounce) => {}
        _ = shutdown.changed() => return,
      }
      if !shared.monitor.is_online() {
        break;
      }
      // A running pass may have snapshotted the queue before this write
      let report = shared.run_pass(PassMode::Background).await;
      if report.skipped != Some(PassSkip::InProgress) {
        break;
      }
      debug!("pass already running, debouncing again");
    }
  }
}

async fn periodic_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
  let period = shared.settings.periodic;
  let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
  ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

  loop {
    tokio::select! {
      _ = ticker.tick() => {
        shared.run_pass(PassMode::Background).await;
      }
      _ = shutdown.changed() => break,
    }
  }
}

async fn reconnect_loop(
  shared: Arc<Shared>,
  reconnect: Arc<Notify>,
  mut shutdown: watch::Receiver<bool>,
) {
  loop {
    tokio::select! {
      _ = reconnect.notified() => {
        debug!("back online, reconciling");
        shared.run_pass(PassMode::Background).await;
      }
      _ = shutdown.changed() => break,
    }
  }
}
