//! The facade the rest of the application talks to.
//!
//! Reads are served from the cache while it is valid, refreshed from the
//! remote store when it is not, and fall back to whatever is cached when the
//! remote store cannot be reached. Writes land in the cache immediately and
//! reach the remote store through an opportunistic push or the sync engine.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{Cache, CacheError, CacheKey, CacheResult, Cacheable, ClearReport};
use crate::config::Config;
use crate::connectivity::{spawn_probe, ConnectivityMonitor};
use crate::diagnostics::{DiagnosticEvent, DiagnosticKind, Diagnostics};
use crate::models::{AppSettings, EntityType, Trade, UserProgress};
use crate::remote::{RemoteClient, RemoteError, RestRemote};
use crate::store::{MemoryRawStore, RawStore, SqliteRawStore};
use crate::sync::{
  DeadLetter, PassMode, PassReport, PassSkip, PendingQueue, SyncEngine, SyncError, SyncSettings,
};

/// Longest a save waits on its immediate push before leaving it to the engine.
const IMMEDIATE_PUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Status surface polled by diagnostics views.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
  pub is_online: bool,
  pub sync_queue_size: usize,
  pub sync_in_progress: bool,
  /// Whether the background triggers are running in this process
  pub background_sync: bool,
  pub remote_configured: bool,
  /// Keys that ran out of retries and wait for a forced sync
  pub dead_lettered: Vec<DeadLetter>,
  pub recent_events: Vec<DiagnosticEvent>,
}

/// Listing marker stored for a collection; its metadata dates the listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CollectionMarker {
  records: usize,
}

/// Everything a [`HybridStore`] is assembled from.
pub struct HybridParts {
  pub raw: Arc<dyn RawStore>,
  pub remote: Option<Arc<dyn RemoteClient>>,
  pub monitor: ConnectivityMonitor,
  pub validity: chrono::Duration,
  pub sync: SyncSettings,
  /// Reachability probe interval; `None` leaves the monitor to the caller
  pub probe_interval: Option<Duration>,
}

struct Probe {
  shutdown: watch::Sender<bool>,
  handle: JoinHandle<()>,
}

pub struct HybridStore {
  cache: Arc<Cache>,
  queue: Arc<PendingQueue>,
  remote: Option<Arc<dyn RemoteClient>>,
  engine: Option<SyncEngine>,
  monitor: ConnectivityMonitor,
  diagnostics: Arc<Diagnostics>,
  validity: chrono::Duration,
  probe_interval: Option<Duration>,
  probe: Mutex<Option<Probe>>,
}

impl HybridStore {
  /// Assemble the store from configuration.
  ///
  /// The remote store is used only when both its url and key are present.
  pub async fn open(config: &Config, ephemeral: bool) -> Result<Self> {
    let capacity = config.cache.capacity_bytes;
    let raw: Arc<dyn RawStore> = if ephemeral {
      Arc::new(match capacity {
        Some(bytes) => MemoryRawStore::with_capacity(bytes),
        None => MemoryRawStore::new(),
      })
    } else {
      Arc::new(SqliteRawStore::open(config.cache.path.as_deref(), capacity)?)
    };

    let remote: Option<Arc<dyn RemoteClient>> = match (&config.remote, Config::get_remote_key()) {
      (Some(remote_config), Some(key)) => Some(Arc::new(RestRemote::new(remote_config, key)?)),
      (Some(_), None) => {
        warn!("remote url configured but no key in TRADEKEEP_REMOTE_KEY, staying local-only");
        None
      }
      (None, _) => None,
    };

    let monitor = ConnectivityMonitor::new(false);
    if let Some(remote) = &remote {
      let reachable = remote.ping().await;
      if let Err(e) = &reachable {
        debug!(error = %e, "remote store not reachable at start-up");
      }
      monitor.set_online(reachable.is_ok());
    }

    Ok(Self::new(HybridParts {
      raw,
      remote,
      monitor,
      validity: config.validity_window(),
      sync: config.sync_settings(),
      probe_interval: Some(config.probe_interval()),
    }))
  }

  pub fn new(parts: HybridParts) -> Self {
    let queue = Arc::new(PendingQueue::new());
    let diagnostics = Arc::new(Diagnostics::default());
    let cache = Arc::new(Cache::new(parts.raw, queue.clone(), diagnostics.clone()));

    let engine = parts.remote.as_ref().map(|remote| {
      SyncEngine::new(
        cache.clone(),
        queue.clone(),
        remote.clone(),
        parts.monitor.clone(),
        diagnostics.clone(),
        parts.sync.clone(),
      )
    });

    // Unsynced writes from a previous run go straight back into the queue
    cache.restore_pending();

    Self {
      cache,
      queue,
      remote: parts.remote,
      engine,
      monitor: parts.monitor,
      diagnostics,
      validity: parts.validity,
      probe_interval: parts.probe_interval,
      probe: Mutex::new(None),
    }
  }

  /// Start background sync and connectivity probing.
  ///
  /// In local-only mode nothing is started.
  pub fn start(&self) {
    let (Some(engine), Some(remote)) = (&self.engine, &self.remote) else {
      info!("no remote store configured, running local-only");
      return;
    };

    engine.start();

    if let Some(interval) = self.probe_interval {
      let mut probe = self.probe.lock().unwrap_or_else(|e| e.into_inner());
      if probe.is_none() {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = spawn_probe(self.monitor.clone(), remote.clone(), interval, shutdown_rx);
        *probe = Some(Probe { shutdown, handle });
      }
    }
  }

  pub async fn stop(&self) {
    let probe = self
      .probe
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .take();
    if let Some(probe) = probe {
      let _ = probe.shutdown.send(true);
      if let Err(e) = probe.handle.await {
        warn!(error = %e, "connectivity probe ended abnormally");
      }
    }

    if let Some(engine) = &self.engine {
      engine.stop().await;
    }
  }

  // ==========================================================================
  // Trades
  // ==========================================================================

  /// All trades of `owner`, most recent first.
  pub async fn get_trades(&self, owner: &str) -> CacheResult<Vec<Trade>> {
    let marker = CacheKey::owner(EntityType::Trade, owner);
    let marker_meta = self.cache.metadata(&marker);
    let cached_at = marker_meta.map(|meta| meta.last_sync_at);

    let Some(remote) = &self.remote else {
      return CacheResult::cache_only(self.local_trades(owner), cached_at);
    };

    if let Some(meta) = marker_meta.filter(|meta| meta.is_valid(Utc::now(), self.validity)) {
      return CacheResult::fresh(self.local_trades(owner), meta.last_sync_at);
    }

    let fetch_started = Utc::now().timestamp_millis();
    match remote.fetch_all(EntityType::Trade, owner).await {
      Ok(rows) => {
        self.refresh_trades(owner, decode_rows(EntityType::Trade, rows), fetch_started);
        CacheResult::from_network(self.local_trades(owner))
      }
      Err(e) => {
        self.stale_fallback(&marker, &e);
        CacheResult::offline(self.local_trades(owner), cached_at)
      }
    }
  }

  pub async fn save_trade(&self, trade: &Trade) -> Result<(), CacheError> {
    self.save(trade).await
  }

  pub async fn delete_trade(&self, owner: &str, id: &str) -> Result<(), CacheError> {
    let key = CacheKey::record(EntityType::Trade, owner, id);
    let metadata = self.cache.write_tombstone(&key)?;
    self.push_now(&key, metadata.version, None).await;
    Ok(())
  }

  fn local_trades(&self, owner: &str) -> Vec<Trade> {
    let mut trades: Vec<Trade> = self
      .cache
      .list::<Trade>(EntityType::Trade, owner)
      .into_iter()
      .map(|entry| entry.value)
      .collect();
    trades.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    trades
  }

  /// Merge a remote listing taken at `fetch_started` into the cache.
  ///
  /// Keys with unsynced local changes, or written locally after the listing
  /// was requested, keep their local value. Other clean local trades the
  /// remote no longer lists were deleted elsewhere and go.
  fn refresh_trades(&self, owner: &str, remote_trades: Vec<Trade>, fetch_started: i64) {
    let mut remote_ids = HashSet::new();

    for trade in remote_trades.into_iter().filter(|t| t.user_id == owner) {
      remote_ids.insert(trade.id.clone());
      let key = trade.cache_key();
      if self.queue.contains(&key.to_string()) || self.written_since(&key, fetch_started) {
        continue;
      }
      if let Err(e) = self.cache.write(&key, &trade, false) {
        warn!(key = %key, error = %e, "failed to cache fetched trade");
      }
    }

    for entry in self.cache.list::<Trade>(EntityType::Trade, owner) {
      let key = entry.value.cache_key();
      if remote_ids.contains(&entry.value.id)
        || entry.metadata.is_dirty
        || entry.metadata.version >= fetch_started
        || self.queue.contains(&key.to_string())
      {
        continue;
      }
      if let Err(e) = self.cache.remove(&key) {
        warn!(key = %key, error = %e, "failed to drop trade deleted remotely");
      }
    }

    let marker = CacheKey::owner(EntityType::Trade, owner);
    let listing = CollectionMarker {
      records: remote_ids.len(),
    };
    if let Err(e) = self.cache.write(&marker, &listing, false) {
      warn!(key = %marker, error = %e, "failed to record trade listing");
    }
  }

  // ==========================================================================
  // Singletons
  // ==========================================================================

  pub async fn get_progress(&self, owner: &str) -> CacheResult<Option<UserProgress>> {
    self.get_singleton(owner).await
  }

  pub async fn save_progress(&self, progress: &UserProgress) -> Result<(), CacheError> {
    self.save(progress).await
  }

  pub async fn get_settings(&self, owner: &str) -> CacheResult<Option<AppSettings>> {
    self.get_singleton(owner).await
  }

  pub async fn save_settings(&self, settings: &AppSettings) -> Result<(), CacheError> {
    self.save(settings).await
  }

  async fn get_singleton<T: Cacheable>(&self, owner: &str) -> CacheResult<Option<T>> {
    let key = CacheKey::owner(T::entity_type(), owner);
    let cached = self.cache.read::<T>(&key);
    let cached_at = cached.as_ref().map(|entry| entry.metadata.last_sync_at);

    let Some(remote) = &self.remote else {
      return CacheResult::cache_only(cached.map(|entry| entry.value), cached_at);
    };

    if let Some(entry) = cached
      .as_ref()
      .filter(|entry| entry.metadata.is_valid(Utc::now(), self.validity))
    {
      return CacheResult::fresh(Some(entry.value.clone()), entry.metadata.last_sync_at);
    }

    let fetch_started = Utc::now().timestamp_millis();
    match remote.fetch_all(T::entity_type(), owner).await {
      Ok(rows) => {
        let fetched = decode_rows::<T>(T::entity_type(), rows)
          .into_iter()
          .find(|record| record.owner_id() == owner);
        match fetched {
          // Unsynced or newer local changes win over the remote copy
          Some(record)
            if !self.queue.contains(&key.to_string())
              && !self.written_since(&key, fetch_started) =>
          {
            if let Err(e) = self.cache.write(&key, &record, false) {
              warn!(key = %key, error = %e, "failed to cache fetched record");
            }
            CacheResult::from_network(Some(record))
          }
          _ => CacheResult::from_network(self.cache.read::<T>(&key).map(|entry| entry.value)),
        }
      }
      Err(e) => {
        self.stale_fallback(&key, &e);
        CacheResult::offline(cached.map(|entry| entry.value), cached_at)
      }
    }
  }

  // ==========================================================================
  // Shared write path
  // ==========================================================================

  async fn save<T: Cacheable>(&self, record: &T) -> Result<(), CacheError> {
    let key = record.cache_key();
    let metadata = self.cache.write(&key, record, true)?;

    match serde_json::to_value(record) {
      Ok(row) => self.push_now(&key, metadata.version, Some(row)).await,
      Err(e) => debug!(key = %key, error = %e, "skipping immediate push"),
    }
    Ok(())
  }

  /// Best-effort immediate push; the sync engine retries whatever fails here.
  async fn push_now(&self, key: &CacheKey, version: i64, row: Option<Value>) {
    let Some(remote) = &self.remote else {
      return;
    };
    if !self.monitor.is_online() {
      return;
    }

    let push = async {
      match &row {
        Some(row) => remote.upsert(key.entity, row).await,
        None => remote.delete(key.entity, key.remote_id()).await,
      }
    };
    let Ok(pushed) = tokio::time::timeout(IMMEDIATE_PUSH_TIMEOUT, push).await else {
      debug!(key = %key, "immediate push timed out, leaving it to the sync engine");
      return;
    };

    match pushed {
      Ok(()) => {
        let settled = match row {
          Some(_) => self.cache.mark_clean(key, version),
          None => self.cache.purge(key, version),
        };
        match settled {
          Ok(true) => {
            self.queue.remove(&key.to_string());
          }
          Ok(false) => {}
          Err(e) => warn!(key = %key, error = %e, "pushed but could not mark entry clean"),
        }
      }
      Err(e) => debug!(key = %key, error = %e, "immediate push failed, leaving it to the sync engine"),
    }
  }

  /// Whether the entry under `key` was written at or after `since` (ms).
  fn written_since(&self, key: &CacheKey, since: i64) -> bool {
    self
      .cache
      .metadata(key)
      .is_some_and(|meta| meta.version >= since)
  }

  fn stale_fallback(&self, key: &CacheKey, error: &RemoteError) {
    self.diagnostics.record(DiagnosticKind::StaleFallback {
      key: key.to_string(),
      error: error.to_string(),
    });
  }

  // ==========================================================================
  // Maintenance
  // ==========================================================================

  pub fn status(&self) -> SyncStatus {
    SyncStatus {
      is_online: self.monitor.is_online(),
      sync_queue_size: self.queue.len(),
      sync_in_progress: self.engine.as_ref().is_some_and(|e| e.is_syncing()),
      background_sync: self.engine.as_ref().is_some_and(|e| e.is_running()),
      remote_configured: self.remote.is_some(),
      dead_lettered: self.queue.dead_letters(),
      recent_events: self.diagnostics.recent(),
    }
  }

  /// Follow connectivity changes as the monitor sees them.
  pub fn online_changes(&self) -> watch::Receiver<bool> {
    self.monitor.watch()
  }

  /// Run one background pass over the queue if the remote store is reachable.
  ///
  /// Short-lived runs call this before exiting so writes left over from
  /// earlier offline runs drain without a long-running `watch`.
  pub async fn sync_pending(&self) -> Option<PassReport> {
    let engine = self.engine.as_ref()?;
    if !self.monitor.is_online() || self.queue.is_empty() {
      return None;
    }
    Some(engine.run_pass(PassMode::Background).await)
  }

  /// Mark everything `owner` has cached dirty and push it now.
  ///
  /// Unlike background sync this reports failure to the caller.
  pub async fn force_sync_all(&self, owner: &str) -> Result<PassReport, SyncError> {
    let Some(engine) = &self.engine else {
      return Err(SyncError::NotConfigured);
    };
    if !self.monitor.is_online() {
      return Err(SyncError::Offline);
    }

    for key in self.cache.keys() {
      if key.owner == owner && !key.is_collection_marker() {
        self.cache.mark_dirty(&key)?;
      }
    }

    let report = engine.run_pass(PassMode::Forced).await;
    if report.skipped == Some(PassSkip::Offline) {
      return Err(SyncError::Offline);
    }
    if let Some(first) = report.failed.first() {
      return Err(SyncError::Incomplete {
        failed: report.failed.len(),
        attempted: report.attempted,
        first_error: first.error.clone(),
      });
    }
    Ok(report)
  }

  /// Drop cached entries for `owner`, or for everyone when `None`.
  pub fn clear_cache(&self, owner: Option<&str>) -> Result<ClearReport, CacheError> {
    let report = self.cache.clear(owner)?;
    info!(
      owner = owner.unwrap_or("*"),
      removed = report.removed,
      "cache cleared"
    );
    Ok(report)
  }

  /// When the cache last heard from the remote store about `owner`'s trades.
  pub fn trades_listed_at(&self, owner: &str) -> Option<DateTime<Utc>> {
    self
      .cache
      .metadata(&CacheKey::owner(EntityType::Trade, owner))
      .map(|meta| meta.last_sync_at)
  }
}

fn decode_rows<T: DeserializeOwned>(entity: EntityType, rows: Vec<Value>) -> Vec<T> {
  rows
    .into_iter()
    .filter_map(|row| match serde_json::from_value(row) {
      Ok(record) => Some(record),
      Err(e) => {
        warn!(%entity, error = %e, "skipping malformed remote row");
        None
      }
    })
    .collect()
}

/// Resolve the owner from the command line or configuration.
pub fn resolve_owner(explicit: Option<&str>, config: &Config) -> Result<String> {
  explicit
    .map(String::from)
    .or_else(|| config.user_id.clone())
    .filter(|owner| !owner.trim().is_empty())
    .ok_or_else(|| eyre!("No user id. Pass --user or set user_id in the config file."))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{encode_metadata, encode_value, CacheMetadata};
  use crate::models::Direction;
  use crate::remote::stub::StubRemote;
  use crate::cache::CacheSource;
  use crate::sync::RetryPolicy;

  fn store_with(
    raw: Arc<dyn RawStore>,
    remote: Option<Arc<StubRemote>>,
    online: bool,
  ) -> HybridStore {
    HybridStore::new(HybridParts {
      raw,
      remote: remote.map(|r| r as Arc<dyn RemoteClient>),
      monitor: ConnectivityMonitor::new(online),
      validity: chrono::Duration::minutes(5),
      sync: SyncSettings {
        retry: RetryPolicy::test(),
        ..SyncSettings::default()
      },
      probe_interval: None,
    })
  }

  fn online_store() -> (HybridStore, Arc<StubRemote>, Arc<MemoryRawStore>) {
    let raw = Arc::new(MemoryRawStore::new());
    let remote = StubRemote::new();
    let store = store_with(raw.clone(), Some(remote.clone()), true);
    (store, remote, raw)
  }

  fn trade(id: &str, pnl: f64) -> Trade {
    let mut trade = Trade::new("u1", "ES", Direction::Long, 4500.0, 1.0);
    trade.id = id.to_string();
    trade.pnl = Some(pnl);
    trade
  }

  /// Plant an entry whose last sync happened `age` ago.
  fn plant<T: Serialize>(raw: &MemoryRawStore, key: &CacheKey, value: &T, age: chrono::Duration) {
    let at = Utc::now() - age;
    let meta = CacheMetadata {
      last_sync_at: at,
      version: at.timestamp_millis(),
      is_dirty: false,
      is_deleted: false,
    };
    raw.set(&key.to_string(), &encode_value(value).unwrap()).unwrap();
    raw.set(&key.meta_key(), &encode_metadata(&meta).unwrap()).unwrap();
  }

  #[tokio::test]
  async fn test_read_after_write_for_every_entity() {
    let (store, remote, _) = online_store();
    remote.fail_fetch.store(true, std::sync::atomic::Ordering::SeqCst);

    let t = trade("t1", 100.0);
    let mut progress = UserProgress::new("u1");
    progress.xp = 250;
    let mut settings = AppSettings::new("u1");
    settings.starting_capital = 25_000.0;

    store.save_trade(&t).await.unwrap();
    store.save_progress(&progress).await.unwrap();
    store.save_settings(&settings).await.unwrap();

    assert_eq!(store.get_trades("u1").await.data, vec![t]);
    assert_eq!(store.get_progress("u1").await.data, Some(progress));
    assert_eq!(store.get_settings("u1").await.data, Some(settings));
    // Singleton writes are fresh, so only the never-listed trades hit the remote
    assert_eq!(remote.calls().0, 1);
  }

  #[tokio::test]
  async fn test_save_online_pushes_immediately() {
    let (store, remote, _) = online_store();
    let t = trade("t1", 50.0);

    store.save_trade(&t).await.unwrap();
    assert_eq!(remote.calls().1, 1);
    assert!(remote.row(EntityType::Trade, "t1").is_some());
    assert!(!store.cache.is_dirty(&t.cache_key()));
    assert_eq!(store.status().sync_queue_size, 0);
  }

  #[tokio::test]
  async fn test_failed_fast_path_leaves_entry_dirty_and_queued() {
    let (store, remote, _) = online_store();
    remote.fail_upsert.store(true, std::sync::atomic::Ordering::SeqCst);
    let t = trade("t1", 50.0);

    store.save_trade(&t).await.unwrap();
    assert!(store.cache.is_dirty(&t.cache_key()));
    assert_eq!(store.status().sync_queue_size, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_offline_save_syncs_after_reconnect() {
    let raw = Arc::new(MemoryRawStore::new());
    let remote = StubRemote::new();
    let store = store_with(raw, Some(remote.clone()), false);
    store.start();

    let t = trade("t1", 100.0);
    store.save_trade(&t).await.unwrap();
    assert_eq!(store.status().sync_queue_size, 1);
    assert!(store.cache.is_dirty(&t.cache_key()));

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(remote.calls().1, 0);

    store.monitor.set_online(true);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let status = store.status();
    assert_eq!(status.sync_queue_size, 0);
    assert!(!status.sync_in_progress);
    assert!(!store.cache.is_dirty(&t.cache_key()));
    assert_eq!(
      remote.row(EntityType::Trade, "t1").unwrap()["pnl"],
      serde_json::json!(100.0)
    );

    store.stop().await;
  }

  #[tokio::test]
  async fn test_expired_entry_falls_back_when_fetch_fails() {
    let raw = Arc::new(MemoryRawStore::new());
    let remote = StubRemote::new();
    remote.fail_fetch.store(true, std::sync::atomic::Ordering::SeqCst);
    let key = CacheKey::owner(EntityType::Progress, "u1");
    let mut progress = UserProgress::new("u1");
    progress.completions = 12;
    plant(&raw, &key, &progress, chrono::Duration::minutes(10));

    let store = store_with(raw, Some(remote.clone()), true);
    let result = store.get_progress("u1").await;

    assert_eq!(result.data, Some(progress));
    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(remote.calls().0, 1);
    assert!(store
      .status()
      .recent_events
      .iter()
      .any(|e| matches!(&e.kind, DiagnosticKind::StaleFallback { key, .. } if key == "cache_progress_u1")));
  }

  #[tokio::test]
  async fn test_valid_entry_never_fetches() {
    let raw = Arc::new(MemoryRawStore::new());
    let remote = StubRemote::new();
    let key = CacheKey::owner(EntityType::Settings, "u1");
    plant(&raw, &key, &AppSettings::new("u1"), chrono::Duration::minutes(1));

    let store = store_with(raw, Some(remote.clone()), true);
    let result = store.get_settings("u1").await;

    assert!(result.data.is_some());
    assert_eq!(result.source, CacheSource::CacheFresh);
    assert_eq!(remote.calls().0, 0);
  }

  #[tokio::test]
  async fn test_expired_entry_refreshes_from_remote() {
    let raw = Arc::new(MemoryRawStore::new());
    let remote = StubRemote::new();
    let key = CacheKey::owner(EntityType::Progress, "u1");
    plant(&raw, &key, &UserProgress::new("u1"), chrono::Duration::minutes(10));

    let mut newer = UserProgress::new("u1");
    newer.level = 4;
    remote.insert(EntityType::Progress, serde_json::to_value(&newer).unwrap());

    let store = store_with(raw, Some(remote), true);
    let result = store.get_progress("u1").await;
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data, Some(newer.clone()));

    let entry = store.cache.read::<UserProgress>(&key).unwrap();
    assert_eq!(entry.value, newer);
    assert!(!entry.metadata.is_dirty);
  }

  #[tokio::test]
  async fn test_missing_everywhere_reads_as_empty() {
    let (store, remote, _) = online_store();
    remote.fail_fetch.store(true, std::sync::atomic::Ordering::SeqCst);

    assert_eq!(store.get_progress("u1").await.data, None);
    assert!(store.get_trades("u1").await.data.is_empty());
  }

  #[tokio::test]
  async fn test_trade_refresh_keeps_pending_local_and_drops_remote_deletions() {
    let raw = Arc::new(MemoryRawStore::new());
    let remote = StubRemote::new();

    // Clean local trade the remote no longer has
    let gone = trade("gone", 1.0);
    plant(&raw, &gone.cache_key(), &gone, chrono::Duration::minutes(30));

    let store = store_with(raw, Some(remote.clone()), true);
    // Pending local edit of a trade the remote has an older copy of
    remote.fail_upsert.store(true, std::sync::atomic::Ordering::SeqCst);
    let local = trade("shared", 99.0);
    store.save_trade(&local).await.unwrap();
    remote.insert(
      EntityType::Trade,
      serde_json::to_value(trade("shared", 1.0)).unwrap(),
    );
    remote.insert(EntityType::Trade, serde_json::to_value(trade("new", 5.0)).unwrap());

    let result = store.get_trades("u1").await;
    assert_eq!(result.source, CacheSource::Network);

    let mut by_id: Vec<(String, Option<f64>)> =
      result.data.iter().map(|t| (t.id.clone(), t.pnl)).collect();
    by_id.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
      by_id,
      vec![("new".to_string(), Some(5.0)), ("shared".to_string(), Some(99.0))]
    );
    assert!(store.cache.is_dirty(&local.cache_key()));
    assert!(store.trades_listed_at("u1").is_some());

    // The listing is now valid, so a second read stays local
    let second = store.get_trades("u1").await;
    assert_eq!(second.source, CacheSource::CacheFresh);
    assert_eq!(remote.calls().0, 1);
  }

  #[tokio::test]
  async fn test_offline_delete_is_hidden_then_reaches_remote() {
    let raw = Arc::new(MemoryRawStore::new());
    let remote = StubRemote::new();
    let t = trade("t1", 3.0);
    remote.insert(EntityType::Trade, serde_json::to_value(&t).unwrap());
    let store = store_with(raw.clone(), Some(remote.clone()), false);
    store.save_trade(&t).await.unwrap();

    store.delete_trade("u1", "t1").await.unwrap();
    assert!(store.get_trades("u1").await.data.is_empty());
    assert_eq!(store.status().sync_queue_size, 1);

    store.monitor.set_online(true);
    store.force_sync_all("u1").await.unwrap();
    assert_eq!(remote.row(EntityType::Trade, "t1"), None);
    let keys = raw.keys().unwrap();
    assert!(!keys.contains(&"cache_trade_u1_t1".to_string()));
    assert!(!keys.contains(&"cache_trade_u1_t1_meta".to_string()));
    assert_eq!(store.status().sync_queue_size, 0);
  }

  #[tokio::test]
  async fn test_clear_cache_is_scoped_to_owner() {
    let raw = Arc::new(MemoryRawStore::new());
    let store = store_with(raw.clone(), None, false);

    for owner in ["u1", "u2"] {
      let mut t = trade("t1", 1.0);
      t.user_id = owner.to_string();
      store.save_trade(&t).await.unwrap();
      store.save_progress(&UserProgress::new(owner)).await.unwrap();
      store.save_settings(&AppSettings::new(owner)).await.unwrap();
    }

    store.clear_cache(Some("u1")).unwrap();

    let keys = raw.keys().unwrap();
    assert!(keys.iter().all(|k| !k.contains("_u1")));
    for key in [
      "cache_trade_u2_t1",
      "cache_trade_u2_t1_meta",
      "cache_progress_u2",
      "cache_progress_u2_meta",
      "cache_settings_u2",
      "cache_settings_u2_meta",
    ] {
      assert!(keys.contains(&key.to_string()), "missing {}", key);
    }
    assert_eq!(store.status().sync_queue_size, 3);

    store.clear_cache(None).unwrap();
    assert!(raw.keys().unwrap().is_empty());
    assert_eq!(store.status().sync_queue_size, 0);
  }

  #[tokio::test]
  async fn test_force_sync_marks_everything_and_reports_failure() {
    let (store, remote, _) = online_store();
    store.save_trade(&trade("t1", 1.0)).await.unwrap();
    store.save_progress(&UserProgress::new("u1")).await.unwrap();
    assert_eq!(store.status().sync_queue_size, 0);
    assert_eq!(remote.calls().1, 2);

    let report = store.force_sync_all("u1").await.unwrap();
    assert_eq!(report.pushed, 2);
    assert_eq!(remote.calls().1, 4);

    remote.fail_upsert.store(true, std::sync::atomic::Ordering::SeqCst);
    let err = store.force_sync_all("u1").await.unwrap_err();
    assert!(matches!(err, SyncError::Incomplete { failed: 2, .. }));
    assert_eq!(store.status().sync_queue_size, 2);
  }

  #[tokio::test]
  async fn test_force_sync_requires_remote_and_connectivity() {
    let local_only = store_with(Arc::new(MemoryRawStore::new()), None, true);
    assert!(matches!(
      local_only.force_sync_all("u1").await,
      Err(SyncError::NotConfigured)
    ));

    let offline = store_with(Arc::new(MemoryRawStore::new()), Some(StubRemote::new()), false);
    assert!(matches!(
      offline.force_sync_all("u1").await,
      Err(SyncError::Offline)
    ));
  }

  #[tokio::test]
  async fn test_local_only_mode_serves_cache() {
    let store = store_with(Arc::new(MemoryRawStore::new()), None, true);
    store.start();

    let t = trade("t1", 1.0);
    store.save_trade(&t).await.unwrap();
    let result = store.get_trades("u1").await;
    assert_eq!(result.source, CacheSource::CacheOnly);
    assert_eq!(result.data, vec![t]);

    let status = store.status();
    assert!(!status.remote_configured);
    assert_eq!(status.sync_queue_size, 1);
    store.stop().await;
  }

  #[tokio::test]
  async fn test_quota_exceeded_propagates_from_save() {
    let raw = Arc::new(MemoryRawStore::with_capacity(64));
    let store = store_with(raw, None, false);

    let err = store.save_trade(&trade("t1", 1.0)).await.unwrap_err();
    assert!(matches!(err, CacheError::QuotaExceeded { .. }));
    assert!(store.get_trades("u1").await.data.is_empty());
    assert!(store
      .status()
      .recent_events
      .iter()
      .any(|e| matches!(e.kind, DiagnosticKind::QuotaExceeded { .. })));
  }

  #[tokio::test]
  async fn test_restart_restores_pending_queue() {
    let raw = Arc::new(MemoryRawStore::new());
    {
      let store = store_with(raw.clone(), None, false);
      store.save_trade(&trade("t1", 1.0)).await.unwrap();
      store.save_progress(&UserProgress::new("u1")).await.unwrap();
    }

    let remote = StubRemote::new();
    let store = store_with(raw, Some(remote.clone()), true);
    assert_eq!(store.status().sync_queue_size, 2);

    let report = store.force_sync_all("u1").await.unwrap();
    assert_eq!(report.pushed, 2);
    assert_eq!(store.status().sync_queue_size, 0);
  }

  #[test]
  fn test_status_serializes_with_expected_field_names() {
    let store = store_with(Arc::new(MemoryRawStore::new()), None, false);
    let json = serde_json::to_value(store.status()).unwrap();
    assert_eq!(json["isOnline"], false);
    assert_eq!(json["syncQueueSize"], 0);
    assert_eq!(json["syncInProgress"], false);
    assert_eq!(json["remoteConfigured"], false);
    assert_eq!(json["backgroundSync"], false);
    assert_eq!(json["deadLettered"], serde_json::json!([]));
  }

  #[tokio::test]
  async fn test_status_reports_dead_letters_and_running_engine() {
    let (store, remote, _) = online_store();
    remote.reject_id("bad");
    store.save_trade(&trade("bad", 1.0)).await.unwrap();
    let engine = store.engine.as_ref().unwrap();
    for _ in 0..3 {
      assert_eq!(engine.run_pass(PassMode::Forced).await.failed.len(), 1);
    }

    store.start();
    let status = store.status();
    assert!(status.background_sync);
    assert_eq!(status.dead_lettered.len(), 1);
    assert_eq!(status.dead_lettered[0].key, "cache_trade_u1_bad");
    assert!(status.dead_lettered[0].last_error.is_some());

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["deadLettered"][0]["attempts"], 3);
    store.stop().await;
    assert!(!store.status().background_sync);
  }

  #[tokio::test]
  async fn test_online_changes_follow_the_monitor() {
    let store = store_with(Arc::new(MemoryRawStore::new()), Some(StubRemote::new()), false);
    let mut online = store.online_changes();
    assert!(!*online.borrow_and_update());

    store.monitor.set_online(true);
    assert!(online.has_changed().unwrap());
    assert!(*online.borrow_and_update());
  }

  #[tokio::test]
  async fn test_trade_saved_during_listing_survives_refresh() {
    let (store, remote, _) = online_store();
    let gate = remote.gate_fetches();
    let t2 = trade("t2", 7.0);

    let (listed, ()) = tokio::join!(store.get_trades("u1"), async {
      while remote.calls().0 == 0 {
        tokio::task::yield_now().await;
      }
      // The listing above was read before this save reached the remote
      store.save_trade(&t2).await.unwrap();
      gate.add_permits(1);
    });

    assert_eq!(listed.data, vec![t2.clone()]);
    let again = store.get_trades("u1").await;
    assert_eq!(again.source, CacheSource::CacheFresh);
    assert_eq!(again.data, vec![t2]);
  }

  #[tokio::test]
  async fn test_singleton_saved_during_fetch_is_not_overwritten() {
    let (store, remote, _) = online_store();
    let mut old = UserProgress::new("u1");
    old.xp = 1;
    remote.insert(EntityType::Progress, serde_json::to_value(&old).unwrap());
    let gate = remote.gate_fetches();

    let mut newer = UserProgress::new("u1");
    newer.xp = 999;
    let (read, ()) = tokio::join!(store.get_progress("u1"), async {
      while remote.calls().0 == 0 {
        tokio::task::yield_now().await;
      }
      store.save_progress(&newer).await.unwrap();
      gate.add_permits(1);
    });

    assert_eq!(read.data.map(|p| p.xp), Some(999));
    assert_eq!(store.get_progress("u1").await.data.map(|p| p.xp), Some(999));
    assert_eq!(remote.row(EntityType::Progress, "u1").unwrap()["xp"], 999);
  }

  #[tokio::test(start_paused = true)]
  async fn test_hung_remote_does_not_hold_up_save() {
    let (store, remote, _) = online_store();
    let _gate = remote.gate_upserts();
    let t = trade("t1", 1.0);

    let started = tokio::time::Instant::now();
    store.save_trade(&t).await.unwrap();
    assert!(started.elapsed() <= IMMEDIATE_PUSH_TIMEOUT + Duration::from_millis(10));

    assert!(store.cache.is_dirty(&t.cache_key()));
    assert_eq!(store.status().sync_queue_size, 1);
    assert_eq!(store.get_trades("u1").await.data, vec![t]);
  }

  #[tokio::test]
  async fn test_sync_pending_drains_writes_from_an_earlier_run() {
    let raw = Arc::new(MemoryRawStore::new());
    {
      let offline = store_with(raw.clone(), Some(StubRemote::new()), false);
      offline.save_trade(&trade("t1", 1.0)).await.unwrap();
      assert_eq!(offline.sync_pending().await, None);
    }

    let remote = StubRemote::new();
    let store = store_with(raw, Some(remote.clone()), true);
    assert_eq!(store.status().sync_queue_size, 1);

    let report = store.sync_pending().await.unwrap();
    assert_eq!(report.pushed, 1);
    assert_eq!(store.status().sync_queue_size, 0);
    assert!(remote.row(EntityType::Trade, "t1").is_some());

    // Nothing left to do, and nothing to do it with in local-only mode
    assert_eq!(store.sync_pending().await, None);
    let local_only = store_with(Arc::new(MemoryRawStore::new()), None, true);
    local_only.save_trade(&trade("t2", 1.0)).await.unwrap();
    assert_eq!(local_only.sync_pending().await, None);
  }

  #[test]
  fn test_resolve_owner_prefers_flag() {
    let config = Config {
      user_id: Some("from-config".into()),
      ..Config::default()
    };
    assert_eq!(resolve_owner(Some("cli"), &config).unwrap(), "cli");
    assert_eq!(resolve_owner(None, &config).unwrap(), "from-config");
    assert!(resolve_owner(None, &Config::default()).is_err());
  }
}
