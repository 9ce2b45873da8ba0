//! Online/offline tracking.
//!
//! A CLI process has no browser-style online event, so the signal comes from
//! a probe that pings the remote store on an interval. Anything else that
//! learns about connectivity can feed [`ConnectivityMonitor::set_online`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::remote::RemoteClient;

pub type SubscriptionId = u64;

type Callback = Arc<dyn Fn() + Send + Sync>;

struct Inner {
  state: watch::Sender<bool>,
  subscribers: Mutex<BTreeMap<SubscriptionId, Callback>>,
  next_id: AtomicU64,
}

/// Current connectivity plus callbacks fired on each offline -> online edge.
#[derive(Clone)]
pub struct ConnectivityMonitor {
  inner: Arc<Inner>,
}

impl ConnectivityMonitor {
  pub fn new(initially_online: bool) -> Self {
    let (state, _) = watch::channel(initially_online);
    Self {
      inner: Arc::new(Inner {
        state,
        subscribers: Mutex::new(BTreeMap::new()),
        next_id: AtomicU64::new(1),
      }),
    }
  }

  pub fn is_online(&self) -> bool {
    *self.inner.state.borrow()
  }

  /// Record the current state. Returns whether this was a transition.
  ///
  /// Each offline -> online transition invokes every subscriber exactly once;
  /// repeated reports of the same state invoke nothing.
  pub fn set_online(&self, online: bool) -> bool {
    let previous = self.inner.state.send_replace(online);
    if previous == online {
      return false;
    }

    info!(online, "connectivity changed");
    if online {
      let callbacks: Vec<Callback> = self
        .inner
        .subscribers
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .values()
        .cloned()
        .collect();
      for callback in callbacks {
        callback();
      }
    }
    true
  }

  /// Register `callback` for offline -> online transitions.
  pub fn subscribe(&self, callback: impl Fn() + Send + Sync + 'static) -> SubscriptionId {
    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
    self
      .inner
      .subscribers
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .insert(id, Arc::new(callback));
    id
  }

  pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
    self
      .inner
      .subscribers
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .remove(&id)
      .is_some()
  }

  pub fn watch(&self) -> watch::Receiver<bool> {
    self.inner.state.subscribe()
  }
}

/// Ping the remote store every `interval` and report the result.
pub fn spawn_probe(
  monitor: ConnectivityMonitor,
  remote: Arc<dyn RemoteClient>,
  interval: Duration,
  mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        _ = ticker.tick() => {
          let reachable = remote.ping().await;
          if let Err(e) = &reachable {
            debug!(error = %e, "connectivity probe failed");
          }
          monitor.set_online(reachable.is_ok());
        }
        _ = shutdown.changed() => break,
      }
    }
  })
}
