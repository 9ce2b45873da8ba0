//! In-memory remote store double for tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

use super::{RemoteClient, RemoteError};
use crate::models::EntityType;

#[derive(Default)]
pub struct StubRemote {
  rows: Mutex<BTreeMap<(EntityType, String), Value>>,
  pub fail_fetch: AtomicBool,
  pub fail_upsert: AtomicBool,
  pub fail_delete: AtomicBool,
  pub fetch_calls: AtomicUsize,
  pub upsert_calls: AtomicUsize,
  pub delete_calls: AtomicUsize,
  /// When set, each upsert waits for a permit before completing
  gate: Mutex<Option<Arc<Semaphore>>>,
  /// When set, each fetch reads its rows and then waits for a permit
  fetch_gate: Mutex<Option<Arc<Semaphore>>>,
  rejected_ids: Mutex<HashSet<String>>,
}

impl StubRemote {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  /// Seed a row as if another client had written it.
  pub fn insert(&self, entity: EntityType, row: Value) {
    let id = row_id(entity, &row);
    self.rows.lock().unwrap().insert((entity, id), row);
  }

  pub fn row(&self, entity: EntityType, id: &str) -> Option<Value> {
    self.rows.lock().unwrap().get(&(entity, id.to_string())).cloned()
  }

  pub fn set_failing(&self, failing: bool) {
    self.fail_fetch.store(failing, Ordering::SeqCst);
    self.fail_upsert.store(failing, Ordering::SeqCst);
    self.fail_delete.store(failing, Ordering::SeqCst);
  }

  /// Make upserts block until permits are added to the returned semaphore.
  pub fn gate_upserts(&self) -> Arc<Semaphore> {
    let gate = Arc::new(Semaphore::new(0));
    *self.gate.lock().unwrap() = Some(gate.clone());
    gate
  }

  /// Make fetches block after reading their rows until permits are added.
  pub fn gate_fetches(&self) -> Arc<Semaphore> {
    let gate = Arc::new(Semaphore::new(0));
    *self.fetch_gate.lock().unwrap() = Some(gate.clone());
    gate
  }

  /// Reject every upsert of the record with this identity.
  pub fn reject_id(&self, id: &str) {
    self.rejected_ids.lock().unwrap().insert(id.to_string());
  }

  pub fn calls(&self) -> (usize, usize, usize) {
    (
      self.fetch_calls.load(Ordering::SeqCst),
      self.upsert_calls.load(Ordering::SeqCst),
      self.delete_calls.load(Ordering::SeqCst),
    )
  }
}

fn row_id(entity: EntityType, row: &Value) -> String {
  row[entity.identity_column()]
    .as_str()
    .unwrap_or_default()
    .to_string()
}

fn unreachable() -> RemoteError {
  RemoteError::Unreachable("stubbed failure".to_string())
}

#[async_trait]
impl RemoteClient for StubRemote {
  async fn fetch_all(&self, entity: EntityType, owner_id: &str) -> Result<Vec<Value>, RemoteError> {
    self.fetch_calls.fetch_add(1, Ordering::SeqCst);
    if self.fail_fetch.load(Ordering::SeqCst) {
      return Err(unreachable());
    }
    let rows: Vec<Value> = self
      .rows
      .lock()
      .unwrap()
      .iter()
      .filter(|((e, _), row)| *e == entity && row["user_id"] == owner_id)
      .map(|(_, row)| row.clone())
      .collect();
    let gate = self.fetch_gate.lock().unwrap().clone();
    if let Some(gate) = gate {
      gate.acquire().await.unwrap().forget();
    }
    Ok(rows)
  }

  async fn upsert(&self, entity: EntityType, record: &Value) -> Result<(), RemoteError> {
    self.upsert_calls.fetch_add(1, Ordering::SeqCst);
    let gate = self.gate.lock().unwrap().clone();
    if let Some(gate) = gate {
      gate.acquire().await.unwrap().forget();
    }
    if self.fail_upsert.load(Ordering::SeqCst) {
      return Err(unreachable());
    }
    if self
      .rejected_ids
      .lock()
      .unwrap()
      .contains(&row_id(entity, record))
    {
      return Err(RemoteError::Rejected {
        status: 422,
        message: "stubbed rejection".to_string(),
      });
    }
    self.insert(entity, record.clone());
    Ok(())
  }

  async fn delete(&self, entity: EntityType, id: &str) -> Result<(), RemoteError> {
    self.delete_calls.fetch_add(1, Ordering::SeqCst);
    if self.fail_delete.load(Ordering::SeqCst) {
      return Err(unreachable());
    }
    self.rows.lock().unwrap().remove(&(entity, id.to_string()));
    Ok(())
  }

  async fn ping(&self) -> Result<(), RemoteError> {
    if self.fail_fetch.load(Ordering::SeqCst) {
      return Err(unreachable());
    }
    Ok(())
  }
}
