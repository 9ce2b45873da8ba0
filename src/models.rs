//! Journal records cached on-device and mirrored to the remote store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::cache::Cacheable;

/// Kind of record the cache and the remote store know about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
  Trade,
  Progress,
  Settings,
}

impl EntityType {
  pub const ALL: [EntityType; 3] = [EntityType::Trade, EntityType::Progress, EntityType::Settings];

  /// Token used inside cache keys.
  pub fn as_str(&self) -> &'static str {
    match self {
      EntityType::Trade => "trade",
      EntityType::Progress => "progress",
      EntityType::Settings => "settings",
    }
  }

  /// Remote table backing this entity.
  pub fn table(&self) -> &'static str {
    match self {
      EntityType::Trade => "trades",
      EntityType::Progress => "user_progress",
      EntityType::Settings => "app_settings",
    }
  }

  /// Column the remote uses to resolve upsert conflicts.
  pub fn identity_column(&self) -> &'static str {
    match self {
      EntityType::Trade => "id",
      EntityType::Progress | EntityType::Settings => "user_id",
    }
  }

  /// Singletons are stored one per owner and carry no record id.
  pub fn is_singleton(&self) -> bool {
    !matches!(self, EntityType::Trade)
  }
}

impl fmt::Display for EntityType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for EntityType {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    EntityType::ALL
      .into_iter()
      .find(|entity| entity.as_str() == s)
      .ok_or_else(|| format!("unknown entity type: {}", s))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
  Long,
  Short,
}

impl fmt::Display for Direction {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Direction::Long => f.write_str("long"),
      Direction::Short => f.write_str("short"),
    }
  }
}

/// A journal entry for one trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
  pub id: String,
  pub user_id: String,
  pub symbol: String,
  pub direction: Direction,
  pub entry_price: f64,
  #[serde(default)]
  pub exit_price: Option<f64>,
  pub quantity: f64,
  #[serde(default)]
  pub pnl: Option<f64>,
  /// Whether the trade respected the active rules
  pub followed_rules: bool,
  #[serde(default)]
  pub tags: Vec<String>,
  #[serde(default)]
  pub notes: Option<String>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl Trade {
  /// Start a new trade with a fresh id.
  pub fn new(user_id: &str, symbol: &str, direction: Direction, entry_price: f64, quantity: f64) -> Self {
    let now = Utc::now();
    Self {
      id: uuid::Uuid::new_v4().to_string(),
      user_id: user_id.to_string(),
      symbol: symbol.to_uppercase(),
      direction,
      entry_price,
      exit_price: None,
      quantity,
      pnl: None,
      followed_rules: true,
      tags: Vec::new(),
      notes: None,
      created_at: now,
      updated_at: now,
    }
  }
}

/// Aggregate progress counters, one per user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProgress {
  pub user_id: String,
  #[serde(default)]
  pub completions: u32,
  #[serde(default)]
  pub current_streak: u32,
  #[serde(default)]
  pub best_streak: u32,
  #[serde(default)]
  pub discipline_score: f64,
  #[serde(default = "default_level")]
  pub level: u32,
  #[serde(default)]
  pub xp: u64,
  pub updated_at: DateTime<Utc>,
}

fn default_level() -> u32 {
  1
}

impl UserProgress {
  pub fn new(user_id: &str) -> Self {
    Self {
      user_id: user_id.to_string(),
      completions: 0,
      current_streak: 0,
      best_streak: 0,
      discipline_score: 0.0,
      level: default_level(),
      xp: 0,
      updated_at: Utc::now(),
    }
  }
}

/// User-chosen configuration, one per user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSettings {
  pub user_id: String,
  pub starting_capital: f64,
  pub target_completions: u32,
  #[serde(default)]
  pub active_rules: Vec<String>,
  pub updated_at: DateTime<Utc>,
}

impl AppSettings {
  pub fn new(user_id: &str) -> Self {
    Self {
      user_id: user_id.to_string(),
      starting_capital: 0.0,
      target_completions: 0,
      active_rules: Vec::new(),
      updated_at: Utc::now(),
    }
  }
}

// ============================================================================
// Cacheable implementations
// ============================================================================

impl Cacheable for Trade {
  fn entity_type() -> EntityType {
    EntityType::Trade
  }

  fn owner_id(&self) -> &str {
    &self.user_id
  }

  fn record_id(&self) -> Option<&str> {
    Some(&self.id)
  }
}

impl Cacheable for UserProgress {
  fn entity_type() -> EntityType {
    EntityType::Progress
  }

  fn owner_id(&self) -> &str {
    &self.user_id
  }

  fn record_id(&self) -> Option<&str> {
    None
  }
}

impl Cacheable for AppSettings {
  fn entity_type() -> EntityType {
    EntityType::Settings
  }

  fn owner_id(&self) -> &str {
    &self.user_id
  }

  fn record_id(&self) -> Option<&str> {
    None
  }
}
