use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sync::{RetryPolicy, SyncSettings};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  /// Owner of every record this device reads and writes
  pub user_id: Option<String>,
  /// Remote durable store; without it everything stays on this device
  pub remote: Option<RemoteConfig>,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Base url of the REST backend (e.g. "https://xyz.supabase.co")
  pub url: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// SQLite file (defaults to $XDG_DATA_HOME/tradekeep/cache.db)
  pub path: Option<PathBuf>,
  /// Upper bound on stored bytes; unbounded when unset
  pub capacity_bytes: Option<u64>,
  /// How long an entry is served without asking the remote store
  #[serde(default = "default_validity_secs")]
  pub validity_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      path: None,
      capacity_bytes: None,
      validity_secs: default_validity_secs(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  #[serde(default = "default_debounce_ms")]
  pub debounce_ms: u64,
  #[serde(default = "default_periodic_secs")]
  pub periodic_secs: u64,
  #[serde(default = "default_probe_secs")]
  pub probe_secs: u64,
  #[serde(default)]
  pub retry: RetryConfig,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      debounce_ms: default_debounce_ms(),
      periodic_secs: default_periodic_secs(),
      probe_secs: default_probe_secs(),
      retry: RetryConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
  #[serde(default = "default_initial_ms")]
  pub initial_ms: u64,
  #[serde(default = "default_max_ms")]
  pub max_ms: u64,
  #[serde(default = "default_factor")]
  pub factor: f64,
  #[serde(default = "default_max_attempts")]
  pub max_attempts: u32,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      initial_ms: default_initial_ms(),
      max_ms: default_max_ms(),
      factor: default_factor(),
      max_attempts: default_max_attempts(),
    }
  }
}

fn default_timeout_secs() -> u64 {
  15
}

fn default_validity_secs() -> u64 {
  300
}

fn default_debounce_ms() -> u64 {
  1000
}

fn default_periodic_secs() -> u64 {
  120
}

fn default_probe_secs() -> u64 {
  30
}

fn default_initial_ms() -> u64 {
  5_000
}

fn default_max_ms() -> u64 {
  300_000
}

fn default_factor() -> f64 {
  2.0
}

fn default_max_attempts() -> u32 {
  8
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./tradekeep.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/tradekeep/config.yaml
  ///
  /// Without any file the defaults apply: local-only, no remote store.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("tradekeep.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("tradekeep").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  /// Get the remote API key from environment variables.
  ///
  /// Checks TRADEKEEP_REMOTE_KEY first, then SUPABASE_ANON_KEY as fallback.
  pub fn get_remote_key() -> Option<String> {
    std::env::var("TRADEKEEP_REMOTE_KEY")
      .or_else(|_| std::env::var("SUPABASE_ANON_KEY"))
      .ok()
      .filter(|key| !key.trim().is_empty())
  }

  pub fn validity_window(&self) -> chrono::Duration {
    chrono::Duration::seconds(self.cache.validity_secs as i64)
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.sync.probe_secs.max(1))
  }

  pub fn sync_settings(&self) -> SyncSettings {
    let retry = &self.sync.retry;
    SyncSettings {
      debounce: Duration::from_millis(self.sync.debounce_ms),
      periodic: Duration::from_secs(self.sync.periodic_secs.max(1)),
      retry: RetryPolicy {
        initial_delay: Duration::from_millis(retry.initial_ms),
        max_delay: Duration::from_millis(retry.max_ms),
        factor: retry.factor,
        max_attempts: retry.max_attempts.max(1),
      },
    }
  }
}
