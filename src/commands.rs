//! Subcommands and their handlers.

use chrono::Utc;
use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};

use crate::cache::{CacheResult, CacheSource};
use crate::hybrid::HybridStore;
use crate::models::{AppSettings, Direction, Trade, UserProgress};

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Record, list and remove trades
  #[command(subcommand)]
  Trade(TradeCommand),
  /// Show or update progress counters
  #[command(subcommand)]
  Progress(ProgressCommand),
  /// Show or update settings
  #[command(subcommand)]
  Settings(SettingsCommand),
  /// Show connectivity and sync state
  Status {
    #[arg(long)]
    json: bool,
  },
  /// Push every cached record now and report failures
  Sync,
  /// Drop cached data
  #[command(subcommand)]
  Cache(CacheCommand),
  /// Keep syncing in the background until interrupted
  Watch,
}

#[derive(Subcommand, Debug)]
pub enum TradeCommand {
  Add {
    #[arg(long)]
    symbol: String,
    #[arg(long, value_enum)]
    direction: Direction,
    #[arg(long)]
    entry: f64,
    #[arg(long)]
    exit: Option<f64>,
    #[arg(long)]
    qty: f64,
    #[arg(long)]
    pnl: Option<f64>,
    /// The trade broke one of the active rules
    #[arg(long)]
    broke_rules: bool,
    #[arg(long = "tag")]
    tags: Vec<String>,
    #[arg(long)]
    notes: Option<String>,
  },
  List,
  Rm {
    id: String,
  },
}

#[derive(Subcommand, Debug)]
pub enum ProgressCommand {
  Show,
  Set {
    #[arg(long)]
    completions: Option<u32>,
    #[arg(long)]
    streak: Option<u32>,
    #[arg(long)]
    score: Option<f64>,
    #[arg(long)]
    level: Option<u32>,
    #[arg(long)]
    xp: Option<u64>,
  },
}

#[derive(Subcommand, Debug)]
pub enum SettingsCommand {
  Show,
  Set {
    #[arg(long)]
    capital: Option<f64>,
    #[arg(long)]
    target: Option<u32>,
    /// Replaces the active rule list when given
    #[arg(long = "rule")]
    rules: Vec<String>,
  },
}

#[derive(Subcommand, Debug)]
pub enum CacheCommand {
  Clear {
    /// Clear every user's data, not just the current one
    #[arg(long)]
    all: bool,
  },
}

pub async fn run(store: &HybridStore, owner: &str, command: Command) -> Result<()> {
  match command {
    Command::Trade(cmd) => run_trade(store, owner, cmd).await,
    Command::Progress(cmd) => run_progress(store, owner, cmd).await,
    Command::Settings(cmd) => run_settings(store, owner, cmd).await,
    Command::Status { json } => {
      let status = store.status();
      if json {
        let out = serde_json::to_string_pretty(&status)
          .map_err(|e| eyre!("Failed to encode status: {}", e))?;
        println!("{}", out);
      } else {
        println!("online:          {}", status.is_online);
        println!("remote:          {}", if status.remote_configured { "configured" } else { "none" });
        println!("queued:          {}", status.sync_queue_size);
        println!("sync running:    {}", status.sync_in_progress);
        println!("background sync: {}", status.background_sync);
        for dead in &status.dead_lettered {
          println!(
            "dead-lettered:   {} after {} attempts ({})",
            dead.key,
            dead.attempts,
            dead.last_error.as_deref().unwrap_or("no error recorded")
          );
        }
        if let Some(at) = store.trades_listed_at(owner) {
          println!("trades listed:   {}", at.to_rfc3339());
        }
        for event in status.recent_events.iter().rev().take(5) {
          println!("event:           {} {:?}", event.at.to_rfc3339(), event.kind);
        }
      }
      Ok(())
    }
    Command::Sync => {
      let report = store
        .force_sync_all(owner)
        .await
        .map_err(|e| eyre!("Sync failed: {}", e))?;
      println!(
        "pushed {}, deleted {}, {} attempted",
        report.pushed, report.deleted, report.attempted
      );
      Ok(())
    }
    Command::Cache(CacheCommand::Clear { all }) => {
      let scope = if all { None } else { Some(owner) };
      let report = store
        .clear_cache(scope)
        .map_err(|e| eyre!("Failed to clear cache: {}", e))?;
      println!("removed {} entries", report.removed);
      if report.discarded_dirty > 0 {
        println!("discarded {} unsynced changes", report.discarded_dirty);
      }
      Ok(())
    }
    Command::Watch => {
      let mut online = store.online_changes();
      store.start();
      println!(
        "syncing in the background ({}), Ctrl-C to stop",
        if *online.borrow_and_update() { "online" } else { "offline" }
      );
      loop {
        tokio::select! {
          signal = tokio::signal::ctrl_c() => {
            signal.map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;
            break;
          }
          Ok(()) = online.changed() => {
            let now_online = *online.borrow_and_update();
            println!("{}", if now_online { "back online" } else { "offline, queueing changes" });
          }
        }
      }
      Ok(())
    }
  }
}

async fn run_trade(store: &HybridStore, owner: &str, cmd: TradeCommand) -> Result<()> {
  match cmd {
    TradeCommand::Add {
      symbol,
      direction,
      entry,
      exit,
      qty,
      pnl,
      broke_rules,
      tags,
      notes,
    } => {
      let mut trade = Trade::new(owner, &symbol, direction, entry, qty);
      trade.exit_price = exit;
      trade.pnl = pnl;
      trade.followed_rules = !broke_rules;
      trade.tags = tags;
      trade.notes = notes;
      store
        .save_trade(&trade)
        .await
        .map_err(|e| eyre!("Failed to save trade: {}", e))?;
      println!("{}", trade.id);
      Ok(())
    }
    TradeCommand::List => {
      let result = store.get_trades(owner).await;
      print_source(&result);
      for trade in &result.data {
        println!(
          "{}  {}  {:<6} {:?}  qty {}  entry {}  pnl {}{}",
          trade.id,
          trade.created_at.format("%Y-%m-%d %H:%M"),
          trade.symbol,
          trade.direction,
          trade.quantity,
          trade.entry_price,
          trade.pnl.map(|p| format!("{:.2}", p)).unwrap_or_else(|| "-".into()),
          if trade.followed_rules { "" } else { "  (broke rules)" },
        );
      }
      Ok(())
    }
    TradeCommand::Rm { id } => store
      .delete_trade(owner, &id)
      .await
      .map_err(|e| eyre!("Failed to delete trade {}: {}", id, e)),
  }
}

async fn run_progress(store: &HybridStore, owner: &str, cmd: ProgressCommand) -> Result<()> {
  let current = store.get_progress(owner).await;
  match cmd {
    ProgressCommand::Show => {
      print_source(&current);
      match current.data {
        Some(p) => println!(
          "completions {}  streak {} (best {})  score {:.1}  level {}  xp {}",
          p.completions, p.current_streak, p.best_streak, p.discipline_score, p.level, p.xp
        ),
        None => println!("no progress recorded"),
      }
      Ok(())
    }
    ProgressCommand::Set {
      completions,
      streak,
      score,
      level,
      xp,
    } => {
      let mut progress = current.data.unwrap_or_else(|| UserProgress::new(owner));
      if let Some(v) = completions {
        progress.completions = v;
      }
      if let Some(v) = streak {
        progress.current_streak = v;
        progress.best_streak = progress.best_streak.max(v);
      }
      if let Some(v) = score {
        progress.discipline_score = v;
      }
      if let Some(v) = level {
        progress.level = v;
      }
      if let Some(v) = xp {
        progress.xp = v;
      }
      progress.updated_at = Utc::now();
      store
        .save_progress(&progress)
        .await
        .map_err(|e| eyre!("Failed to save progress: {}", e))
    }
  }
}

async fn run_settings(store: &HybridStore, owner: &str, cmd: SettingsCommand) -> Result<()> {
  let current = store.get_settings(owner).await;
  match cmd {
    SettingsCommand::Show => {
      print_source(&current);
      match current.data {
        Some(s) => {
          println!(
            "capital {:.2}  target {}",
            s.starting_capital, s.target_completions
          );
          for rule in &s.active_rules {
            println!("  - {}", rule);
          }
        }
        None => println!("no settings recorded"),
      }
      Ok(())
    }
    SettingsCommand::Set {
      capital,
      target,
      rules,
    } => {
      let mut settings = current.data.unwrap_or_else(|| AppSettings::new(owner));
      if let Some(v) = capital {
        settings.starting_capital = v;
      }
      if let Some(v) = target {
        settings.target_completions = v;
      }
      if !rules.is_empty() {
        settings.active_rules = rules;
      }
      settings.updated_at = Utc::now();
      store
        .save_settings(&settings)
        .await
        .map_err(|e| eyre!("Failed to save settings: {}", e))
    }
  }
}

fn print_source<T>(result: &CacheResult<T>) {
  let note = match result.source {
    CacheSource::Network | CacheSource::CacheFresh => return,
    CacheSource::Offline => "remote unreachable, showing cached data",
    CacheSource::CacheOnly => "local-only, no remote store configured",
  };
  match result.cached_at {
    Some(at) => eprintln!("({}, last synced {})", note, at.to_rfc3339()),
    None => eprintln!("({})", note),
  }
}
