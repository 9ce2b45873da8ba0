mod cache;
mod commands;
mod config;
mod connectivity;
mod diagnostics;
mod hybrid;
mod logging;
mod models;
mod remote;
mod store;
mod sync;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "tradekeep")]
#[command(about = "An offline-first trading discipline journal")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/tradekeep/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// User whose records to work with (overrides user_id from the config)
  #[arg(short, long)]
  user: Option<String>,

  /// Keep the cache in memory for this run only
  #[arg(long)]
  ephemeral: bool,

  /// Also log to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: commands::Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = logging::init(args.verbose)?;

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let owner = hybrid::resolve_owner(args.user.as_deref(), &config)?;

  let store = hybrid::HybridStore::open(&config, args.ephemeral).await?;
  info!(owner = %owner, remote = store.status().remote_configured, "store opened");

  let result = commands::run(&store, &owner, args.command).await;

  // Drain writes queued by this or an earlier offline run
  if let Some(report) = store.sync_pending().await {
    info!(
      pushed = report.pushed,
      deleted = report.deleted,
      failed = report.failed.len(),
      "pending changes synced before exit"
    );
  }
  store.stop().await;
  result
}
