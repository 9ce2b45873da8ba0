//! Log setup: a daily file in the data directory, plus stderr on request.

use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const FILTER_ENV: &str = "TRADEKEEP_LOG";
const DEFAULT_FILTER: &str = "tradekeep=info";

pub fn log_dir() -> Option<PathBuf> {
  dirs::data_dir().map(|dir| dir.join("tradekeep").join("logs"))
}

fn env_filter() -> EnvFilter {
  EnvFilter::try_from_env(FILTER_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop and must outlive the
/// program's work.
pub fn init(verbose: bool) -> Result<Option<WorkerGuard>> {
  let (file_layer, guard) = match log_dir() {
    Some(dir) => {
      std::fs::create_dir_all(&dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;
      let appender = tracing_appender::rolling::daily(&dir, "tradekeep.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_filter(env_filter());
      (Some(layer), Some(guard))
    }
    None => (None, None),
  };

  let stderr_layer = verbose.then(|| {
    tracing_subscriber::fmt::layer()
      .with_writer(std::io::stderr)
      .with_target(false)
      .with_filter(env_filter())
  });

  tracing_subscriber::registry()
    .with(file_layer)
    .with(stderr_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to init logging: {}", e))?;

  Ok(guard)
}
