//! Logging setup: a daily rolling file, plus stderr with `--verbose`.
//!
//! stdout is reserved for the JSON-lines protocol, so nothing logs there.
//! The filter comes from `OFFSYNC_LOG` and defaults to `info`.

use color_eyre::eyre::eyre;
use color_eyre::Result;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "OFFSYNC_LOG";
pub const LOG_FILE: &str = "offsync.log";

/// Keeps the file writer alive; dropping it flushes the log.
pub struct LoggingGuard {
  _file_guard: WorkerGuard,
}

/// `$XDG_DATA_HOME/offsync/logs`, or `./logs` when there is no data dir.
pub fn default_log_dir() -> PathBuf {
  dirs::data_dir()
    .map(|dir| dir.join("offsync").join("logs"))
    .unwrap_or_else(|| PathBuf::from("logs"))
}

fn env_filter() -> EnvFilter {
  EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}

pub fn init(log_dir: &Path, verbose: bool) -> Result<LoggingGuard> {
  std::fs::create_dir_all(log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE);
  let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);

  let file_layer = tracing_subscriber::fmt::layer()
    .with_writer(file_writer)
    .with_ansi(false);

  let stderr_layer = verbose.then(|| {
    tracing_subscriber::fmt::layer()
      .with_writer(std::io::stderr)
      .compact()
  });

  tracing_subscriber::registry()
    .with(env_filter())
    .with(file_layer)
    .with(stderr_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

  Ok(LoggingGuard {
    _file_guard: file_guard,
  })
}
