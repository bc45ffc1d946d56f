use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

/// Route tracing output to a log file so stdout stays free for command output.
///
/// RUST_LOG takes precedence over the configured level. The returned guard
/// flushes buffered lines when dropped and must be held until exit.
pub fn init(config: &LogConfig, data_dir: &Path) -> Result<WorkerGuard> {
  let path = config
    .file
    .clone()
    .unwrap_or_else(|| data_dir.join("health-guide.log"));

  let dir = path
    .parent()
    .filter(|p| !p.as_os_str().is_empty())
    .unwrap_or_else(|| Path::new("."));
  let file_name = path
    .file_name()
    .ok_or_else(|| eyre!("Invalid log file path {}", path.display()))?;

  std::fs::create_dir_all(dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let appender = tracing_appender::rolling::never(dir, file_name);
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter = EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| EnvFilter::new(config.level.as_deref().unwrap_or("info")));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}
