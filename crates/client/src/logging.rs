//! Log setup for the binary.
//!
//! The interactive session owns the terminal, so logs always go to a file.

use std::fs::{self, OpenOptions};
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

/// Name of the log file inside the log directory.
pub const LOG_FILE_NAME: &str = "alloc-exec.log";

/// Full path of the log file.
pub fn log_path(config: &LogConfig) -> PathBuf {
    config.dir.join(LOG_FILE_NAME)
}

/// Filter directives: `RUST_LOG` when set, else the configured level for
/// this crate and `warn` for dependencies.
pub fn filter_directives(level: &str, verbose: bool) -> String {
    if let Ok(filter) = std::env::var("RUST_LOG") {
        if !filter.is_empty() {
            return filter;
        }
    }
    let level = if verbose { "debug" } else { level };
    format!("warn,exec_client={level},alloc_exec={level}")
}

/// Installs the global subscriber writing to the log file.
///
/// The returned guard flushes pending lines when dropped; keep it alive for
/// the life of the process.
pub fn init(config: &LogConfig, verbose: bool) -> Result<WorkerGuard> {
    fs::create_dir_all(&config.dir)
        .with_context(|| format!("Failed to create log directory: {}", config.dir.display()))?;

    let path = log_path(config);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open log file: {}", path.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(file);

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter_directives(&config.level, verbose)))
        .with_ansi(false)
        .with_writer(writer)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}
