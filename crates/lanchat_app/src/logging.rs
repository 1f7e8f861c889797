use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DEFAULT_FILTER: &str = "info,lanchat_app=debug,lanchat_network=debug";

/// Returns the app directory: `~/.lanchat`
pub fn base_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".lanchat"))
}

/// Returns the network config path: `~/.lanchat/network.json`
pub fn config_path() -> Result<PathBuf> {
    Ok(base_dir()?.join("network.json"))
}

/// Returns the logs directory: `~/.lanchat/logs`
pub fn logs_dir() -> Result<PathBuf> {
    Ok(base_dir()?.join("logs"))
}

/// Initializes file logging under `~/.lanchat/logs`.
///
/// The terminal belongs to the chat, so nothing is logged to stdout.
/// Returns a guard that must be kept alive for the duration of the app.
pub fn init_logging() -> Result<WorkerGuard> {
    init_logging_to_dir(&logs_dir()?, DEFAULT_FILTER)
}

/// Initialize logging to a custom directory with a custom filter.
pub fn init_logging_to_dir(logs_dir: &Path, filter: &str) -> Result<WorkerGuard> {
    std::fs::create_dir_all(logs_dir)?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, "lanchat");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_to_dir_creates_directory() {
        let tmp = tempfile::tempdir().expect("Failed to create tempdir");
        let logs_dir = tmp.path().join("nested").join("logs");
        assert!(!logs_dir.exists());

        // Only one global subscriber per process; a second init may fail,
        // but the directory is created either way.
        let result = init_logging_to_dir(&logs_dir, "warn");
        assert!(logs_dir.exists());
        drop(result);
    }

    #[test]
    fn test_paths_live_under_base_dir() {
        let base = base_dir().unwrap();
        assert!(base.ends_with(".lanchat"));
        assert_eq!(config_path().unwrap(), base.join("network.json"));
        assert_eq!(logs_dir().unwrap(), base.join("logs"));
    }
}
