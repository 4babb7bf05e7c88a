//! Tracing setup: human-readable stderr plus the durable log file.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

pub const LOG_FILE_NAME: &str = "ednovas.log";

/// Install the global subscriber. `RUST_LOG` overrides `default_level`.
///
/// Returns the path of the durable log. Calling this twice is harmless; the
/// second call leaves the first subscriber in place.
pub fn init(log_dir: &Path, default_level: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;
    let log_path = log_dir.join(LOG_FILE_NAME);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open {}", log_path.display()))?;

    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
    };

    let stderr_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(filter());
    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .with_filter(filter());

    let _ = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init();
    Ok(log_path)
}

/// Log a failed top-level command so the durable log holds the full error
/// chain, not just the stderr of whoever ran it.
pub fn record_failure<T>(result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        tracing::error!("{e:#}");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = init(&dir.path().join("logs"), "info").unwrap();
        assert!(path.exists());
        assert_eq!(path.file_name().unwrap(), LOG_FILE_NAME);
    }

    #[test]
    fn failed_command_lands_in_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.log");
        let file = std::fs::File::create(&path).unwrap();
        let subscriber = tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)));

        tracing::subscriber::with_default(subscriber, || {
            let failed: Result<()> =
                Err(anyhow::anyhow!("connection refused").context("login failed"));
            assert!(record_failure(failed).is_err());
            assert!(record_failure(Ok(1)).is_ok());
        });

        let log = std::fs::read_to_string(&path).unwrap();
        assert_eq!(log.lines().count(), 1);
        assert!(log.contains("ERROR"));
        assert!(log.contains("login failed: connection refused"));
    }
}
