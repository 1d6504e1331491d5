//! tracing initialization for the manager binary.

use std::path::Path;
use switchboard_core::SwitchboardResult;
use tracing_subscriber::EnvFilter;

/// Keeps the non-blocking file writer alive for the process lifetime.
///
/// Dropping the guard flushes and stops the background writer thread.
pub struct TelemetryGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Initialize the global subscriber.
///
/// `log_level` is the default filter directive; `RUST_LOG` overrides it.
/// With `log_file` set, output goes to that file through a non-blocking
/// writer instead of stderr.
pub fn init(log_level: &str, log_file: Option<&Path>) -> SwitchboardResult<TelemetryGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false)
                .init();
            Ok(TelemetryGuard {
                _file_guard: Some(guard),
            })
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
            Ok(TelemetryGuard { _file_guard: None })
        }
    }
}
