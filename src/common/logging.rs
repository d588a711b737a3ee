//! Logging and tracing configuration
//!
//! Scenario runs can take hours, so besides the terminal output a run can
//! mirror everything into a log file for later inspection.

use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use super::paths;

fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Initialize tracing for the CLI (stderr logging)
///
/// Logs are controlled by the `RUST_LOG` environment variable.
/// Default level is INFO for this crate, WARN for dependencies.
pub fn init_cli() {
    tracing_subscriber::registry()
        .with(env_filter("metabox=info,warn"))
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .init();
}

/// Initialize tracing to stderr and to a log file
///
/// The file receives everything down to `debug` for this crate (unless
/// `RUST_LOG` says otherwise), including session output traced per chunk
/// when `trace` is enabled. The returned guard flushes the file on drop and
/// must be kept alive for the whole run.
pub fn init_with_log_file(log_file: &Path) -> std::io::Result<WorkerGuard> {
    if let Some(parent) = log_file.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)?;
    let (writer, guard) = tracing_appender::non_blocking(file);

    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter("metabox=debug,info"))
        .with(file_layer)
        .with(stderr_layer)
        .init();

    Ok(guard)
}

/// Default location of the run log
pub fn default_log_file() -> Option<PathBuf> {
    paths::log_dir().map(|d| d.join("run.log"))
}
