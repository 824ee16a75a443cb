//! Shared tracing setup for the mikroscope binary.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str =
    "mikroscope=info,mikroscope_server=info,mikroscope_index=info,mikroscope_alerts=info";

/// Logging configuration for the sidecar process.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    /// Directory for the sidecar's own rolling log files. `None`
    /// disables the file layer (console only).
    pub log_dir: Option<&'a Path>,
    pub verbose: bool,
}

/// Guard that must stay alive for the duration of the process; dropping
/// it flushes and stops the background log writer.
pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Initialize tracing with an optional daily-rolling file layer and a
/// stderr layer. `RUST_LOG` overrides the default filter.
pub fn init_logging(config: LogConfig<'_>) -> Result<LogGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let mut file_guard = None;
    let file_layer = match config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory: {}", dir.display()))?;
            let appender =
                tracing_appender::rolling::daily(dir, format!("{}.log", config.app_name));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            file_guard = Some(guard);
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_filter(
                        EnvFilter::try_from_default_env()
                            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
                    ),
            )
        }
        None => None,
    };

    let console_filter = if config.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        env_filter
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .init();

    Ok(LogGuard {
        _file_guard: file_guard,
    })
}

/// Default directory for the sidecar's own logs, next to the data it
/// manages rather than under the user's home.
pub fn default_log_dir(db_path: &Path) -> PathBuf {
    db_path
        .parent()
        .map(|parent| parent.join("mikroscope-logs"))
        .unwrap_or_else(|| PathBuf::from("mikroscope-logs"))
}
