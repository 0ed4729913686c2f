use std::path::PathBuf;

use anyhow::Result;
use driver_protocol::Severity;
use serde::{Deserialize, Serialize};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `info` or `driverd=debug`.
    #[serde(default = "default_level")]
    pub level: String,
    /// Directory for the daily rolling log file. Stdout only when unset.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: default_level(), dir: None }
    }
}

fn default_level() -> String {
    "info".to_string()
}

pub const LOG_FILE: &str = "driverd.log";

/// Install the global subscriber: a stdout printer with thread names (the
/// listener and reader threads are named after their manager and driver) and,
/// when a directory is configured, a non-blocking daily rolling file.
///
/// Keep the returned guard alive for as long as logs should be flushed.
pub fn init_tracing(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let stdout_layer = fmt::layer()
        .with_thread_names(true)
        .with_filter(EnvFilter::new(&config.level));

    match &config.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_thread_names(true)
                .with_filter(EnvFilter::new(&config.level));

            Registry::default()
                .with(stdout_layer)
                .with(file_layer)
                .try_init()?;
            Ok(Some(guard))
        }
        None => {
            Registry::default().with(stdout_layer).try_init()?;
            Ok(None)
        }
    }
}

/// Emit a message on behalf of a subsystem (`HKM`, `VMM`, a driver name, …).
pub fn log(facility: &str, severity: Severity, message: &str) {
    match severity {
        Severity::Debug => tracing::debug!(%facility, "{message}"),
        Severity::Info => tracing::info!(%facility, "{message}"),
        Severity::Warning => tracing::warn!(%facility, "{message}"),
        Severity::Error => tracing::error!(%facility, "{message}"),
    }
}
