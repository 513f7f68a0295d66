//! Logging setup
//!
//! The terminal belongs to the UI, so logs go to a daily-rolling file in the
//! config directory instead of stderr.

use std::path::{Path, PathBuf};

use anyhow::Result;
use docchat_core::Config;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

const LOG_FILE_PREFIX: &str = "docchat.log";

/// Filter directives: `RUST_LOG` wins, then the configured level, then `info`.
pub fn filter_directives(env_value: Option<&str>, configured: Option<&str>) -> String {
    if let Some(directives) = env_value.map(str::trim).filter(|d| !d.is_empty()) {
        return directives.to_string();
    }
    let level = configured.map(str::trim).filter(|l| !l.is_empty()).unwrap_or("info");
    format!("warn,docchat_core={level},docchat_tui={level}")
}

pub fn log_dir() -> Result<PathBuf> {
    Ok(Config::config_dir()?.join("logs"))
}

/// Initialize file logging. Keep the returned guard alive until exit so
/// buffered lines get flushed.
pub fn init_logging(config: &Config) -> Result<WorkerGuard> {
    init_logging_in(&log_dir()?, config)
}

pub fn init_logging_in(dir: &Path, config: &Config) -> Result<WorkerGuard> {
    std::fs::create_dir_all(dir)?;

    let directives = filter_directives(
        std::env::var("RUST_LOG").ok().as_deref(),
        config.log_level.as_deref(),
    );
    let env_filter = EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new("info"));

    let file_appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(non_blocking)
        .with_ansi(false); // No colors in file

    Registry::default()
        .with(env_filter)
        .with(file_layer)
        .try_init()?;

    tracing::info!(filter = %directives, "logging initialized in {}", dir.display());
    Ok(guard)
}
