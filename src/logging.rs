//! Logging setup for the finspect binary
//!
//! Console output plus a daily rolling log file. Library code only emits `tracing`
//! events; installing the subscriber is the binary's job.

use anyhow::{Context, Result};
use std::fs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

/// Flush guards for the non-blocking writers. Dropping them loses buffered log lines.
pub struct LogGuards {
    _console: WorkerGuard,
    _file: WorkerGuard,
}

pub fn init_logging(config: &LoggingConfig) -> Result<LogGuards> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .context("Invalid log filter")?;

    fs::create_dir_all(&config.directory).with_context(|| {
        format!(
            "Failed to create logs directory {}",
            config.directory.display()
        )
    })?;

    let file_appender = rolling::daily(&config.directory, "finspect.log");
    let (non_blocking_file, file_guard) = non_blocking(file_appender);
    let (non_blocking_console, console_guard) = non_blocking(std::io::stdout());

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking_console)
                .with_target(false)
                .with_ansi(true),
        )
        .with(
            fmt::layer()
                .with_writer(non_blocking_file)
                .with_target(true)
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(LogGuards {
        _console: console_guard,
        _file: file_guard,
    })
}
