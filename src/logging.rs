//! Tracing subscriber setup.
//!
//! `RUST_LOG` wins over the configured level. Output goes to stderr (pretty
//! or JSON) and, when `logging.directory` is set, also to a daily rolling
//! file through a non-blocking writer.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::LoggingSection;

pub const LOG_FILE_PREFIX: &str = "phasegate.log";

/// Keeps the file writer flushing. Hold it for the life of the process.
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// Map a configured level onto one `EnvFilter` understands.
pub fn normalise_level(level: &str) -> &'static str {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "info" => "info",
        "warn" | "warning" => "warn",
        "error" => "error",
        _ => "info",
    }
}

pub fn init(config: &LoggingSection, verbose: bool) -> Result<LoggingGuard> {
    let fallback = if verbose {
        "debug"
    } else {
        normalise_level(&config.level)
    };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_writer, guard) = if config.directory.trim().is_empty() {
        (None, None)
    } else {
        std::fs::create_dir_all(&config.directory)
            .with_context(|| format!("Failed to create log directory: {}", config.directory))?;
        let appender = tracing_appender::rolling::daily(&config.directory, LOG_FILE_PREFIX);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        (Some(writer), Some(guard))
    };

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(file_writer.map(|w| fmt::layer().json().with_ansi(false).with_writer(w)))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .with(file_writer.map(|w| fmt::layer().with_ansi(false).with_writer(w)))
            .try_init()
    };
    installed.context("Failed to install tracing subscriber")?;

    tracing::debug!(
        level = fallback,
        json = config.json,
        directory = %config.directory,
        "Logging initialized"
    );
    Ok(LoggingGuard { _file: guard })
}
