//! Structured logging for the downloader.
//!
//! Terminal output plus an optional daily-rolling log file, both driven by `tracing`.

use std::path::Path;

use thiserror::Error;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::danbooru::config_loader::Logging;

/// Error types for logging
#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Logging error: {0}")]
    Logging(String),
}

/// Result type for logging operations
pub type LoggerResult<T> = Result<T, LoggerError>;

/// Name of the rolling log file inside the log directory.
pub const LOG_FILE_NAME: &str = "danbooru_downloader.log";

/// Installs the global subscriber.
///
/// The returned guard must be held for the life of the process, otherwise buffered
/// file output is lost.
pub fn init_logger(logging: &Logging, log_dir: &Path) -> LoggerResult<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.log_level))
        .map_err(|e| LoggerError::Logging(e.to_string()))?;

    let terminal_layer = fmt::layer().with_target(false).compact();

    let (file_layer, guard) = if logging.log_to_file {
        std::fs::create_dir_all(log_dir)?;

        let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, LOG_FILE_NAME);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let layer = match logging.log_format.as_str() {
            "json" => fmt::layer().json().with_ansi(false).with_writer(non_blocking).boxed(),
            _ => fmt::layer().with_ansi(false).with_writer(non_blocking).boxed(),
        };

        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(terminal_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| LoggerError::Logging(e.to_string()))?;

    info!(
        log_format = %logging.log_format,
        log_level = %logging.log_level,
        log_to_file = logging.log_to_file,
        "Logger initialized"
    );

    Ok(guard)
}
