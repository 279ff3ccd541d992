//! scalebridge Common Library
//!
//! This crate provides shared types and utilities for the scalebridge
//! serial-to-MQTT bridge:
//!
//! - [`reading`] - The published JSON envelope (`Reading`) and timestamp layout
//! - [`config`] - Configuration loading (JSON5 format) and logging settings
//! - [`error`] - Error types

pub mod config;
pub mod error;
pub mod reading;

// Re-export commonly used types at the crate root
pub use config::{LogFormat, LoggingConfig, load_config, parse_config};
pub use error::{Error, Result};
pub use reading::{Reading, TIMESTAMP_FORMAT, format_timestamp};

/// Guard that flushes the log file writer when dropped.
pub use tracing_appender::non_blocking::WorkerGuard;

/// Initialize tracing with the given configuration.
///
/// Supports two output formats:
/// - `LogFormat::Text` (default): Human-readable text format
/// - `LogFormat::Json`: Structured JSON format for log aggregation systems
///
/// When `config.directory` is set, events are also written to daily files
/// named `app.YYYY-MM-DD.log`, keeping the newest `retention_days` files.
/// The returned guard must be held until shutdown or buffered lines are lost.
///
/// # Example
///
/// ```ignore
/// use scalebridge_common::{LoggingConfig, LogFormat, init_tracing};
///
/// let config = LoggingConfig {
///     level: "info".to_string(),
///     format: LogFormat::Json,
///     ..Default::default()
/// };
/// let _guard = init_tracing(&config)?;
/// ```
pub fn init_tracing(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    use tracing_appender::rolling::{Builder, Rotation};
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let (file_writer, guard) = match &config.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = Builder::new()
                .rotation(Rotation::DAILY)
                .filename_prefix("app")
                .filename_suffix("log")
                .max_log_files(config.retention_days)
                .build(dir)
                .map_err(|e| Error::Config(format!("Failed to open log directory: {}", e)))?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(file_writer.map(|w| fmt::layer().with_writer(w).with_ansi(false)))
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(file_writer.map(|w| fmt::layer().json().with_writer(w)))
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
    }

    tracing::debug!(
        level = %config.level,
        directory = ?config.directory,
        "Tracing initialized"
    );
    Ok(guard)
}
