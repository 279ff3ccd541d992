use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format (default).
    #[default]
    Text,
    /// Structured JSON format.
    Json,
}

/// Common logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,

    /// Directory for daily log files. Console-only when unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Number of daily log files to keep.
    #[serde(default = "default_retention_days")]
    pub retention_days: usize,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_retention_days() -> usize {
    30
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            directory: None,
            retention_days: default_retention_days(),
        }
    }
}

impl LoggingConfig {
    /// Check the settings that cannot be expressed through serde defaults.
    pub fn validate(&self) -> Result<()> {
        if self.level.trim().is_empty() {
            return Err(Error::Config("Log level cannot be empty".to_string()));
        }
        if self.retention_days == 0 {
            return Err(Error::Config(
                "logging.retention_days must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load a configuration file in JSON5 format.
pub fn load_config<T: for<'de> Deserialize<'de>>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "Failed to read config file '{}': {}",
            path.display(),
            e
        ))
    })?;

    json5::from_str(&content).map_err(|e| {
        Error::Config(format!(
            "Failed to parse config file '{}': {}",
            path.display(),
            e
        ))
    })
}

/// Load a configuration from a JSON5 string.
pub fn parse_config<T: for<'de> Deserialize<'de>>(content: &str) -> Result<T> {
    json5::from_str(content).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct Wrapper {
        #[serde(default)]
        logging: LoggingConfig,
    }

    #[test]
    fn test_default_logging() {
        let config: Wrapper = parse_config("{}").unwrap();

        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Text);
        assert!(config.logging.directory.is_none());
        assert_eq!(config.logging.retention_days, 30);
    }

    #[test]
    fn test_json_logging_with_directory() {
        let json5 = r#"
        {
            logging: {
                level: "debug",
                format: "json",
                directory: "logs",
                retention_days: 7,
            },
        }
        "#;

        let config: Wrapper = parse_config(json5).unwrap();

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.directory, Some(PathBuf::from("logs")));
        assert_eq!(config.logging.retention_days, 7);
        config.logging.validate().unwrap();
    }

    #[test]
    fn test_zero_retention_rejected() {
        let config = LoggingConfig {
            retention_days: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_parse_error_is_config_error() {
        let result: Result<Wrapper> = parse_config("{ logging: ");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let result: Result<Wrapper> = load_config("/nonexistent/scalebridge.json5");
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Failed to read config file"));
    }
}
