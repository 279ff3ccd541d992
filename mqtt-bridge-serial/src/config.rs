//! Configuration for the serial-to-MQTT bridge.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use scalebridge_common::LoggingConfig;

use crate::broker::{BrokerTarget, MIN_KEEP_ALIVE, MqttSessionOptions};
use crate::orchestrator::DEFAULT_BAUD_RATE;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] scalebridge_common::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Serial device settings
    #[serde(default)]
    pub serial: SerialConfig,

    /// Broker settings; the bridge monitors without publishing when absent
    #[serde(default)]
    pub mqtt: Option<MqttConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Serial device configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0" or "COM3")
    #[serde(default)]
    pub port: Option<String>,

    /// Baud rate (default: 9600)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: default_baud_rate(),
        }
    }
}

/// MQTT broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker address (e.g., "tcp://localhost:1883")
    pub broker: String,

    /// Topic readings are published to (default: "sensor/weight")
    #[serde(default = "default_topic")]
    pub topic: String,

    /// Username; leave empty for anonymous access
    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Client id prefix; a random suffix is appended per connection
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,

    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_topic() -> String {
    "sensor/weight".to_string()
}

fn default_client_id_prefix() -> String {
    "scalebridge".to_string()
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl MqttConfig {
    /// Broker target for a connect command.
    pub fn target(&self) -> BrokerTarget {
        BrokerTarget::new(&self.broker, &self.topic).with_credentials(&self.username, &self.password)
    }

    /// Session options for the MQTT transport.
    pub fn session_options(&self) -> MqttSessionOptions {
        MqttSessionOptions {
            client_id_prefix: self.client_id_prefix.clone(),
            keep_alive: Duration::from_secs(self.keep_alive_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: BridgeConfig = scalebridge_common::load_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.serial.baud_rate == 0 {
            return Err(ConfigError::Validation(
                "serial.baud_rate must be greater than 0".to_string(),
            ));
        }

        if let Some(mqtt) = &self.mqtt {
            if mqtt.broker.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "mqtt.broker cannot be empty".to_string(),
                ));
            }

            if mqtt.topic.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "mqtt.topic cannot be empty".to_string(),
                ));
            }

            if mqtt.keep_alive_secs < MIN_KEEP_ALIVE.as_secs() {
                return Err(ConfigError::Validation(format!(
                    "mqtt.keep_alive_secs must be at least {}",
                    MIN_KEEP_ALIVE.as_secs()
                )));
            }

            if mqtt.connect_timeout_secs == 0 {
                return Err(ConfigError::Validation(
                    "mqtt.connect_timeout_secs must be greater than 0".to_string(),
                ));
            }
        }

        self.logging
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scalebridge_common::{LogFormat, parse_config};

    #[test]
    fn test_parse_minimal_config() {
        let json = r#"{
            serial: { port: "/dev/ttyUSB0" }
        }"#;

        let config: BridgeConfig = parse_config(json).unwrap();
        config.validate().unwrap();

        assert_eq!(config.serial.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(config.serial.baud_rate, 9600); // default
        assert!(config.mqtt.is_none());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_full_config() {
        let json = r#"{
            // Scale on the bench
            serial: { port: "COM3", baud_rate: 19200 },
            mqtt: {
                broker: "tcp://18.219.121.50:1883",
                topic: "plant/line1/weight",
                username: "scale",
                password: "secret",
                keep_alive_secs: 30,
            },
            logging: { level: "debug", format: "json", directory: "logs" },
        }"#;

        let config: BridgeConfig = parse_config(json).unwrap();
        config.validate().unwrap();

        assert_eq!(config.serial.baud_rate, 19200);
        assert_eq!(config.logging.format, LogFormat::Json);

        let mqtt = config.mqtt.unwrap();
        assert_eq!(mqtt.client_id_prefix, "scalebridge"); // default
        assert_eq!(mqtt.connect_timeout_secs, 10); // default

        let target = mqtt.target();
        assert_eq!(target.address, "tcp://18.219.121.50:1883");
        assert_eq!(target.topic, "plant/line1/weight");
        assert_eq!(target.credentials.unwrap().username, "scale");

        let options = mqtt.session_options();
        assert_eq!(options.keep_alive, Duration::from_secs(30));
        assert_eq!(options.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_default_topic_and_anonymous() {
        let json = r#"{
            serial: {},
            mqtt: { broker: "localhost" }
        }"#;

        let config: BridgeConfig = parse_config(json).unwrap();
        let mqtt = config.mqtt.unwrap();
        assert_eq!(mqtt.topic, "sensor/weight");
        assert!(mqtt.target().credentials.is_none());
    }

    #[test]
    fn test_validate_zero_baud_rate() {
        let json = r#"{ serial: { baud_rate: 0 } }"#;
        let config: BridgeConfig = parse_config(json).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_mqtt_settings() {
        let cases = [
            r#"{ serial: {}, mqtt: { broker: "", } }"#,
            r#"{ serial: {}, mqtt: { broker: "localhost", topic: " " } }"#,
            r#"{ serial: {}, mqtt: { broker: "localhost", keep_alive_secs: 2 } }"#,
            r#"{ serial: {}, mqtt: { broker: "localhost", connect_timeout_secs: 0 } }"#,
        ];

        for json in cases {
            let config: BridgeConfig = parse_config(json).unwrap();
            assert!(
                matches!(config.validate(), Err(ConfigError::Validation(_))),
                "config: {}",
                json
            );
        }
    }

    #[test]
    fn test_validate_logging() {
        let json = r#"{ serial: {}, logging: { retention_days: 0 } }"#;
        let config: BridgeConfig = parse_config(json).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_load_from_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{
                serial: {{ port: "COM3" }},
                mqtt: {{ broker: "tcp://localhost:1883" }},
            }}"#
        )
        .unwrap();

        let config = BridgeConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.serial.port.as_deref(), Some("COM3"));
        assert_eq!(config.mqtt.unwrap().keep_alive_secs, 60);
    }

    #[test]
    fn test_load_missing_file() {
        let err = BridgeConfig::load_from_file("/nonexistent/scalebridge.json5").unwrap_err();
        assert!(matches!(err, ConfigError::Load(_)));
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{ serial: {{ baud_rate: 0 }} }}"#).unwrap();
        let err = BridgeConfig::load_from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{ serial: ").unwrap();
        let err = BridgeConfig::load_from_file(file.path()).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Load(scalebridge_common::Error::Config(_))
        ));
        assert!(err.to_string().contains("Failed to parse config file"));
    }
}
