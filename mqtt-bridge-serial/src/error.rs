//! Error types for bridge commands.

use thiserror::Error;

use crate::broker::BrokerError;
use crate::device::DeviceError;

/// Result type for bridge commands.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Failure of a bridge command.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// No serial port was given to start monitoring.
    #[error("No serial port selected")]
    NoPortSelected,

    /// No broker address was given to connect to.
    #[error("No MQTT broker configured")]
    NoBrokerConfigured,

    #[error("MQTT topic cannot be empty")]
    EmptyTopic,

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}
