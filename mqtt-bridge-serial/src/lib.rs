//! Serial-to-MQTT bridge.
//!
//! This bridge polls a line-oriented serial device (typically a weighing
//! scale) and publishes every reading to an MQTT topic.
//!
//! # Pipeline
//!
//! ```text
//! device --\r\n--> DeviceReader --bytes--> Framer --Message--> BridgeOrchestrator
//!                                                                 |-> EventSink
//!                                                                 '-> MQTT topic
//! ```
//!
//! # Payload
//!
//! Each reading is published at QoS 1, not retained, as:
//!
//! ```text
//! {"timestamp":"2024-05-01 12:00:00","weight":"ST,GS,  12.50kg"}
//! ```

pub mod broker;
pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod framer;
pub mod orchestrator;
pub mod reader;

pub use broker::{
    BrokerConnection, BrokerError, BrokerTarget, BrokerTransport, Credentials, LinkCallback,
    LinkEvent, MqttSessionOptions, MqttTransport, QoS,
};
pub use config::{BridgeConfig, ConfigError};
pub use device::{DeviceError, DeviceTransport, SerialSettings, TokioSerialTransport};
pub use error::{BridgeError, Result};
pub use events::{BridgeEvent, ChannelSink, ConnectionState, Endpoint, EventSink, TracingSink};
pub use framer::{Framer, Message};
pub use orchestrator::{BridgeOrchestrator, CommandOutcome, SessionInfo};
pub use reader::{DeviceReader, ReaderOptions};
