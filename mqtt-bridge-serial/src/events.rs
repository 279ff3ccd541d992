//! Events reported by the bridge to its consumers.
//!
//! The orchestrator talks to the outside world only through [`EventSink`].
//! Implementations must return quickly: they are called from the poll loop's
//! message callback. [`ChannelSink`] hands every call to an unbounded queue so
//! a presentation layer can drain it on its own schedule; [`TracingSink`]
//! writes events to the structured log.

use std::fmt;

use chrono::{DateTime, Local};
use scalebridge_common::format_timestamp;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::framer::Message;

/// Which side of the bridge a connection state belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Device,
    Broker,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Device => write!(f, "device"),
            Endpoint::Broker => write!(f, "broker"),
        }
    }
}

/// Connection state of one [`Endpoint`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Receiver of bridge events.
pub trait EventSink: Send + Sync {
    /// A reading arrived from the device at `at`.
    fn on_message(&self, message: &Message, at: DateTime<Local>);

    /// Human-readable progress or status text.
    fn on_status(&self, text: &str);

    /// Human-readable error text, including the failed operation.
    fn on_error(&self, text: &str);

    fn on_connection_change(&self, endpoint: Endpoint, state: &ConnectionState);
}

/// A single [`EventSink`] call as a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    Message {
        message: Message,
        at: DateTime<Local>,
    },
    Status(String),
    Error(String),
    ConnectionChanged {
        endpoint: Endpoint,
        state: ConnectionState,
    },
}

impl BridgeEvent {
    /// Replay this event into `sink`.
    pub fn dispatch(&self, sink: &dyn EventSink) {
        match self {
            BridgeEvent::Message { message, at } => sink.on_message(message, *at),
            BridgeEvent::Status(text) => sink.on_status(text),
            BridgeEvent::Error(text) => sink.on_error(text),
            BridgeEvent::ConnectionChanged { endpoint, state } => {
                sink.on_connection_change(*endpoint, state)
            }
        }
    }
}

/// [`EventSink`] that queues events on an unbounded channel.
///
/// Sending never blocks. Events sent after the receiver is dropped are
/// discarded.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<BridgeEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiver that drains it.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BridgeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: BridgeEvent) {
        // A closed receiver means nobody is listening any more.
        let _ = self.tx.send(event);
    }
}

impl EventSink for ChannelSink {
    fn on_message(&self, message: &Message, at: DateTime<Local>) {
        self.send(BridgeEvent::Message {
            message: message.clone(),
            at,
        });
    }

    fn on_status(&self, text: &str) {
        self.send(BridgeEvent::Status(text.to_string()));
    }

    fn on_error(&self, text: &str) {
        self.send(BridgeEvent::Error(text.to_string()));
    }

    fn on_connection_change(&self, endpoint: Endpoint, state: &ConnectionState) {
        self.send(BridgeEvent::ConnectionChanged {
            endpoint,
            state: state.clone(),
        });
    }
}

/// [`EventSink`] that writes every event to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn on_message(&self, message: &Message, at: DateTime<Local>) {
        info!(
            timestamp = %format_timestamp(&at),
            weight = %message,
            "Reading received"
        );
    }

    fn on_status(&self, text: &str) {
        info!("{}", text);
    }

    fn on_error(&self, text: &str) {
        error!("{}", text);
    }

    fn on_connection_change(&self, endpoint: Endpoint, state: &ConnectionState) {
        info!(endpoint = %endpoint, state = %state, "Connection state changed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl EventSink for Recorder {
        fn on_message(&self, message: &Message, _at: DateTime<Local>) {
            self.0.lock().unwrap().push(format!("message {}", message));
        }
        fn on_status(&self, text: &str) {
            self.0.lock().unwrap().push(format!("status {}", text));
        }
        fn on_error(&self, text: &str) {
            self.0.lock().unwrap().push(format!("error {}", text));
        }
        fn on_connection_change(&self, endpoint: Endpoint, state: &ConnectionState) {
            self.0
                .lock()
                .unwrap()
                .push(format!("{} {}", endpoint, state));
        }
    }

    #[test]
    fn test_channel_sink_preserves_order() {
        let (sink, mut rx) = ChannelSink::new();
        let message = Message::new("12.5 kg").unwrap();
        let at = Local::now();

        sink.on_status("Monitoring started");
        sink.on_message(&message, at);
        sink.on_connection_change(Endpoint::Broker, &ConnectionState::Connected);
        sink.on_error("Failed to publish");

        assert_eq!(
            rx.try_recv().unwrap(),
            BridgeEvent::Status("Monitoring started".to_string())
        );
        assert_eq!(rx.try_recv().unwrap(), BridgeEvent::Message { message, at });
        assert_eq!(
            rx.try_recv().unwrap(),
            BridgeEvent::ConnectionChanged {
                endpoint: Endpoint::Broker,
                state: ConnectionState::Connected
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            BridgeEvent::Error("Failed to publish".to_string())
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_channel_sink_survives_closed_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.on_status("nobody listening");
    }

    #[test]
    fn test_dispatch_replays_into_sink() {
        let recorder = Recorder::default();
        let events = [
            BridgeEvent::Status("ready".to_string()),
            BridgeEvent::Message {
                message: Message::new("1.0").unwrap(),
                at: Local::now(),
            },
            BridgeEvent::ConnectionChanged {
                endpoint: Endpoint::Device,
                state: ConnectionState::Failed("busy".to_string()),
            },
            BridgeEvent::Error("oops".to_string()),
        ];

        for event in &events {
            event.dispatch(&recorder);
        }

        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![
                "status ready",
                "message 1.0",
                "device failed: busy",
                "error oops"
            ]
        );
    }
}
