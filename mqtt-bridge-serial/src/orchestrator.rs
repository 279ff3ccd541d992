//! Bridge state machine.
//!
//! [`BridgeOrchestrator`] ties a [`DeviceReader`] to a broker connection. The
//! device side is either idle or monitoring one port; the broker side is
//! connected or not. The two are independent: monitoring runs whether or not
//! a broker is connected, and readings are published only while the broker
//! link is up.
//!
//! All state lives behind one lock shared by the command methods and the
//! callbacks of the poll loop and the broker transport. [`EventSink`] calls
//! are made while that lock is held so that consumers see events in the same
//! order as the state changes behind them; sinks must therefore return quickly
//! and must not call back into the orchestrator.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Local};
use scalebridge_common::Reading;
use tracing::{debug, trace};

use crate::broker::{
    BrokerConnection, BrokerError, BrokerTarget, BrokerTransport, LinkCallback, LinkEvent,
    MqttTransport, QoS,
};
use crate::device::{DeviceError, DeviceTransport, TokioSerialTransport};
use crate::error::{BridgeError, Result};
use crate::events::{ConnectionState, Endpoint, EventSink};
use crate::framer::Message;
use crate::reader::{DeviceReader, ReaderOptions};

/// Line speed used unless configured otherwise.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Result of a command that may already be in the requested state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The command changed the bridge state.
    Applied,
    /// The bridge was already in the requested state; nothing was done.
    Unchanged,
}

/// Bookkeeping for one monitoring session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionInfo {
    pub start_time: Option<DateTime<Local>>,
    pub stop_time: Option<DateTime<Local>>,
    /// Messages received from the device since the session started.
    pub message_count: u64,
}

struct ActiveBroker<C> {
    connection: C,
    topic: String,
}

struct Inner<C> {
    session: SessionInfo,
    /// Incremented on every start so callbacks of an old reader are ignored.
    session_id: u64,
    reader: Option<DeviceReader>,
    device_state: ConnectionState,
    broker_state: ConnectionState,
    broker: Option<ActiveBroker<C>>,
    /// Incremented on every connect and disconnect so link events and
    /// connect results from a superseded attempt are ignored.
    broker_generation: u64,
}

impl<C> Inner<C> {
    fn new() -> Self {
        Self {
            session: SessionInfo::default(),
            session_id: 0,
            reader: None,
            device_state: ConnectionState::Disconnected,
            broker_state: ConnectionState::Disconnected,
            broker: None,
            broker_generation: 0,
        }
    }

    fn set_state(&mut self, endpoint: Endpoint, state: ConnectionState, sink: &dyn EventSink) {
        let slot = match endpoint {
            Endpoint::Device => &mut self.device_state,
            Endpoint::Broker => &mut self.broker_state,
        };
        if *slot != state {
            *slot = state;
            sink.on_connection_change(endpoint, slot);
        }
    }
}

fn lock<C>(inner: &Mutex<Inner<C>>) -> MutexGuard<'_, Inner<C>> {
    // Sinks run under this lock; a panicking sink must not wedge the bridge.
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Coordinates device monitoring with broker publication.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use mqtt_bridge_serial::{BridgeOrchestrator, BrokerTarget, ChannelSink};
///
/// let (sink, mut events) = ChannelSink::new();
/// let bridge = BridgeOrchestrator::new(
///     TokioSerialTransport,
///     MqttTransport::default(),
///     Arc::new(sink),
/// );
///
/// bridge
///     .connect_broker(BrokerTarget::new("tcp://localhost:1883", "sensor/weight"))
///     .await?;
/// bridge.start_monitoring(Some("/dev/ttyUSB0"))?;
/// ```
pub struct BridgeOrchestrator<D = TokioSerialTransport, B = MqttTransport>
where
    D: DeviceTransport,
    B: BrokerTransport,
{
    device: D,
    broker: B,
    sink: Arc<dyn EventSink>,
    baud_rate: u32,
    options: ReaderOptions,
    inner: Arc<Mutex<Inner<B::Connection>>>,
}

impl<D, B> BridgeOrchestrator<D, B>
where
    D: DeviceTransport,
    B: BrokerTransport,
{
    /// Create an idle, disconnected bridge.
    pub fn new(device: D, broker: B, sink: Arc<dyn EventSink>) -> Self {
        Self {
            device,
            broker,
            sink,
            baud_rate: DEFAULT_BAUD_RATE,
            options: ReaderOptions::default(),
            inner: Arc::new(Mutex::new(Inner::new())),
        }
    }

    /// Set the line speed used by subsequent starts.
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Set the poll cycle timing used by subsequent starts.
    pub fn with_reader_options(mut self, options: ReaderOptions) -> Self {
        self.options = options;
        self
    }

    /// Serial ports currently present on the system.
    pub fn list_ports(&self) -> Result<Vec<String>> {
        self.device
            .list_ports()
            .map_err(|e| self.report("Failed to list serial ports", e.into()))
    }

    /// Open `port` and start polling it.
    ///
    /// Starts a fresh [`SessionInfo`]. Returns [`CommandOutcome::Unchanged`]
    /// if monitoring is already running.
    pub fn start_monitoring(&self, port: Option<&str>) -> Result<CommandOutcome> {
        let Some(port) = port.map(str::trim).filter(|p| !p.is_empty()) else {
            return Err(self.report("Failed to start monitoring", BridgeError::NoPortSelected));
        };

        let mut inner = lock(&self.inner);
        if let Some(reader) = &inner.reader {
            self.sink.on_status(&format!("Already monitoring {}", reader.port()));
            return Ok(CommandOutcome::Unchanged);
        }

        inner.set_state(Endpoint::Device, ConnectionState::Connecting, &*self.sink);

        let session_id = inner.session_id + 1;
        let started = DeviceReader::start(
            &self.device,
            port,
            self.baud_rate,
            self.options,
            message_handler(Arc::downgrade(&self.inner), self.sink.clone(), session_id),
            error_handler(self.sink.clone(), port.to_string()),
        );

        let reader = match started {
            Ok(reader) => reader,
            Err(e) => {
                inner.set_state(
                    Endpoint::Device,
                    ConnectionState::Failed(e.to_string()),
                    &*self.sink,
                );
                inner.set_state(Endpoint::Device, ConnectionState::Disconnected, &*self.sink);
                drop(inner);
                return Err(self.report("Failed to start monitoring", e.into()));
            }
        };

        let mut start_time = Local::now();
        if let Some(previous) = inner.session.start_time {
            if start_time <= previous {
                start_time = previous + chrono::Duration::nanoseconds(1);
            }
        }

        inner.session_id = session_id;
        inner.session = SessionInfo {
            start_time: Some(start_time),
            stop_time: None,
            message_count: 0,
        };
        inner.reader = Some(reader);
        inner.set_state(Endpoint::Device, ConnectionState::Connected, &*self.sink);
        self.sink.on_status(&format!("Monitoring started on {}", port));

        debug!(port = %port, session = session_id, baud_rate = self.baud_rate, "Session started");
        Ok(CommandOutcome::Applied)
    }

    /// Stop polling and release the device.
    ///
    /// Records the stop time and keeps the final message count. Returns once
    /// the poll loop has exited.
    pub async fn stop_monitoring(&self) -> CommandOutcome {
        let reader = {
            let mut inner = lock(&self.inner);
            let Some(reader) = inner.reader.take() else {
                self.sink.on_status("Monitoring is not running");
                return CommandOutcome::Unchanged;
            };
            reader.stop();

            inner.session.stop_time = Some(Local::now());
            inner.set_state(Endpoint::Device, ConnectionState::Disconnected, &*self.sink);
            self.sink.on_status(&format!(
                "Monitoring stopped. Total messages: {}",
                inner.session.message_count
            ));
            reader
        };

        let port = reader.port().to_string();
        reader.shutdown().await;
        debug!(port = %port, "Device released");
        CommandOutcome::Applied
    }

    /// Connect to the broker described by `target`.
    ///
    /// Returns [`CommandOutcome::Unchanged`] if a connection is already up or
    /// being established. On failure the broker state returns to
    /// disconnected; there is no retry.
    pub async fn connect_broker(&self, target: BrokerTarget) -> Result<CommandOutcome> {
        const CONTEXT: &str = "Failed to connect to MQTT broker";

        if target.address.trim().is_empty() {
            return Err(self.report(CONTEXT, BridgeError::NoBrokerConfigured));
        }
        if target.topic.trim().is_empty() {
            return Err(self.report(CONTEXT, BridgeError::EmptyTopic));
        }

        let generation = {
            let mut inner = lock(&self.inner);
            if matches!(
                inner.broker_state,
                ConnectionState::Connected | ConnectionState::Connecting
            ) {
                self.sink.on_status("Already connected to MQTT broker");
                return Ok(CommandOutcome::Unchanged);
            }
            inner.broker_generation += 1;
            inner.set_state(Endpoint::Broker, ConnectionState::Connecting, &*self.sink);
            inner.broker_generation
        };

        let result = self
            .broker
            .connect(&target, self.link_handler(generation))
            .await;

        let mut inner = lock(&self.inner);
        if inner.broker_generation != generation {
            // Disconnected or superseded while the attempt was in flight.
            if let Ok(connection) = &result {
                connection.disconnect();
            }
            drop(inner);
            let cancelled = BrokerError::Connect("connection attempt cancelled".to_string());
            return Err(self.report(CONTEXT, cancelled.into()));
        }

        match result {
            Ok(connection) => {
                let state = if connection.is_connected() {
                    ConnectionState::Connected
                } else {
                    ConnectionState::Connecting
                };
                inner.broker = Some(ActiveBroker {
                    connection,
                    topic: target.topic.clone(),
                });
                let status = if state.is_connected() {
                    "Connected to MQTT broker"
                } else {
                    "MQTT session opened, waiting for the link to come back"
                };
                inner.set_state(Endpoint::Broker, state, &*self.sink);
                self.sink.on_status(status);

                debug!(broker = %target.address, topic = %target.topic, "Broker session installed");
                Ok(CommandOutcome::Applied)
            }
            Err(e) => {
                inner.set_state(
                    Endpoint::Broker,
                    ConnectionState::Failed(e.to_string()),
                    &*self.sink,
                );
                inner.set_state(Endpoint::Broker, ConnectionState::Disconnected, &*self.sink);
                drop(inner);
                Err(self.report(CONTEXT, e.into()))
            }
        }
    }

    /// Drop the broker connection. Monitoring continues without publishing.
    ///
    /// Does not wait for the broker to acknowledge.
    pub fn disconnect_broker(&self) -> CommandOutcome {
        let mut inner = lock(&self.inner);
        if inner.broker_state == ConnectionState::Disconnected {
            self.sink.on_status("Not connected to MQTT broker");
            return CommandOutcome::Unchanged;
        }

        inner.broker_generation += 1;
        if let Some(active) = inner.broker.take() {
            active.connection.disconnect();
        }
        inner.set_state(Endpoint::Broker, ConnectionState::Disconnected, &*self.sink);
        self.sink.on_status("Disconnected from MQTT broker");
        CommandOutcome::Applied
    }

    /// Stop monitoring and disconnect the broker, whichever are active.
    pub async fn shutdown(&self) {
        if self.is_monitoring() {
            self.stop_monitoring().await;
        }
        if self.broker_state() != ConnectionState::Disconnected {
            self.disconnect_broker();
        }
    }

    /// Snapshot of the current or most recent session.
    pub fn session(&self) -> SessionInfo {
        lock(&self.inner).session.clone()
    }

    pub fn device_state(&self) -> ConnectionState {
        lock(&self.inner).device_state.clone()
    }

    pub fn broker_state(&self) -> ConnectionState {
        lock(&self.inner).broker_state.clone()
    }

    pub fn is_monitoring(&self) -> bool {
        lock(&self.inner).reader.is_some()
    }

    /// Port being monitored, if any.
    pub fn monitored_port(&self) -> Option<String> {
        lock(&self.inner)
            .reader
            .as_ref()
            .map(|reader| reader.port().to_string())
    }

    fn report(&self, context: &str, error: BridgeError) -> BridgeError {
        self.sink.on_error(&format!("{}: {}", context, error));
        error
    }

    fn link_handler(&self, generation: u64) -> LinkCallback {
        let inner: Weak<Mutex<Inner<B::Connection>>> = Arc::downgrade(&self.inner);
        let sink = self.sink.clone();

        Arc::new(move |event: LinkEvent| {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let mut inner = lock(&inner);
            if inner.broker_generation != generation {
                return;
            }

            match event {
                LinkEvent::Lost(reason) => {
                    if inner.broker_state.is_connected() {
                        inner.set_state(Endpoint::Broker, ConnectionState::Connecting, &*sink);
                        sink.on_error(&format!("MQTT connection lost: {}", reason));
                    }
                }
                LinkEvent::Restored => {
                    if inner.broker_state == ConnectionState::Connecting && inner.broker.is_some()
                    {
                        inner.set_state(Endpoint::Broker, ConnectionState::Connected, &*sink);
                        sink.on_status("MQTT connection restored");
                    }
                }
            }
        })
    }
}

fn message_handler<C: BrokerConnection>(
    inner: Weak<Mutex<Inner<C>>>,
    sink: Arc<dyn EventSink>,
    session_id: u64,
) -> impl FnMut(Message) + Send + 'static {
    move |message: Message| {
        let at = Local::now();
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let mut inner = lock(&inner);
        if inner.session_id != session_id || inner.reader.is_none() {
            return;
        }

        inner.session.message_count += 1;
        sink.on_message(&message, at);

        if !inner.broker_state.is_connected() {
            trace!(weight = %message, "Broker not connected, skipping publish");
            return;
        }
        if let Some(active) = &inner.broker {
            publish_reading(active, &message, &at, &*sink);
        }
    }
}

fn error_handler(
    sink: Arc<dyn EventSink>,
    port: String,
) -> impl FnMut(DeviceError) + Send + 'static {
    move |error: DeviceError| sink.on_error(&format!("Read error on {}: {}", port, error))
}

fn publish_reading<C: BrokerConnection>(
    active: &ActiveBroker<C>,
    message: &Message,
    at: &DateTime<Local>,
    sink: &dyn EventSink,
) {
    let payload = match Reading::new(at, message.as_str()).to_payload() {
        Ok(payload) => payload,
        Err(e) => {
            sink.on_error(&format!("Failed to encode reading: {}", e));
            return;
        }
    };

    match active
        .connection
        .publish(&active.topic, payload, QoS::AtLeastOnce, false)
    {
        Ok(()) => debug!(topic = %active.topic, weight = %message, "Published reading"),
        Err(e) => sink.on_error(&format!("Failed to publish to MQTT: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SerialSettings;
    use crate::events::{BridgeEvent, ChannelSink};
    use std::future::Future;
    use tokio::io::DuplexStream;

    /// Device transport that must never be touched.
    struct NoDevice;

    impl DeviceTransport for NoDevice {
        type Port = DuplexStream;

        fn list_ports(&self) -> std::result::Result<Vec<String>, DeviceError> {
            Ok(vec!["COM1".to_string(), "COM3".to_string()])
        }

        fn open(
            &self,
            port: &str,
            _settings: &SerialSettings,
        ) -> std::result::Result<DuplexStream, DeviceError> {
            Err(DeviceError::Open {
                port: port.to_string(),
                reason: "Access is denied".to_string(),
            })
        }
    }

    struct NoConnection;

    impl BrokerConnection for NoConnection {
        fn publish(
            &self,
            _topic: &str,
            _payload: Vec<u8>,
            _qos: QoS,
            _retain: bool,
        ) -> std::result::Result<(), BrokerError> {
            unreachable!()
        }

        fn is_connected(&self) -> bool {
            false
        }

        fn disconnect(&self) {}
    }

    /// Broker transport that refuses every connection.
    struct RefusingBroker;

    impl BrokerTransport for RefusingBroker {
        type Connection = NoConnection;

        fn connect(
            &self,
            _target: &BrokerTarget,
            _on_link: LinkCallback,
        ) -> impl Future<Output = std::result::Result<NoConnection, BrokerError>> + Send {
            async { Err(BrokerError::Connect("connection refused".to_string())) }
        }
    }

    fn bridge() -> (
        BridgeOrchestrator<NoDevice, RefusingBroker>,
        tokio::sync::mpsc::UnboundedReceiver<BridgeEvent>,
    ) {
        let (sink, rx) = ChannelSink::new();
        (
            BridgeOrchestrator::new(NoDevice, RefusingBroker, Arc::new(sink)),
            rx,
        )
    }

    fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<BridgeEvent>) -> Vec<BridgeEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_start_without_port() {
        let (bridge, mut rx) = bridge();

        for port in [None, Some(""), Some("   ")] {
            let err = bridge.start_monitoring(port).unwrap_err();
            assert!(matches!(err, BridgeError::NoPortSelected));
        }

        assert_eq!(bridge.device_state(), ConnectionState::Disconnected);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| matches!(
            e,
            BridgeEvent::Error(text) if text == "Failed to start monitoring: No serial port selected"
        )));
    }

    #[test]
    fn test_open_failure_leaves_bridge_idle() {
        let (bridge, mut rx) = bridge();

        let err = bridge.start_monitoring(Some("COM3")).unwrap_err();
        assert!(matches!(err, BridgeError::Device(DeviceError::Open { .. })));
        assert!(!bridge.is_monitoring());
        assert_eq!(bridge.session(), SessionInfo::default());

        let events = drain(&mut rx);
        assert_eq!(
            events[..3],
            [
                BridgeEvent::ConnectionChanged {
                    endpoint: Endpoint::Device,
                    state: ConnectionState::Connecting,
                },
                BridgeEvent::ConnectionChanged {
                    endpoint: Endpoint::Device,
                    state: ConnectionState::Failed(
                        "Failed to open port COM3: Access is denied".to_string()
                    ),
                },
                BridgeEvent::ConnectionChanged {
                    endpoint: Endpoint::Device,
                    state: ConnectionState::Disconnected,
                },
            ]
        );
        assert_eq!(
            events[3],
            BridgeEvent::Error(
                "Failed to start monitoring: Failed to open port COM3: Access is denied"
                    .to_string()
            )
        );
    }

    #[tokio::test]
    async fn test_connect_validates_before_io() {
        let (bridge, _rx) = bridge();

        let err = bridge
            .connect_broker(BrokerTarget::new("  ", "sensor/weight"))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::NoBrokerConfigured));

        let err = bridge
            .connect_broker(BrokerTarget::new("tcp://localhost:1883", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::EmptyTopic));

        assert_eq!(bridge.broker_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_failure_returns_to_disconnected() {
        let (bridge, mut rx) = bridge();

        let err = bridge
            .connect_broker(BrokerTarget::new("tcp://localhost:1883", "sensor/weight"))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Broker(BrokerError::Connect(_))));
        assert_eq!(bridge.broker_state(), ConnectionState::Disconnected);

        let states: Vec<ConnectionState> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                BridgeEvent::ConnectionChanged { state, .. } => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Failed(
                    "Failed to connect to broker: connection refused".to_string()
                ),
                ConnectionState::Disconnected,
            ]
        );
    }

    #[tokio::test]
    async fn test_idle_commands_are_benign() {
        let (bridge, mut rx) = bridge();

        assert_eq!(bridge.stop_monitoring().await, CommandOutcome::Unchanged);
        assert_eq!(bridge.disconnect_broker(), CommandOutcome::Unchanged);
        bridge.shutdown().await;

        assert_eq!(
            drain(&mut rx),
            vec![
                BridgeEvent::Status("Monitoring is not running".to_string()),
                BridgeEvent::Status("Not connected to MQTT broker".to_string()),
            ]
        );
    }

    #[test]
    fn test_list_ports_delegates_to_transport() {
        let (bridge, _rx) = bridge();
        assert_eq!(bridge.list_ports().unwrap(), vec!["COM1", "COM3"]);
    }
}
