//! MQTT broker transport.
//!
//! [`BrokerTransport`] and [`BrokerConnection`] describe what the bridge
//! needs from an MQTT client: connect, publish, disconnect and a link-state
//! flag. [`MqttTransport`] implements them over `rumqttc`, whose event loop
//! reconnects on its own after the first successful session.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use rumqttc::QoS;

/// Port used when the broker address does not name one.
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Shortest keep-alive the MQTT client accepts.
pub const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// Delay between reconnection attempts after the link drops.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Capacity of the client's outgoing request queue.
const REQUEST_CAPACITY: usize = 64;

/// Errors raised by the broker side of the bridge.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Invalid broker address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("Failed to connect to broker: {0}")]
    Connect(String),
    #[error("Timed out connecting to broker after {0:?}")]
    Timeout(Duration),
    #[error("Failed to publish to {topic}: {message}")]
    Publish { topic: String, message: String },
}

/// Username and password passed through to the broker.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Where and how to publish: a snapshot taken at connect time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerTarget {
    /// Broker address, e.g. `tcp://broker.local:1883`.
    pub address: String,
    /// Topic every reading is published to.
    pub topic: String,
    pub credentials: Option<Credentials>,
}

impl BrokerTarget {
    pub fn new(address: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            topic: topic.into(),
            credentials: None,
        }
    }

    /// Attach credentials. A blank username means anonymous access and the
    /// credentials are ignored.
    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = if username.trim().is_empty() {
            None
        } else {
            Some(Credentials {
                username: username.to_string(),
                password: password.to_string(),
            })
        };
        self
    }
}

/// Link changes reported by a connection after it was established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The link dropped; the transport is trying to reconnect.
    Lost(String),
    /// The transport reconnected.
    Restored,
}

/// Callback receiving [`LinkEvent`]s from the transport's own task.
pub type LinkCallback = Arc<dyn Fn(LinkEvent) + Send + Sync>;

/// A live broker session.
pub trait BrokerConnection: Send + Sync + 'static {
    /// Queue `payload` for `topic`. Must not wait on the network.
    fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool)
    -> Result<(), BrokerError>;

    /// Whether the underlying link is currently up.
    fn is_connected(&self) -> bool;

    /// Close the session without waiting for outstanding publishes.
    fn disconnect(&self);
}

/// Factory for broker sessions.
pub trait BrokerTransport: Send + Sync + 'static {
    type Connection: BrokerConnection;

    /// Open a session to `target`.
    ///
    /// Resolves once the broker has accepted the session. `on_link` is only
    /// invoked after this returns `Ok`.
    fn connect(
        &self,
        target: &BrokerTarget,
        on_link: LinkCallback,
    ) -> impl Future<Output = Result<Self::Connection, BrokerError>> + Send;
}

/// Split a broker address into host and port.
///
/// Accepts `tcp://host:port`, `mqtt://host:port`, `host:port` and `host`;
/// IPv6 hosts must be bracketed when a port is given.
pub fn parse_broker_address(address: &str) -> Result<(String, u16), BrokerError> {
    let invalid = |reason: &str| BrokerError::InvalidAddress {
        address: address.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = address.trim();
    let rest = match trimmed.split_once("://") {
        Some(("tcp" | "mqtt", rest)) => rest,
        Some((scheme, _)) => return Err(invalid(&format!("unsupported scheme '{}'", scheme))),
        None => trimmed,
    };
    let rest = rest.trim_end_matches('/');

    let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
        let (host, tail) = bracketed
            .split_once(']')
            .ok_or_else(|| invalid("unterminated IPv6 literal"))?;
        match tail {
            "" => (host, None),
            _ => match tail.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None => return Err(invalid("unexpected text after IPv6 literal")),
            },
        }
    } else {
        match rest.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => (host, Some(port)),
            Some(_) => (rest, None),
            None => (rest, None),
        }
    };

    if host.is_empty() {
        return Err(invalid("missing host"));
    }

    let port = match port {
        Some(port) => port
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| invalid("port must be a number between 1 and 65535"))?,
        None => DEFAULT_MQTT_PORT,
    };

    Ok((host.to_string(), port))
}

/// Session options applied to every MQTT connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttSessionOptions {
    /// Client ids are `<prefix>_<8 hex digits>`.
    pub client_id_prefix: String,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
}

impl Default for MqttSessionOptions {
    fn default() -> Self {
        Self {
            client_id_prefix: "scalebridge".to_string(),
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Client id with a random suffix, fresh for every connection.
fn client_id(prefix: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}_{}", prefix, &suffix[..8])
}

/// [`BrokerTransport`] backed by `rumqttc`.
#[derive(Debug, Clone, Default)]
pub struct MqttTransport {
    options: MqttSessionOptions,
}

impl MqttTransport {
    pub fn new(options: MqttSessionOptions) -> Self {
        Self { options }
    }

    /// Build the client options for `target`.
    pub fn mqtt_options(&self, target: &BrokerTarget) -> Result<MqttOptions, BrokerError> {
        let (host, port) = parse_broker_address(&target.address)?;

        let mut options = MqttOptions::new(client_id(&self.options.client_id_prefix), host, port);
        options.set_clean_session(true);

        let mut keep_alive = self.options.keep_alive;
        if keep_alive < MIN_KEEP_ALIVE {
            warn!(
                requested = ?keep_alive,
                "MQTT keep-alive below {:?}, using the minimum",
                MIN_KEEP_ALIVE
            );
            keep_alive = MIN_KEEP_ALIVE;
        }
        options.set_keep_alive(keep_alive);

        if let Some(credentials) = &target.credentials {
            options.set_credentials(credentials.username.clone(), credentials.password.clone());
        }

        Ok(options)
    }
}

impl BrokerTransport for MqttTransport {
    type Connection = MqttConnection;

    fn connect(
        &self,
        target: &BrokerTarget,
        on_link: LinkCallback,
    ) -> impl Future<Output = Result<MqttConnection, BrokerError>> + Send {
        let prepared = self.mqtt_options(target);
        let connect_timeout = self.options.connect_timeout;
        let address = target.address.clone();

        async move {
            let options = prepared?;
            let client_id = options.client_id();
            let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

            info!(broker = %address, client_id = %client_id, "Connecting to MQTT broker");

            tokio::time::timeout(connect_timeout, wait_for_connack(&mut eventloop))
                .await
                .map_err(|_| BrokerError::Timeout(connect_timeout))??;

            let state = Arc::new(LinkState::default());
            state.connected.store(true, Ordering::SeqCst);

            tokio::spawn(drive_event_loop(
                eventloop,
                address,
                state.clone(),
                on_link,
            ));

            Ok(MqttConnection { client, state })
        }
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), BrokerError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(BrokerError::Connect(format!(
                        "broker refused connection: {:?}",
                        ack.code
                    )))
                };
            }
            Ok(_) => continue,
            Err(e) => return Err(BrokerError::Connect(e.to_string())),
        }
    }
}

#[derive(Debug, Default)]
struct LinkState {
    connected: AtomicBool,
    closing: AtomicBool,
    cancel: CancellationToken,
}

/// Keep the event loop turning so requests flow and reconnects happen.
async fn drive_event_loop(
    mut eventloop: EventLoop,
    address: String,
    state: Arc<LinkState>,
    on_link: LinkCallback,
) {
    loop {
        let event = tokio::select! {
            _ = state.cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                if !state.connected.swap(true, Ordering::SeqCst) {
                    info!(broker = %address, "MQTT connection restored");
                    on_link(LinkEvent::Restored);
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!(broker = %address, "MQTT disconnect sent");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if state.closing.load(Ordering::SeqCst) {
                    break;
                }
                if state.connected.swap(false, Ordering::SeqCst) {
                    warn!(broker = %address, error = %e, "MQTT connection lost");
                    on_link(LinkEvent::Lost(e.to_string()));
                }
                tokio::select! {
                    _ = state.cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
        }
    }

    state.connected.store(false, Ordering::SeqCst);
    debug!(broker = %address, "MQTT event loop stopped");
}

/// A `rumqttc` session.
pub struct MqttConnection {
    client: AsyncClient,
    state: Arc<LinkState>,
}

impl fmt::Debug for MqttConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttConnection")
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl BrokerConnection for MqttConnection {
    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), BrokerError> {
        self.client
            .try_publish(topic, qos, retain, payload)
            .map_err(|e| BrokerError::Publish {
                topic: topic.to_string(),
                message: e.to_string(),
            })
    }

    fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    fn disconnect(&self) {
        if self.state.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.connected.store(false, Ordering::SeqCst);
        if let Err(e) = self.client.try_disconnect() {
            debug!(error = %e, "Could not queue MQTT disconnect, dropping session");
            self.state.cancel.cancel();
        }
    }
}

impl Drop for MqttConnection {
    fn drop(&mut self) {
        if !self.state.closing.load(Ordering::SeqCst) {
            self.state.cancel.cancel();
        }
    }
}
