//! Serial device transport.
//!
//! [`DeviceTransport`] is the seam between the poll loop and the operating
//! system's serial ports. [`TokioSerialTransport`] is the production
//! implementation; tests substitute in-memory streams.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::{DataBits, FlowControl, Parity, SerialStream, StopBits};
use tracing::debug;

/// Errors raised by the device side of the bridge.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Failed to open port {port}: {reason}")]
    Open { port: String, reason: String },
    #[error("Failed to enumerate serial ports: {0}")]
    Enumerate(String),
    #[error("Failed to write poll request: {0}")]
    Write(#[source] std::io::Error),
    #[error("Failed to read from device: {0}")]
    Read(#[source] std::io::Error),
    #[error("Device closed the connection")]
    Closed,
}

/// Line settings used when opening a device.
///
/// Framing is always 8 data bits, no parity, 1 stop bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialSettings {
    /// Line speed in baud.
    pub baud_rate: u32,
    /// Driver-level read timeout.
    pub read_timeout: Duration,
}

impl SerialSettings {
    pub fn new(baud_rate: u32, read_timeout: Duration) -> Self {
        Self {
            baud_rate,
            read_timeout,
        }
    }
}

/// Access to serial devices.
pub trait DeviceTransport: Send + Sync + 'static {
    /// An open device handle. Closing is dropping.
    type Port: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Identifiers of the ports currently present on the system.
    fn list_ports(&self) -> Result<Vec<String>, DeviceError>;

    /// Open `port` with the given settings.
    fn open(&self, port: &str, settings: &SerialSettings) -> Result<Self::Port, DeviceError>;
}

/// [`DeviceTransport`] backed by `tokio-serial`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSerialTransport;

impl DeviceTransport for TokioSerialTransport {
    type Port = SerialStream;

    fn list_ports(&self) -> Result<Vec<String>, DeviceError> {
        let ports = tokio_serial::available_ports()
            .map_err(|e| DeviceError::Enumerate(e.to_string()))?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    fn open(&self, port: &str, settings: &SerialSettings) -> Result<Self::Port, DeviceError> {
        debug!(port = %port, baud_rate = settings.baud_rate, "Opening serial port");

        let builder = tokio_serial::new(port, settings.baud_rate)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::None)
            .flow_control(FlowControl::None)
            .timeout(settings.read_timeout);

        SerialStream::open(&builder).map_err(|e| DeviceError::Open {
            port: port.to_string(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_port_fails() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = rt.enter();

        let settings = SerialSettings::new(9600, Duration::from_millis(100));
        let err = TokioSerialTransport
            .open("/dev/scalebridge-does-not-exist", &settings)
            .unwrap_err();

        match err {
            DeviceError::Open { port, .. } => assert_eq!(port, "/dev/scalebridge-does-not-exist"),
            other => panic!("Expected open error, got {:?}", other),
        }
    }

    #[test]
    fn test_error_messages() {
        let err = DeviceError::Open {
            port: "COM3".to_string(),
            reason: "Access is denied".to_string(),
        };
        assert_eq!(err.to_string(), "Failed to open port COM3: Access is denied");
        assert_eq!(DeviceError::Closed.to_string(), "Device closed the connection");
    }
}
