//! Device polling loop.
//!
//! The scale does not push readings on its own; every cycle the reader
//! writes a poll request, waits a fixed settle interval for the answer, reads
//! whatever has arrived and feeds it through the [`Framer`].

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::device::{DeviceError, DeviceTransport, SerialSettings};
use crate::framer::{Framer, Message};

/// Bytes written to the device at the start of every poll cycle.
pub const POLL_REQUEST: &[u8; 2] = b"\r\n";

/// Wait between the poll request and the read.
pub const SETTLE_DELAY: Duration = Duration::from_millis(300);

/// Upper bound on a single read once the settle delay has passed.
pub const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Largest chunk taken from the device in one cycle.
pub const READ_BUFFER_SIZE: usize = 1024;

/// Poll cycle timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderOptions {
    pub settle: Duration,
    pub read_timeout: Duration,
    pub buffer_size: usize,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            settle: SETTLE_DELAY,
            read_timeout: READ_TIMEOUT,
            buffer_size: READ_BUFFER_SIZE,
        }
    }
}

/// Handle to a running poll loop.
///
/// The loop runs on its own tokio task until [`DeviceReader::stop`] or
/// [`DeviceReader::shutdown`] is called, or the handle is dropped. The device
/// handle is owned by the task and closed when the loop exits.
#[derive(Debug)]
pub struct DeviceReader {
    port: String,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl DeviceReader {
    /// Open `port` through `transport` and start polling it.
    ///
    /// `on_message` is called for every framed message, in order.
    /// `on_error` is called for I/O failures within a cycle; the loop keeps
    /// going after reporting them.
    pub fn start<T, M, E>(
        transport: &T,
        port: &str,
        baud_rate: u32,
        options: ReaderOptions,
        on_message: M,
        on_error: E,
    ) -> Result<Self, DeviceError>
    where
        T: DeviceTransport,
        M: FnMut(Message) + Send + 'static,
        E: FnMut(DeviceError) + Send + 'static,
    {
        let settings = SerialSettings::new(baud_rate, options.read_timeout);
        let stream = transport.open(port, &settings)?;
        Ok(Self::spawn(stream, port, options, on_message, on_error))
    }

    /// Start polling an already open stream.
    pub fn spawn<P, M, E>(
        stream: P,
        port: &str,
        options: ReaderOptions,
        on_message: M,
        on_error: E,
    ) -> Self
    where
        P: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        M: FnMut(Message) + Send + 'static,
        E: FnMut(DeviceError) + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(poll_loop(
            stream,
            port.to_string(),
            options,
            cancel.clone(),
            on_message,
            on_error,
        ));

        Self {
            port: port.to_string(),
            cancel,
            task: Some(task),
        }
    }

    /// The port this reader polls.
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Whether the poll loop is still alive.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Signal the loop to exit. Returns immediately.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Signal the loop to exit and wait until it has released the device.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(port = %self.port, error = %e, "Poll loop ended abnormally");
            }
        }
    }
}

impl Drop for DeviceReader {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn poll_loop<P, M, E>(
    mut stream: P,
    port: String,
    options: ReaderOptions,
    cancel: CancellationToken,
    mut on_message: M,
    mut on_error: E,
) where
    P: AsyncRead + AsyncWrite + Unpin,
    M: FnMut(Message),
    E: FnMut(DeviceError),
{
    let mut framer = Framer::new();
    let mut buf = vec![0u8; options.buffer_size.max(1)];

    debug!(port = %port, settle_ms = options.settle.as_millis() as u64, "Poll loop started");

    while !cancel.is_cancelled() {
        match poll_once(&mut stream, &mut buf, &options, &cancel).await {
            Ok(Some(n)) => {
                if n > 0 {
                    trace!(port = %port, bytes = n, "Read from device");
                }
                for message in framer.feed(&buf[..n]) {
                    on_message(message);
                }
            }
            Ok(None) => break,
            Err(e) => {
                if cancel.is_cancelled() {
                    break;
                }
                on_error(e);
                // A dead device fails instantly; keep the cycle rate bounded.
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(options.settle) => {}
                }
            }
        }
    }

    debug!(port = %port, discarded = framer.pending(), "Poll loop stopped");
}

/// Run one request/settle/read cycle.
///
/// Returns `Ok(None)` if cancelled part way, otherwise the number of bytes
/// read into `buf` (zero when the device stayed silent).
async fn poll_once<P>(
    stream: &mut P,
    buf: &mut [u8],
    options: &ReaderOptions,
    cancel: &CancellationToken,
) -> Result<Option<usize>, DeviceError>
where
    P: AsyncRead + AsyncWrite + Unpin,
{
    let write = async {
        stream.write_all(POLL_REQUEST).await?;
        stream.flush().await
    };
    tokio::select! {
        _ = cancel.cancelled() => return Ok(None),
        result = write => result.map_err(DeviceError::Write)?,
    }

    tokio::select! {
        _ = cancel.cancelled() => return Ok(None),
        _ = tokio::time::sleep(options.settle) => {}
    }

    tokio::select! {
        _ = cancel.cancelled() => Ok(None),
        result = tokio::time::timeout(options.read_timeout, stream.read(buf)) => match result {
            Err(_) => Ok(Some(0)),
            Ok(Ok(0)) => Err(DeviceError::Closed),
            Ok(Ok(n)) => Ok(Some(n)),
            Ok(Err(e)) => Err(DeviceError::Read(e)),
        },
    }
}
