//! Serial-to-MQTT bridge.
//!
//! Polls a serial device (e.g. a weighing scale) and publishes each reading
//! to an MQTT topic until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, info, warn};

use mqtt_bridge_serial::{
    BridgeConfig, BridgeEvent, BridgeOrchestrator, ChannelSink, DeviceTransport, MqttTransport,
    TokioSerialTransport, TracingSink,
};

/// Upper bound on waiting for queued events to be written at exit.
const RENDERER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Serial device to MQTT bridge.
#[derive(Parser, Debug)]
#[command(name = "mqtt-bridge-serial")]
#[command(about = "Polls a serial device and publishes readings to MQTT")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long, default_value = "scalebridge.json5")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Serial port to monitor, overriding the configuration.
    #[arg(short, long)]
    port: Option<String>,

    /// List available serial ports and exit.
    #[arg(long)]
    list_ports: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.list_ports {
        let ports = TokioSerialTransport
            .list_ports()
            .context("Failed to list serial ports")?;
        if ports.is_empty() {
            println!("No serial ports found");
        }
        for port in ports {
            println!("{}", port);
        }
        return Ok(());
    }

    // Load configuration
    let config = BridgeConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    // Initialize logging
    let mut log_config = config.logging.clone();
    if let Some(level) = &args.log_level {
        log_config.level = level.clone();
    }
    let _log_guard = scalebridge_common::init_tracing(&log_config)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!("Starting mqtt-bridge-serial");
    info!("Loaded configuration from {:?}", args.config);

    let broker = config
        .mqtt
        .as_ref()
        .map(|mqtt| MqttTransport::new(mqtt.session_options()))
        .unwrap_or_default();

    let (sink, events) = ChannelSink::new();
    let renderer = tokio::spawn(render_events(events));

    let bridge = BridgeOrchestrator::new(TokioSerialTransport, broker, Arc::new(sink))
        .with_baud_rate(config.serial.baud_rate);

    // Connect to the broker first so the first readings are published
    match &config.mqtt {
        Some(mqtt) => {
            if let Err(e) = bridge.connect_broker(mqtt.target()).await {
                warn!("Continuing without publishing: {}", e);
            }
        }
        None => info!("No MQTT broker configured, readings will not be published"),
    }

    let port = args.port.as_deref().or(config.serial.port.as_deref());
    if let Err(e) = bridge.start_monitoring(port) {
        bridge.shutdown().await;
        drop(bridge);
        let _ = tokio::time::timeout(RENDERER_DRAIN_TIMEOUT, renderer).await;
        return Err(e).context("Failed to start monitoring");
    }

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    bridge.shutdown().await;

    let session = bridge.session();
    info!(messages = session.message_count, "Serial bridge stopped");

    // Dropping the bridge closes the event channel and ends the renderer
    drop(bridge);
    match tokio::time::timeout(RENDERER_DRAIN_TIMEOUT, renderer).await {
        Ok(Err(e)) => error!("Event renderer failed: {}", e),
        Err(_) => warn!("Timed out draining bridge events"),
        Ok(Ok(())) => {}
    }

    Ok(())
}

/// Write bridge events to the log until the channel closes.
async fn render_events(mut events: UnboundedReceiver<BridgeEvent>) {
    while let Some(event) = events.recv().await {
        event.dispatch(&TracingSink);
    }
}
