//! Zenoh bridge for Modbus TCP energy meters.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

use zenoh_bridge_meter::{
    BusSink, BusWorker, ConnectionManager, DeviceConnector, HttpServer, MeterBridgeConfig,
    MetricsSink, ModbusTcpConnector, PollCycle, Poller, PublishFanout, ScalingEngine,
    SnapshotStore,
};

/// Cycles buffered for the bus worker before new ones are dropped.
const BUS_QUEUE: usize = 4;

/// How long to wait for tasks after a shutdown request.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Polls a Modbus TCP energy meter and publishes readings to Zenoh,
/// Prometheus and an HTTP snapshot API.
#[derive(Parser, Debug)]
#[command(name = "zenoh-bridge-meter")]
#[command(about = "Polls a Modbus TCP energy meter and publishes to Zenoh")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format); built-in defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Override the meter host.
    #[arg(long)]
    host: Option<String>,

    /// Override the meter port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => MeterBridgeConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => MeterBridgeConfig::default(),
    };

    if let Some(host) = args.host {
        config.device.host = host;
    }
    if let Some(port) = args.port {
        config.device.port = port;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.validate().context("Invalid configuration")?;

    metersight_common::init_tracing(&config.logging)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!("Starting zenoh-bridge-meter");
    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    let map = config.register_map()?;
    let listen_addr = config.http.listen_addr()?;

    let snapshots = Arc::new(SnapshotStore::new());
    let metrics = Arc::new(MetricsSink::new(&config.http.metrics_prefix, &map)?);
    let (bus_sink, bus_rx) = BusSink::channel(BUS_QUEUE);

    let fanout = PublishFanout::new()
        .with_sink(Arc::new(bus_sink))
        .with_sink(metrics.clone())
        .with_sink(snapshots.clone());

    let connector = ModbusTcpConnector::from_config(&config.device);
    let endpoint = connector.endpoint();
    let registers = map.len();

    let poller = Poller::new(
        PollCycle::new(map, ScalingEngine::standard(), config.device.address_offset),
        ConnectionManager::new(connector, config.device.reconnect_delay()),
        fanout,
        config.device.poll_interval(),
    );
    let bus_worker = BusWorker::new(
        config.zenoh.clone(),
        config.publish.clone(),
        endpoint.clone(),
        registers,
        bus_rx,
    );
    let http_server = HttpServer::new(
        snapshots,
        metrics,
        listen_addr,
        config.http.metrics_path.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let bus_shutdown = shutdown_rx.clone();
    let bus_task = tokio::spawn(async move {
        if let Err(e) = bus_worker.run(bus_shutdown).await {
            error!("Bus publisher error: {}", e);
        }
    });

    let http_shutdown = shutdown_rx.clone();
    let http_task = tokio::spawn(async move {
        if let Err(e) = http_server.run(http_shutdown).await {
            error!("HTTP server error: {}", e);
        }
    });

    let poller_task = tokio::spawn(poller.run(shutdown_rx));

    info!(
        device = %endpoint,
        registers,
        prefix = %config.publish.key_prefix,
        "Meter bridge running"
    );

    wait_for_signal().await;
    shutdown_tx.send(true)?;

    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        let _ = poller_task.await;
        let _ = bus_task.await;
        let _ = http_task.await;
    })
    .await;
    if drained.is_err() {
        warn!("Tasks did not stop within {:?}", SHUTDOWN_GRACE);
    }

    info!("Meter bridge stopped");
    Ok(())
}

async fn wait_for_signal() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate() => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Cannot install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
