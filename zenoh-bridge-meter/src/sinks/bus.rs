//! Message bus sink.
//!
//! The poller never touches the Zenoh session. [`BusSink`] hands cycles over a
//! bounded channel to a [`BusWorker`], which owns the session, reconnects it
//! with a fixed delay and publishes each cycle as one message per register
//! followed by the aggregate on `{prefix}/snapshot`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metersight_common::config::ZenohConfig;
use metersight_common::{Format, TopicBuilder, encode};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use zenoh::Session;
use zenoh::handlers::FifoChannelHandler;
use zenoh::key_expr::KeyExpr;
use zenoh::qos::{CongestionControl, Priority};
use zenoh::query::{Query, Queryable};

use crate::config::{BusPriority, CongestionMode, PublishConfig};
use crate::error::{BridgeError, Result};
use crate::fanout::Sink;
use crate::poller::wait_for_shutdown;
use crate::reading::{ConnectionStatus, CycleReport};

/// Name reported in status messages.
const BRIDGE_NAME: &str = "meter";

/// Work items for the bus worker.
#[derive(Debug, Clone)]
pub enum BusMessage {
    Cycle(Arc<CycleReport>),
    DeviceStatus(ConnectionStatus),
}

/// Fanout side of the bus: enqueues without waiting on the network.
#[derive(Debug, Clone)]
pub struct BusSink {
    tx: mpsc::Sender<BusMessage>,
}

impl BusSink {
    /// Create the sink and the receiver to hand to a [`BusWorker`].
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<BusMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    fn send(&self, message: BusMessage) -> Result<()> {
        self.tx.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => {
                BridgeError::sink("bus", "publisher is behind, message dropped")
            }
            TrySendError::Closed(_) => BridgeError::sink("bus", "publisher has stopped"),
        })
    }
}

#[async_trait]
impl Sink for BusSink {
    fn name(&self) -> &str {
        "bus"
    }

    async fn deliver(&self, report: &CycleReport) -> Result<()> {
        self.send(BusMessage::Cycle(Arc::new(report.clone())))
    }

    async fn status_changed(&self, status: &ConnectionStatus) -> Result<()> {
        self.send(BusMessage::DeviceStatus(status.clone()))
    }
}

/// Raw put on the message bus.
#[async_trait]
pub trait BusTransport: Send + Sync {
    async fn put(&self, key: &str, payload: Vec<u8>) -> Result<()>;
}

/// Zenoh-backed transport with fixed QoS.
#[derive(Debug, Clone)]
pub struct ZenohTransport {
    session: Arc<Session>,
    congestion_control: CongestionControl,
    priority: Priority,
    express: bool,
}

impl ZenohTransport {
    pub fn new(session: Arc<Session>, config: &PublishConfig) -> Self {
        Self {
            session,
            congestion_control: congestion_control(config.congestion_control),
            priority: priority(config.priority),
            express: config.express,
        }
    }
}

fn congestion_control(mode: CongestionMode) -> CongestionControl {
    match mode {
        CongestionMode::Drop => CongestionControl::Drop,
        CongestionMode::Block => CongestionControl::Block,
    }
}

fn priority(priority: BusPriority) -> Priority {
    match priority {
        BusPriority::RealTime => Priority::RealTime,
        BusPriority::InteractiveHigh => Priority::InteractiveHigh,
        BusPriority::InteractiveLow => Priority::InteractiveLow,
        BusPriority::DataHigh => Priority::DataHigh,
        BusPriority::Data => Priority::Data,
        BusPriority::DataLow => Priority::DataLow,
        BusPriority::Background => Priority::Background,
    }
}

#[async_trait]
impl BusTransport for ZenohTransport {
    async fn put(&self, key: &str, payload: Vec<u8>) -> Result<()> {
        self.session
            .put(key, payload)
            .congestion_control(self.congestion_control)
            .priority(self.priority)
            .express(self.express)
            .await
            .map_err(|e| BridgeError::Publish {
                key: key.to_string(),
                message: e.to_string(),
            })
    }
}

/// Statistics from a publish round.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishStats {
    pub success: usize,
    pub failed: usize,
}

/// Bridge status published on `{prefix}/@/status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeStatus {
    pub bridge: String,
    pub version: String,
    /// "running" or "offline".
    pub status: String,
    /// Device endpoint being polled.
    pub device: String,
    pub registers: usize,
    pub connection_status: String,
}

/// Encodes cycles and puts them on a [`BusTransport`].
pub struct BusPublisher<T: BusTransport> {
    transport: T,
    topics: TopicBuilder,
    format: Format,
    retained: Option<BTreeMap<String, Vec<u8>>>,
}

impl<T: BusTransport> BusPublisher<T> {
    /// With `retain`, the last payload of every key is kept for late joiners.
    pub fn new(transport: T, topics: TopicBuilder, format: Format, retain: bool) -> Self {
        Self {
            transport,
            topics,
            format,
            retained: retain.then(BTreeMap::new),
        }
    }

    pub fn topics(&self) -> &TopicBuilder {
        &self.topics
    }

    /// Last payload per key, when retention is on.
    pub fn retained(&self) -> Option<&BTreeMap<String, Vec<u8>>> {
        self.retained.as_ref()
    }

    /// Publish every reading, then the aggregate.
    pub async fn publish_cycle(&mut self, report: &CycleReport) -> PublishStats {
        let mut stats = PublishStats::default();

        for reading in &report.readings {
            let key = self.topics.register(&reading.name);
            match self.publish(key, &reading.message()).await {
                Ok(()) => stats.success += 1,
                Err(e) => {
                    stats.failed += 1;
                    warn!(register = %reading.name, error = %e, "Failed to publish reading");
                }
            }
        }

        let key = self.topics.snapshot();
        match self.publish(key, &report.snapshot_message()).await {
            Ok(()) => stats.success += 1,
            Err(e) => {
                stats.failed += 1;
                warn!(error = %e, "Failed to publish aggregate");
            }
        }

        debug!(success = stats.success, failed = stats.failed, "Cycle published");
        stats
    }

    /// Publish bridge status as JSON regardless of the payload format.
    pub async fn publish_status(&self, status: &BridgeStatus) -> Result<()> {
        let payload = serde_json::to_vec(status)?;
        self.transport.put(&self.topics.status(), payload).await
    }

    async fn publish<M: Serialize>(&mut self, key: String, message: &M) -> Result<()> {
        let payload =
            encode(message, self.format).map_err(|e| BridgeError::Serialization(e.to_string()))?;
        if let Some(retained) = &mut self.retained {
            retained.insert(key.clone(), payload.clone());
        }
        self.transport.put(&key, payload).await
    }
}

/// Owns the Zenoh session and drains the [`BusSink`] channel.
pub struct BusWorker {
    zenoh: ZenohConfig,
    publish: PublishConfig,
    device: String,
    registers: usize,
    rx: mpsc::Receiver<BusMessage>,
}

impl BusWorker {
    pub fn new(
        zenoh: ZenohConfig,
        publish: PublishConfig,
        device: String,
        registers: usize,
        rx: mpsc::Receiver<BusMessage>,
    ) -> Self {
        Self {
            zenoh,
            publish,
            device,
            registers,
            rx,
        }
    }

    /// Connect, then publish until shutdown or until every sink handle is gone.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let topics = TopicBuilder::new(&self.publish.key_prefix)?;

        let Some(session) = self.connect(&mut shutdown).await? else {
            return Ok(());
        };
        let session = Arc::new(session);

        let transport = ZenohTransport::new(session.clone(), &self.publish);
        let mut publisher =
            BusPublisher::new(transport, topics.clone(), self.publish.format, self.publish.retain);

        let mut queryable = if self.publish.retain {
            match session.declare_queryable(topics.wildcard()).await {
                Ok(queryable) => {
                    info!(key = %topics.wildcard(), "Answering queries with retained values");
                    Some(queryable)
                }
                Err(e) => {
                    warn!(error = %e, "Cannot declare queryable, retention disabled for queries");
                    None
                }
            }
        } else {
            None
        };

        let mut device_status = ConnectionStatus::NotConnected;
        self.announce(&publisher, "running", &device_status).await;

        loop {
            tokio::select! {
                message = self.rx.recv() => match message {
                    Some(BusMessage::Cycle(report)) => {
                        publisher.publish_cycle(&report).await;
                        if report.status != device_status {
                            device_status = report.status.clone();
                            self.announce(&publisher, "running", &device_status).await;
                        }
                    }
                    Some(BusMessage::DeviceStatus(status)) => {
                        if status != device_status {
                            device_status = status;
                            self.announce(&publisher, "running", &device_status).await;
                        }
                    }
                    None => break,
                },
                query = next_query(queryable.as_ref()) => match query {
                    Some(query) => answer(&publisher, &query).await,
                    None => {
                        warn!("Queryable closed");
                        queryable = None;
                    }
                },
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }

        self.announce(&publisher, "offline", &device_status).await;
        drop(queryable);
        if let Err(e) = session.close().await {
            warn!(error = %e, "Error closing Zenoh session");
        }
        info!("Bus publisher stopped");
        Ok(())
    }

    /// Open the session, retrying until it succeeds. `None` means shutdown
    /// was requested first; a configuration error is returned at once.
    async fn connect(&self, shutdown: &mut watch::Receiver<bool>) -> Result<Option<Session>> {
        let delay = Duration::from_secs(self.publish.reconnect_delay_secs);
        loop {
            match metersight_common::connect(&self.zenoh).await.map_err(BridgeError::from) {
                Ok(session) => {
                    info!(mode = %self.zenoh.mode, "Connected to Zenoh");
                    return Ok(Some(session));
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(error = %e, retry_in = ?delay, "Cannot connect to Zenoh");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = wait_for_shutdown(shutdown) => return Ok(None),
                    }
                }
            }
        }
    }

    async fn announce<T: BusTransport>(
        &self,
        publisher: &BusPublisher<T>,
        state: &str,
        device_status: &ConnectionStatus,
    ) {
        let status = BridgeStatus {
            bridge: BRIDGE_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            status: state.to_string(),
            device: self.device.clone(),
            registers: self.registers,
            connection_status: device_status.to_string(),
        };
        if let Err(e) = publisher.publish_status(&status).await {
            warn!(error = %e, state, "Failed to publish bridge status");
        }
    }
}

async fn next_query(queryable: Option<&Queryable<FifoChannelHandler<Query>>>) -> Option<Query> {
    match queryable {
        Some(queryable) => queryable.recv_async().await.ok(),
        None => std::future::pending().await,
    }
}

async fn answer<T: BusTransport>(publisher: &BusPublisher<T>, query: &Query) {
    let Some(retained) = publisher.retained() else {
        return;
    };

    for (key, payload) in retained {
        let Ok(key_expr) = KeyExpr::try_from(key.as_str()) else {
            continue;
        };
        if !query.key_expr().intersects(&key_expr) {
            continue;
        }
        if let Err(e) = query.reply(key_expr, payload.clone()).await {
            warn!(key = %key, error = %e, "Failed to answer query");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::RawValue;
    use crate::reading::{Reading, ReadingMessage, SnapshotMessage};
    use crate::registers::RegisterDescriptor;
    use crate::scaling::Scaled;
    use parking_lot::Mutex;

    #[derive(Clone, Default)]
    struct RecordingTransport {
        puts: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
        reject: Option<String>,
    }

    #[async_trait]
    impl BusTransport for RecordingTransport {
        async fn put(&self, key: &str, payload: Vec<u8>) -> Result<()> {
            if self.reject.as_deref() == Some(key) {
                return Err(BridgeError::Publish {
                    key: key.to_string(),
                    message: "congested".into(),
                });
            }
            self.puts.lock().push((key.to_string(), payload));
            Ok(())
        }
    }

    fn report() -> CycleReport {
        let readings = [(0x2014, "voltage_l1_mV", 230.0, "V"), (0x201A, "current_l1_mA", -1.5, "A")]
            .into_iter()
            .map(|(address, name, value, unit)| {
                let d = RegisterDescriptor::new(address, name, "", 4, true);
                Reading::new(
                    &d,
                    vec![0, 1],
                    RawValue::Signed(1),
                    Scaled {
                        value,
                        unit: unit.into(),
                    },
                    1_700_000_000,
                )
            })
            .collect();

        CycleReport {
            timestamp: 1_700_000_000,
            status: ConnectionStatus::Connected,
            readings,
            failed: Vec::new(),
        }
    }

    fn publisher(transport: RecordingTransport, retain: bool) -> BusPublisher<RecordingTransport> {
        BusPublisher::new(transport, TopicBuilder::default(), Format::Json, retain)
    }

    #[tokio::test]
    async fn test_individual_messages_precede_aggregate() {
        let transport = RecordingTransport::default();
        let mut publisher = publisher(transport.clone(), false);

        let stats = publisher.publish_cycle(&report()).await;
        assert_eq!(stats, PublishStats { success: 3, failed: 0 });

        let puts = transport.puts.lock();
        let keys: Vec<&str> = puts.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "meter/telstar80a/voltage_l1_mV",
                "meter/telstar80a/current_l1_mA",
                "meter/telstar80a/snapshot",
            ]
        );

        let first: ReadingMessage = serde_json::from_slice(&puts[0].1).unwrap();
        assert_eq!(first.record.value, 230.0);
        assert_eq!(first.record.address, "0x2014");
        assert_eq!(first.timestamp, 1_700_000_000);

        let aggregate: SnapshotMessage = serde_json::from_slice(&puts[2].1).unwrap();
        assert_eq!(aggregate.data.len(), 2);
        assert_eq!(aggregate.data["current_l1_mA"].unit, "A");
    }

    #[tokio::test]
    async fn test_empty_cycle_still_publishes_aggregate() {
        let transport = RecordingTransport::default();
        let mut publisher = publisher(transport.clone(), false);

        let mut empty = report();
        empty.readings.clear();
        publisher.publish_cycle(&empty).await;

        let puts = transport.puts.lock();
        assert_eq!(puts.len(), 1);
        assert_eq!(puts[0].0, "meter/telstar80a/snapshot");
    }

    #[tokio::test]
    async fn test_failed_put_does_not_stop_cycle() {
        let transport = RecordingTransport {
            reject: Some("meter/telstar80a/voltage_l1_mV".into()),
            ..Default::default()
        };
        let mut publisher = publisher(transport.clone(), false);

        let stats = publisher.publish_cycle(&report()).await;
        assert_eq!(stats, PublishStats { success: 2, failed: 1 });
        assert_eq!(
            transport.puts.lock().last().map(|(k, _)| k.clone()),
            Some("meter/telstar80a/snapshot".to_string())
        );
    }

    #[tokio::test]
    async fn test_retention_keeps_last_payload() {
        let mut publisher = publisher(RecordingTransport::default(), true);
        publisher.publish_cycle(&report()).await;

        let mut next = report();
        next.readings.truncate(1);
        next.readings[0].scaled_value = 231.0;
        next.timestamp += 10;
        publisher.publish_cycle(&next).await;

        let retained = publisher.retained().unwrap();
        assert_eq!(retained.len(), 3);
        let voltage: ReadingMessage =
            serde_json::from_slice(&retained["meter/telstar80a/voltage_l1_mV"]).unwrap();
        assert_eq!(voltage.record.value, 231.0);
        // Registers missing from the latest cycle keep their older value.
        assert!(retained.contains_key("meter/telstar80a/current_l1_mA"));
    }

    #[tokio::test]
    async fn test_no_retention_by_default() {
        let mut publisher = publisher(RecordingTransport::default(), false);
        publisher.publish_cycle(&report()).await;
        assert!(publisher.retained().is_none());
    }

    #[tokio::test]
    async fn test_cbor_payloads() {
        let transport = RecordingTransport::default();
        let mut publisher =
            BusPublisher::new(transport.clone(), TopicBuilder::default(), Format::Cbor, false);
        publisher.publish_cycle(&report()).await;

        let puts = transport.puts.lock();
        let message: ReadingMessage =
            metersight_common::decode(&puts[0].1, Format::Cbor).unwrap();
        assert_eq!(message.record.unit, "V");
    }

    #[tokio::test]
    async fn test_status_is_json() {
        let transport = RecordingTransport::default();
        let publisher =
            BusPublisher::new(transport.clone(), TopicBuilder::default(), Format::Cbor, false);
        let status = BridgeStatus {
            bridge: "meter".into(),
            version: "0.2.0".into(),
            status: "running".into(),
            device: "10.0.0.5:502".into(),
            registers: 40,
            connection_status: ConnectionStatus::Connected.to_string(),
        };
        publisher.publish_status(&status).await.unwrap();

        let puts = transport.puts.lock();
        assert_eq!(puts[0].0, "meter/telstar80a/@/status");
        let decoded: BridgeStatus = serde_json::from_slice(&puts[0].1).unwrap();
        assert_eq!(decoded, status);
    }

    #[tokio::test]
    async fn test_sink_drops_when_worker_is_behind() {
        let (sink, mut rx) = BusSink::channel(1);

        sink.deliver(&report()).await.unwrap();
        let err = sink.deliver(&report()).await.unwrap_err();
        assert!(err.to_string().contains("message dropped"));

        match rx.recv().await {
            Some(BusMessage::Cycle(r)) => assert_eq!(r.readings.len(), 2),
            other => panic!("unexpected message: {:?}", other),
        }

        sink.status_changed(&ConnectionStatus::Connected).await.unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(BusMessage::DeviceStatus(ConnectionStatus::Connected))
        ));
    }

    #[tokio::test]
    async fn test_sink_reports_stopped_worker() {
        let (sink, rx) = BusSink::channel(4);
        drop(rx);
        let err = sink.deliver(&report()).await.unwrap_err();
        assert!(err.to_string().contains("stopped"));
    }

    #[tokio::test]
    async fn test_worker_stops_on_invalid_zenoh_config() {
        let zenoh = ZenohConfig {
            mode: metersight_common::config::ZenohMode::Peer,
            connect: Vec::new(),
            listen: vec!["not an endpoint".to_string()],
        };
        let (_sink, rx) = BusSink::channel(4);
        let worker = BusWorker::new(zenoh, PublishConfig::default(), "meter".into(), 2, rx);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let err = worker.run(shutdown_rx).await.unwrap_err();
        assert!(err.is_fatal(), "{}", err);
    }

    #[test]
    fn test_qos_mapping() {
        assert_eq!(congestion_control(CongestionMode::Block), CongestionControl::Block);
        assert_eq!(congestion_control(CongestionMode::Drop), CongestionControl::Drop);
        assert_eq!(priority(BusPriority::RealTime), Priority::RealTime);
        assert_eq!(priority(BusPriority::Background), Priority::Background);
    }
}
