//! Delivery of cycle reports to every configured sink.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::Result;
use crate::reading::{ConnectionStatus, CycleReport};

/// A consumer of poll-cycle results.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Accept one cycle's results.
    async fn deliver(&self, report: &CycleReport) -> Result<()>;

    /// Connection status changed without a completed cycle.
    async fn status_changed(&self, _status: &ConnectionStatus) -> Result<()> {
        Ok(())
    }
}

/// Counters for one fanout round.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanoutStats {
    /// Sinks that accepted.
    pub delivered: usize,
    /// Sinks that returned an error.
    pub failed: usize,
}

/// Hands each cycle to all sinks in registration order.
///
/// A failing sink is logged and skipped; it never prevents the remaining
/// sinks from receiving the same report.
#[derive(Default, Clone)]
pub struct PublishFanout {
    sinks: Vec<Arc<dyn Sink>>,
}

impl PublishFanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration.
    pub fn with_sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.add_sink(sink);
        self
    }

    pub fn add_sink(&mut self, sink: Arc<dyn Sink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Deliver a report to every sink.
    pub async fn deliver(&self, report: &CycleReport) -> FanoutStats {
        let mut stats = FanoutStats::default();

        for sink in &self.sinks {
            match sink.deliver(report).await {
                Ok(()) => stats.delivered += 1,
                Err(e) => {
                    stats.failed += 1;
                    warn!(sink = %sink.name(), error = %e, "Sink rejected cycle");
                }
            }
        }

        debug!(
            readings = report.readings.len(),
            failed_registers = report.failed.len(),
            delivered = stats.delivered,
            failed = stats.failed,
            "Cycle fanned out"
        );
        stats
    }

    /// Tell every sink about a status change.
    pub async fn announce_status(&self, status: &ConnectionStatus) -> FanoutStats {
        let mut stats = FanoutStats::default();

        for sink in &self.sinks {
            match sink.status_changed(status).await {
                Ok(()) => stats.delivered += 1,
                Err(e) => {
                    stats.failed += 1;
                    warn!(sink = %sink.name(), error = %e, "Sink rejected status change");
                }
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::RawValue;
    use crate::error::BridgeError;
    use crate::reading::Reading;
    use crate::registers::RegisterDescriptor;
    use crate::scaling::Scaled;
    use crate::sinks::SnapshotStore;
    use parking_lot::Mutex;

    struct FailingSink;

    #[async_trait]
    impl Sink for FailingSink {
        fn name(&self) -> &str {
            "bus"
        }

        async fn deliver(&self, _report: &CycleReport) -> Result<()> {
            Err(BridgeError::sink("bus", "router unreachable"))
        }

        async fn status_changed(&self, _status: &ConnectionStatus) -> Result<()> {
            Err(BridgeError::sink("bus", "router unreachable"))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        reports: Mutex<Vec<CycleReport>>,
    }

    #[async_trait]
    impl Sink for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }

        async fn deliver(&self, report: &CycleReport) -> Result<()> {
            self.reports.lock().push(report.clone());
            Ok(())
        }
    }

    fn report() -> CycleReport {
        let readings = ["a_mW", "b_mW", "c_mW"]
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let d = RegisterDescriptor::new(i as u16 * 2, *name, "mW", 4, true);
                Reading::new(
                    &d,
                    vec![0, 1000],
                    RawValue::Signed(1000),
                    Scaled {
                        value: 1.0,
                        unit: "W".into(),
                    },
                    100,
                )
            })
            .collect();

        CycleReport {
            timestamp: 100,
            status: ConnectionStatus::Connected,
            readings,
            failed: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_failing_bus_does_not_starve_snapshot() {
        let store = Arc::new(SnapshotStore::new());
        let fanout = PublishFanout::new()
            .with_sink(Arc::new(FailingSink))
            .with_sink(store.clone());

        for _ in 0..3 {
            let stats = fanout.deliver(&report()).await;
            assert_eq!(stats, FanoutStats { delivered: 1, failed: 1 });
        }

        let snapshot = store.load();
        assert_eq!(snapshot.topics(), vec!["a_mW", "b_mW", "c_mW"]);
        assert_eq!(snapshot.timestamp, Some(100));
    }

    #[tokio::test]
    async fn test_every_sink_gets_the_same_report() {
        let first = Arc::new(RecordingSink::default());
        let second = Arc::new(RecordingSink::default());
        let fanout = PublishFanout::new()
            .with_sink(first.clone())
            .with_sink(second.clone());
        assert_eq!(fanout.len(), 2);

        let report = report();
        fanout.deliver(&report).await;

        assert_eq!(first.reports.lock().as_slice(), &[report.clone()]);
        assert_eq!(second.reports.lock().as_slice(), &[report]);
    }

    #[tokio::test]
    async fn test_status_uses_default_hook() {
        let recording = Arc::new(RecordingSink::default());
        let fanout = PublishFanout::new()
            .with_sink(recording.clone())
            .with_sink(Arc::new(FailingSink));

        let stats = fanout
            .announce_status(&ConnectionStatus::Failed("refused".into()))
            .await;
        assert_eq!(stats, FanoutStats { delivered: 1, failed: 1 });
        assert!(recording.reports.lock().is_empty());
    }

    #[tokio::test]
    async fn test_empty_fanout() {
        let fanout = PublishFanout::new();
        assert!(fanout.is_empty());
        assert_eq!(fanout.deliver(&report()).await, FanoutStats::default());
    }
}
