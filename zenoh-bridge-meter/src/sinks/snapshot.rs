//! In-memory snapshot store backing the HTTP query surface.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::Result;
use crate::fanout::Sink;
use crate::reading::{ConnectionStatus, CycleReport, Snapshot};

/// Holds the latest [`Snapshot`].
///
/// Snapshots are immutable and swapped whole, so a reader holding an `Arc`
/// from [`load`](Self::load) keeps a consistent view while newer cycles land.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    current: RwLock<Arc<Snapshot>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot.
    pub fn load(&self) -> Arc<Snapshot> {
        self.current.read().clone()
    }

    /// Replace the snapshot.
    pub fn replace(&self, snapshot: Snapshot) {
        *self.current.write() = Arc::new(snapshot);
    }

    /// Keep the registers, change only the connection status.
    pub fn set_status(&self, status: ConnectionStatus) {
        let mut current = self.current.write();
        *current = Arc::new(current.with_status(status));
    }
}

#[async_trait]
impl Sink for SnapshotStore {
    fn name(&self) -> &str {
        "snapshot"
    }

    async fn deliver(&self, report: &CycleReport) -> Result<()> {
        self.replace(Snapshot::from_report(report));
        Ok(())
    }

    async fn status_changed(&self, status: &ConnectionStatus) -> Result<()> {
        self.set_status(status.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::RawValue;
    use crate::reading::Reading;
    use crate::registers::RegisterDescriptor;
    use crate::scaling::Scaled;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    const NAMES: [&str; 8] = ["r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7"];

    fn report(cycle: i64, names: &[&str]) -> CycleReport {
        let readings = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let d = RegisterDescriptor::new(i as u16 * 2, *name, "", 4, false);
                Reading::new(
                    &d,
                    vec![0, cycle as u16],
                    RawValue::Unsigned(cycle as u64),
                    Scaled {
                        value: cycle as f64,
                        unit: String::new(),
                    },
                    cycle,
                )
            })
            .collect();
        CycleReport {
            timestamp: cycle,
            status: ConnectionStatus::Connected,
            readings,
            failed: Vec::new(),
        }
    }

    #[test]
    fn test_initial_snapshot() {
        let store = SnapshotStore::new();
        let snapshot = store.load();
        assert_eq!(snapshot.timestamp, None);
        assert_eq!(snapshot.connection_status, ConnectionStatus::NotConnected);
        assert!(snapshot.registers.is_empty());
    }

    #[tokio::test]
    async fn test_partial_and_empty_cycles_replace_everything() {
        let store = SnapshotStore::new();
        store.deliver(&report(1, &NAMES)).await.unwrap();
        assert_eq!(store.load().registers.len(), 8);

        store.deliver(&report(2, &["r0", "r1"])).await.unwrap();
        assert_eq!(store.load().topics(), vec!["r0", "r1"]);

        let mut empty = report(3, &[]);
        empty.status = ConnectionStatus::NotConnected;
        store.deliver(&empty).await.unwrap();
        let snapshot = store.load();
        assert!(snapshot.registers.is_empty());
        assert_eq!(snapshot.timestamp, Some(3));
        assert_eq!(snapshot.connection_status, ConnectionStatus::NotConnected);
    }

    #[tokio::test]
    async fn test_status_change_keeps_registers() {
        let store = SnapshotStore::new();
        store.deliver(&report(5, &NAMES)).await.unwrap();

        let failed = ConnectionStatus::Failed("connection refused".into());
        store.status_changed(&failed).await.unwrap();

        let snapshot = store.load();
        assert_eq!(snapshot.connection_status, failed);
        assert_eq!(snapshot.registers.len(), 8);
        assert_eq!(snapshot.timestamp, Some(5));
    }

    #[test]
    fn test_readers_never_see_mixed_cycles() {
        let store = Arc::new(SnapshotStore::new());
        store.replace(Snapshot::from_report(&report(0, &NAMES)));
        let done = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                let done = done.clone();
                thread::spawn(move || {
                    let mut observed = 0usize;
                    while !done.load(Ordering::Relaxed) {
                        let snapshot = store.load();
                        let stamp = snapshot.timestamp.unwrap();
                        assert_eq!(snapshot.registers.len(), NAMES.len());
                        for record in snapshot.registers.values() {
                            assert_eq!(record.value, stamp as f64);
                        }
                        observed += 1;
                    }
                    observed
                })
            })
            .collect();

        for cycle in 1..=2_000 {
            store.replace(Snapshot::from_report(&report(cycle, &NAMES)));
        }
        done.store(true, Ordering::Relaxed);

        for reader in readers {
            assert!(reader.join().unwrap() > 0);
        }
        assert_eq!(store.load().timestamp, Some(2_000));
    }
}
