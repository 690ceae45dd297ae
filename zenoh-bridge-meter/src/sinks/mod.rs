//! Sink implementations for the publish fanout.

pub mod bus;
pub mod metrics;
pub mod snapshot;

pub use bus::{
    BridgeStatus, BusMessage, BusPublisher, BusSink, BusTransport, BusWorker, PublishStats,
    ZenohTransport,
};
pub use metrics::{CONTENT_TYPE, MetricsSink, sanitize_metric_name};
pub use snapshot::SnapshotStore;
