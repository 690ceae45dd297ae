//! Zenoh bridge for Modbus TCP energy meters.
//!
//! The bridge polls a fixed register map from one meter, decodes and scales
//! each register group, and hands every cycle to three sinks: Zenoh, a
//! Prometheus endpoint and an in-memory snapshot served over HTTP.
//!
//! # Key Expressions
//!
//! ```text
//! meter/telstar80a/<register>     one message per register per cycle
//! meter/telstar80a/snapshot       aggregate of the cycle, after the registers
//! meter/telstar80a/@/status       bridge status (JSON)
//! ```
//!
//! # Pipeline
//!
//! ```text
//! ConnectionManager ─> PollCycle ─> CycleReport ─> PublishFanout ─┬─> BusSink ─> BusWorker ─> Zenoh
//!                                                                 ├─> MetricsSink ─> /metrics
//!                                                                 └─> SnapshotStore ─> /api/*
//! ```

pub mod config;
pub mod connection;
pub mod decode;
pub mod device;
pub mod error;
pub mod fanout;
pub mod http;
pub mod poller;
pub mod reading;
pub mod registers;
pub mod scaling;
pub mod sinks;

pub use config::MeterBridgeConfig;
pub use connection::{ConnectionManager, ConnectionState};
pub use decode::{RawValue, combine_words};
pub use device::{DeviceConnector, ModbusTcpConnector, RegisterReader};
pub use error::{BridgeError, ReadError, Result};
pub use fanout::{PublishFanout, Sink};
pub use http::HttpServer;
pub use poller::{PollCycle, PollPhase, Poller};
pub use reading::{ConnectionStatus, CycleReport, Reading, Snapshot};
pub use registers::{RegisterDescriptor, RegisterMap};
pub use scaling::{ScalingEngine, ScalingRule, Transform};
pub use sinks::{BusSink, BusWorker, MetricsSink, SnapshotStore};
