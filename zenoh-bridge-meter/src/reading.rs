//! Per-cycle readings and the snapshot model served to consumers.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize, Serializer};

use crate::decode::RawValue;
use crate::registers::RegisterDescriptor;
use crate::scaling::Scaled;

/// One register's value from one poll cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub name: String,
    pub raw_value: RawValue,
    pub raw_words: Vec<u16>,
    pub scaled_value: f64,
    pub scaled_unit: String,
    pub address: u16,
    /// Poll-cycle time, unix seconds.
    pub timestamp: i64,
}

impl Reading {
    /// Assemble a reading from its descriptor and pipeline results.
    pub fn new(
        descriptor: &RegisterDescriptor,
        raw_words: Vec<u16>,
        raw_value: RawValue,
        scaled: Scaled,
        timestamp: i64,
    ) -> Self {
        Self {
            name: descriptor.name.clone(),
            raw_value,
            raw_words,
            scaled_value: scaled.value,
            scaled_unit: scaled.unit,
            address: descriptor.address,
            timestamp,
        }
    }

    /// Record form used in snapshots and the aggregate message.
    pub fn record(&self) -> RegisterRecord {
        RegisterRecord {
            value: self.scaled_value,
            unit: self.scaled_unit.clone(),
            raw_value: self.raw_value,
            raw_registers: self.raw_words.clone(),
            address: format!("{:#x}", self.address),
        }
    }

    /// Payload of the per-register bus message.
    pub fn message(&self) -> ReadingMessage {
        ReadingMessage {
            record: self.record(),
            timestamp: self.timestamp,
        }
    }
}

/// Serialized view of a reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterRecord {
    pub value: f64,
    pub unit: String,
    pub raw_value: RawValue,
    pub raw_registers: Vec<u16>,
    pub address: String,
}

/// Per-register bus payload: the record plus its timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingMessage {
    #[serde(flatten)]
    pub record: RegisterRecord,
    pub timestamp: i64,
}

/// Aggregate bus payload, one per cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMessage {
    pub timestamp: i64,
    pub data: BTreeMap<String, RegisterRecord>,
}

/// Device connection status as seen by consumers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConnectionStatus {
    #[default]
    NotConnected,
    Connected,
    Failed(String),
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::NotConnected => f.write_str("Not connected"),
            ConnectionStatus::Connected => f.write_str("Connected"),
            ConnectionStatus::Failed(reason) => write!(f, "Failed: {}", reason),
        }
    }
}

impl Serialize for ConnectionStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Outcome of one poll cycle, handed to the fanout.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    /// Cycle time, unix seconds.
    pub timestamp: i64,
    pub status: ConnectionStatus,
    /// Successful readings in map order.
    pub readings: Vec<Reading>,
    /// Names of registers that failed this cycle.
    pub failed: Vec<String>,
}

impl CycleReport {
    /// Readings keyed by register name.
    pub fn records(&self) -> BTreeMap<String, RegisterRecord> {
        self.readings
            .iter()
            .map(|r| (r.name.clone(), r.record()))
            .collect()
    }

    /// Aggregate bus payload for this cycle.
    pub fn snapshot_message(&self) -> SnapshotMessage {
        SnapshotMessage {
            timestamp: self.timestamp,
            data: self.records(),
        }
    }

    /// Whether some registers failed while others succeeded.
    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty() && !self.readings.is_empty()
    }
}

/// Latest state of the device as served to readers.
///
/// Immutable once built; the store swaps whole snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Snapshot {
    /// Time of the last delivered cycle, unix seconds.
    pub timestamp: Option<i64>,
    pub connection_status: ConnectionStatus,
    pub registers: BTreeMap<String, RegisterRecord>,
}

impl Snapshot {
    /// Snapshot reflecting a completed cycle.
    pub fn from_report(report: &CycleReport) -> Self {
        Self {
            timestamp: Some(report.timestamp),
            connection_status: report.status.clone(),
            registers: report.records(),
        }
    }

    /// Copy of this snapshot with a different connection status.
    pub fn with_status(&self, status: ConnectionStatus) -> Self {
        Self {
            connection_status: status,
            ..self.clone()
        }
    }

    /// Register names in sorted order.
    pub fn topics(&self) -> Vec<String> {
        self.registers.keys().cloned().collect()
    }
}
