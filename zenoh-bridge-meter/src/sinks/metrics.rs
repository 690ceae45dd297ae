//! Prometheus gauges for the latest readings.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicU64;

use async_trait::async_trait;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use tracing::trace;

use crate::error::{BridgeError, Result};
use crate::fanout::Sink;
use crate::reading::{ConnectionStatus, CycleReport};
use crate::registers::RegisterMap;

/// Content type of the rendered exposition.
pub const CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

const TIMESTAMP_METRIC: &str = "snapshot_timestamp";
const CONNECTED_METRIC: &str = "device_connected";

/// Convert a register name to a valid Prometheus metric name.
///
/// Invalid characters become underscores, runs of underscores collapse, and a
/// leading digit gets an underscore prefix.
pub fn sanitize_metric_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 1);
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        out.push('_');
    }

    for c in name.chars() {
        let c = if c.is_ascii_alphanumeric() || c == '_' || c == ':' {
            c
        } else {
            '_'
        };
        if c == '_' && out.ends_with('_') {
            continue;
        }
        out.push(c);
    }

    let trimmed = out.trim_end_matches('_');
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}

/// One gauge per register plus cycle bookkeeping.
#[derive(Debug)]
pub struct MetricsSink {
    registry: Registry,
    registers: HashMap<String, Gauge<f64, AtomicU64>>,
    last_cycle: Gauge,
    connected: Gauge,
}

impl MetricsSink {
    /// Register a gauge for every entry of `map`, named `{prefix}_{register}`.
    pub fn new(prefix: &str, map: &RegisterMap) -> Result<Self> {
        let mut registry = Registry::with_prefix(sanitize_metric_name(prefix));
        let mut taken: HashSet<String> =
            [TIMESTAMP_METRIC, CONNECTED_METRIC].map(String::from).into();
        let mut registers = HashMap::with_capacity(map.len());

        for descriptor in map {
            let metric = sanitize_metric_name(&descriptor.name);
            if !taken.insert(metric.clone()) {
                return Err(BridgeError::validation(format!(
                    "register '{}' maps to metric name '{}' which is already in use",
                    descriptor.name, metric
                )));
            }

            let gauge = Gauge::<f64, AtomicU64>::default();
            let help = if descriptor.raw_unit.is_empty() {
                format!("Meter register {}", descriptor.name)
            } else {
                format!("Meter register {} (raw unit {})", descriptor.name, descriptor.raw_unit)
            };
            registry.register(metric, help, gauge.clone());
            registers.insert(descriptor.name.clone(), gauge);
        }

        let last_cycle = Gauge::default();
        registry.register(
            TIMESTAMP_METRIC,
            "Unix time of the last completed poll cycle",
            last_cycle.clone(),
        );
        let connected = Gauge::default();
        registry.register(
            CONNECTED_METRIC,
            "Whether the meter connection is up",
            connected.clone(),
        );

        Ok(Self {
            registry,
            registers,
            last_cycle,
            connected,
        })
    }

    /// Text exposition of all gauges.
    pub fn render(&self) -> std::result::Result<String, std::fmt::Error> {
        let mut out = String::new();
        encode(&mut out, &self.registry)?;
        Ok(out)
    }

    fn set_connected(&self, status: &ConnectionStatus) {
        self.connected.set(i64::from(status.is_connected()));
    }

    /// Current value of a register gauge.
    pub fn value(&self, register: &str) -> Option<f64> {
        self.registers.get(register).map(Gauge::get)
    }
}

#[async_trait]
impl Sink for MetricsSink {
    fn name(&self) -> &str {
        "metrics"
    }

    async fn deliver(&self, report: &CycleReport) -> Result<()> {
        for reading in &report.readings {
            match self.registers.get(&reading.name) {
                Some(gauge) => {
                    gauge.set(reading.scaled_value);
                }
                None => trace!(register = %reading.name, "No gauge for register"),
            }
        }
        self.last_cycle.set(report.timestamp);
        self.set_connected(&report.status);
        Ok(())
    }

    async fn status_changed(&self, status: &ConnectionStatus) -> Result<()> {
        self.set_connected(status);
        Ok(())
    }
}
