//! Configuration for the meter bridge.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use metersight_common::config::{LoggingConfig, ZenohConfig};
use metersight_common::{Format, KEY_PREFIX, validate_prefix};
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::registers::{RegisterDescriptor, RegisterMap};

/// Complete bridge configuration.
///
/// Every section has defaults, so an empty file polls the built-in Telstar
/// 80A map on `127.0.0.1:502`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeterBridgeConfig {
    /// Zenoh connection settings
    #[serde(default)]
    pub zenoh: ZenohConfig,

    /// Metering device
    #[serde(default)]
    pub device: DeviceConfig,

    /// Message bus publishing
    #[serde(default)]
    pub publish: PublishConfig,

    /// Metrics and snapshot HTTP server
    #[serde(default)]
    pub http: HttpConfig,

    /// Register map override; the built-in map is used when absent
    #[serde(default)]
    pub registers: Option<Vec<RegisterDescriptor>>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Modbus TCP device settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Host name or IP address
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Modbus unit/slave ID (1-247)
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,

    /// Added to every register address before reading
    #[serde(default)]
    pub address_offset: i32,

    /// Connect and per-read timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Poll interval in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Delay between connection attempts in seconds
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    502
}

fn default_unit_id() -> u8 {
    1
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_poll_interval() -> u64 {
    10
}

fn default_reconnect_delay() -> u64 {
    5
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            unit_id: default_unit_id(),
            address_offset: 0,
            timeout_ms: default_timeout_ms(),
            poll_interval_secs: default_poll_interval(),
            reconnect_delay_secs: default_reconnect_delay(),
        }
    }
}

impl DeviceConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

/// What to do when the bus cannot keep up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CongestionMode {
    #[default]
    Drop,
    Block,
}

/// Bus priority for published samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusPriority {
    RealTime,
    InteractiveHigh,
    InteractiveLow,
    DataHigh,
    #[default]
    Data,
    DataLow,
    Background,
}

/// Message bus publishing settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Key expression prefix (default: "meter/telstar80a")
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    #[serde(default)]
    pub congestion_control: CongestionMode,

    #[serde(default)]
    pub priority: BusPriority,

    /// Skip batching on the bus
    #[serde(default)]
    pub express: bool,

    /// Keep the last payload per key and answer queries with it
    #[serde(default)]
    pub retain: bool,

    /// Payload encoding
    #[serde(default)]
    pub format: Format,

    /// Seconds between bus connection attempts
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
}

fn default_key_prefix() -> String {
    KEY_PREFIX.to_string()
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            congestion_control: CongestionMode::default(),
            priority: BusPriority::default(),
            express: false,
            retain: false,
            format: Format::default(),
            reconnect_delay_secs: default_reconnect_delay(),
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Listen address
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Path of the Prometheus endpoint
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,

    /// Prefix for every metric name
    #[serde(default = "default_metrics_prefix")]
    pub metrics_prefix: String,
}

fn default_listen() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_metrics_prefix() -> String {
    "telstar".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            metrics_path: default_metrics_path(),
            metrics_prefix: default_metrics_prefix(),
        }
    }
}

impl HttpConfig {
    /// Parsed listen address.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen.parse().map_err(|e| {
            BridgeError::validation(format!("invalid listen address '{}': {}", self.listen, e))
        })
    }
}

impl MeterBridgeConfig {
    /// Load and validate configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = metersight_common::load_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration without validating it.
    pub fn parse(content: &str) -> Result<Self> {
        Ok(metersight_common::parse_config(content)?)
    }

    /// The register map to poll.
    pub fn register_map(&self) -> Result<RegisterMap> {
        match &self.registers {
            Some(descriptors) => RegisterMap::new(descriptors.clone()),
            None => Ok(RegisterMap::telstar_80a()),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        let device = &self.device;

        if device.host.is_empty() {
            return Err(BridgeError::validation("device.host cannot be empty"));
        }
        if device.port == 0 {
            return Err(BridgeError::validation("device.port cannot be 0"));
        }
        if !(1..=247).contains(&device.unit_id) {
            return Err(BridgeError::validation(format!(
                "device.unit_id must be 1-247, got {}",
                device.unit_id
            )));
        }
        if device.timeout_ms == 0 {
            return Err(BridgeError::validation("device.timeout_ms must be positive"));
        }
        if device.poll_interval_secs == 0 {
            return Err(BridgeError::validation("device.poll_interval_secs must be positive"));
        }
        if device.reconnect_delay_secs == 0 {
            return Err(BridgeError::validation(
                "device.reconnect_delay_secs must be positive",
            ));
        }
        if device.reconnect_delay_secs >= device.poll_interval_secs {
            return Err(BridgeError::validation(format!(
                "device.reconnect_delay_secs ({}) must be shorter than device.poll_interval_secs ({})",
                device.reconnect_delay_secs, device.poll_interval_secs
            )));
        }
        if self.publish.reconnect_delay_secs == 0 {
            return Err(BridgeError::validation(
                "publish.reconnect_delay_secs must be positive",
            ));
        }

        validate_prefix(&self.publish.key_prefix)?;

        self.http.listen_addr()?;
        if !self.http.metrics_path.starts_with('/') {
            return Err(BridgeError::validation(format!(
                "http.metrics_path must start with '/', got '{}'",
                self.http.metrics_path
            )));
        }
        if self.http.metrics_path.starts_with("/api/") || self.http.metrics_path == "/health" {
            return Err(BridgeError::validation(format!(
                "http.metrics_path '{}' collides with a built-in route",
                self.http.metrics_path
            )));
        }
        if self.http.metrics_prefix.is_empty() {
            return Err(BridgeError::validation("http.metrics_prefix cannot be empty"));
        }

        let map = self.register_map()?;
        map.validate_offset(device.address_offset)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metersight_common::ZenohMode;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = MeterBridgeConfig::parse("{}").unwrap();
        config.validate().unwrap();

        assert_eq!(config.device, DeviceConfig::default());
        assert_eq!(config.device.port, 502);
        assert_eq!(config.device.poll_interval(), Duration::from_secs(10));
        assert_eq!(config.publish.key_prefix, "meter/telstar80a");
        assert_eq!(config.publish.congestion_control, CongestionMode::Drop);
        assert_eq!(config.publish.priority, BusPriority::Data);
        assert_eq!(config.http.listen, "0.0.0.0:8000");
        assert_eq!(config.register_map().unwrap().len(), 40);
    }

    #[test]
    fn test_parse_full_config() {
        let config = MeterBridgeConfig::parse(
            r#"{
                zenoh: { mode: "client", connect: ["tcp/10.0.0.1:7447"] },
                device: {
                    host: "meter.plant.local",
                    port: 1502,
                    unit_id: 3,
                    address_offset: -1,
                    poll_interval_secs: 30,
                },
                publish: {
                    key_prefix: "site/a/meter",
                    congestion_control: "block",
                    priority: "data_high",
                    express: true,
                    retain: true,
                    format: "cbor",
                },
                http: { listen: "127.0.0.1:9100", metrics_prefix: "site_a" },
                registers: [
                    { address: 8212, name: "voltage_l1_mV", unit: "mV", size_bytes: 4 },
                    { address: 8196, name: "active_power_total_mW", unit: "mW", size_bytes: 4, signed: true },
                ],
                logging: { level: "debug" },
            }"#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.zenoh.mode, ZenohMode::Client);
        assert_eq!(config.device.unit_id, 3);
        assert_eq!(config.device.address_offset, -1);
        assert_eq!(config.publish.congestion_control, CongestionMode::Block);
        assert_eq!(config.publish.priority, BusPriority::DataHigh);
        assert_eq!(config.publish.format, Format::Cbor);
        assert!(config.publish.retain);
        assert_eq!(config.http.metrics_path, "/metrics");

        let map = config.register_map().unwrap();
        assert_eq!(map.len(), 2);
        assert!(map.get("active_power_total_mW").unwrap().signed);
    }

    #[test]
    fn test_invalid_unit_id() {
        let config = MeterBridgeConfig::parse("{ device: { unit_id: 0 } }").unwrap();
        assert!(config.validate().unwrap_err().to_string().contains("unit_id"));

        let config = MeterBridgeConfig::parse("{ device: { unit_id: 248 } }").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_intervals_rejected() {
        for device in [
            "{ poll_interval_secs: 0 }",
            "{ reconnect_delay_secs: 0 }",
            "{ timeout_ms: 0 }",
        ] {
            let config = MeterBridgeConfig::parse(&format!("{{ device: {} }}", device)).unwrap();
            assert!(config.validate().is_err(), "{} should be rejected", device);
        }
    }

    #[test]
    fn test_reconnect_delay_must_undercut_poll_interval() {
        let config = MeterBridgeConfig::parse(
            "{ device: { poll_interval_secs: 5, reconnect_delay_secs: 5 } }",
        )
        .unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("shorter than"), "{}", err);

        let config = MeterBridgeConfig::parse(
            "{ device: { poll_interval_secs: 6, reconnect_delay_secs: 5 } }",
        )
        .unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_prefix_rejected() {
        let config = MeterBridgeConfig::parse(r#"{ publish: { key_prefix: "meter/*" } }"#).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_listen_rejected() {
        let config = MeterBridgeConfig::parse(r#"{ http: { listen: "not-an-address" } }"#).unwrap();
        assert!(config.validate().unwrap_err().to_string().contains("listen"));
    }

    #[test]
    fn test_metrics_path_collision_rejected() {
        let config = MeterBridgeConfig::parse(r#"{ http: { metrics_path: "/health" } }"#).unwrap();
        assert!(config.validate().is_err());

        let config = MeterBridgeConfig::parse(r#"{ http: { metrics_path: "metrics" } }"#).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_register_map_is_fatal() {
        let config = MeterBridgeConfig::parse(
            r#"{ registers: [{ address: 0, name: "odd", size_bytes: 6 }] }"#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("unsupported width"));
    }

    #[test]
    fn test_offset_out_of_range_rejected() {
        let config = MeterBridgeConfig::parse("{ device: { address_offset: -9000 } }").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = MeterBridgeConfig::load_from_file("/nonexistent/meter.json5").unwrap_err();
        assert!(matches!(err, BridgeError::ConfigNotFound { .. }));
    }

    #[test]
    fn test_syntax_error_is_parse_error() {
        let err = MeterBridgeConfig::parse("{ device: { port: } }").unwrap_err();
        assert!(matches!(err, BridgeError::ConfigParse(_)), "{:?}", err);
        assert!(err.is_fatal());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meter.json5");
        std::fs::write(&path, "{ device: { host: \"10.1.1.1\" } }").unwrap();

        let config = MeterBridgeConfig::load_from_file(&path).unwrap();
        assert_eq!(config.device.host, "10.1.1.1");
    }
}
