//! Error types for the meter bridge.

use std::time::Duration;

use thiserror::Error;

use crate::decode::DecodeError;

/// Result type alias using [`BridgeError`].
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors that can occur in the bridge.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file not found.
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Configuration parse error.
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    /// Configuration validation error.
    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    /// The metering device could not be reached.
    #[error("Device unreachable: {0}")]
    DeviceUnreachable(String),

    /// A single register could not be read or decoded.
    #[error("Failed to read register '{name}': {source}")]
    RegisterRead {
        name: String,
        #[source]
        source: ReadError,
    },

    /// A sink rejected a cycle.
    #[error("Sink '{sink}' delivery failed: {message}")]
    SinkDelivery { sink: String, message: String },

    /// Zenoh connection error.
    #[error("Zenoh connection error: {0}")]
    ZenohConnection(String),

    /// Publishing error.
    #[error("Failed to publish to {key}: {message}")]
    Publish { key: String, message: String },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Create a configuration validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ConfigValidation(msg.into())
    }

    /// Create a sink delivery error.
    pub fn sink(sink: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SinkDelivery {
            sink: sink.into(),
            message: message.into(),
        }
    }

    /// Whether retrying cannot help: the configuration itself is wrong.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::ConfigNotFound { .. }
                | Self::ConfigParse(_)
                | Self::ConfigValidation(_)
        )
    }
}

impl From<zenoh::Error> for BridgeError {
    fn from(err: zenoh::Error) -> Self {
        Self::ZenohConnection(err.to_string())
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<metersight_common::Error> for BridgeError {
    fn from(err: metersight_common::Error) -> Self {
        match err {
            metersight_common::Error::Config(msg) => Self::Config(msg),
            metersight_common::Error::ConfigNotFound(path) => Self::ConfigNotFound {
                path: path.display().to_string(),
            },
            metersight_common::Error::ConfigParse(msg) => Self::ConfigParse(msg),
            metersight_common::Error::KeyExpr(msg) => Self::ConfigValidation(msg),
            metersight_common::Error::Zenoh(e) => Self::ZenohConnection(e.to_string()),
            metersight_common::Error::Io(e) => Self::Io(e),
            other => Self::Serialization(other.to_string()),
        }
    }
}

/// Failure reading one register group from the device.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReadError {
    /// The stream broke or the request could not be sent.
    #[error("transport error: {0}")]
    Transport(String),

    /// No response within the per-read timeout.
    #[error("read timed out after {0:?}")]
    Timeout(Duration),

    /// The device answered with a protocol exception.
    #[error("device exception: {0}")]
    Exception(String),

    /// The response carried the wrong number of words.
    #[error("malformed response: expected {expected} words, got {actual}")]
    Malformed { expected: usize, actual: usize },

    /// The offset pushed the address outside the 16-bit register space.
    #[error("address {address:#06x} with offset {offset} is outside the register space")]
    AddressOutOfRange { address: u16, offset: i32 },

    /// No connection could be acquired for this read.
    #[error("no device connection: {0}")]
    NotConnected(String),

    /// The words could not be combined into an integer.
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl ReadError {
    /// Whether the connection is unusable after this error.
    ///
    /// Exceptions and malformed payloads leave the stream in sync; transport
    /// errors and timeouts do not.
    pub fn requires_reconnect(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_classification() {
        assert!(ReadError::Transport("broken pipe".into()).requires_reconnect());
        assert!(ReadError::Timeout(Duration::from_secs(5)).requires_reconnect());
        assert!(!ReadError::Exception("IllegalDataAddress".into()).requires_reconnect());
        assert!(
            !ReadError::Malformed {
                expected: 2,
                actual: 1
            }
            .requires_reconnect()
        );
    }

    #[test]
    fn test_error_messages() {
        let err = BridgeError::RegisterRead {
            name: "voltage_l1_mV".into(),
            source: ReadError::AddressOutOfRange {
                address: 0x0002,
                offset: -3,
            },
        };
        assert_eq!(
            err.to_string(),
            "Failed to read register 'voltage_l1_mV': address 0x0002 with offset -3 is outside the register space"
        );

        let err = BridgeError::sink("bus", "session closed");
        assert_eq!(err.to_string(), "Sink 'bus' delivery failed: session closed");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(BridgeError::validation("bad").is_fatal());
        assert!(!BridgeError::DeviceUnreachable("refused".into()).is_fatal());
    }
}
