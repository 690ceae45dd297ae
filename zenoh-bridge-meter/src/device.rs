//! Device transport: Modbus TCP holding-register reads.

use std::time::Duration;

use async_trait::async_trait;
use tokio_modbus::client::{Context, Reader};
use tokio_modbus::prelude::*;

use crate::config::DeviceConfig;
use crate::error::{BridgeError, ReadError, Result};

/// A live connection able to read holding registers.
#[async_trait]
pub trait RegisterReader: Send {
    /// Read exactly `count` words starting at `address`.
    async fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> std::result::Result<Vec<u16>, ReadError>;
}

/// Opens connections to the metering device.
#[async_trait]
pub trait DeviceConnector: Send + Sync {
    type Connection: RegisterReader + 'static;

    /// Open a new connection.
    async fn connect(&self) -> Result<Self::Connection>;

    /// Human-readable endpoint for logs.
    fn endpoint(&self) -> String;
}

/// Connector for a Modbus TCP device.
#[derive(Debug, Clone)]
pub struct ModbusTcpConnector {
    host: String,
    port: u16,
    unit_id: u8,
    timeout: Duration,
}

impl ModbusTcpConnector {
    /// Create a connector; `timeout` bounds both connecting and each read.
    pub fn new(host: impl Into<String>, port: u16, unit_id: u8, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            unit_id,
            timeout,
        }
    }

    /// Create a connector from the device section of the configuration.
    pub fn from_config(device: &DeviceConfig) -> Self {
        Self::new(
            device.host.clone(),
            device.port,
            device.unit_id,
            Duration::from_millis(device.timeout_ms),
        )
    }
}

#[async_trait]
impl DeviceConnector for ModbusTcpConnector {
    type Connection = ModbusConnection;

    async fn connect(&self) -> Result<ModbusConnection> {
        let endpoint = self.endpoint();

        let addr = tokio::time::timeout(
            self.timeout,
            tokio::net::lookup_host((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| BridgeError::DeviceUnreachable(format!("resolving {} timed out", endpoint)))?
        .map_err(|e| BridgeError::DeviceUnreachable(format!("cannot resolve {}: {}", endpoint, e)))?
        .next()
        .ok_or_else(|| BridgeError::DeviceUnreachable(format!("no address for {}", endpoint)))?;

        let ctx = tokio::time::timeout(self.timeout, tcp::connect_slave(addr, Slave(self.unit_id)))
            .await
            .map_err(|_| {
                BridgeError::DeviceUnreachable(format!("connection to {} timed out", endpoint))
            })?
            .map_err(|e| BridgeError::DeviceUnreachable(format!("{}: {}", endpoint, e)))?;

        Ok(ModbusConnection {
            ctx,
            timeout: self.timeout,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// An open Modbus TCP client context.
pub struct ModbusConnection {
    ctx: Context,
    timeout: Duration,
}

impl std::fmt::Debug for ModbusConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusConnection")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RegisterReader for ModbusConnection {
    async fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> std::result::Result<Vec<u16>, ReadError> {
        tokio::time::timeout(self.timeout, self.ctx.read_holding_registers(address, count))
            .await
            .map_err(|_| ReadError::Timeout(self.timeout))?
            .map_err(|e| ReadError::Transport(e.to_string()))?
            .map_err(|e| ReadError::Exception(format!("{:?}", e)))
    }
}
