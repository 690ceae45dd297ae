//! Device connection lifecycle.
//!
//! ```text
//! Disconnected ──> Connecting ──> Connected ──> Disconnected (invalidate)
//!                      │
//!                      └──> Failed ──(fixed backoff)──> Connecting
//! ```
//!
//! Faults are never classified: every failure is retried forever at the same
//! fixed delay.

use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::device::DeviceConnector;
use crate::error::Result;

/// Capacity of the state-change channel.
const EVENT_CAPACITY: usize = 32;

/// Connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed(String),
}

/// Owns the device connection and reconnects it on demand.
pub struct ConnectionManager<C: DeviceConnector> {
    connector: C,
    connection: Option<C::Connection>,
    state: ConnectionState,
    backoff: Duration,
    consecutive_failures: u32,
    events: broadcast::Sender<ConnectionState>,
}

impl<C: DeviceConnector> ConnectionManager<C> {
    /// Create a manager; nothing is opened until the first acquire.
    pub fn new(connector: C, backoff: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            connector,
            connection: None,
            state: ConnectionState::Disconnected,
            backoff,
            consecutive_failures: 0,
            events,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Receive every state transition from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionState> {
        self.events.subscribe()
    }

    /// Return the live connection, making at most one connect attempt.
    pub async fn try_acquire(&mut self) -> Result<&mut C::Connection> {
        let connection = match self.connection.take() {
            Some(connection) => connection,
            None => self.open().await?,
        };
        Ok(self.connection.insert(connection))
    }

    /// Return the live connection, retrying at the fixed backoff until one opens.
    ///
    /// After a failed attempt the first retry also waits one backoff.
    pub async fn acquire(&mut self) -> &mut C::Connection {
        let connection = match self.connection.take() {
            Some(connection) => connection,
            None => loop {
                if matches!(self.state, ConnectionState::Failed(_)) {
                    tokio::time::sleep(self.backoff).await;
                }
                if let Ok(connection) = self.open().await {
                    break connection;
                }
            },
        };
        self.connection.insert(connection)
    }

    /// Drop the current connection so the next acquire reconnects.
    pub fn invalidate(&mut self, reason: &str) {
        if self.connection.take().is_some() {
            warn!(
                endpoint = %self.connector.endpoint(),
                reason = %reason,
                "Dropping device connection"
            );
            self.transition(ConnectionState::Disconnected);
        }
    }

    async fn open(&mut self) -> Result<C::Connection> {
        self.transition(ConnectionState::Connecting);

        match self.connector.connect().await {
            Ok(connection) => {
                info!(
                    endpoint = %self.connector.endpoint(),
                    after_failures = self.consecutive_failures,
                    "Connected to device"
                );
                self.consecutive_failures = 0;
                self.transition(ConnectionState::Connected);
                Ok(connection)
            }
            Err(e) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                warn!(
                    endpoint = %self.connector.endpoint(),
                    error = %e,
                    failures = self.consecutive_failures,
                    retry_in = ?self.backoff,
                    "Cannot connect to device"
                );
                self.transition(ConnectionState::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    fn transition(&mut self, state: ConnectionState) {
        debug!(from = ?self.state, to = ?state, "Connection state change");
        self.state = state.clone();
        // No subscribers is fine.
        let _ = self.events.send(state);
    }
}
