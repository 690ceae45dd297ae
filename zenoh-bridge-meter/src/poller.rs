//! Register polling.
//!
//! [`PollCycle`] walks the register map once and produces a [`CycleReport`].
//! [`Poller`] drives cycles on a fixed interval and hands every report to the
//! [`PublishFanout`].

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::connection::{ConnectionManager, ConnectionState};
use crate::decode::combine_words;
use crate::device::{DeviceConnector, RegisterReader};
use crate::error::{BridgeError, ReadError};
use crate::fanout::PublishFanout;
use crate::reading::{ConnectionStatus, CycleReport, Reading};
use crate::registers::{RegisterDescriptor, RegisterMap};
use crate::scaling::ScalingEngine;

/// One pass over the register map.
#[derive(Debug, Clone)]
pub struct PollCycle {
    map: RegisterMap,
    engine: ScalingEngine,
    address_offset: i32,
}

impl PollCycle {
    pub fn new(map: RegisterMap, engine: ScalingEngine, address_offset: i32) -> Self {
        Self {
            map,
            engine,
            address_offset,
        }
    }

    pub fn map(&self) -> &RegisterMap {
        &self.map
    }

    /// Read every register in map order.
    ///
    /// A register that fails is logged and left out of the report. Transport
    /// errors and timeouts drop the connection; the next register then makes a
    /// single reconnect attempt, and if that fails the rest of the cycle is
    /// skipped without further attempts.
    pub async fn run<C: DeviceConnector>(
        &self,
        connection: &mut ConnectionManager<C>,
        timestamp: i64,
    ) -> CycleReport {
        let mut readings = Vec::with_capacity(self.map.len());
        let mut failed = Vec::new();
        let mut reconnect_error: Option<String> = None;
        let mut reached_device = false;

        for descriptor in &self.map {
            let result = match &reconnect_error {
                Some(reason) => Err(ReadError::NotConnected(format!(
                    "reconnect failed earlier in this cycle: {}",
                    reason
                ))),
                None => match connection.try_acquire().await {
                    Ok(reader) => {
                        reached_device = true;
                        self.read_one(reader, descriptor, timestamp).await
                    }
                    Err(e) => {
                        let reason = e.to_string();
                        reconnect_error = Some(reason.clone());
                        Err(ReadError::NotConnected(reason))
                    }
                },
            };

            match result {
                Ok(reading) => {
                    trace!(
                        register = %reading.name,
                        value = reading.scaled_value,
                        unit = %reading.scaled_unit,
                        "Read register"
                    );
                    readings.push(reading);
                }
                Err(source) => {
                    if source.requires_reconnect() {
                        connection.invalidate(&source.to_string());
                    }
                    let error = BridgeError::RegisterRead {
                        name: descriptor.name.clone(),
                        source,
                    };
                    warn!(address = %descriptor.address_hex(), error = %error, "Register skipped");
                    failed.push(descriptor.name.clone());
                }
            }
        }

        // A connection dropped after the last read still served this cycle.
        let status = match reconnect_error {
            Some(reason) => ConnectionStatus::Failed(reason),
            None if reached_device => ConnectionStatus::Connected,
            None => status_of(connection.state()),
        };

        CycleReport {
            timestamp,
            status,
            readings,
            failed,
        }
    }

    async fn read_one<R: RegisterReader>(
        &self,
        reader: &mut R,
        descriptor: &RegisterDescriptor,
        timestamp: i64,
    ) -> Result<Reading, ReadError> {
        let address = descriptor.resolve_address(self.address_offset)?;
        let count = descriptor.word_count();

        let words = reader.read_holding_registers(address, count).await?;
        if words.len() != usize::from(count) {
            return Err(ReadError::Malformed {
                expected: usize::from(count),
                actual: words.len(),
            });
        }

        let raw = combine_words(&words, descriptor.signed)?;
        let scaled = self.engine.scale(&descriptor.name, raw, &descriptor.raw_unit);

        Ok(Reading::new(descriptor, words, raw, scaled, timestamp))
    }
}

fn status_of(state: &ConnectionState) -> ConnectionStatus {
    match state {
        ConnectionState::Connected => ConnectionStatus::Connected,
        ConnectionState::Failed(reason) => ConnectionStatus::Failed(reason.clone()),
        ConnectionState::Disconnected | ConnectionState::Connecting => {
            ConnectionStatus::NotConnected
        }
    }
}

/// What the poll worker is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPhase {
    Idle,
    Connecting,
    Reading,
    Publishing,
    Sleeping,
}

/// Long-running poll worker.
pub struct Poller<C: DeviceConnector> {
    cycle: PollCycle,
    connection: ConnectionManager<C>,
    fanout: PublishFanout,
    interval: Duration,
    phase: PollPhase,
}

impl<C: DeviceConnector> Poller<C> {
    pub fn new(
        cycle: PollCycle,
        connection: ConnectionManager<C>,
        fanout: PublishFanout,
        interval: Duration,
    ) -> Self {
        Self {
            cycle,
            connection,
            fanout,
            interval,
            phase: PollPhase::Idle,
        }
    }

    pub fn phase(&self) -> PollPhase {
        self.phase
    }

    pub fn connection(&self) -> &ConnectionManager<C> {
        &self.connection
    }

    /// Poll until `shutdown` turns true.
    ///
    /// Shutdown is only observed between phases, so an in-flight read
    /// always completes first.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            endpoint = %self.connection.connector().endpoint(),
            registers = self.cycle.map().len(),
            interval = ?self.interval,
            "Starting poller"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut retry_pending = false;

        loop {
            if !retry_pending {
                self.enter(PollPhase::Idle);
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = wait_for_shutdown(&mut shutdown) => break,
                }
            }
            if *shutdown.borrow() {
                break;
            }

            if self.poll_once().await {
                if retry_pending {
                    // Realign so the recovered cycle is not followed by an immediate one.
                    ticker.reset();
                    retry_pending = false;
                }
            } else {
                retry_pending = true;
                self.enter(PollPhase::Sleeping);
                tokio::select! {
                    _ = tokio::time::sleep(self.connection.backoff()) => {}
                    _ = wait_for_shutdown(&mut shutdown) => break,
                }
            }
        }

        self.connection.invalidate("poller stopped");
        info!("Poller stopped");
    }

    /// Run one cycle. Returns false when no connection could be opened.
    pub async fn poll_once(&mut self) -> bool {
        self.enter(PollPhase::Connecting);
        if let Err(e) = self.connection.try_acquire().await {
            warn!(
                error = %e,
                retry_in = ?self.connection.backoff(),
                "Skipping poll cycle"
            );
            self.fanout
                .announce_status(&ConnectionStatus::Failed(e.to_string()))
                .await;
            return false;
        }

        self.enter(PollPhase::Reading);
        let timestamp = chrono::Utc::now().timestamp();
        let report = self.cycle.run(&mut self.connection, timestamp).await;

        if report.readings.is_empty() {
            warn!(failed = report.failed.len(), "Cycle produced no readings");
        } else if report.is_partial() {
            info!(
                readings = report.readings.len(),
                failed = report.failed.len(),
                "Partial cycle"
            );
        }

        self.enter(PollPhase::Publishing);
        self.fanout.deliver(&report).await;
        true
    }

    fn enter(&mut self, phase: PollPhase) {
        if self.phase != phase {
            debug!(from = ?self.phase, to = ?phase, "Poller phase");
            self.phase = phase;
        }
    }
}

/// Resolves once shutdown is requested or the sender is gone.
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
