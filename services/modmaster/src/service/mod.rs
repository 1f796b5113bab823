//! Modbus master service
//!
//! Owns one logical connection, runs reads against it and publishes
//! data, log, stats, status and error events. All mutable state sits behind a
//! single mutex that is never held across transport I/O.
//!
//! - `lifecycle`: connect/disconnect, the background retry loop and
//!   implicit reconnect after a lost link
//! - `read`: the read orchestrator

mod lifecycle;
mod read;

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ServiceConfig;
use crate::core::events::{Event, EventBus, DEFAULT_EVENT_CAPACITY};
use crate::core::logs::{Direction, LogBuffer, LogEntry};
use crate::core::read::{ConnectionStatus, Stats};
use crate::error::Result;
use crate::runtime::reconnect::ReconnectPolicy;
use crate::transport::{ClientFactory, ModbusClient, TokioModbusFactory};

/// Default number of log entries kept in memory
pub const DEFAULT_LOG_CAPACITY: usize = 500;

/// Construction options for [`Service`]
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub log_capacity: usize,
    pub event_capacity: usize,
    pub reconnect: ReconnectPolicy,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            log_capacity: DEFAULT_LOG_CAPACITY,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Mutable service state, guarded by `Inner::state`
struct State {
    config: ServiceConfig,
    client: Option<Arc<dyn ModbusClient>>,
    stats: Stats,
    connecting: bool,
    connect_cancel: Option<CancellationToken>,
    last_connect_error: Option<String>,
    /// Bumped whenever the connection owner changes: a new connect loop,
    /// a disconnect, or an implicit teardown. Stale work compares against it
    /// before committing.
    generation: u64,
}

impl State {
    fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            connected: self.client.is_some(),
            connecting: self.connecting,
            last_error: self.last_connect_error.clone(),
        }
    }

    /// Mark a connect loop as running and return its cancel token and generation
    fn arm_connect(&mut self) -> (CancellationToken, u64) {
        let token = CancellationToken::new();
        self.connect_cancel = Some(token.clone());
        self.connecting = true;
        self.generation += 1;
        (token, self.generation)
    }
}

struct Inner {
    state: Mutex<State>,
    logs: LogBuffer,
    events: EventBus,
    factory: Arc<dyn ClientFactory>,
    reconnect: ReconnectPolicy,
}

/// Handle to the Modbus master service
///
/// Cloning is cheap; all clones share the same connection and state.
#[derive(Clone)]
pub struct Service {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("status", &self.status_snapshot())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Service {
    /// Service backed by `tokio-modbus` with default options
    pub fn new(config: ServiceConfig) -> Self {
        Self::with_factory(config, Arc::new(TokioModbusFactory), ServiceOptions::default())
    }

    pub fn with_factory(
        config: ServiceConfig,
        factory: Arc<dyn ClientFactory>,
        options: ServiceOptions,
    ) -> Self {
        let state = State {
            config,
            client: None,
            stats: Stats::default(),
            connecting: false,
            connect_cancel: None,
            last_connect_error: None,
            generation: 0,
        };
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                logs: LogBuffer::new(options.log_capacity),
                events: EventBus::new(options.event_capacity),
                factory,
                reconnect: options.reconnect,
            }),
        }
    }

    pub fn config(&self) -> ServiceConfig {
        self.inner.state.lock().config.clone()
    }

    /// Replace the configuration
    ///
    /// Takes effect for the next read and the next connect attempt; an open
    /// connection is not reopened.
    pub fn update_config(&self, config: ServiceConfig) -> Result<()> {
        config.validate()?;
        self.inner.state.lock().config = config;
        debug!("Configuration updated");
        Ok(())
    }

    pub fn stats(&self) -> Stats {
        self.inner.state.lock().stats
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.inner.logs.snapshot()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().client.is_some()
    }

    pub fn is_connecting(&self) -> bool {
        self.inner.state.lock().connecting
    }

    pub fn last_connect_error(&self) -> Option<String> {
        self.inner.state.lock().last_connect_error.clone()
    }

    pub fn status_snapshot(&self) -> ConnectionStatus {
        self.inner.state.lock().status()
    }

    /// Receiving end of the event channel; `None` after the first call
    pub fn take_events(&self) -> Option<mpsc::Receiver<Event>> {
        self.inner.events.take_receiver()
    }

    /// Events discarded because the channel was full
    pub fn dropped_events(&self) -> u64 {
        self.inner.events.dropped()
    }

    // ------------------------------------------------------------------
    // Event helpers
    // ------------------------------------------------------------------

    fn log(&self, direction: Direction, message: impl Into<String>) {
        let entry = LogEntry::new(direction, message);
        match direction {
            Direction::Sys => info!(direction = %direction, "{}", entry.message),
            Direction::Err => warn!(direction = %direction, "{}", entry.message),
            Direction::Tx | Direction::Rx => debug!(direction = %direction, "{}", entry.message),
        }
        self.inner.logs.add(entry.clone());
        self.inner.events.publish(Event::Log(entry));
    }

    fn log_sys(&self, message: impl Into<String>) {
        self.log(Direction::Sys, message);
    }

    fn log_err(&self, message: impl Into<String>) {
        self.log(Direction::Err, message);
    }

    fn emit_status(&self) {
        let status = self.status_snapshot();
        self.log_sys(format!(
            "status: connected={} connecting={} lastError={:?}",
            status.connected,
            status.connecting,
            status.last_error.as_deref().unwrap_or("")
        ));
        self.inner.events.publish(Event::Status(status));
    }

    /// Count a finished read and publish the new totals
    fn update_stats(&self, latency_ms: u64, failed: bool) {
        let mut state = self.inner.state.lock();
        if failed {
            state.stats.record_error(latency_ms);
        } else {
            state.stats.record_success(latency_ms);
        }
        // Published under the lock so stats events arrive in counter order
        self.inner.events.publish(Event::Stats(state.stats));
    }
}
