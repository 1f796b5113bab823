//! Event publication
//!
//! - **EventBus**: the single bounded channel the service publishes into.
//!   Publishing never blocks; events are dropped when the buffer is full.
//! - **EventHub**: optional fan-out of that channel to many subscribers
//!   (dashboard sockets, CLI watchers) over a broadcast channel.
//!
//! Consumers must tolerate gaps and treat `status`/`stats` payloads as
//! snapshots rather than deltas.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::core::logs::LogEntry;
use crate::core::read::{ConnectionStatus, ReadResult, Stats};

/// Default buffer size of the service event channel
pub const DEFAULT_EVENT_CAPACITY: usize = 32;

/// Tagged event, serialized as `{"type": ..., "payload": ...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Event {
    Data(ReadResult),
    Log(LogEntry),
    Stats(Stats),
    Status(ConnectionStatus),
    Error(ReadResult),
}

impl Event {
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::Data(_) => "data",
            Event::Log(_) => "log",
            Event::Stats(_) => "stats",
            Event::Status(_) => "status",
            Event::Error(_) => "error",
        }
    }
}

/// Bounded, drop-on-full event channel
#[derive(Debug)]
pub struct EventBus {
    sender: mpsc::Sender<Event>,
    receiver: Mutex<Option<mpsc::Receiver<Event>>>,
    dropped: AtomicU64,
}

impl EventBus {
    /// Create a bus; a zero capacity is raised to one
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
            dropped: AtomicU64::new(0),
        }
    }

    /// Publish without waiting
    pub fn publish(&self, event: Event) {
        match self.sender.try_send(event) {
            Ok(()) => {},
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                trace!(event = event.type_name(), "Event channel full, dropping");
            },
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            },
        }
    }

    /// Hand out the receiving end; only the first call gets it
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<Event>> {
        self.receiver.lock().take()
    }

    /// Number of events discarded so far
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Fan-out of a service event stream to any number of subscribers
///
/// Subscribers that fall behind skip events (`RecvError::Lagged`) instead of
/// slowing the hub down. The hub stops once the source channel closes.
#[derive(Debug)]
pub struct EventHub {
    sender: broadcast::Sender<Event>,
    task: JoinHandle<()>,
}

impl EventHub {
    /// Start forwarding `source` on the current tokio runtime
    pub fn spawn(mut source: mpsc::Receiver<Event>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        let forward = sender.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = source.recv().await {
                // No subscribers is fine; the event is simply discarded
                let _ = forward.send(event);
            }
            debug!("Event source closed, hub stopping");
        });
        Self { sender, task }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop forwarding; subscribers see the channel close
    pub fn shutdown(self) {
        self.task.abort();
    }
}
