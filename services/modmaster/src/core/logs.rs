//! Bounded in-memory log of traffic and lifecycle messages

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Origin of a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Request sent to the device
    Tx,
    /// Response received from the device
    Rx,
    Err,
    /// Lifecycle and status messages
    Sys,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Tx => "tx",
            Direction::Rx => "rx",
            Direction::Err => "err",
            Direction::Sys => "sys",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub time: DateTime<Utc>,
    pub direction: Direction,
    pub message: String,
}

impl LogEntry {
    pub fn new(direction: Direction, message: impl Into<String>) -> Self {
        Self {
            time: Utc::now(),
            direction,
            message: message.into(),
        }
    }
}

/// Fixed-capacity FIFO of [`LogEntry`]
///
/// When full, the oldest entry is evicted. A capacity of zero drops everything.
#[derive(Debug)]
pub struct LogBuffer {
    entries: Mutex<Vec<LogEntry>>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn add(&self, entry: LogEntry) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            // Shift left and overwrite the last slot; storage never grows
            entries.rotate_left(1);
            if let Some(last) = entries.last_mut() {
                *last = entry;
            }
            return;
        }
        entries.push(entry);
    }

    /// Copy of the current contents, oldest first
    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
