//! The host's flush event seam.

use std::sync::Arc;

use crate::snapshot::MetricsSnapshot;

/// Something that wants to see every flush.
///
/// Implementations must return quickly: the host's flush cycle waits on them.
pub trait FlushListener: Send + Sync {
    /// Called once per flush with the flush time in seconds since the epoch.
    fn on_flush(&self, timestamp: u64, metrics: &MetricsSnapshot);
}

/// A source of flush events that listeners can subscribe to.
pub trait FlushSubscriber {
    fn subscribe(&mut self, listener: Arc<dyn FlushListener>);
}

/// Minimal in-process flush event source.
///
/// Listeners are called in subscription order on the emitting thread.
#[derive(Default)]
pub struct FlushEmitter {
    listeners: Vec<Arc<dyn FlushListener>>,
}

impl FlushEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&self, timestamp: u64, metrics: &MetricsSnapshot) {
        for listener in &self.listeners {
            listener.on_flush(timestamp, metrics);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl FlushSubscriber for FlushEmitter {
    fn subscribe(&mut self, listener: Arc<dyn FlushListener>) {
        self.listeners.push(listener);
    }
}
