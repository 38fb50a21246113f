//! Monitoring counter registry.
//!
//! Counters are accumulated by every pipeline stage and periodically
//! snapshot-and-reset by the monitoring loop. `reset()` swaps the whole map
//! so concurrent increments during emission land in the next window.

use std::collections::HashMap;

use parking_lot::Mutex;

pub const BYTES_IN: &str = "bytes_in";
pub const BYTES_OUT: &str = "bytes_out";
pub const UDP_RECEIVED: &str = "udp_received";
pub const UDP_DROPPED: &str = "udp_dropped";
pub const MESSAGES_RECEIVED: &str = "messages_received";
pub const MESSAGES_DROPPED: &str = "messages_dropped";
pub const METRICS_RECEIVED: &str = "metrics_received";
pub const METRICS_DROPPED: &str = "metrics_dropped";
pub const METRICS_WRITTEN: &str = "metrics_written";

/// Thread-safe named counters, monotonic between resets.
#[derive(Debug, Default)]
pub struct Stats {
    counters: Mutex<HashMap<&'static str, i64>>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `delta` to the named counter, creating it at zero if absent.
    pub fn add(&self, key: &'static str, delta: i64) {
        let mut counters = self.counters.lock();
        *counters.entry(key).or_insert(0) += delta;
    }

    /// Atomically swap the registry for an empty one and return the
    /// previous snapshot.
    pub fn reset(&self) -> HashMap<&'static str, i64> {
        std::mem::take(&mut *self.counters.lock())
    }
}
