//! Session byte and stream counters.
//!
//! Counters are written from relay tasks and read from the stats reporter
//! and host getters without locks. Byte totals only grow during a session;
//! they reset when a new session starts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Per-session transfer counters.
#[derive(Debug, Default)]
pub struct TunnelMetrics {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    active_streams: AtomicU64,
}

impl TunnelMetrics {
    /// Create a zeroed counter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes received from upstream.
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    /// Total bytes sent upstream.
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    /// Number of relays currently running.
    pub fn active_streams(&self) -> u64 {
        self.active_streams.load(Ordering::Relaxed)
    }

    /// Add to the received-byte counter.
    pub fn add_bytes_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    /// Add to the sent-byte counter.
    pub fn add_bytes_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }

    /// Snapshot (bytes_in, bytes_out) for a stats tick.
    pub fn snapshot(&self) -> (u64, u64) {
        (self.bytes_in(), self.bytes_out())
    }

    /// Zero every counter at session start.
    pub fn reset(&self) {
        self.bytes_in.store(0, Ordering::Relaxed);
        self.bytes_out.store(0, Ordering::Relaxed);
        self.active_streams.store(0, Ordering::Relaxed);
    }

    /// Count one relay for the lifetime of the returned guard.
    ///
    /// The decrement lives in `Drop`, so it runs on every exit path out of
    /// the relay, panics included.
    pub fn stream_guard(self: &Arc<Self>) -> StreamGuard {
        self.active_streams.fetch_add(1, Ordering::Relaxed);
        StreamGuard {
            metrics: Arc::clone(self),
        }
    }
}

/// RAII guard pairing one increment of `active_streams` with one decrement.
pub struct StreamGuard {
    metrics: Arc<TunnelMetrics>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.metrics.active_streams.fetch_sub(1, Ordering::Relaxed);
    }
}
