//! Tunnel pool.
//!
//! Owns the session's live carriers and hands one out per incoming SOCKS
//! connection. Carriers are shared: the pool keeps an owning reference and
//! every in-flight relay borrows its own, so a carrier stays alive for as
//! long as any of its streams does.
//!
//! The pool does not track carrier health. A failed stream open is the
//! caller's problem; single failures may be transient and the carrier stays
//! in rotation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::carrier::Carrier;

/// An ordered collection of live carriers with round-robin selection.
#[derive(Default)]
pub struct TunnelPool {
    inner: Mutex<PoolInner>,
    cursor: AtomicUsize,
}

#[derive(Default)]
struct PoolInner {
    carriers: Vec<Arc<dyn Carrier>>,
    closed: bool,
}

impl TunnelPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a carrier to the live set.
    ///
    /// Adding to a closed pool closes the carrier immediately instead.
    pub fn add(&self, carrier: Arc<dyn Carrier>) {
        let mut inner = self.inner.lock();
        if inner.closed {
            drop(inner);
            carrier.close();
            return;
        }
        inner.carriers.push(carrier);
    }

    /// Select one live carrier, or `None` if the pool is empty or closed.
    ///
    /// Round-robin over the current set: fair over many calls and never
    /// blocking.
    pub fn get(&self) -> Option<Arc<dyn Carrier>> {
        let inner = self.inner.lock();
        if inner.closed || inner.carriers.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % inner.carriers.len();
        Some(Arc::clone(&inner.carriers[idx]))
    }

    /// Number of carriers currently held.
    pub fn len(&self) -> usize {
        self.inner.lock().carriers.len()
    }

    /// Whether the pool holds no carriers.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark the pool closed, close every carrier, and empty the set.
    ///
    /// Idempotent: carriers are released exactly once, and later `get`
    /// calls return `None`.
    pub fn close(&self) {
        let carriers = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            std::mem::take(&mut inner.carriers)
        };
        for carrier in carriers {
            carrier.close();
        }
    }
}
