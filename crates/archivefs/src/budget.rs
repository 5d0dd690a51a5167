//! Session memory accounting.
//!
//! Every extraction session declares a fixed-size reservation before it
//! drives the decoder and gives it back when it ends, whatever the outcome.
//! The reservation is a guard, so early returns, errors and cancellation all
//! release it on drop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Process-wide tally of memory declared by running sessions.
#[derive(Debug, Default)]
pub struct ResourceManager {
    reserved: AtomicU64,
    peak: AtomicU64,
    reservations: AtomicU64,
}

impl ResourceManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Declares `bytes` for the lifetime of the returned guard.
    pub fn reserve(self: &Arc<Self>, bytes: u64) -> Reservation {
        let now = self.reserved.fetch_add(bytes, Ordering::SeqCst) + bytes;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.reservations.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(bytes, reserved = now, "session memory reserved");
        Reservation {
            manager: Arc::clone(self),
            bytes,
        }
    }

    /// Bytes currently declared by live reservations.
    pub fn reserved(&self) -> u64 {
        self.reserved.load(Ordering::SeqCst)
    }

    /// Highest simultaneous reservation seen so far.
    pub fn peak(&self) -> u64 {
        self.peak.load(Ordering::SeqCst)
    }

    /// Number of reservations ever taken.
    pub fn total_reservations(&self) -> u64 {
        self.reservations.load(Ordering::Relaxed)
    }
}

/// Scoped reservation; released when dropped.
#[derive(Debug)]
pub struct Reservation {
    manager: Arc<ResourceManager>,
    bytes: u64,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let before = self.manager.reserved.fetch_sub(self.bytes, Ordering::SeqCst);
        tracing::trace!(
            bytes = self.bytes,
            reserved = before - self.bytes,
            "session memory released"
        );
    }
}
