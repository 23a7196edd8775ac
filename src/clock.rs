//! Logical clock used to stamp synthesized tombstones.

use std::sync::atomic::{AtomicU64, Ordering};

/// A process-wide monotonic version generator.
///
/// [`tick`](Self::tick) draws values strictly greater than every version the
/// clock has witnessed, so a tombstone stamped from it outranks every copy of
/// the file previously seen from any node. Engines sharing a store must share
/// one clock.
#[derive(Debug, Default)]
pub struct LamportClock {
    now: AtomicU64,
}

impl LamportClock {
    /// Creates a clock that has witnessed nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds an observed version into the clock.
    pub fn witness(&self, version: u64) {
        self.now.fetch_max(version, Ordering::SeqCst);
    }

    /// Draws a version strictly greater than everything witnessed so far.
    pub fn tick(&self) -> u64 {
        self.now.fetch_add(1, Ordering::SeqCst) + 1
    }
}
