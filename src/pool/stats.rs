//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent (e.g., reserved bytes may briefly disagree with the chunk
//! count times the chunk size). This is acceptable for diagnostic display.
//! Do NOT use these values for allocation decisions.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers should always use `load()`/`get()`,
/// which clamp negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize) as isize
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    #[allow(dead_code)]
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0) as usize
    }
}

// Total bytes of chunk memory reserved by live arenas
crate::sync::static_atomic! {
    pub static CHUNK_BYTES_RESERVED: Counter = Counter::new();
}
// Number of chunks currently held by live arenas
crate::sync::static_atomic! {
    pub static CHUNKS_LIVE: Counter = Counter::new();
}
// Number of outstanding allocations (runs and subpage cells)
crate::sync::static_atomic! {
    pub static ALLOCATIONS_LIVE: Counter = Counter::new();
}

/// Best-effort subtract from a diagnostic atomic counter.
///
/// Uses a single atomic subtraction (no TOCTOU load-then-subtract race).
/// Readers clamp negative transients via `Counter::load`.
pub fn sub_saturating(counter: &Counter, val: usize) {
    counter.sub(val);
}

/// Point-in-time snapshot of the global gauges plus one arena's view of its
/// own chunks. The global fields aggregate every live arena in the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub chunk_bytes_reserved: usize,
    pub chunks_live: usize,
    pub allocations_live: usize,
    /// Sum of `free_bytes` across the owning arena's chunks.
    pub arena_free_bytes: usize,
    /// Number of chunks owned by the arena that produced this snapshot.
    pub arena_chunks: usize,
}
