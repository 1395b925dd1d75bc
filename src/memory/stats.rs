//! Crate-wide diagnostic gauges.
//!
//! All counters use `Relaxed` ordering. Values are eventually consistent and
//! a snapshot may be transiently inconsistent across counters (a total may
//! briefly disagree with the sum of its parts). They are for display only;
//! the allocator never reads them to make a decision.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers always go through `load()`/`get()`,
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
        // Clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
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
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }
}

// Address space reserved from the OS by every allocator instance.
crate::sync::static_atomic! {
    pub static TOTAL_RESERVED: Counter = Counter::new();
}
// Memory committed (readable/writable) by every allocator instance.
crate::sync::static_atomic! {
    pub static TOTAL_COMMITTED: Counter = Counter::new();
}

// Breakdown by subsystem
crate::sync::static_atomic! {
    pub static POOL_COMMITTED: Counter = Counter::new();
}
crate::sync::static_atomic! {
    pub static LARGE_ALLOC_COMMITTED: Counter = Counter::new();
}
crate::sync::static_atomic! {
    pub static METADATA_COMMITTED: Counter = Counter::new();
}

/// Record a reserve-and-commit of `bytes` against `subsystem`.
#[inline]
pub(crate) fn on_map(subsystem: &Counter, bytes: usize) {
    TOTAL_RESERVED.add(bytes);
    TOTAL_COMMITTED.add(bytes);
    subsystem.add(bytes);
}

/// Record the release of a region previously counted by [`on_map`].
#[inline]
pub(crate) fn on_unmap(subsystem: &Counter, bytes: usize) {
    TOTAL_RESERVED.sub(bytes);
    TOTAL_COMMITTED.sub(bytes);
    subsystem.sub(bytes);
}

/// Point-in-time copy of the crate-wide gauges.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub total_reserved: usize,
    pub total_committed: usize,
    pub pool_committed: usize,
    pub large_alloc_committed: usize,
    pub metadata_committed: usize,
}

impl MemoryStats {
    #[must_use]
    pub fn snapshot() -> Self {
        Self {
            total_reserved: TOTAL_RESERVED.get(),
            total_committed: TOTAL_COMMITTED.get(),
            pool_committed: POOL_COMMITTED.get(),
            large_alloc_committed: LARGE_ALLOC_COMMITTED.get(),
            metadata_committed: METADATA_COMMITTED.get(),
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_counter_clamps_negative() {
        let c = Counter::new();
        c.sub(10);
        assert_eq!(c.get(), 0);
        c.add(15);
        assert_eq!(c.get(), 5);
    }

    #[test]
    fn test_counter_clamps_huge_delta() {
        let c = Counter::new();
        c.add(usize::MAX);
        assert_eq!(c.get(), isize::MAX.cast_unsigned());
    }

    #[test]
    fn test_map_unmap_balance() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let before = MemoryStats::snapshot();

        on_map(&LARGE_ALLOC_COMMITTED, 8192);
        let during = MemoryStats::snapshot();
        assert_eq!(during.total_reserved, before.total_reserved + 8192);
        assert_eq!(during.total_committed, before.total_committed + 8192);
        assert_eq!(during.large_alloc_committed, before.large_alloc_committed + 8192);

        on_unmap(&LARGE_ALLOC_COMMITTED, 8192);
        assert_eq!(MemoryStats::snapshot(), before);
    }
}
