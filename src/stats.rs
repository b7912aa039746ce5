//! Allocation statistics counters.
//!
//! All counters use `Relaxed` ordering — they are observational only and
//! never used for synchronization. Individual counter loads are atomic but
//! a [`Snapshot`] is not globally consistent across counters; for
//! monitoring purposes this is always sufficient.

use core::sync::atomic::{AtomicU64, Ordering};

pub(crate) struct Stats {
    // ---- Facade ----
    /// Total allocation calls with size > 0.
    pub alloc_count: AtomicU64,
    /// Total deallocation calls with a non-null pointer.
    pub free_count: AtomicU64,
    /// Total reallocation calls.
    pub realloc_count: AtomicU64,

    // ---- Cross-thread traffic ----
    /// Blocks freed by a thread other than the page owner.
    pub thread_free_count: AtomicU64,
    /// Times an owner drained a page's cross-thread free list.
    pub thread_free_adopt_count: AtomicU64,

    // ---- Pages, spans, heaps ----
    /// Pages reinitialized from a heap's free lists.
    pub page_recycle_count: AtomicU64,
    /// Spans mapped from the OS.
    pub span_map_count: AtomicU64,
    /// Huge allocations mapped directly from the OS.
    pub huge_alloc_count: AtomicU64,
    /// Heaps reused from the global free queue.
    pub heap_recycle_count: AtomicU64,
    /// Bytes requested from the OS map interface.
    pub os_map_bytes: AtomicU64,
}

impl Stats {
    const fn new() -> Self {
        Self {
            alloc_count: AtomicU64::new(0),
            free_count: AtomicU64::new(0),
            realloc_count: AtomicU64::new(0),
            thread_free_count: AtomicU64::new(0),
            thread_free_adopt_count: AtomicU64::new(0),
            page_recycle_count: AtomicU64::new(0),
            span_map_count: AtomicU64::new(0),
            huge_alloc_count: AtomicU64::new(0),
            heap_recycle_count: AtomicU64::new(0),
            os_map_bytes: AtomicU64::new(0),
        }
    }
}

pub(crate) static STATS: Stats = Stats::new();

/// A point-in-time snapshot of the allocation statistics.
///
/// Obtain one with [`snapshot()`].
#[derive(Clone, Copy, Debug, Default)]
pub struct Snapshot {
    /// Total allocation calls with size > 0.
    pub alloc_count: u64,
    /// Total deallocation calls with a non-null pointer.
    pub free_count: u64,
    /// Total reallocation calls.
    pub realloc_count: u64,
    /// Blocks freed by a thread other than the page owner.
    pub thread_free_count: u64,
    /// Times an owner drained a page's cross-thread free list.
    pub thread_free_adopt_count: u64,
    /// Pages reinitialized from a heap's free lists.
    pub page_recycle_count: u64,
    /// Spans mapped from the OS.
    pub span_map_count: u64,
    /// Huge allocations mapped directly from the OS.
    pub huge_alloc_count: u64,
    /// Heaps reused from the global free queue.
    pub heap_recycle_count: u64,
    /// Bytes requested from the OS map interface.
    pub os_map_bytes: u64,
}

/// Load all counters with `Relaxed` ordering.
pub fn snapshot() -> Snapshot {
    let s = &STATS;
    Snapshot {
        alloc_count: s.alloc_count.load(Ordering::Relaxed),
        free_count: s.free_count.load(Ordering::Relaxed),
        realloc_count: s.realloc_count.load(Ordering::Relaxed),
        thread_free_count: s.thread_free_count.load(Ordering::Relaxed),
        thread_free_adopt_count: s.thread_free_adopt_count.load(Ordering::Relaxed),
        page_recycle_count: s.page_recycle_count.load(Ordering::Relaxed),
        span_map_count: s.span_map_count.load(Ordering::Relaxed),
        huge_alloc_count: s.huge_alloc_count.load(Ordering::Relaxed),
        heap_recycle_count: s.heap_recycle_count.load(Ordering::Relaxed),
        os_map_bytes: s.os_map_bytes.load(Ordering::Relaxed),
    }
}
