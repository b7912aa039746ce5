//! Per-thread heap: maps size classes to pages, recycles free pages and
//! claims new spans.
//!
//! Each heap is mutated only by its owning thread, with two exceptions:
//! the per-tier `page_free_thread` stacks, which any thread may CAS pages
//! onto, and the global registry below. Retired heaps go onto a global
//! queue guarded by a spinlock whose word holds the current holder's
//! thread id; new threads pop from the queue before mapping a fresh heap.

use core::cell::UnsafeCell;
use core::mem::size_of;
use core::ptr::{self, null_mut};
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::page::{Block, FLAG_DECOMMITTED, FLAG_FULL, FLAG_ZERO, Page};
use crate::size_class::{self, PageTier, SIZE_CLASS_COUNT, SIZE_CLASSES, TINY_SIZE_LIMIT};
use crate::span::Span;
use crate::sync::{SpinLock, SpinMutex, thread_id};
use crate::{MAX_ALIGNMENT, SMALL_GRANULARITY, SPAN_HEADER_SIZE, SPAN_SIZE, platform};
use crate::{stat_add, stat_inc};

/// Reallocation flag: do not copy old contents into the new block.
pub const NO_PRESERVE: u32 = 1;
/// Reallocation flag: fail instead of relocating the block.
pub const GROW_OR_FAIL: u32 = 2;

/// Owner id of the shared fallback heap. Never matches a real thread, so
/// every free of a fallback-owned block takes the cross-thread path and
/// stays sound without any thread-local state.
pub(crate) const SHARED_OWNER: usize = usize::MAX;

/// Per-thread heap control structure.
#[repr(C)]
pub struct Heap {
    /// Owning thread id.
    pub owner_thread: usize,
    /// Fast-track free lists for each size class, fed by draining a page's
    /// local free list after a miss.
    pub local_free: [*mut Block; SIZE_CLASS_COUNT],
    /// Available non-full pages for each size class.
    pub page_available: [*mut Page; SIZE_CLASS_COUNT],
    /// Recycled free pages for each page tier.
    pub page_free: [*mut Page; 3],
    /// Pages returned by other threads, one lock-free stack per tier.
    pub page_free_thread: [AtomicUsize; 3],
    /// Partially carved spans for each page tier.
    pub span_partial: [*mut Span; 3],
    /// Fully carved spans for each page tier.
    pub span_used: [*mut Span; 3],
    /// Next heap in the global free queue.
    pub next: *mut Heap,
    /// Heap id, for diagnostics.
    pub id: u32,
    /// Memory map region offset.
    pub offset: u32,
    /// Memory map size.
    pub mapped_size: usize,
}

impl Heap {
    const fn new_with_owner(owner_thread: usize) -> Self {
        Self {
            owner_thread,
            local_free: [null_mut(); SIZE_CLASS_COUNT],
            page_available: [null_mut(); SIZE_CLASS_COUNT],
            page_free: [null_mut(); 3],
            page_free_thread: [const { AtomicUsize::new(0) }; 3],
            span_partial: [null_mut(); 3],
            span_used: [null_mut(); 3],
            next: null_mut(),
            id: 0,
            offset: 0,
            mapped_size: 0,
        }
    }
}

struct SharedHeap(UnsafeCell<Heap>);

// SAFETY: the fallback heap is only mutated under FALLBACK_LOCK, and its
// pages carry SHARED_OWNER so frees never mutate it directly.
unsafe impl Sync for SharedHeap {}

/// Shared fallback heap, used when no thread-local heap is available.
static FALLBACK: SharedHeap = SharedHeap(UnsafeCell::new(Heap::new_with_owner(SHARED_OWNER)));

/// Serializes every operation on the fallback heap.
pub(crate) static FALLBACK_LOCK: SpinLock = SpinLock::new();

#[inline]
pub(crate) fn fallback_heap() -> *mut Heap {
    FALLBACK.0.get()
}

struct HeapQueue {
    head: *mut Heap,
}

// SAFETY: the queue owns retired heaps outright; the raw pointer is only
// followed under the queue's lock.
unsafe impl Send for HeapQueue {}

/// Free-heap queue; retired thread heaps wait here for reuse.
static HEAP_QUEUE: SpinMutex<HeapQueue> = SpinMutex::new(HeapQueue { head: null_mut() });

/// Monotonic heap id counter.
static HEAP_ID: AtomicU32 = AtomicU32::new(0);

/// Acquire a heap for the calling thread: recycle one from the global
/// queue, or map a fresh one. Returns null only when the OS refuses memory.
pub fn heap_allocate() -> *mut Heap {
    platform::initialize();
    let mut heap = {
        let mut queue = HEAP_QUEUE.lock();
        let heap = queue.head;
        if !heap.is_null() {
            queue.head = unsafe { (*heap).next };
        }
        heap
    };
    if heap.is_null() {
        heap = heap_allocate_new();
    } else {
        stat_inc!(heap_recycle_count);
    }
    if !heap.is_null() {
        unsafe {
            (*heap).next = null_mut();
            // A recycled heap keeps its pages and spans; a fresh thread just
            // rebinds the owner.
            (*heap).owner_thread = thread_id();
        }
    }
    heap
}

fn heap_allocate_new() -> *mut Heap {
    let heap_size = platform::page_aligned_size(size_of::<Heap>());
    let mapping = match unsafe { platform::map(heap_size, 0) } {
        Some(mapping) => mapping,
        None => return null_mut(),
    };
    stat_add!(os_map_bytes, mapping.mapped_size as u64);
    let heap = mapping.ptr as *mut Heap;
    unsafe {
        ptr::write_bytes(heap as *mut u8, 0, size_of::<Heap>());
        (*heap).id = 1 + HEAP_ID.fetch_add(1, Ordering::Relaxed);
        (*heap).offset = mapping.offset;
        (*heap).mapped_size = mapping.mapped_size;
    }
    heap
}

/// Retire a heap to the global free queue. Its pages stay in place; the
/// next thread that pops it rebinds the owner id.
///
/// # Safety
/// The calling thread must own `heap` and must not use it afterwards.
pub unsafe fn heap_release(heap: *mut Heap) {
    let mut queue = HEAP_QUEUE.lock();
    unsafe { (*heap).next = queue.head };
    queue.head = heap;
}

/// Reinitialize a recycled page for a size class and link it into the
/// heap's available list.
unsafe fn make_free_page_available(heap: *mut Heap, size_class: u32, page: *mut Page) {
    unsafe {
        debug_assert_eq!((*page).heap, heap);
        let class = &SIZE_CLASSES[size_class as usize];
        (*page).size_class = size_class;
        (*page).block_size = class.block_size;
        (*page).block_count = class.block_count;
        (*page).block_used = 0;
        (*page).block_initialized = 0;
        (*page).local_free = null_mut();
        (*page).local_free_count = 0;
        // Everything except the decommit bit resets; in particular the zero
        // bit, since a recycled page's contents are unknown.
        (*page).flags &= FLAG_DECOMMITTED;
        (*page).owner_thread = (*heap).owner_thread;
        let head = (*heap).page_available[size_class as usize];
        (*page).next = head;
        (*page).prev = null_mut();
        (*page).thread_free.store(0, Ordering::Relaxed);
        if !head.is_null() {
            (*head).prev = page;
        }
        (*heap).page_available[size_class as usize] = page;
        if (*page).is_decommitted() {
            Page::commit_tail(page);
            // Recommitted OS pages come back zeroed; zero the remainder of
            // the header page by hand so zeroing allocations can skip the
            // memset again.
            let first_page = (page as *mut u8).add(crate::PAGE_HEADER_SIZE);
            ptr::write_bytes(first_page, 0, platform::os_page_size() - crate::PAGE_HEADER_SIZE);
            (*page).flags |= FLAG_ZERO;
        }
        stat_inc!(page_recycle_count);
    }
}

/// Find or map a span for the given page tier.
unsafe fn get_span(heap: *mut Heap, tier: PageTier) -> *mut Span {
    unsafe {
        let tier_index = tier as usize;
        let span = (*heap).span_partial[tier_index];
        if !span.is_null() {
            return span;
        }

        let mapping = match platform::map(SPAN_SIZE, SPAN_SIZE) {
            Some(mapping) => mapping,
            None => return null_mut(),
        };
        stat_inc!(span_map_count);
        stat_add!(os_map_bytes, mapping.mapped_size as u64);
        let span = mapping.ptr as *mut Span;
        (*span).tier = tier;
        (*span).page.heap = heap;
        (*span).page.owner_thread = (*heap).owner_thread;
        (*span).page_count = tier.pages_per_span();
        (*span).page_size = tier.page_size() as u32;
        (*span).page_size_shift = tier.page_size_shift();
        (*span).offset = mapping.offset;
        (*span).mapped_size = mapping.mapped_size as u64;

        (*heap).span_partial[tier_index] = span;
        span
    }
}

/// Find or create a page with capacity for the given size class.
///
/// Priority: current available page, locally recycled free page, pages
/// returned by other threads (whole stack stolen with one swap), then a
/// fresh page carved from a span.
pub(crate) unsafe fn get_page(heap: *mut Heap, size_class: u32) -> *mut Page {
    unsafe {
        let page = (*heap).page_available[size_class as usize];
        if !page.is_null() {
            return page;
        }

        let tier = size_class::tier_of(size_class);
        let tier_index = tier as usize;
        let page = (*heap).page_free[tier_index];
        if !page.is_null() {
            (*heap).page_free[tier_index] = (*page).next;
            make_free_page_available(heap, size_class, page);
            return page;
        }

        let stolen = (*heap).page_free_thread[tier_index].swap(0, Ordering::Acquire);
        if stolen != 0 {
            let page = stolen as *mut Page;
            (*heap).page_free[tier_index] = (*page).next;
            make_free_page_available(heap, size_class, page);
            return page;
        }

        let span = get_span(heap, tier);
        if !span.is_null() {
            let page = Span::next_page(span);
            make_free_page_available(heap, size_class, page);
            return page;
        }

        null_mut()
    }
}

/// Pop a block from the heap's per-class fast list.
#[inline]
unsafe fn pop_local_free(heap: *mut Heap, size_class: u32) -> *mut Block {
    unsafe {
        let block = (*heap).local_free[size_class as usize];
        if !block.is_null() {
            (*heap).local_free[size_class as usize] = (*block).next;
        }
        block
    }
}

unsafe fn allocate_from_page(heap: *mut Heap, size_class: u32, zero: bool) -> *mut u8 {
    unsafe {
        let page = get_page(heap, size_class);
        if page.is_null() {
            return null_mut();
        }
        Page::allocate_block(page, zero)
    }
}

/// Allocate a block of at most [`TINY_SIZE_LIMIT`] bytes.
///
/// # Safety
/// The calling thread must own `heap` (or hold the fallback lock).
#[inline]
pub unsafe fn allocate_tiny(heap: *mut Heap, size: usize, zero: bool) -> *mut u8 {
    unsafe {
        let size_class = size_class::size_to_class_tiny(size);
        let block = pop_local_free(heap, size_class);
        if !block.is_null() {
            if zero {
                ptr::write_bytes(block as *mut u8, 0, size_class::class_to_size(size_class));
            }
            return block as *mut u8;
        }
        allocate_from_page(heap, size_class, zero)
    }
}

/// Allocate a block of the given size, routing to the tiny, size-classed
/// or huge path.
///
/// # Safety
/// The calling thread must own `heap` (or hold the fallback lock).
pub unsafe fn allocate_block(heap: *mut Heap, size: usize, zero: bool) -> *mut u8 {
    unsafe {
        if size <= TINY_SIZE_LIMIT {
            return allocate_tiny(heap, size, zero);
        }
        let size_class = size_class::size_to_class(size);
        if (size_class as usize) < SIZE_CLASS_COUNT {
            let block = pop_local_free(heap, size_class);
            if !block.is_null() {
                if zero {
                    ptr::write_bytes(block as *mut u8, 0, size_class::class_to_size(size_class));
                }
                return block as *mut u8;
            }
            return allocate_from_page(heap, size_class, zero);
        }
        // Huge blocks come straight from the OS, already zeroed.
        allocate_huge(size)
    }
}

/// Map a huge allocation: a one-off span with a single oversized block.
unsafe fn allocate_huge(size: usize) -> *mut u8 {
    unsafe {
        // The span header records the user size in 32 bits.
        if size >= crate::MAX_ALLOC_SIZE {
            return null_mut();
        }
        let alloc_size = platform::page_aligned_size(size + SPAN_HEADER_SIZE);
        let mapping = match platform::map(alloc_size, SPAN_SIZE) {
            Some(mapping) => mapping,
            None => return null_mut(),
        };
        stat_inc!(huge_alloc_count);
        stat_add!(os_map_bytes, mapping.mapped_size as u64);
        let span = mapping.ptr as *mut Span;
        (*span).tier = PageTier::Huge;
        (*span).page.tier = PageTier::Huge;
        (*span).page_size = size as u32;
        (*span).page_size_shift = 0;
        (*span).offset = mapping.offset;
        (*span).mapped_size = mapping.mapped_size as u64;
        (*span).page.flags |= FLAG_FULL;
        mapping.ptr.add(SPAN_HEADER_SIZE)
    }
}

/// Allocate a block whose address is a multiple of `alignment`.
///
/// Alignments up to the block granularity come for free. Larger ones
/// over-allocate by `alignment` and round the result up, marking the page
/// so deallocation can recover the block origin.
///
/// # Safety
/// The calling thread must own `heap` (or hold the fallback lock).
/// `alignment` must be a power of two below [`MAX_ALIGNMENT`] and
/// `size + alignment` must not overflow (the facade validates both).
pub unsafe fn allocate_aligned(
    heap: *mut Heap,
    alignment: usize,
    size: usize,
    zero: bool,
) -> *mut u8 {
    unsafe {
        if alignment <= SMALL_GRANULARITY {
            return allocate_block(heap, size, zero);
        }
        debug_assert!(alignment.is_power_of_two());
        if alignment >= MAX_ALIGNMENT {
            return null_mut();
        }

        let align_mask = alignment - 1;
        let block = allocate_block(heap, size + alignment, zero);
        if block.is_null() {
            return null_mut();
        }
        if (block as usize) & align_mask != 0 {
            let aligned = (((block as usize) & !align_mask) + alignment) as *mut u8;
            let span = Span::from_block(aligned);
            // Huge spans need no marking: free and realloc recover the
            // mapping from the span header alone.
            if (*span).tier != PageTier::Huge {
                let page = (*span).page_of(aligned);
                (*page).flags |= crate::page::FLAG_ALIGNED;
            }
            return aligned;
        }
        block
    }
}

/// Free a block from any thread: mask to the span, shift to the page, and
/// free locally or through the cross-thread token. Huge blocks unmap the
/// whole reservation immediately.
///
/// # Safety
/// `block` must have been returned by this allocator and not freed since.
pub unsafe fn block_deallocate(block: *mut u8) {
    unsafe {
        let span = Span::from_block(block);
        if (*span).tier != PageTier::Huge {
            let page = (*span).page_of(block);
            Page::deallocate_block(page, block as *mut Block);
        } else {
            platform::unmap(
                span as *mut u8,
                (*span).offset,
                (*span).mapped_size as usize,
            );
        }
    }
}

/// Usable bytes from the given address to the end of its block (or of its
/// huge mapping).
///
/// # Safety
/// `block` must point into a live allocation from this allocator.
pub unsafe fn block_usable_size(block: *mut u8) -> usize {
    unsafe {
        let span = Span::from_block(block);
        if (*span).tier != PageTier::Huge {
            let page = (*span).page_of(block);
            let blocks_start = (*page).block_start() as usize;
            let block_size = (*page).block_size as usize;
            block_size - ((block as usize - blocks_start) % block_size)
        } else {
            let reserved = (*span).mapped_size as usize - (*span).offset as usize;
            reserved - (block as usize - span as usize)
        }
    }
}

/// Reallocate a block, in place when the new size fits its capacity.
///
/// Growth overallocates by 3/8 of the old size when the increase is small,
/// to damp repeated grow-copy cycles. `GROW_OR_FAIL` returns null instead
/// of relocating; `NO_PRESERVE` skips all copying.
///
/// # Safety
/// The calling thread must own `heap` (or hold the fallback lock), and
/// `block` must be null or a live allocation from this allocator.
pub unsafe fn reallocate(
    heap: *mut Heap,
    block: *mut u8,
    size: usize,
    old_size: usize,
    flags: u32,
) -> *mut u8 {
    unsafe {
        let mut old_size = old_size;
        if !block.is_null() {
            let span = Span::from_block(block);
            if (*span).tier != PageTier::Huge {
                let page = (*span).page_of(block);
                let blocks_start = (*page).block_start() as usize;
                let block_size = (*page).block_size as usize;
                let block_index = (block as usize - blocks_start) / block_size;
                let block_origin = (blocks_start + block_index * block_size) as *mut u8;
                if old_size == 0 {
                    old_size = block_size - (block as usize - block_origin as usize);
                }
                if block_size >= size {
                    // Still fits; preserve data if the pointer was
                    // alignment-shifted inside the block.
                    if block != block_origin && flags & NO_PRESERVE == 0 {
                        ptr::copy(block, block_origin, old_size);
                    }
                    return block_origin;
                }
            } else {
                let block_start = (span as *mut u8).add(SPAN_HEADER_SIZE);
                if old_size == 0 {
                    old_size = (*span).page_size as usize;
                }
                let reserved = (*span).mapped_size as usize - (*span).offset as usize;
                if size <= reserved - SPAN_HEADER_SIZE && size < crate::MAX_ALLOC_SIZE {
                    if block_start != block && flags & NO_PRESERVE == 0 {
                        ptr::copy(block, block_start, old_size);
                    }
                    (*span).page_size = size as u32;
                    return block_start;
                }
            }
        } else {
            old_size = 0;
        }

        if flags & GROW_OR_FAIL != 0 {
            return null_mut();
        }

        // Avoid hysteresis by overallocating when the increase is small
        // (below 37.5%).
        let lower_bound = old_size + (old_size >> 2) + (old_size >> 3);
        let new_size = if size > lower_bound {
            size
        } else if size > old_size {
            lower_bound
        } else {
            size
        };
        let old_block = block;
        let block = allocate_block(heap, new_size, false);
        if !block.is_null() && !old_block.is_null() {
            if flags & NO_PRESERVE == 0 {
                ptr::copy_nonoverlapping(old_block, block, old_size.min(new_size));
            }
            block_deallocate(old_block);
        }
        block
    }
}

/// Reallocate with an alignment requirement.
///
/// # Safety
/// Same contract as [`reallocate`]; `alignment` must be a power of two
/// below [`MAX_ALIGNMENT`].
pub unsafe fn reallocate_aligned(
    heap: *mut Heap,
    block: *mut u8,
    alignment: usize,
    size: usize,
    old_size: usize,
    flags: u32,
) -> *mut u8 {
    unsafe {
        if alignment <= SMALL_GRANULARITY {
            return reallocate(heap, block, size, old_size, flags);
        }

        let no_alloc = flags & GROW_OR_FAIL != 0;
        let usable_size = if block.is_null() {
            0
        } else {
            block_usable_size(block)
        };
        if usable_size >= size && (block as usize) & (alignment - 1) == 0 {
            // Keep the block when it already fits, unless shrinking would
            // waste more than half of it.
            if no_alloc || size >= usable_size / 2 {
                return block;
            }
        }
        let old_block = block;
        let block = if no_alloc {
            null_mut()
        } else {
            allocate_aligned(heap, alignment, size, false)
        };
        if !block.is_null() && !old_block.is_null() {
            if flags & NO_PRESERVE == 0 {
                let old_size = if old_size != 0 { old_size } else { usable_size };
                ptr::copy_nonoverlapping(old_block, block, old_size.min(size));
            }
            block_deallocate(old_block);
        }
        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::thread_free_decode;
    use alloc::vec::Vec;

    fn make_heap() -> *mut Heap {
        let heap = heap_allocate();
        assert!(!heap.is_null());
        heap
    }

    /// Accounting invariant for a quiescent page, counting blocks parked in
    /// the heap's fast list as used.
    unsafe fn check_page_accounting(page: *mut Page) {
        unsafe {
            let (_, thread_free_count) =
                thread_free_decode((*page).thread_free.load(Ordering::Relaxed));
            let total = (*page).block_used
                + (*page).local_free_count
                + ((*page).block_count - (*page).block_initialized)
                + thread_free_count;
            assert_eq!(total, (*page).block_count, "page accounting out of sync");
        }
    }

    #[test]
    fn test_allocate_and_free_roundtrip() {
        unsafe {
            let heap = make_heap();
            // 2048-byte blocks skip the pre-link batch, so the page's local
            // free list is the only cache and a freed block comes straight
            // back on the next allocation.
            let block = allocate_block(heap, 2048, false);
            assert!(!block.is_null());
            assert!(block_usable_size(block) >= 2048);
            block.write_bytes(0xAB, 2048);
            block_deallocate(block);

            let again = allocate_block(heap, 2048, false);
            assert_eq!(again, block);
            block_deallocate(again);
        }
    }

    #[test]
    fn test_usable_size_within_next_class() {
        unsafe {
            let heap = make_heap();
            for size in [8usize, 16, 24, 32, 64, 128, 4096] {
                let block = allocate_block(heap, size, false);
                assert!(!block.is_null());
                let usable = block_usable_size(block);
                assert!(usable >= size);
                let class = size_class::size_to_class(size);
                assert_eq!(usable, size_class::class_to_size(class));
                block_deallocate(block);
            }
        }
    }

    #[test]
    fn test_span_mask_and_tier_consistency() {
        unsafe {
            let heap = make_heap();
            for (size, tier) in [
                (64usize, PageTier::Small),
                (4096, PageTier::Small),
                (4097, PageTier::Medium),
                (256 * 1024, PageTier::Medium),
                (300 * 1024, PageTier::Large),
                (8 * 1024 * 1024, PageTier::Large),
            ] {
                let block = allocate_block(heap, size, false);
                assert!(!block.is_null(), "alloc failed for size {size}");
                let span = Span::from_block(block);
                assert_eq!((span as usize) % SPAN_SIZE, 0);
                assert_eq!((*span).tier, tier);
                assert_eq!((*span).page_size as usize, tier.page_size());
                let page = (*span).page_of(block);
                assert_eq!((*page).tier, tier);
                // Block origin: offset from the blocks area is a multiple
                // of the block size.
                let offset = block as usize - ((*page).block_start() as usize);
                assert_eq!(offset % (*page).block_size as usize, 0);
                block_deallocate(block);
            }
        }
    }

    #[test]
    fn test_zeroed_allocation() {
        unsafe {
            let heap = make_heap();
            // Dirty a block, free it, then request a zeroed one of the same
            // class: it must come back clean.
            let block = allocate_block(heap, 256, false);
            block.write_bytes(0xFF, 256);
            block_deallocate(block);
            let block = allocate_block(heap, 256, true);
            for i in 0..256 {
                assert_eq!(*block.add(i), 0, "byte {i} not zeroed");
            }
            block_deallocate(block);
        }
    }

    #[test]
    fn test_page_fill_and_reuse_cycle() {
        unsafe {
            let heap = make_heap();
            // Class of 2048-byte blocks: 31 per small page, no pre-linking
            // (block size is not below half an OS page).
            let size = 2048usize;
            let class = size_class::size_to_class(size);
            let per_page = SIZE_CLASSES[class as usize].block_count as usize;

            let mut blocks = Vec::new();
            blocks.push(allocate_block(heap, size, false));
            let first_page = (*Span::from_block(blocks[0])).page_of(blocks[0]);
            for _ in 1..per_page {
                blocks.push(allocate_block(heap, size, false));
            }
            // Page is now full and detached.
            assert!((*first_page).is_full());
            assert!((*heap).page_available[class as usize] != first_page);

            // One more allocation carves a new page from the span.
            let overflow = allocate_block(heap, size, false);
            let second_page = (*Span::from_block(overflow)).page_of(overflow);
            assert_ne!(first_page, second_page);

            // Free all but one: the page returns to available and stays.
            for block in blocks.drain(1..) {
                block_deallocate(block);
            }
            assert!(!(*first_page).is_full());
            assert!(!(*first_page).is_free());
            check_page_accounting(first_page);

            // Free the last: available -> free, onto the tier free list.
            block_deallocate(blocks.pop().unwrap());
            assert!((*first_page).is_free());
            assert_eq!((*heap).page_free[PageTier::Small as usize], first_page);

            // A class-matching allocation reuses the freed page once the
            // current available page is exhausted; force it by requesting a
            // different small class.
            let other = allocate_block(heap, 3000, false);
            let other_page = (*Span::from_block(other)).page_of(other);
            assert_eq!(other_page, first_page, "free page not recycled");
            block_deallocate(other);
            block_deallocate(overflow);
        }
    }

    #[test]
    fn test_tiny_fast_list_drain() {
        unsafe {
            let heap = make_heap();
            // 128-byte blocks pre-link the rest of the OS page; the drained
            // fast list serves subsequent allocations without touching the
            // page.
            let first = allocate_block(heap, 100, false);
            let class = size_class::size_to_class(100);
            assert!(
                !(*heap).local_free[class as usize].is_null(),
                "fast list not populated"
            );
            let page = (*Span::from_block(first)).page_of(first);
            let used_before = (*page).block_used;
            let second = allocate_block(heap, 100, false);
            assert_eq!((*page).block_used, used_before, "fast path touched page");
            block_deallocate(second);
            block_deallocate(first);
        }
    }

    #[test]
    fn test_cross_thread_free_reconciles() {
        unsafe {
            let heap = make_heap();
            let size = 100usize;
            let count = 1000usize;
            let mut blocks = Vec::with_capacity(count);
            for _ in 0..count {
                let block = allocate_block(heap, size, false);
                assert!(!block.is_null());
                blocks.push(block as usize);
            }

            // Another thread frees everything: every free takes the
            // cross-thread token path.
            std::thread::spawn(move || {
                for block in blocks {
                    unsafe { block_deallocate(block as *mut u8) };
                }
            })
            .join()
            .unwrap();

            // The owner allocates the same volume again, draining adopted
            // tokens before touching fresh pages; all pointers are distinct
            // and usable.
            let mut again = Vec::with_capacity(count);
            for _ in 0..count {
                let block = allocate_block(heap, size, false);
                assert!(!block.is_null());
                block.write_bytes(0x5A, size);
                again.push(block as usize);
            }
            let mut sorted = again.clone();
            sorted.sort_unstable();
            sorted.dedup();
            assert_eq!(sorted.len(), count, "duplicate blocks handed out");

            for block in again {
                block_deallocate(block as *mut u8);
            }
        }
    }

    #[test]
    fn test_remote_saturation_returns_page() {
        unsafe {
            let heap = make_heap();
            // 4096-byte blocks: 15 per small page, no pre-linking, so a
            // full page has every block in user hands.
            let size = 4096usize;
            let class = size_class::size_to_class(size);
            let per_page = SIZE_CLASSES[class as usize].block_count as usize;

            let mut blocks = Vec::new();
            for _ in 0..per_page {
                blocks.push(allocate_block(heap, size, false) as usize);
            }
            let page = (*Span::from_block(blocks[0] as *mut u8)).page_of(blocks[0] as *mut u8);
            assert!((*page).is_full());

            // A remote thread frees every block: the token saturates and
            // the freeing thread pushes the page onto the owner's
            // cross-thread free-page stack, decommitting its tail.
            std::thread::spawn(move || {
                for block in blocks {
                    unsafe { block_deallocate(block as *mut u8) };
                }
            })
            .join()
            .unwrap();

            let stack = (*heap).page_free_thread[PageTier::Small as usize].load(Ordering::Relaxed);
            assert_eq!(stack, page as usize, "page not handed back");
            assert!((*page).is_decommitted());

            // The owner's next allocation miss for the tier steals the
            // stack, recommits and reuses the page.
            let block = allocate_block(heap, size, true);
            let reused = (*Span::from_block(block)).page_of(block);
            assert_eq!(reused, page);
            assert!(!(*page).is_decommitted());
            for i in 0..size {
                assert_eq!(*block.add(i), 0, "recycled page not zeroed");
            }
            block_deallocate(block);
        }
    }

    #[test]
    fn test_aligned_allocation_recovers_origin() {
        unsafe {
            let heap = make_heap();
            let block = allocate_aligned(heap, 4096, 100, false);
            assert!(!block.is_null());
            assert_eq!(block as usize % 4096, 0);
            let page = (*Span::from_block(block)).page_of(block);
            assert!((*page).has_aligned_block());
            block.write_bytes(0x3C, 100);

            let used_before = (*page).block_used;
            block_deallocate(block);
            assert_eq!((*page).block_used, used_before - 1, "origin not recovered");
        }
    }

    #[test]
    fn test_aligned_small_alignment_passthrough() {
        unsafe {
            let heap = make_heap();
            let block = allocate_aligned(heap, 16, 64, false);
            assert!(!block.is_null());
            assert_eq!(block as usize % 16, 0);
            block_deallocate(block);
        }
    }

    #[test]
    fn test_aligned_rejects_large_alignment() {
        unsafe {
            let heap = make_heap();
            assert!(allocate_aligned(heap, MAX_ALIGNMENT, 64, false).is_null());
            assert!(allocate_aligned(heap, MAX_ALIGNMENT * 2, 64, false).is_null());
        }
    }

    #[test]
    fn test_realloc_in_place_and_grow() {
        unsafe {
            let heap = make_heap();
            let block = allocate_block(heap, 100, false);
            block.write_bytes(0x7E, 100);

            // Shrink and modest growth stay within the 128-byte block.
            let same = reallocate(heap, block, 50, 0, 0);
            assert_eq!(same, block);
            let same = reallocate(heap, block, 128, 0, 0);
            assert_eq!(same, block);

            // Growth past the block relocates and preserves contents.
            let grown = reallocate(heap, block, 4000, 0, 0);
            assert!(!grown.is_null());
            assert_ne!(grown, block);
            for i in 0..100 {
                assert_eq!(*grown.add(i), 0x7E, "byte {i} lost in realloc");
            }
            block_deallocate(grown);
        }
    }

    #[test]
    fn test_realloc_grow_or_fail() {
        unsafe {
            let heap = make_heap();
            let block = allocate_block(heap, 100, false);
            block.write_bytes(0x11, 100);
            // Does not fit: fails without touching the old block.
            assert!(reallocate(heap, block, 4000, 0, GROW_OR_FAIL).is_null());
            for i in 0..100 {
                assert_eq!(*block.add(i), 0x11);
            }
            // Fits: succeeds in place.
            let same = reallocate(heap, block, 120, 0, GROW_OR_FAIL);
            assert_eq!(same, block);
            block_deallocate(block);
        }
    }

    #[test]
    fn test_realloc_no_preserve() {
        unsafe {
            let heap = make_heap();
            let block = allocate_block(heap, 100, false);
            block.write_bytes(0x22, 100);
            let grown = reallocate(heap, block, 5000, 0, NO_PRESERVE);
            assert!(!grown.is_null());
            assert_ne!(grown, block);
            block_deallocate(grown);
        }
    }

    #[test]
    fn test_huge_allocation() {
        unsafe {
            let heap = make_heap();
            let size = 9 * 1024 * 1024;
            let block = allocate_block(heap, size, false);
            assert!(!block.is_null());
            let span = Span::from_block(block);
            assert_eq!((*span).tier, PageTier::Huge);
            assert_eq!(block as usize, span as usize + SPAN_HEADER_SIZE);
            assert!(block_usable_size(block) >= size);

            // Touch both ends.
            *block = 0xAA;
            *block.add(size - 1) = 0xBB;
            assert_eq!(*block, 0xAA);
            assert_eq!(*block.add(size - 1), 0xBB);
            block_deallocate(block);
        }
    }

    #[test]
    fn test_huge_realloc_in_place_and_grow() {
        unsafe {
            let heap = make_heap();
            let size = 9 * 1024 * 1024;
            let block = allocate_block(heap, size, false);
            block.write_bytes(0x44, 1024);

            // Shrinking stays in place, and so does growing within the
            // mapped reservation (the span-alignment padding is real,
            // committed memory).
            let same = reallocate(heap, block, size / 2, 0, 0);
            assert_eq!(same, block);
            let same = reallocate(heap, block, 3 * size, 0, 0);
            assert_eq!(same, block);

            // Growing past the whole reservation relocates.
            let grown = reallocate(heap, block, 300 * 1024 * 1024, 0, 0);
            assert!(!grown.is_null());
            assert_ne!(grown, block);
            for i in 0..1024 {
                assert_eq!(*grown.add(i), 0x44);
            }
            block_deallocate(grown);
        }
    }

    #[test]
    fn test_heap_recycling_queue() {
        unsafe {
            let heap = make_heap();
            let id = (*heap).id;
            // Push and pop under one lock hold: concurrent tests call
            // heap_allocate and would otherwise race us for the queued heap.
            {
                let mut queue = HEAP_QUEUE.lock();
                (*heap).next = queue.head;
                queue.head = heap;

                let popped = queue.head;
                queue.head = (*popped).next;
                assert_eq!(popped, heap);
                assert_eq!((*popped).id, id);
                (*popped).next = null_mut();
            }
            // A recycled heap keeps its pages; only the owner id rebinds.
            (*heap).owner_thread = thread_id();
            assert_ne!((*heap).owner_thread, 0);
        }
    }

    #[test]
    fn test_heap_ids_monotonic() {
        let a = heap_allocate();
        let b = heap_allocate();
        unsafe {
            assert_ne!((*a).id, (*b).id);
            assert!((*a).id >= 1 && (*b).id >= 1);
        }
    }
}
