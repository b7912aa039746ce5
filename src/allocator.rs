//! Published allocator surface: thread-local heap binding, the
//! malloc-family entry points, and the `GlobalAlloc` implementation.
//!
//! All entry points are thin adapters over the heap layer. Heap binding
//! strategy (fastest to slowest):
//! - `nightly` feature: `#[thread_local]` const-init pointer (single TLS
//!   read, no branches beyond the null check)
//! - `std` feature: `std::thread_local!` with const-init plus a cleanup
//!   guard that recycles the heap on thread exit
//! - neither: every call shares the fallback heap under its spinlock;
//!   fallback-owned pages carry a sentinel owner so frees stay lock-free
//!   and sound without any thread-local state.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::null_mut;

use crate::heap::{self, FALLBACK_LOCK, Heap, fallback_heap};
use crate::stat_inc;
use crate::{MAX_ALIGNMENT, MAX_ALLOC_SIZE, SMALL_GRANULARITY};

pub use crate::heap::{GROW_OR_FAIL, NO_PRESERVE};

/// Why the last failing call failed, kept per thread.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AllocErrorKind {
    /// Bad alignment, or a size beyond the supported maximum.
    InvalidArgument,
    /// The OS refused to map more memory.
    OutOfMemory,
}

cfg_if::cfg_if! {
    if #[cfg(feature = "nightly")] {
        #[thread_local]
        static mut LAST_ERROR: u8 = 0;

        fn set_error(kind: AllocErrorKind) {
            unsafe { *core::ptr::addr_of_mut!(LAST_ERROR) = kind as u8 + 1 };
        }

        fn error_code() -> u8 {
            unsafe { *core::ptr::addr_of!(LAST_ERROR) }
        }
    } else if #[cfg(feature = "std")] {
        std::thread_local! {
            static LAST_ERROR: core::cell::Cell<u8> = const { core::cell::Cell::new(0) };
        }

        fn set_error(kind: AllocErrorKind) {
            let _ = LAST_ERROR.try_with(|e| e.set(kind as u8 + 1));
        }

        fn error_code() -> u8 {
            LAST_ERROR.try_with(|e| e.get()).unwrap_or(0)
        }
    } else {
        use core::sync::atomic::{AtomicU8, Ordering};

        static LAST_ERROR: AtomicU8 = AtomicU8::new(0);

        fn set_error(kind: AllocErrorKind) {
            LAST_ERROR.store(kind as u8 + 1, Ordering::Relaxed);
        }

        fn error_code() -> u8 {
            LAST_ERROR.load(Ordering::Relaxed)
        }
    }
}

/// Error indicator for the calling thread: why the most recent failing
/// call failed. Not cleared by successful calls.
pub fn last_error() -> Option<AllocErrorKind> {
    match error_code() {
        1 => Some(AllocErrorKind::InvalidArgument),
        2 => Some(AllocErrorKind::OutOfMemory),
        _ => None,
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "nightly")] {
        #[thread_local]
        static mut THREAD_HEAP: *mut Heap = null_mut();

        #[inline]
        fn thread_heap() -> *mut Heap {
            let heap = unsafe { *core::ptr::addr_of!(THREAD_HEAP) };
            if !heap.is_null() {
                return heap;
            }
            thread_heap_bind()
        }

        #[cold]
        #[inline(never)]
        fn thread_heap_bind() -> *mut Heap {
            let heap = heap::heap_allocate();
            if heap.is_null() {
                // Out of memory for the heap itself; serve this call from
                // the fallback without caching, so a later call can retry.
                return fallback_heap();
            }
            // Bind BEFORE cleanup registration — if register() triggers an
            // allocation, the reentrant call finds the heap bound.
            unsafe { *core::ptr::addr_of_mut!(THREAD_HEAP) = heap };
            heap_cleanup::register();
            heap
        }

        /// Retire the calling thread's heap to the global free queue.
        /// Later allocations on this thread go through the shared fallback
        /// heap.
        pub fn thread_finalize() {
            unsafe {
                let heap = *core::ptr::addr_of!(THREAD_HEAP);
                if !heap.is_null() && heap != fallback_heap() {
                    heap::heap_release(heap);
                    *core::ptr::addr_of_mut!(THREAD_HEAP) = fallback_heap();
                }
            }
        }

        #[cfg(feature = "std")]
        mod heap_cleanup {
            struct Guard;

            impl Drop for Guard {
                fn drop(&mut self) {
                    super::thread_finalize();
                }
            }

            std::thread_local! {
                static GUARD: Guard = const { Guard };
            }

            pub(super) fn register() {
                // try_with: if std's TLS is already shutting down, skip —
                // the heap leaks rather than corrupting the queue.
                let _ = GUARD.try_with(|_| {});
            }
        }

        #[cfg(not(feature = "std"))]
        mod heap_cleanup {
            pub(super) fn register() {}
        }
    } else if #[cfg(feature = "std")] {
        std::thread_local! {
            static THREAD_HEAP: core::cell::Cell<*mut Heap> =
                const { core::cell::Cell::new(null_mut()) };
        }

        #[inline]
        fn thread_heap() -> *mut Heap {
            THREAD_HEAP
                .try_with(|cell| {
                    let heap = cell.get();
                    if !heap.is_null() {
                        return heap;
                    }
                    let heap = heap::heap_allocate();
                    if heap.is_null() {
                        return fallback_heap();
                    }
                    // Bind BEFORE cleanup registration — if register()
                    // triggers an allocation, the reentrant call finds the
                    // heap bound.
                    cell.set(heap);
                    heap_cleanup::register();
                    heap
                })
                .unwrap_or_else(|_| fallback_heap())
        }

        /// Retire the calling thread's heap to the global free queue.
        /// Later allocations on this thread go through the shared fallback
        /// heap.
        pub fn thread_finalize() {
            let _ = THREAD_HEAP.try_with(|cell| {
                let heap = cell.get();
                if !heap.is_null() && heap != fallback_heap() {
                    unsafe { heap::heap_release(heap) };
                    cell.set(fallback_heap());
                }
            });
        }

        mod heap_cleanup {
            struct Guard;

            impl Drop for Guard {
                fn drop(&mut self) {
                    super::thread_finalize();
                }
            }

            std::thread_local! {
                static GUARD: Guard = const { Guard };
            }

            pub(super) fn register() {
                // try_with: if std's TLS is already shutting down, skip —
                // the heap leaks rather than corrupting the queue.
                let _ = GUARD.try_with(|_| {});
            }
        }
    } else {
        #[inline]
        fn thread_heap() -> *mut Heap {
            fallback_heap()
        }

        /// No thread-local state to retire in this configuration.
        pub fn thread_finalize() {}
    }
}

struct FallbackGuard;

impl Drop for FallbackGuard {
    fn drop(&mut self) {
        FALLBACK_LOCK.unlock();
    }
}

/// Run an operation against the calling thread's heap. Operations on the
/// shared fallback heap are serialized by its lock.
#[inline]
fn with_heap<R>(f: impl FnOnce(*mut Heap) -> R) -> R {
    let heap = thread_heap();
    if heap == fallback_heap() {
        FALLBACK_LOCK.lock();
        let _guard = FallbackGuard;
        f(heap)
    } else {
        f(heap)
    }
}

/// Allocate `size` bytes. Returns null on failure and sets the thread's
/// error indicator.
pub fn alloc(size: usize) -> *mut u8 {
    if size >= MAX_ALLOC_SIZE {
        set_error(AllocErrorKind::InvalidArgument);
        return null_mut();
    }
    stat_inc!(alloc_count);
    let block = with_heap(|heap| unsafe { heap::allocate_block(heap, size, false) });
    if block.is_null() {
        set_error(AllocErrorKind::OutOfMemory);
    }
    block
}

/// Allocate a zero-initialized array of `num` elements of `size` bytes.
pub fn calloc(num: usize, size: usize) -> *mut u8 {
    let total = match num.checked_mul(size) {
        Some(total) if total < MAX_ALLOC_SIZE => total,
        _ => {
            set_error(AllocErrorKind::InvalidArgument);
            return null_mut();
        }
    };
    stat_inc!(alloc_count);
    let block = with_heap(|heap| unsafe { heap::allocate_block(heap, total, true) });
    if block.is_null() {
        set_error(AllocErrorKind::OutOfMemory);
    }
    block
}

/// Resize an allocation, in place when possible. A null `ptr` allocates.
pub fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    if size >= MAX_ALLOC_SIZE {
        set_error(AllocErrorKind::InvalidArgument);
        return null_mut();
    }
    stat_inc!(realloc_count);
    let block = with_heap(|heap| unsafe { heap::reallocate(heap, ptr, size, 0, 0) });
    if block.is_null() {
        set_error(AllocErrorKind::OutOfMemory);
    }
    block
}

fn validate_alignment(alignment: usize, size: usize) -> bool {
    alignment.is_power_of_two()
        && alignment < MAX_ALIGNMENT
        && size < MAX_ALLOC_SIZE
        && size.checked_add(alignment).is_some()
}

/// Allocate `size` bytes aligned to `alignment` (a power of two below
/// [`MAX_ALIGNMENT`]).
pub fn aligned_alloc(alignment: usize, size: usize) -> *mut u8 {
    if !validate_alignment(alignment, size) {
        set_error(AllocErrorKind::InvalidArgument);
        return null_mut();
    }
    stat_inc!(alloc_count);
    let block = with_heap(|heap| unsafe { heap::allocate_aligned(heap, alignment, size, false) });
    if block.is_null() {
        set_error(AllocErrorKind::OutOfMemory);
    }
    block
}

/// Resize an allocation while keeping it aligned to `alignment`.
///
/// `flags` accepts [`NO_PRESERVE`] and [`GROW_OR_FAIL`]. `old_size` is a
/// hint; pass 0 to derive it from the block.
pub fn aligned_realloc(
    ptr: *mut u8,
    alignment: usize,
    size: usize,
    old_size: usize,
    flags: u32,
) -> *mut u8 {
    if !validate_alignment(alignment, size) {
        set_error(AllocErrorKind::InvalidArgument);
        return null_mut();
    }
    stat_inc!(realloc_count);
    let block = with_heap(|heap| unsafe {
        heap::reallocate_aligned(heap, ptr, alignment, size, old_size, flags)
    });
    if block.is_null() && flags & GROW_OR_FAIL == 0 {
        set_error(AllocErrorKind::OutOfMemory);
    }
    block
}

/// Free an allocation. Null is ignored.
pub fn free(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    stat_inc!(free_count);
    unsafe { heap::block_deallocate(ptr) };
}

/// Usable bytes from `ptr` to the end of its block. Null yields 0.
pub fn usable_size(ptr: *mut u8) -> usize {
    if ptr.is_null() {
        return 0;
    }
    unsafe { heap::block_usable_size(ptr) }
}

/// Span-based thread-caching allocator.
///
/// Register as the global allocator with:
/// ```ignore
/// #[global_allocator]
/// static GLOBAL: rsmalloc::RsMalloc = rsmalloc::RsMalloc;
/// ```
pub struct RsMalloc;

unsafe impl GlobalAlloc for RsMalloc {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = layout.size();
        if size == 0 {
            return layout.align() as *mut u8;
        }
        stat_inc!(alloc_count);
        let align = layout.align();
        if align <= SMALL_GRANULARITY {
            with_heap(|heap| unsafe { heap::allocate_block(heap, size, false) })
        } else {
            with_heap(|heap| unsafe { heap::allocate_aligned(heap, align, size, false) })
        }
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if layout.size() == 0 {
            return;
        }
        stat_inc!(free_count);
        unsafe { heap::block_deallocate(ptr) };
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let size = layout.size();
        if size == 0 {
            return layout.align() as *mut u8;
        }
        stat_inc!(alloc_count);
        let align = layout.align();
        // The zero flag lets fresh or recommitted pages skip the memset.
        if align <= SMALL_GRANULARITY {
            with_heap(|heap| unsafe { heap::allocate_block(heap, size, true) })
        } else {
            with_heap(|heap| unsafe { heap::allocate_aligned(heap, align, size, true) })
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if ptr.is_null() || layout.size() == 0 {
            let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
            return unsafe { GlobalAlloc::alloc(self, new_layout) };
        }
        stat_inc!(realloc_count);
        // The true capacity comes from the span metadata, not layout.size():
        // a previous shrink may have stayed in place, leaving the caller's
        // layout smaller than the block's real size class.
        let align = layout.align();
        if align <= SMALL_GRANULARITY {
            with_heap(|heap| unsafe { heap::reallocate(heap, ptr, new_size, 0, 0) })
        } else {
            with_heap(|heap| unsafe { heap::reallocate_aligned(heap, ptr, align, new_size, 0, 0) })
        }
    }
}

#[cfg(feature = "nightly")]
unsafe impl core::alloc::Allocator for RsMalloc {
    fn allocate(
        &self,
        layout: Layout,
    ) -> Result<core::ptr::NonNull<[u8]>, core::alloc::AllocError> {
        let ptr = unsafe { GlobalAlloc::alloc(self, layout) };
        if ptr.is_null() {
            Err(core::alloc::AllocError)
        } else {
            let slice = core::ptr::slice_from_raw_parts_mut(ptr, layout.size());
            Ok(unsafe { core::ptr::NonNull::new_unchecked(slice) })
        }
    }

    unsafe fn deallocate(&self, ptr: core::ptr::NonNull<u8>, layout: Layout) {
        unsafe { GlobalAlloc::dealloc(self, ptr.as_ptr(), layout) }
    }
}
