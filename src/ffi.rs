//! C-ABI exports for external linking (e.g. as a staticlib providing a
//! malloc family).
//!
//! Gated behind `features = ["ffi"]`. The entry points mirror the Rust
//! facade one to one; errors surface as null returns (or POSIX codes for
//! `rsmalloc_posix_memalign`), with the per-thread indicator available
//! through the Rust API.

use crate::allocator;

const EINVAL: i32 = 22;
const ENOMEM: i32 = 12;

#[unsafe(no_mangle)]
pub extern "C" fn rsmalloc_malloc(size: usize) -> *mut u8 {
    allocator::alloc(size)
}

#[unsafe(no_mangle)]
pub extern "C" fn rsmalloc_calloc(num: usize, size: usize) -> *mut u8 {
    allocator::calloc(num, size)
}

/// # Safety
/// `ptr` must be null or a live allocation from this allocator.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rsmalloc_realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    allocator::realloc(ptr, size)
}

/// # Safety
/// `ptr` must be null or a live allocation from this allocator.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rsmalloc_free(ptr: *mut u8) {
    allocator::free(ptr)
}

#[unsafe(no_mangle)]
pub extern "C" fn rsmalloc_aligned_alloc(alignment: usize, size: usize) -> *mut u8 {
    allocator::aligned_alloc(alignment, size)
}

/// # Safety
/// `ptr` must be null or a live allocation from this allocator.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rsmalloc_aligned_realloc(
    ptr: *mut u8,
    alignment: usize,
    size: usize,
    old_size: usize,
    flags: u32,
) -> *mut u8 {
    allocator::aligned_realloc(ptr, alignment, size, old_size, flags)
}

#[unsafe(no_mangle)]
pub extern "C" fn rsmalloc_memalign(alignment: usize, size: usize) -> *mut u8 {
    allocator::aligned_alloc(alignment, size)
}

/// # Safety
/// `memptr` must be null or a valid pointer to writable storage.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rsmalloc_posix_memalign(
    memptr: *mut *mut u8,
    alignment: usize,
    size: usize,
) -> i32 {
    if memptr.is_null() {
        return EINVAL;
    }
    let block = allocator::aligned_alloc(alignment, size);
    unsafe { *memptr = block };
    if block.is_null() { ENOMEM } else { 0 }
}

/// # Safety
/// `ptr` must be null or point into a live allocation from this allocator.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rsmalloc_usable_size(ptr: *mut u8) -> usize {
    allocator::usable_size(ptr)
}

#[unsafe(no_mangle)]
pub extern "C" fn rsmalloc_thread_finalize() {
    allocator::thread_finalize()
}
