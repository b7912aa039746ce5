//! OS virtual-memory interface.
//!
//! The core only needs four operations: `map` aligned reservations,
//! `commit`/`decommit` ranges inside them, and `unmap` whole reservations.
//! The default implementation wraps mmap/mprotect/madvise on Unix and
//! VirtualAlloc/VirtualFree on Windows. A custom [`MemoryInterface`] can be
//! injected with [`initialize_with`] before the first allocation.
//!
//! `decommit` is a hint: contents may be lost and the address range stays
//! valid. `commit` after `decommit` yields zero-filled pages.

use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

#[cfg(unix)]
mod unix;

#[cfg(windows)]
mod windows;

#[cfg(unix)]
use unix as sys;
#[cfg(windows)]
use windows as sys;

/// An aligned virtual-memory reservation returned by `map`.
///
/// `ptr` is the aligned base handed to the caller; `offset` is the padding
/// between the OS-returned base and `ptr` (needed to invert the alignment
/// at unmap time); `mapped_size` is the full length of the OS mapping.
#[derive(Clone, Copy, Debug)]
pub struct Mapping {
    pub ptr: *mut u8,
    pub offset: u32,
    pub mapped_size: usize,
}

/// Injectable virtual-memory backend.
///
/// `map(size, alignment)` must return a region of at least `size` bytes
/// whose base is aligned to `alignment` (0 or 1 for no constraint).
/// `unmap` receives the aligned base plus the original offset and mapped
/// size so it can release the OS reservation exactly.
pub struct MemoryInterface {
    pub map: unsafe fn(size: usize, alignment: usize) -> Option<Mapping>,
    pub commit: unsafe fn(addr: *mut u8, size: usize),
    pub decommit: unsafe fn(addr: *mut u8, size: usize),
    pub unmap: unsafe fn(addr: *mut u8, offset: u32, mapped_size: usize),
    /// Called when `map` fails; returning `true` requests a retry.
    pub map_fail_callback: Option<fn(size: usize) -> bool>,
}

/// Default OS-backed interface.
pub static OS_INTERFACE: MemoryInterface = MemoryInterface {
    map: os_map,
    commit: os_commit,
    decommit: os_decommit,
    unmap: os_unmap,
    map_fail_callback: None,
};

static INTERFACE: AtomicPtr<MemoryInterface> = AtomicPtr::new(ptr::null_mut());
static OS_PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Install the default OS memory interface and capture the OS page size.
/// Idempotent; called lazily from every path that can map memory.
pub fn initialize() {
    let _ = INTERFACE.compare_exchange(
        ptr::null_mut(),
        &OS_INTERFACE as *const _ as *mut MemoryInterface,
        Ordering::AcqRel,
        Ordering::Acquire,
    );
    os_page_size();
}

/// Install a custom memory interface. Returns `false` if an interface
/// (custom or default) was already installed, in which case the existing
/// one stays active.
pub fn initialize_with(interface: &'static MemoryInterface) -> bool {
    let installed = INTERFACE
        .compare_exchange(
            ptr::null_mut(),
            interface as *const _ as *mut MemoryInterface,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_ok();
    os_page_size();
    installed
}

#[inline]
fn interface() -> &'static MemoryInterface {
    let ptr = INTERFACE.load(Ordering::Acquire);
    if ptr.is_null() {
        initialize();
        return unsafe { &*INTERFACE.load(Ordering::Acquire) };
    }
    unsafe { &*ptr }
}

/// Size of an OS virtual-memory page (not an allocator page).
#[inline]
pub fn os_page_size() -> usize {
    let size = OS_PAGE_SIZE.load(Ordering::Relaxed);
    if size != 0 {
        return size;
    }
    let size = sys::query_page_size();
    let size = if size != 0 { size } else { 4096 };
    OS_PAGE_SIZE.store(size, Ordering::Relaxed);
    size
}

/// Round `size` up to a whole number of OS pages.
#[inline]
pub fn page_aligned_size(size: usize) -> usize {
    let unalign = size % os_page_size();
    if unalign != 0 {
        size + os_page_size() - unalign
    } else {
        size
    }
}

/// Map an aligned reservation through the installed interface, consulting
/// the map-failure callback for retries.
pub unsafe fn map(size: usize, alignment: usize) -> Option<Mapping> {
    let iface = interface();
    loop {
        if let Some(mapping) = unsafe { (iface.map)(size, alignment) } {
            return Some(mapping);
        }
        match iface.map_fail_callback {
            Some(callback) if callback(size + alignment) => continue,
            _ => return None,
        }
    }
}

/// Make a range readable and writable again after a decommit.
///
/// # Safety
/// `addr..addr + size` must lie inside a live mapping, OS-page aligned.
pub unsafe fn commit(addr: *mut u8, size: usize) {
    unsafe { (interface().commit)(addr, size) }
}

/// Hint that a range's contents are disposable. Addresses stay valid.
///
/// # Safety
/// `addr..addr + size` must lie inside a live mapping, OS-page aligned.
pub unsafe fn decommit(addr: *mut u8, size: usize) {
    unsafe { (interface().decommit)(addr, size) }
}

/// Release a reservation previously returned by [`map`].
///
/// # Safety
/// `addr`, `offset` and `mapped_size` must come from the same [`Mapping`],
/// and the region must not be referenced afterwards.
pub unsafe fn unmap(addr: *mut u8, offset: u32, mapped_size: usize) {
    unsafe { (interface().unmap)(addr, offset, mapped_size) }
}

fn os_map(size: usize, alignment: usize) -> Option<Mapping> {
    let map_size = size + alignment;
    let ptr = unsafe { sys::map_pages(map_size) };
    if ptr.is_null() {
        return None;
    }
    let mut offset = 0usize;
    if alignment != 0 {
        let padding = (ptr as usize) & (alignment - 1);
        if padding != 0 {
            offset = alignment - padding;
        }
    }
    Some(Mapping {
        ptr: unsafe { ptr.add(offset) },
        offset: offset as u32,
        mapped_size: map_size,
    })
}

fn os_commit(addr: *mut u8, size: usize) {
    unsafe { sys::commit_pages(addr, size) }
}

fn os_decommit(addr: *mut u8, size: usize) {
    unsafe { sys::decommit_pages(addr, size) }
}

fn os_unmap(addr: *mut u8, offset: u32, mapped_size: usize) {
    unsafe { sys::unmap_pages(addr.sub(offset as usize), mapped_size) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SPAN_SIZE;

    #[test]
    fn test_map_unaligned() {
        unsafe {
            let m = map(os_page_size() * 4, 0).unwrap();
            assert!(!m.ptr.is_null());
            assert_eq!(m.offset, 0);
            // Write and read back across the region.
            for i in (0..os_page_size() * 4).step_by(os_page_size()) {
                *m.ptr.add(i) = 0xA5;
                assert_eq!(*m.ptr.add(i), 0xA5);
            }
            unmap(m.ptr, m.offset, m.mapped_size);
        }
    }

    #[test]
    fn test_map_span_aligned() {
        unsafe {
            let m = map(SPAN_SIZE, SPAN_SIZE).unwrap();
            assert_eq!(m.ptr as usize % SPAN_SIZE, 0, "span base not aligned");
            assert_eq!(m.mapped_size, SPAN_SIZE * 2);
            // The aligned base is usable.
            *m.ptr = 1;
            *m.ptr.add(SPAN_SIZE - 1) = 2;
            unmap(m.ptr, m.offset, m.mapped_size);
        }
    }

    #[test]
    fn test_commit_after_decommit_zeroes() {
        unsafe {
            let size = os_page_size() * 8;
            let m = map(size, 0).unwrap();
            core::ptr::write_bytes(m.ptr, 0xFF, size);

            let tail = m.ptr.add(os_page_size());
            let tail_size = size - os_page_size();
            decommit(tail, tail_size);
            commit(tail, tail_size);

            // First page keeps its contents, the recommitted range is zero.
            assert_eq!(*m.ptr, 0xFF);
            for i in (0..tail_size).step_by(os_page_size()) {
                assert_eq!(*tail.add(i), 0, "recommitted page not zeroed");
            }
            unmap(m.ptr, m.offset, m.mapped_size);
        }
    }

    #[test]
    fn test_os_page_size_sane() {
        let size = os_page_size();
        assert!(size >= 4096);
        assert!(size.is_power_of_two());
    }
}
