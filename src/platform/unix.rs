//! Unix virtual memory implementation using mmap/mprotect/madvise.

use core::ffi::c_void;

const PROT_NONE: i32 = 0x0;
const PROT_READ: i32 = 0x1;
const PROT_WRITE: i32 = 0x2;
const MAP_PRIVATE: i32 = 0x02;
const MAP_ANONYMOUS: i32 = if cfg!(any(target_os = "linux", target_os = "android")) {
    0x20
} else {
    0x1000
};
const MAP_FAILED: *mut c_void = !0usize as *mut c_void;
const MADV_DONTNEED: i32 = 4;

unsafe extern "C" {
    fn mmap(
        addr: *mut c_void,
        length: usize,
        prot: i32,
        flags: i32,
        fd: i32,
        offset: i64,
    ) -> *mut c_void;

    fn munmap(addr: *mut c_void, length: usize) -> i32;

    fn mprotect(addr: *mut c_void, length: usize, prot: i32) -> i32;

    fn madvise(addr: *mut c_void, length: usize, advice: i32) -> i32;

    fn getpagesize() -> i32;
}

pub fn query_page_size() -> usize {
    unsafe { getpagesize() as usize }
}

pub unsafe fn map_pages(size: usize) -> *mut u8 {
    let ptr = unsafe {
        mmap(
            core::ptr::null_mut(),
            size,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == MAP_FAILED {
        core::ptr::null_mut()
    } else {
        ptr as *mut u8
    }
}

pub unsafe fn unmap_pages(ptr: *mut u8, size: usize) {
    unsafe { munmap(ptr as *mut c_void, size) };
}

pub unsafe fn commit_pages(ptr: *mut u8, size: usize) {
    unsafe { mprotect(ptr as *mut c_void, size, PROT_READ | PROT_WRITE) };
}

pub unsafe fn decommit_pages(ptr: *mut u8, size: usize) {
    // Drop the physical pages first, then remove access so a stale use
    // faults instead of silently reading zeroes.
    unsafe {
        madvise(ptr as *mut c_void, size, MADV_DONTNEED);
        mprotect(ptr as *mut c_void, size, PROT_NONE);
    }
}
