//! Windows virtual memory implementation using VirtualAlloc/VirtualFree.

use core::ffi::c_void;

const MEM_COMMIT: u32 = 0x1000;
const MEM_RESERVE: u32 = 0x2000;
const MEM_DECOMMIT: u32 = 0x4000;
const MEM_RELEASE: u32 = 0x8000;
const PAGE_READWRITE: u32 = 0x04;

#[repr(C)]
struct SystemInfo {
    processor_architecture: u16,
    reserved: u16,
    page_size: u32,
    minimum_application_address: *mut c_void,
    maximum_application_address: *mut c_void,
    active_processor_mask: usize,
    number_of_processors: u32,
    processor_type: u32,
    allocation_granularity: u32,
    processor_level: u16,
    processor_revision: u16,
}

unsafe extern "system" {
    #[link_name = "VirtualAlloc"]
    fn virtual_alloc(
        lp_address: *mut c_void,
        dw_size: usize,
        fl_allocation_type: u32,
        fl_protect: u32,
    ) -> *mut c_void;

    #[link_name = "VirtualFree"]
    fn virtual_free(lp_address: *mut c_void, dw_size: usize, dw_free_type: u32) -> i32;

    #[link_name = "GetSystemInfo"]
    fn get_system_info(lp_system_info: *mut SystemInfo);
}

pub fn query_page_size() -> usize {
    let mut info = SystemInfo {
        processor_architecture: 0,
        reserved: 0,
        page_size: 0,
        minimum_application_address: core::ptr::null_mut(),
        maximum_application_address: core::ptr::null_mut(),
        active_processor_mask: 0,
        number_of_processors: 0,
        processor_type: 0,
        allocation_granularity: 0,
        processor_level: 0,
        processor_revision: 0,
    };
    unsafe { get_system_info(&mut info) };
    info.page_size as usize
}

pub unsafe fn map_pages(size: usize) -> *mut u8 {
    // Physical pages are not consumed until the addresses are touched, so
    // reserving and committing in one call is fine even for whole spans.
    let ptr = unsafe {
        virtual_alloc(
            core::ptr::null_mut(),
            size,
            MEM_RESERVE | MEM_COMMIT,
            PAGE_READWRITE,
        )
    };
    ptr as *mut u8
}

pub unsafe fn unmap_pages(ptr: *mut u8, _size: usize) {
    // MEM_RELEASE requires dwSize = 0 (releases the whole reservation)
    unsafe { virtual_free(ptr as *mut c_void, 0, MEM_RELEASE) };
}

pub unsafe fn commit_pages(ptr: *mut u8, size: usize) {
    unsafe { virtual_alloc(ptr as *mut c_void, size, MEM_COMMIT, PAGE_READWRITE) };
}

pub unsafe fn decommit_pages(ptr: *mut u8, size: usize) {
    unsafe { virtual_free(ptr as *mut c_void, size, MEM_DECOMMIT) };
}
