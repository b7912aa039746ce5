#![no_std]
#![cfg_attr(feature = "nightly", feature(thread_local, allocator_api))]

//! rsmalloc: a span-based, thread-caching memory allocator for Rust.
//!
//! Memory is organized in a three-level hierarchy:
//! - Spans: 256 MiB virtual-memory reservations aligned to their own size,
//!   so any interior pointer recovers the span header with a single mask.
//! - Pages: fixed-size chunks of a span (64 KiB / 4 MiB / 64 MiB depending
//!   on tier), each carved into equal-sized blocks of one size class, with
//!   separate free lists for same-thread and cross-thread deallocation.
//! - Heaps: per-thread coordinators mapping size class to current page,
//!   recycling free pages and claiming new spans.
//!
//! The hot paths are lock free: same-thread allocation and deallocation
//! touch only thread-owned state, and cross-thread frees go through a
//! single-word CAS per page.
//!
//! # Usage
//!
//! ```ignore
//! #[global_allocator]
//! static GLOBAL: rsmalloc::RsMalloc = rsmalloc::RsMalloc;
//! ```

#[cfg(test)]
extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod allocator;
#[cfg(feature = "ffi")]
pub mod ffi;
pub mod heap;
mod macros;
pub mod page;
pub mod platform;
pub mod size_class;
pub mod span;
#[cfg(feature = "stats")]
pub mod stats;
pub mod sync;

/// Size of the header at the start of every page, and of the span header
/// that shares the first page's header area.
pub const PAGE_HEADER_SIZE: usize = 128;
pub const SPAN_HEADER_SIZE: usize = PAGE_HEADER_SIZE;

/// Smallest block size and granularity of the small size classes.
pub const SMALL_GRANULARITY: usize = 32;

pub const SMALL_PAGE_SHIFT: usize = 16;
/// Small page size (64 KiB).
pub const SMALL_PAGE_SIZE: usize = 1 << SMALL_PAGE_SHIFT;
pub const MEDIUM_PAGE_SHIFT: usize = 22;
/// Medium page size (4 MiB).
pub const MEDIUM_PAGE_SIZE: usize = 1 << MEDIUM_PAGE_SHIFT;
pub const LARGE_PAGE_SHIFT: usize = 26;
/// Large page size (64 MiB).
pub const LARGE_PAGE_SIZE: usize = 1 << LARGE_PAGE_SHIFT;

/// Span reservation size (256 MiB). Spans are aligned to this, which makes
/// `ptr & SPAN_MASK` recover the owning span from any interior pointer.
pub const SPAN_SIZE: usize = 256 * 1024 * 1024;
pub const SPAN_MASK: usize = !(SPAN_SIZE - 1);

/// Upper bound (exclusive) for alignment requests.
pub const MAX_ALIGNMENT: usize = 256 * 1024;

/// Upper bound (exclusive) for allocation requests. The span header records
/// the user size of a huge allocation in 32 bits, so requests at or above
/// this fail with an invalid-argument error.
pub const MAX_ALLOC_SIZE: usize = (u32::MAX as usize) - (1 << 16);

pub use allocator::{
    AllocErrorKind, GROW_OR_FAIL, NO_PRESERVE, RsMalloc, aligned_alloc, aligned_realloc, alloc,
    calloc, free, last_error, realloc, thread_finalize, usable_size,
};
pub use platform::{MemoryInterface, initialize, initialize_with};

// Panic handler for staticlib builds (no_std has no default panic handler).
// Only active when panic="abort", not during normal checks.
#[cfg(all(feature = "ffi", not(test), not(feature = "std"), panic = "abort"))]
#[panic_handler]
fn panic(_: &core::panic::PanicInfo) -> ! {
    unsafe extern "C" {
        fn abort() -> !;
    }
    unsafe { abort() }
}
