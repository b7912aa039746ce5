//! Span management: one 256 MiB reservation, carved into pages of a single
//! tier.
//!
//! Spans are aligned to their own size, so `ptr & SPAN_MASK` recovers the
//! span header from any interior pointer, and a shift by the tier's page
//! size recovers the page. This is the layout decision everything else
//! leans on. The span header shares the first page's header area: a `Span`
//! starts with the first page's [`Page`] struct and both fit in 128 bytes.

use crate::page::Page;
use crate::size_class::PageTier;
use crate::{SPAN_HEADER_SIZE, SPAN_MASK};

/// Span header, at the start of every 256 MiB reservation.
#[repr(C)]
pub struct Span {
    /// Header of the first page; also carries the owning heap and thread
    /// for the span itself.
    pub page: Page,
    /// Number of pages carved out so far.
    pub page_initialized: u32,
    /// Total pages in the span.
    pub page_count: u32,
    /// Bytes per page; for a huge span, the user size of its single block.
    pub page_size: u32,
    /// Page size bit shift (0 for huge spans).
    pub page_size_shift: u32,
    /// Page tier for the whole span.
    pub tier: PageTier,
    /// Padding between the OS-returned base and this header, to invert the
    /// alignment at unmap time.
    pub offset: u32,
    /// Full length of the OS mapping.
    pub mapped_size: u64,
    /// Next span in list.
    pub next: *mut Span,
    /// Previous span in list.
    pub prev: *mut Span,
}

const _: () = assert!(core::mem::size_of::<Span>() <= SPAN_HEADER_SIZE);

impl Span {
    /// Span containing the given block, recovered by address masking.
    #[inline]
    pub fn from_block(block: *const u8) -> *mut Span {
        ((block as usize) & SPAN_MASK) as *mut Span
    }

    /// Page within this span containing the given block.
    #[inline]
    pub fn page_of(&self, block: *const u8) -> *mut Page {
        let base = self as *const Span as usize;
        let page_index = ((block as usize) - base) >> self.page_size_shift;
        (base + (page_index << self.page_size_shift)) as *mut Page
    }

    /// Carve the next uninitialized page out of the span.
    ///
    /// The new page header is zeroed and stamped with the span's tier and
    /// the owning heap and thread. When this initializes the final page,
    /// the span moves from the heap's partial slot to its used list.
    ///
    /// # Safety
    /// `span` must be valid, not yet saturated, and owned by the calling
    /// thread's heap.
    pub unsafe fn next_page(span: *mut Span) -> *mut Page {
        unsafe {
            debug_assert!((*span).page_initialized < (*span).page_count);
            let heap = (*span).page.heap;
            let page = ((span as usize)
                + ((*span).page_size as usize * (*span).page_initialized as usize))
                as *mut Page;
            (*span).page_initialized += 1;

            // Zero only the Page struct: for the first page it overlays the
            // head of this span header, whose own fields live past it.
            core::ptr::write_bytes(page as *mut u8, 0, core::mem::size_of::<Page>());
            (*page).tier = (*span).tier;
            (*page).flags = crate::page::FLAG_ZERO;
            (*page).owner_thread = (*heap).owner_thread;
            (*page).heap = heap;

            if (*span).page_initialized == (*span).page_count {
                // Span fully carved up.
                let tier = (*span).tier as usize;
                debug_assert_eq!(span, (*heap).span_partial[tier]);
                (*heap).span_partial[tier] = core::ptr::null_mut();

                (*span).next = (*heap).span_used[tier];
                if !(*span).next.is_null() {
                    (*(*span).next).prev = span;
                }
                (*heap).span_used[tier] = span;
            }

            page
        }
    }
}
