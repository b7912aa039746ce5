//! Size class table and lookup functions.
//!
//! Blocks are bucketed into 73 size classes across three page tiers: 29
//! small (32 B granularity up to 4 KiB), 24 medium (up to 256 KiB) and 20
//! large (up to 8 MiB). Anything larger is a huge allocation served
//! directly from the OS. Class 0 is a degenerate guard equal to class 1 so
//! the tiny lookup (`ceil(size / 32)`, which maps size 0 to class 0) needs
//! no branch.

use crate::{
    LARGE_PAGE_SHIFT, LARGE_PAGE_SIZE, MEDIUM_PAGE_SHIFT, MEDIUM_PAGE_SIZE, PAGE_HEADER_SIZE,
    SMALL_GRANULARITY, SMALL_PAGE_SHIFT, SMALL_PAGE_SIZE, SPAN_SIZE,
};

pub const SMALL_CLASS_COUNT: usize = 29;
pub const MEDIUM_CLASS_COUNT: usize = 24;
pub const LARGE_CLASS_COUNT: usize = 20;
/// Number of size classes, excluding the implicit huge class.
pub const SIZE_CLASS_COUNT: usize = SMALL_CLASS_COUNT + MEDIUM_CLASS_COUNT + LARGE_CLASS_COUNT;

/// Largest size served from a size class; bigger requests are huge.
pub const MAX_CLASS_SIZE: usize = 8 * 1024 * 1024;

/// Page tier. Determines the page size a size class is carved from.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum PageTier {
    /// 64 KiB pages.
    Small = 0,
    /// 4 MiB pages.
    Medium = 1,
    /// 64 MiB pages.
    Large = 2,
    /// Oversize allocations mapped directly from the OS.
    Huge = 3,
}

impl PageTier {
    #[inline]
    pub const fn from_u32(v: u32) -> PageTier {
        match v {
            0 => PageTier::Small,
            1 => PageTier::Medium,
            2 => PageTier::Large,
            _ => PageTier::Huge,
        }
    }

    /// Page size for this tier. Huge spans size their single page
    /// individually; this returns 0 for them.
    #[inline]
    pub const fn page_size(self) -> usize {
        match self {
            PageTier::Small => SMALL_PAGE_SIZE,
            PageTier::Medium => MEDIUM_PAGE_SIZE,
            PageTier::Large => LARGE_PAGE_SIZE,
            PageTier::Huge => 0,
        }
    }

    #[inline]
    pub const fn page_size_shift(self) -> u32 {
        match self {
            PageTier::Small => SMALL_PAGE_SHIFT as u32,
            PageTier::Medium => MEDIUM_PAGE_SHIFT as u32,
            PageTier::Large => LARGE_PAGE_SHIFT as u32,
            PageTier::Huge => 0,
        }
    }

    /// Number of pages of this tier in one span reservation.
    #[inline]
    pub const fn pages_per_span(self) -> u32 {
        match self {
            PageTier::Huge => 1,
            _ => (SPAN_SIZE / self.page_size()) as u32,
        }
    }
}

/// A single size class: block size and how many blocks fit in a page of the
/// class's tier after the page header.
#[derive(Clone, Copy, Debug)]
pub struct SizeClass {
    pub block_size: u32,
    pub block_count: u32,
}

const fn sclass(n: usize) -> SizeClass {
    SizeClass {
        block_size: (n * SMALL_GRANULARITY) as u32,
        block_count: ((SMALL_PAGE_SIZE - PAGE_HEADER_SIZE) / (n * SMALL_GRANULARITY)) as u32,
    }
}

const fn mclass(n: usize) -> SizeClass {
    SizeClass {
        block_size: (n * SMALL_GRANULARITY) as u32,
        block_count: ((MEDIUM_PAGE_SIZE - PAGE_HEADER_SIZE) / (n * SMALL_GRANULARITY)) as u32,
    }
}

const fn lclass(n: usize) -> SizeClass {
    SizeClass {
        block_size: (n * SMALL_GRANULARITY) as u32,
        block_count: ((LARGE_PAGE_SIZE - PAGE_HEADER_SIZE) / (n * SMALL_GRANULARITY)) as u32,
    }
}

/// The size class table, indexed by the value of [`size_to_class`].
///
/// Entries are multiples of [`SMALL_GRANULARITY`]: linear up to 16, then
/// four subclasses per power-of-two doubling.
#[rustfmt::skip]
pub static SIZE_CLASSES: [SizeClass; SIZE_CLASS_COUNT] = [
    sclass(1),      sclass(1),      sclass(2),     sclass(3),     sclass(4),
    sclass(5),      sclass(6),      sclass(7),     sclass(8),     sclass(9),
    sclass(10),     sclass(11),     sclass(12),    sclass(13),    sclass(14),
    sclass(15),     sclass(16),     sclass(20),    sclass(24),    sclass(28),
    sclass(32),     sclass(40),     sclass(48),    sclass(56),    sclass(64),
    sclass(80),     sclass(96),     sclass(112),   sclass(128),
    mclass(160),    mclass(192),    mclass(224),   mclass(256),   mclass(320),
    mclass(384),    mclass(448),    mclass(512),   mclass(640),   mclass(768),
    mclass(896),    mclass(1024),   mclass(1280),  mclass(1536),  mclass(1792),
    mclass(2048),   mclass(2560),   mclass(3072),  mclass(3584),  mclass(4096),
    mclass(5120),   mclass(6144),   mclass(7168),  mclass(8192),
    lclass(10240),  lclass(12288),  lclass(14336), lclass(16384), lclass(20480),
    lclass(24576),  lclass(28672),  lclass(32768), lclass(40960), lclass(49152),
    lclass(57344),  lclass(65536),  lclass(81920), lclass(98304), lclass(114688),
    lclass(131072), lclass(163840), lclass(196608), lclass(229376), lclass(262144),
];

/// Largest size handled by the tiny lookup path.
pub const TINY_SIZE_LIMIT: usize = SMALL_GRANULARITY * 16;

/// Size class for tiny sizes (at most [`TINY_SIZE_LIMIT`]): linear
/// quantization by granularity. Size 0 maps to the class 0 guard entry.
#[inline]
pub fn size_to_class_tiny(size: usize) -> u32 {
    ((size + (SMALL_GRANULARITY - 1)) / SMALL_GRANULARITY) as u32
}

/// Map an allocation size to its size class index.
///
/// Returns a value `>= SIZE_CLASS_COUNT` for sizes beyond the largest
/// class; callers route those to the huge path.
#[inline]
pub fn size_to_class(size: usize) -> u32 {
    let mut minblock_count = (size + (SMALL_GRANULARITY - 1)) / SMALL_GRANULARITY;
    // For sizes up to 16 times the granularity the class equals the number
    // of granules.
    if size <= TINY_SIZE_LIMIT {
        return if minblock_count != 0 {
            minblock_count as u32
        } else {
            1
        };
    }
    minblock_count -= 1;
    // minblock_count > 16 here, so the most significant bit is >= 4.
    // Class sizes have the bit pattern [..]0xx000[..]: the position of the
    // most significant bit picks the doubling, the next two bits pick one
    // of four subclasses.
    let most_significant_bit = usize::BITS - 1 - minblock_count.leading_zeros();
    let subclass = (minblock_count >> (most_significant_bit - 2)) & 0x3;
    (most_significant_bit << 2) + (subclass as u32) + 1
}

/// Page tier serving the given size class.
#[inline]
pub fn tier_of(size_class: u32) -> PageTier {
    if (size_class as usize) < SMALL_CLASS_COUNT {
        PageTier::Small
    } else if (size_class as usize) < SMALL_CLASS_COUNT + MEDIUM_CLASS_COUNT {
        PageTier::Medium
    } else if (size_class as usize) < SIZE_CLASS_COUNT {
        PageTier::Large
    } else {
        PageTier::Huge
    }
}

/// Block size for a size class index.
#[inline]
pub fn class_to_size(size_class: u32) -> usize {
    SIZE_CLASSES[size_class as usize].block_size as usize
}
