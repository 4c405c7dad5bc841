//! Size-class discretization.
//!
//! Unlike tcmalloc's geometric schedule, this allocator uses a fixed linear
//! schedule: size class `i` always holds blocks of exactly `(i + 1) *
//! ALIGNMENT` bytes. That makes the class table itself unnecessary — both
//! directions of the mapping are closed-form arithmetic — but the batch size
//! and span page count a class refills with still vary with block size, so
//! those stay as small formulas rather than a precomputed table.

use crate::config::{ALIGNMENT, FREE_LIST_SIZE, MAX_BYTES, PAGE_SIZE, SPAN_PAGES};

/// Number of distinct size classes.
pub const NUM_SIZE_CLASSES: usize = FREE_LIST_SIZE;

/// Map a requested allocation size to its size-class index.
///
/// Returns `None` for `size > MAX_BYTES` (the oversize path, handled
/// directly by the page heap). A `size` of zero is rounded up to one
/// `ALIGNMENT`, matching the minimum block size.
#[inline]
pub fn size_to_class(size: usize) -> Option<usize> {
    if size > MAX_BYTES {
        return None;
    }
    let rounded = size.max(ALIGNMENT);
    Some(rounded.div_ceil(ALIGNMENT) - 1)
}

/// Block size (in bytes) for a given size-class index.
#[inline]
pub const fn class_to_size(class: usize) -> usize {
    (class + 1) * ALIGNMENT
}

/// Per-batch object count a thread cache requests on a refill miss for a
/// class whose block size is `size` bytes, clamped so a batch never asks
/// for much more than ~4 KiB total.
#[inline]
pub fn batch_size_for(size: usize) -> usize {
    let target = if size <= 32 {
        64
    } else if size <= 64 {
        32
    } else if size <= 128 {
        16
    } else if size <= 256 {
        8
    } else if size <= 512 {
        4
    } else if size <= 1024 {
        2
    } else {
        1
    };
    let cap = (4096 / size).max(1);
    target.clamp(1, cap)
}

/// Page-span size the central cache requests to refill a class whose block
/// size is `size` bytes.
#[inline]
pub fn span_pages_for(size: usize) -> usize {
    if size <= SPAN_PAGES * PAGE_SIZE {
        SPAN_PAGES
    } else {
        size.div_ceil(PAGE_SIZE)
    }
}

/// Number of `size`-byte blocks that fit in a span of `pages` pages.
#[inline]
pub const fn objects_per_span(pages: usize, size: usize) -> usize {
    (pages * PAGE_SIZE) / size
}
