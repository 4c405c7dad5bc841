//! C-ABI exports for linking this allocator into non-Rust callers.
//!
//! Gated behind `features = ["ffi"]`. With the `testing` feature, export
//! names are prefixed by the thread-cache variant in use (`std` or
//! `nostd`) so a harness can link both variants into one binary; without
//! `testing`, exports use plain `tiercache_*` names.

use crate::allocator::TierCache;
use core::alloc::{GlobalAlloc, Layout};

static ALLOC: TierCache = TierCache;

#[cfg_attr(not(feature = "testing"), unsafe(no_mangle))]
#[cfg_attr(
    all(feature = "testing", feature = "std"),
    unsafe(export_name = "tiercache_std_alloc")
)]
#[cfg_attr(
    all(feature = "testing", not(feature = "std")),
    unsafe(export_name = "tiercache_nostd_alloc")
)]
pub unsafe extern "C" fn tiercache_alloc(size: usize, align: usize) -> *mut u8 {
    let layout = unsafe { Layout::from_size_align_unchecked(size, align) };
    unsafe { ALLOC.alloc(layout) }
}

#[cfg_attr(not(feature = "testing"), unsafe(no_mangle))]
#[cfg_attr(
    all(feature = "testing", feature = "std"),
    unsafe(export_name = "tiercache_std_dealloc")
)]
#[cfg_attr(
    all(feature = "testing", not(feature = "std")),
    unsafe(export_name = "tiercache_nostd_dealloc")
)]
pub unsafe extern "C" fn tiercache_dealloc(ptr: *mut u8, size: usize, align: usize) {
    let layout = unsafe { Layout::from_size_align_unchecked(size, align) };
    unsafe { ALLOC.dealloc(ptr, layout) }
}

#[cfg_attr(not(feature = "testing"), unsafe(no_mangle))]
#[cfg_attr(
    all(feature = "testing", feature = "std"),
    unsafe(export_name = "tiercache_std_realloc")
)]
#[cfg_attr(
    all(feature = "testing", not(feature = "std")),
    unsafe(export_name = "tiercache_nostd_realloc")
)]
pub unsafe extern "C" fn tiercache_realloc(
    ptr: *mut u8,
    size: usize,
    align: usize,
    new_size: usize,
) -> *mut u8 {
    let layout = unsafe { Layout::from_size_align_unchecked(size, align) };
    unsafe { ALLOC.realloc(ptr, layout, new_size) }
}
