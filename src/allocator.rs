//! Top-level allocator: ties all tiers together and implements `GlobalAlloc`.
//!
//! `TierCache` is zero-sized; all mutable state lives in module-level statics
//! protected by spinlocks or atomics.
//!
//! Cache strategy (fastest to slowest):
//! - `std` feature: `std::thread_local!` per-thread free lists (the common case)
//! - without `std`: central cache only (locked on every call)
//!
//! Sized deallocation: callers must pass the `Layout` that was used for the
//! matching `alloc`/`realloc` call, per `GlobalAlloc`'s own contract. This
//! allocator leans on that guarantee rather than recovering a block's size
//! class from span metadata — `layout.size()` is already the size-class key
//! for small objects, and the page count for large ones, so no extra lookup
//! is needed on the free path except to locate the span struct itself.

use crate::PAGE_SHIFT;
use crate::PAGE_SIZE;
use crate::central_free_list::CentralCache;
use crate::page_heap::PageHeap;
use crate::pagemap::PageMap;
use crate::size_class;
use crate::span;
use crate::sync::SpinMutex;
use crate::{stat_add, stat_inc};
use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

#[cfg(feature = "std")]
use crate::span::FreeObject;
#[cfg(feature = "std")]
use crate::thread_cache::ThreadCache;
#[cfg(feature = "std")]
use crate::transfer_cache::TransferCacheArray;
#[cfg(not(feature = "std"))]
use crate::span::FreeObject as NoStdFreeObject;

pub(crate) static PAGE_MAP: PageMap = PageMap::new();
pub(crate) static PAGE_HEAP: SpinMutex<PageHeap> = SpinMutex::new(PageHeap::new(&PAGE_MAP));
pub(crate) static CENTRAL_CACHE: CentralCache = CentralCache::new();

#[cfg(feature = "std")]
pub(crate) static TRANSFER_CACHE: TransferCacheArray = TransferCacheArray::new();

#[cfg(feature = "std")]
std::thread_local! {
    static TC_CELL: core::cell::UnsafeCell<ThreadCache> = const {
        core::cell::UnsafeCell::new(ThreadCache::new_const())
    };
}

#[cfg(feature = "std")]
struct TcFlushGuard;

#[cfg(feature = "std")]
impl Drop for TcFlushGuard {
    fn drop(&mut self) {
        TC_CELL.with(|cell| unsafe {
            let tc = &mut *cell.get();
            if tc.is_initialized() {
                tc.flush_and_destroy(&TRANSFER_CACHE, &CENTRAL_CACHE, &PAGE_HEAP, &PAGE_MAP);
            }
        });
    }
}

#[cfg(feature = "std")]
std::thread_local! {
    static TC_FLUSH_GUARD: TcFlushGuard = const { TcFlushGuard };
}

/// A thread-caching, tcmalloc-style allocator.
///
/// Register as the global allocator with:
/// ```ignore
/// #[global_allocator]
/// static GLOBAL: tiercache::TierCache = tiercache::TierCache;
/// ```
pub struct TierCache;

/// Decide which tier a request belongs to: a small/medium size class, or the
/// large path (oversized, or a size class whose block size the requested
/// alignment doesn't divide evenly).
#[inline]
fn classify(size: usize, align: usize) -> Option<usize> {
    if align <= crate::config::ALIGNMENT {
        return size_class::size_to_class(size);
    }
    let effective_size = size.max(align);
    let class = size_class::size_to_class(effective_size)?;
    let class_size = size_class::class_to_size(class);
    if align > PAGE_SIZE || !class_size.is_multiple_of(align) {
        None
    } else {
        Some(class)
    }
}

unsafe impl GlobalAlloc for TierCache {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = layout.size();
        if size == 0 {
            return layout.align() as *mut u8;
        }

        stat_inc!(alloc_count);
        stat_add!(alloc_bytes, size as u64);

        match classify(size, layout.align()) {
            Some(class) => unsafe { self.alloc_small(class) },
            None => unsafe { self.alloc_large(layout) },
        }
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if layout.size() == 0 {
            return;
        }

        stat_inc!(dealloc_count);

        match classify(layout.size(), layout.align()) {
            Some(class) => unsafe { self.dealloc_small(ptr, class) },
            None => {
                let page_id = (ptr as usize) >> PAGE_SHIFT;
                let span = PAGE_MAP.get(page_id);
                if !span.is_null() {
                    unsafe { PAGE_HEAP.lock().deallocate_span(span) };
                }
            }
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.alloc(layout) };
        if !ptr.is_null() && layout.size() > 0 {
            unsafe { ptr::write_bytes(ptr, 0, layout.size()) };
        }
        ptr
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if ptr.is_null() || layout.size() == 0 {
            let new_layout =
                unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
            return unsafe { self.alloc(new_layout) };
        }

        if new_size == 0 {
            unsafe { self.dealloc(ptr, layout) };
            return layout.align() as *mut u8;
        }

        stat_inc!(realloc_count);

        // The old layout is exactly what this pointer was allocated with (the
        // caller's obligation under GlobalAlloc), so its own size already
        // tells us the old block's usable capacity, no span lookup needed.
        let old_usable = match classify(layout.size(), layout.align()) {
            Some(class) => size_class::class_to_size(class),
            None => layout.size().div_ceil(PAGE_SIZE) * PAGE_SIZE,
        };

        if new_size <= old_usable {
            return ptr;
        }

        let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
        let new_ptr = unsafe { self.alloc(new_layout) };
        if !new_ptr.is_null() {
            unsafe { ptr::copy_nonoverlapping(ptr, new_ptr, old_usable.min(new_size)) };
            unsafe { self.dealloc(ptr, layout) };
        }
        new_ptr
    }
}

impl TierCache {
    #[cfg(feature = "std")]
    #[inline(always)]
    unsafe fn alloc_small(&self, class: usize) -> *mut u8 {
        match TC_CELL.try_with(|cell| unsafe {
            let tc = &mut *cell.get();
            if !tc.is_initialized() {
                tc.init();
                TC_FLUSH_GUARD.with(|_| {});
            }
            tc.allocate(class, &TRANSFER_CACHE, &CENTRAL_CACHE, &PAGE_HEAP, &PAGE_MAP)
        }) {
            Ok(ptr) => ptr,
            Err(_) => unsafe { self.alloc_from_central(class) },
        }
    }

    #[cfg(feature = "std")]
    #[inline(always)]
    unsafe fn dealloc_small(&self, ptr: *mut u8, class: usize) {
        if TC_CELL
            .try_with(|cell| unsafe {
                let tc = &mut *cell.get();
                tc.deallocate(ptr, class, &TRANSFER_CACHE, &CENTRAL_CACHE, &PAGE_HEAP, &PAGE_MAP);
            })
            .is_err()
        {
            unsafe { self.dealloc_to_central(ptr, class) };
        }
    }

    #[cfg(not(feature = "std"))]
    #[inline(always)]
    unsafe fn alloc_small(&self, class: usize) -> *mut u8 {
        unsafe { self.alloc_from_central(class) }
    }

    #[cfg(not(feature = "std"))]
    #[inline(always)]
    unsafe fn dealloc_small(&self, ptr: *mut u8, class: usize) {
        unsafe { self.dealloc_to_central(ptr, class) };
    }

    unsafe fn alloc_from_central(&self, size_class: usize) -> *mut u8 {
        stat_inc!(thread_cache_misses);
        stat_inc!(central_cache_hits);
        let (count, head) = unsafe {
            CENTRAL_CACHE
                .get(size_class)
                .lock()
                .remove_range(1, &PAGE_HEAP, &PAGE_MAP)
        };
        if count == 0 || head.is_null() {
            ptr::null_mut()
        } else {
            head as *mut u8
        }
    }

    unsafe fn dealloc_to_central(&self, ptr: *mut u8, size_class: usize) {
        #[cfg(feature = "std")]
        let obj = ptr as *mut FreeObject;
        #[cfg(not(feature = "std"))]
        let obj = ptr as *mut NoStdFreeObject;
        unsafe { (*obj).next = ptr::null_mut() };
        unsafe {
            CENTRAL_CACHE
                .get(size_class)
                .lock()
                .insert_range(obj, 1, &PAGE_HEAP, &PAGE_MAP)
        };
    }

    /// Allocate directly from the page heap, bypassing all size classes.
    ///
    /// Used both for oversized requests and for small requests whose
    /// alignment a size class's block size can't satisfy.
    unsafe fn alloc_large(&self, layout: Layout) -> *mut u8 {
        stat_inc!(page_heap_allocs);

        let size = layout.size();
        let align = layout.align();
        let size_pages = size.div_ceil(PAGE_SIZE);

        if align <= PAGE_SIZE {
            let span = unsafe { PAGE_HEAP.lock().allocate_span(size_pages) };
            if span.is_null() {
                return ptr::null_mut();
            }
            unsafe {
                (*span).size_class = span::NO_SIZE_CLASS;
                PAGE_MAP.register_span(span);
            }
            return unsafe { (*span).start_addr() };
        }

        // Over-aligned: over-allocate, then trim the prefix/suffix so only
        // the aligned region remains registered as the live span.
        let align_pages = align / PAGE_SIZE;
        let total_pages = size_pages + align_pages - 1;

        let mut heap = PAGE_HEAP.lock();
        let span = unsafe { heap.allocate_span(total_pages) };
        if span.is_null() {
            return ptr::null_mut();
        }

        let start_addr = unsafe { (*span).start_addr() } as usize;
        let aligned_addr = (start_addr + align - 1) & !(align - 1);
        let prefix_pages = (aligned_addr - start_addr) / PAGE_SIZE;
        let suffix_pages = total_pages - prefix_pages - size_pages;

        unsafe {
            PAGE_MAP.unregister_span(span);

            if prefix_pages > 0 {
                let prefix = span::alloc_span();
                if !prefix.is_null() {
                    (*prefix).start_page = (*span).start_page;
                    (*prefix).num_pages = prefix_pages;
                    heap.deallocate_span(prefix);
                }
            }

            (*span).start_page += prefix_pages;
            (*span).num_pages = size_pages;
            (*span).size_class = span::NO_SIZE_CLASS;
            PAGE_MAP.register_span(span);

            if suffix_pages > 0 {
                let suffix = span::alloc_span();
                if !suffix.is_null() {
                    (*suffix).start_page = (*span).start_page + size_pages;
                    (*suffix).num_pages = suffix_pages;
                    heap.deallocate_span(suffix);
                }
            }
        }

        aligned_addr as *mut u8
    }
}

/// Allocate `size` bytes at the minimum alignment, the literal allocator API
/// surface this crate is built around (an `impl GlobalAlloc` is the idiomatic
/// way to expose it to Rust programs; [`GlobalAlloc::alloc`] is this same path).
///
/// # Safety
///
/// Caller must release the result via [`deallocate`] with the same `size`.
pub unsafe fn allocate(size: usize) -> *mut u8 {
    let layout = unsafe { Layout::from_size_align_unchecked(size.max(1), crate::config::ALIGNMENT) };
    unsafe { GlobalAlloc::alloc(&TierCache, layout) }
}

/// Release memory returned by [`allocate`]. `size` must match the value
/// passed to the matching `allocate` call — this allocator performs no
/// automatic reclamation and does not recover the size on its own.
///
/// # Safety
///
/// `ptr` must have come from [`allocate`] with this exact `size`, and must
/// not have been freed already.
pub unsafe fn deallocate(ptr: *mut u8, size: usize) {
    let layout = unsafe { Layout::from_size_align_unchecked(size.max(1), crate::config::ALIGNMENT) };
    unsafe { GlobalAlloc::dealloc(&TierCache, ptr, layout) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_alloc_dealloc_roundtrip() {
        unsafe {
            let layout = Layout::from_size_align(64, 8).unwrap();
            let ptr = TierCache.alloc(layout);
            assert!(!ptr.is_null());
            *ptr = 0x42;
            assert_eq!(*ptr, 0x42);
            TierCache.dealloc(ptr, layout);
        }
    }

    #[test]
    fn large_alloc_dealloc_roundtrip() {
        unsafe {
            let layout = Layout::from_size_align(crate::config::MAX_BYTES + 1, 8).unwrap();
            let ptr = TierCache.alloc(layout);
            assert!(!ptr.is_null());
            *ptr.add(layout.size() - 1) = 0x7;
            TierCache.dealloc(ptr, layout);
        }
    }

    #[test]
    fn zero_size_alloc_is_noop_pointer() {
        unsafe {
            let layout = Layout::from_size_align(0, 8).unwrap();
            let ptr = TierCache.alloc(layout);
            assert_eq!(ptr as usize, layout.align());
            TierCache.dealloc(ptr, layout);
        }
    }

    #[test]
    fn realloc_grow_preserves_contents() {
        unsafe {
            let layout = Layout::from_size_align(16, 8).unwrap();
            let ptr = TierCache.alloc(layout);
            assert!(!ptr.is_null());
            for i in 0..16u8 {
                *ptr.add(i as usize) = i;
            }
            let new_ptr = TierCache.realloc(ptr, layout, 256);
            assert!(!new_ptr.is_null());
            for i in 0..16u8 {
                assert_eq!(*new_ptr.add(i as usize), i);
            }
            let new_layout = Layout::from_size_align(256, 8).unwrap();
            TierCache.dealloc(new_ptr, new_layout);
        }
    }

    #[test]
    fn realloc_shrink_within_class_keeps_pointer() {
        unsafe {
            let layout = Layout::from_size_align(64, 8).unwrap();
            let ptr = TierCache.alloc(layout);
            assert!(!ptr.is_null());
            let same_ptr = TierCache.realloc(ptr, layout, 40);
            assert_eq!(ptr, same_ptr);
            let new_layout = Layout::from_size_align(40, 8).unwrap();
            TierCache.dealloc(same_ptr, new_layout);
        }
    }

    #[test]
    fn allocate_deallocate_api_roundtrip() {
        unsafe {
            let ptr = allocate(128);
            assert!(!ptr.is_null());
            *ptr = 9;
            deallocate(ptr, 128);
        }
    }

    #[test]
    fn overaligned_request_goes_large_path() {
        unsafe {
            let layout = Layout::from_size_align(32, PAGE_SIZE * 2).unwrap();
            let ptr = TierCache.alloc(layout);
            assert!(!ptr.is_null());
            assert_eq!(ptr as usize % (PAGE_SIZE * 2), 0);
            TierCache.dealloc(ptr, layout);
        }
    }
}
