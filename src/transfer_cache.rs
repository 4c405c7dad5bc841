//! Transfer cache: per-size-class batch cache between thread caches and the
//! central cache.
//!
//! Stores pre-built linked lists of exactly `batch_size` objects. Thread
//! caches move full batches to/from here in O(1), avoiding the per-object
//! span lookups the central cache needs for the common case of one thread
//! freeing a batch that another thread will allocate.

use crate::central_free_list::{self, CentralCache};
use crate::page_heap::PageHeap;
use crate::pagemap::PageMap;
use crate::size_class::{self, NUM_SIZE_CLASSES};
use crate::span::FreeObject;
use crate::sync::SpinMutex;
use core::ptr;

use crate::config::MAX_TRANSFER_SLOTS;

#[derive(Clone, Copy)]
struct TransferCacheSlot {
    head: *mut FreeObject,
    tail: *mut FreeObject,
}

/// Per-size-class transfer cache (LIFO stack of batches).
struct TransferCacheInner {
    slots: [TransferCacheSlot; MAX_TRANSFER_SLOTS],
    used: usize,
}

// SAFETY: Only accessed through external SpinMutex synchronization.
unsafe impl Send for TransferCacheInner {}

impl TransferCacheInner {
    const fn new() -> Self {
        Self {
            slots: [TransferCacheSlot {
                head: ptr::null_mut(),
                tail: ptr::null_mut(),
            }; MAX_TRANSFER_SLOTS],
            used: 0,
        }
    }

    /// Pop a batch. Returns (head, tail) or None.
    fn pop(&mut self) -> Option<(*mut FreeObject, *mut FreeObject)> {
        if self.used == 0 {
            return None;
        }
        self.used -= 1;
        let slot = self.slots[self.used];
        Some((slot.head, slot.tail))
    }

    /// Push a batch. Returns true if successful, false if full.
    fn push(&mut self, head: *mut FreeObject, tail: *mut FreeObject) -> bool {
        if self.used >= MAX_TRANSFER_SLOTS {
            return false;
        }
        self.slots[self.used] = TransferCacheSlot { head, tail };
        self.used += 1;
        true
    }
}

/// Array of transfer caches, one per size class.
/// Each is individually locked (separate from central free list locks).
pub struct TransferCacheArray {
    caches: [SpinMutex<TransferCacheInner>; NUM_SIZE_CLASSES],
}

impl Default for TransferCacheArray {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferCacheArray {
    pub const fn new() -> Self {
        Self {
            caches: [const { SpinMutex::new(TransferCacheInner::new()) }; NUM_SIZE_CLASSES],
        }
    }

    /// Remove a batch of objects for the given size class.
    /// Tries transfer cache first (O(1)), falls through to central free list on miss.
    ///
    /// # Safety
    ///
    /// `size_class` must be a valid index in `0..NUM_SIZE_CLASSES`.
    pub unsafe fn remove_range(
        &self,
        size_class: usize,
        count: usize,
        central: &CentralCache,
        page_heap: &SpinMutex<PageHeap>,
        pagemap: &PageMap,
    ) -> (usize, *mut FreeObject) {
        let batch_size = size_class::batch_size_for(size_class::class_to_size(size_class));

        // Try transfer cache (O(1) if hit)
        {
            let mut tc = self.caches[size_class].lock();
            if let Some((head, _tail)) = tc.pop() {
                return (batch_size, head);
            }
        }
        // Transfer cache lock released before central lock -- no deadlock possible

        // Fall through to central free list (with lock dropping for page heap calls)
        unsafe {
            central_free_list::remove_range_dropping_lock(
                central.get(size_class),
                size_class,
                count,
                page_heap,
                pagemap,
            )
        }
    }

    /// Insert a batch of objects for the given size class.
    /// If count == batch_size, tries transfer cache first (O(1)).
    /// Falls through to central free list if cache is full or count != batch_size.
    ///
    /// # Safety
    ///
    /// `head` must point to a valid linked list of `count` `FreeObject`s.
    /// `tail` must be the last node in that list.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn insert_range(
        &self,
        size_class: usize,
        head: *mut FreeObject,
        tail: *mut FreeObject,
        count: usize,
        central: &CentralCache,
        page_heap: &SpinMutex<PageHeap>,
        pagemap: &PageMap,
    ) {
        let batch_size = size_class::batch_size_for(size_class::class_to_size(size_class));

        // Only cache exact-batch-size transfers
        if count == batch_size {
            let mut tc = self.caches[size_class].lock();
            if tc.push(head, tail) {
                return;
            }
            // Transfer cache full -- fall through
        }
        // Transfer cache lock released before central lock

        // Fall through to central free list (with lock dropping for span dealloc)
        unsafe {
            central_free_list::insert_range_dropping_lock(
                central.get(size_class),
                head,
                count,
                page_heap,
                pagemap,
            )
        }
    }
}
