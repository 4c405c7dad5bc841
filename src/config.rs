//! Fixed allocator constants.
//!
//! These are plain compile-time constants rather than a `build.rs`-generated
//! table: every value here is fixed by the allocator's design, not a
//! deployment-time tunable, so there is no build-time configurability to
//! wire up.

/// Alignment (in bytes) of every allocation, and the minimum block size —
/// a free block must hold an embedded next-pointer of this width.
pub const ALIGNMENT: usize = 8;

/// Requests larger than this bypass the tiered cache and go straight to
/// the page heap / OS.
pub const MAX_BYTES: usize = 262_144; // 256 KiB

/// Number of distinct size classes (`MAX_BYTES / ALIGNMENT`).
pub const FREE_LIST_SIZE: usize = MAX_BYTES / ALIGNMENT;

/// Page size used by the page heap.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12; // log2(PAGE_SIZE)

/// Default page-span size the central cache requests for size classes
/// whose backing fits within this many pages.
pub const SPAN_PAGES: usize = 8;

/// Largest page-list index the page heap tracks by exact page count before
/// falling back to a best-fit scan over `large_spans`.
pub const MAX_PAGES: usize = 128;

/// Overall thread-cache budget shared (via claim/return) across all threads.
pub const OVERALL_THREAD_CACHE_SIZE: usize = 32 * 1024 * 1024;
/// Budget a thread cache claims on first use.
pub const MIN_PER_THREAD_CACHE_SIZE: usize = 512 * 1024;
/// Chunk size a thread cache steals from the shared budget when it keeps
/// scavenging (i.e. is under active, sustained load).
pub const STEAL_AMOUNT: usize = 64 * 1024;
/// Per-size-class cap on how large a thread-cache free list is allowed to
/// grow before it stops expanding.
pub const MAX_DYNAMIC_FREE_LIST_LENGTH: u32 = 8192;
/// Consecutive refill overages before a thread-cache free list's
/// `max_length` is shrunk back down.
pub const MAX_OVERAGES: u32 = 3;
/// Capacity of each size class's transfer-cache batch stack.
pub const MAX_TRANSFER_SLOTS: usize = 64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_list_size_matches_formula() {
        assert_eq!(FREE_LIST_SIZE, MAX_BYTES / ALIGNMENT);
        assert_eq!(FREE_LIST_SIZE, 32768);
    }

    #[test]
    fn page_shift_matches_page_size() {
        assert_eq!(1usize << PAGE_SHIFT, PAGE_SIZE);
    }
}
