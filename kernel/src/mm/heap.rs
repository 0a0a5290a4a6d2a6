//! Canary-guarded kernel heap.
//!
//! First-fit free list over page regions obtained from the PMM. Every
//! allocated block carries a front canary in its header and a 32-bit back
//! canary directly after the payload; a mismatch on free is memory
//! corruption and panics the kernel. Freed payloads are poisoned so
//! use-after-free reads are loud. The allocation tracker records every
//! live block for leak reports.
//!
//! On bare metal this heap backs `#[global_allocator]`; hosted test builds
//! exercise it over plain byte arenas instead.

use core::panic::Location;

use crate::mm::tracker::{AllocRecord, AllocTracker};
use crate::sync::IrqMutex;

const FRONT_MAGIC: u32 = 0xFEED_FACE;
const BACK_MAGIC: u32 = 0xDEAD_C0DE;
const POISON_FREE: u8 = 0x5A;

/// All payloads are 8-aligned and sized in 8-byte steps.
pub const ALIGN: usize = 8;

/// A split only happens when the remainder can hold a header plus this much
/// payload.
const MIN_SPLIT: usize = 32;

const BACK_CANARY_SIZE: usize = 4;

#[repr(C)]
struct BlockHeader {
    front_canary: u32,
    free: u32,
    /// Rounded request size; the back canary sits at `payload + size`.
    size: usize,
    /// Extent of the payload area up to the next header (>= size + 4 for
    /// allocated blocks).
    capacity: usize,
    next: *mut BlockHeader,
    timestamp_ms: u64,
    site: &'static Location<'static>,
}

const fn header_size() -> usize {
    (core::mem::size_of::<BlockHeader>() + ALIGN - 1) & !(ALIGN - 1)
}

/// Point-in-time allocator statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub active_count: usize,
    pub total_bytes: usize,
    pub peak_count: usize,
    pub peak_bytes: usize,
    pub alloc_calls: u64,
    pub free_calls: u64,
    pub region_bytes: usize,
}

/// The allocator proper. Not internally locked; see [`LockedHeap`].
pub struct Heap {
    head: *mut BlockHeader,
    stats: HeapStats,
    tracker: AllocTracker,
}

// SAFETY: the raw block pointers are only dereferenced while the owning
// IrqMutex is held.
unsafe impl Send for Heap {}

impl Heap {
    pub const fn new() -> Self {
        Self {
            head: core::ptr::null_mut(),
            stats: HeapStats {
                active_count: 0,
                total_bytes: 0,
                peak_count: 0,
                peak_bytes: 0,
                alloc_calls: 0,
                free_calls: 0,
                region_bytes: 0,
            },
            tracker: AllocTracker::new(),
        }
    }

    /// Hand a raw memory region to the heap. Regions never leave again.
    ///
    /// # Safety
    /// `base..base+len` must be valid, unused memory that outlives the heap.
    #[track_caller]
    pub unsafe fn add_region(&mut self, base: *mut u8, len: usize) {
        let aligned = (base as usize + ALIGN - 1) & !(ALIGN - 1);
        let slack = aligned - base as usize;
        if len < slack + header_size() + MIN_SPLIT {
            return;
        }
        let len = len - slack;

        let block = aligned as *mut BlockHeader;
        // SAFETY: `block` points into the caller-provided region with space
        // for a header (checked above).
        unsafe {
            (*block).front_canary = FRONT_MAGIC;
            (*block).free = 1;
            (*block).size = 0;
            (*block).capacity = len - header_size();
            (*block).next = core::ptr::null_mut();
            (*block).timestamp_ms = 0;
            (*block).site = Location::caller();
        }
        self.stats.region_bytes += len;
        self.insert_sorted(block);
    }

    /// Keep the list address-ordered so predecessor merging stays a single
    /// forward scan.
    fn insert_sorted(&mut self, block: *mut BlockHeader) {
        if self.head.is_null() || (block as usize) < (self.head as usize) {
            // SAFETY: block is a valid header written by add_region.
            unsafe { (*block).next = self.head };
            self.head = block;
            return;
        }
        let mut cur = self.head;
        // SAFETY: every pointer on the list is a live header owned by us.
        unsafe {
            while !(*cur).next.is_null() && ((*cur).next as usize) < (block as usize) {
                cur = (*cur).next;
            }
            (*block).next = (*cur).next;
            (*cur).next = block;
        }
    }

    /// Allocate `size` bytes. Returns null when out of memory or `size == 0`
    /// (no record is created for either).
    #[track_caller]
    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        if size == 0 {
            return core::ptr::null_mut();
        }
        self.stats.alloc_calls += 1;

        let rounded = (size + ALIGN - 1) & !(ALIGN - 1);
        let need = rounded + BACK_CANARY_SIZE;

        let mut block = self.head;
        while !block.is_null() {
            // SAFETY: list pointers are live headers.
            unsafe {
                if (*block).free == 1 && (*block).capacity >= need {
                    self.carve(block, rounded, need, Location::caller());
                    return (block as *mut u8).add(header_size());
                }
                block = (*block).next;
            }
        }
        core::ptr::null_mut()
    }

    /// Turn the free block into an allocated one, splitting off the tail
    /// when it is worth a header.
    ///
    /// # Safety (internal)
    /// `block` must be a free block on the list with `capacity >= need`.
    fn carve(
        &mut self,
        block: *mut BlockHeader,
        rounded: usize,
        need: usize,
        site: &'static Location<'static>,
    ) {
        // SAFETY: caller contract; all arithmetic stays inside the block's
        // region extent.
        unsafe {
            let payload = (block as *mut u8).add(header_size());
            let spare = (*block).capacity - need;
            if spare >= header_size() + MIN_SPLIT {
                let tail = payload.add(need) as *mut BlockHeader;
                (*tail).front_canary = FRONT_MAGIC;
                (*tail).free = 1;
                (*tail).size = 0;
                (*tail).capacity = spare - header_size();
                (*tail).next = (*block).next;
                (*tail).timestamp_ms = 0;
                (*tail).site = site;
                (*block).next = tail;
                (*block).capacity = need;
            }

            let now = crate::timer::uptime_ms();
            (*block).free = 0;
            (*block).size = rounded;
            (*block).timestamp_ms = now;
            (*block).site = site;

            // Back canary directly after the payload.
            let back = payload.add(rounded) as *mut u32;
            back.write_unaligned(BACK_MAGIC);

            self.stats.active_count += 1;
            self.stats.total_bytes += rounded;
            self.stats.peak_count = self.stats.peak_count.max(self.stats.active_count);
            self.stats.peak_bytes = self.stats.peak_bytes.max(self.stats.total_bytes);
            self.tracker
                .record_alloc(payload as usize, rounded, now, site);
        }
    }

    /// Free a payload pointer previously returned by [`alloc`].
    ///
    /// Panics on canary mismatch or double free — both mean corruption, and
    /// the kernel never limps past corrupted memory.
    ///
    /// # Safety
    /// `ptr` must be a payload pointer from this heap, freed at most once.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let block = (ptr as usize - header_size()) as *mut BlockHeader;

        // SAFETY: per the caller contract `block` is one of our headers;
        // every check below reads memory this heap owns.
        unsafe {
            if (*block).front_canary != FRONT_MAGIC {
                panic!(
                    "heap corruption: front canary smashed at {:p} (allocated at {})",
                    ptr,
                    (*block).site
                );
            }
            if (*block).free == 1 {
                panic!("heap corruption: double free of {:p}", ptr);
            }
            let back = ptr.add((*block).size) as *const u32;
            if back.read_unaligned() != BACK_MAGIC {
                panic!(
                    "heap corruption: back canary smashed at {:p} (size {}, allocated at {})",
                    ptr,
                    (*block).size,
                    (*block).site
                );
            }

            self.stats.free_calls += 1;
            self.stats.active_count -= 1;
            self.stats.total_bytes -= (*block).size;
            self.tracker.record_free(ptr as usize);

            core::ptr::write_bytes(ptr, POISON_FREE, (*block).size);
            (*block).free = 1;
            (*block).size = 0;

            self.merge_forward(block);
            self.merge_with_predecessor(block);
        }
    }

    /// Absorb directly adjacent free successors.
    unsafe fn merge_forward(&mut self, block: *mut BlockHeader) {
        // SAFETY: list pointers are live headers; adjacency is verified by
        // address arithmetic before every merge.
        unsafe {
            while !(*block).next.is_null() {
                let next = (*block).next;
                let end = block as usize + header_size() + (*block).capacity;
                if end != next as usize || (*next).free == 0 {
                    break;
                }
                (*block).capacity += header_size() + (*next).capacity;
                (*block).next = (*next).next;
            }
        }
    }

    /// Single linear scan to find and absorb into a free predecessor.
    unsafe fn merge_with_predecessor(&mut self, block: *mut BlockHeader) {
        let mut cur = self.head;
        // SAFETY: list pointers are live headers.
        unsafe {
            while !cur.is_null() {
                if (*cur).next == block {
                    let end = cur as usize + header_size() + (*cur).capacity;
                    if (*cur).free == 1 && end == block as usize {
                        (*cur).capacity += header_size() + (*block).capacity;
                        (*cur).next = (*block).next;
                    }
                    return;
                }
                cur = (*cur).next;
            }
        }
    }

    /// Walk every block and verify canaries of live allocations. Panics on
    /// the first corrupt block.
    pub fn validate(&self) {
        let mut block = self.head;
        // SAFETY: list pointers are live headers.
        unsafe {
            while !block.is_null() {
                if (*block).front_canary != FRONT_MAGIC {
                    panic!("heap corruption: header canary smashed at {:p}", block);
                }
                if (*block).free == 0 {
                    let payload = (block as *const u8).add(header_size());
                    let back = payload.add((*block).size) as *const u32;
                    if back.read_unaligned() != BACK_MAGIC {
                        panic!(
                            "heap corruption: back canary smashed for {:p} (allocated at {})",
                            payload,
                            (*block).site
                        );
                    }
                }
                block = (*block).next;
            }
        }
    }

    pub fn stats(&self) -> HeapStats {
        self.stats
    }

    /// Visit live allocations older than `older_than_ms`.
    pub fn report_leaks(&self, older_than_ms: u64, visit: impl FnMut(&AllocRecord)) -> usize {
        self.tracker
            .report_leaks(crate::timer::uptime_ms(), older_than_ms, visit)
    }

    /// Largest free block currently available (for `free`-style diagnostics).
    pub fn largest_free_block(&self) -> usize {
        let mut best = 0;
        let mut block = self.head;
        // SAFETY: list pointers are live headers.
        unsafe {
            while !block.is_null() {
                if (*block).free == 1 {
                    best = best.max((*block).capacity);
                }
                block = (*block).next;
            }
        }
        best
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Global instance
// ---------------------------------------------------------------------------

/// IRQ-safe wrapper; the bare-metal `#[global_allocator]`.
pub struct LockedHeap {
    inner: IrqMutex<Heap>,
}

impl LockedHeap {
    pub const fn new() -> Self {
        Self {
            inner: IrqMutex::new(Heap::new()),
        }
    }

    #[track_caller]
    pub fn alloc(&self, size: usize) -> *mut u8 {
        let ptr = self.inner.lock().alloc(size);
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        if ptr.is_null() && size > 0 {
            if self.grow(size) {
                return self.inner.lock().alloc(size);
            }
        }
        ptr
    }

    /// # Safety
    /// Same contract as [`Heap::free`].
    pub unsafe fn free(&self, ptr: *mut u8) {
        // SAFETY: forwarded contract.
        unsafe { self.inner.lock().free(ptr) };
    }

    pub fn stats(&self) -> HeapStats {
        self.inner.lock().stats()
    }

    pub fn validate(&self) {
        self.inner.lock().validate()
    }

    pub fn report_leaks(&self, older_than_ms: u64, visit: impl FnMut(&AllocRecord)) -> usize {
        self.inner.lock().report_leaks(older_than_ms, visit)
    }

    pub fn largest_free_block(&self) -> usize {
        self.inner.lock().largest_free_block()
    }

    /// Pull more pages from the PMM. Expansion unit is whole pages, at least
    /// enough for the failed request plus bookkeeping.
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    fn grow(&self, min_bytes: usize) -> bool {
        use crate::mm::pmm;
        let pages = (min_bytes + header_size() + BACK_CANARY_SIZE)
            .div_ceil(pmm::PAGE_SIZE)
            .max(16);
        match pmm::alloc_contiguous(pages) {
            Ok(base) => {
                // SAFETY: the PMM handed us exclusive ownership of the
                // identity-mapped run.
                unsafe {
                    self.inner
                        .lock()
                        .add_region(base as usize as *mut u8, pages * pmm::PAGE_SIZE)
                };
                true
            }
            Err(_) => false,
        }
    }
}

/// The kernel heap. On bare metal this is the global allocator; hosted test
/// builds leave it empty and use the system allocator instead.
#[cfg_attr(all(target_arch = "x86", target_os = "none"), global_allocator)]
pub static KERNEL_HEAP: LockedHeap = LockedHeap::new();

#[cfg(all(target_arch = "x86", target_os = "none"))]
unsafe impl core::alloc::GlobalAlloc for LockedHeap {
    unsafe fn alloc(&self, layout: core::alloc::Layout) -> *mut u8 {
        if layout.align() > ALIGN {
            return core::ptr::null_mut();
        }
        LockedHeap::alloc(self, layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: core::alloc::Layout) {
        // SAFETY: `ptr` came from `alloc` above per the GlobalAlloc contract.
        unsafe { self.free(ptr) };
    }
}

/// Seed the heap with its first region.
pub fn init() -> crate::error::KernelResult<()> {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    {
        use crate::mm::pmm;
        const INITIAL_PAGES: usize = 256; // 1 MiB
        let base = pmm::alloc_contiguous(INITIAL_PAGES)?;
        // SAFETY: fresh pages from the PMM, identity mapped.
        unsafe {
            KERNEL_HEAP
                .inner
                .lock()
                .add_region(base as usize as *mut u8, INITIAL_PAGES * pmm::PAGE_SIZE)
        };
        log::info!("heap: seeded with {} KiB", INITIAL_PAGES * 4);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    extern crate std;
    use std::vec;
    use std::vec::Vec;

    /// A heap over a leaked arena. Leaking keeps the region 'static, which
    /// mirrors the bare-metal ownership model.
    fn arena_heap(bytes: usize) -> Heap {
        let arena: &'static mut [u8] = Vec::leak(vec![0u8; bytes]);
        let mut heap = Heap::new();
        // SAFETY: the leaked arena is valid and exclusively ours.
        unsafe { heap.add_region(arena.as_mut_ptr(), arena.len()) };
        heap
    }

    #[test]
    fn alloc_returns_aligned_nonnull() {
        let mut heap = arena_heap(4096);
        let p = heap.alloc(24);
        assert!(!p.is_null());
        assert_eq!(p as usize % ALIGN, 0);
    }

    #[test]
    fn alloc_zero_returns_null_without_record() {
        let mut heap = arena_heap(4096);
        assert!(heap.alloc(0).is_null());
        assert_eq!(heap.stats().active_count, 0);
        assert_eq!(heap.stats().total_bytes, 0);
    }

    #[test]
    fn canaries_bracket_every_allocation() {
        let mut heap = arena_heap(4096);
        let p = heap.alloc(20);
        assert!(!p.is_null());
        // SAFETY: reading the words the allocator just planted around the
        // payload of a live allocation.
        unsafe {
            let front = (p.sub(header_size()) as *const u32).read();
            assert_eq!(front, FRONT_MAGIC);
            let back = (p.add(24) as *const u32).read_unaligned(); // 20 rounds to 24
            assert_eq!(back, BACK_MAGIC);
        }
        heap.validate();
    }

    #[test]
    fn paired_alloc_free_returns_stats_to_zero() {
        let mut heap = arena_heap(8192);
        let mut ptrs = Vec::new();
        for i in 1..16 {
            ptrs.push(heap.alloc(i * 8));
        }
        for p in ptrs {
            // SAFETY: freeing pointers this heap handed out.
            unsafe { heap.free(p) };
        }
        let stats = heap.stats();
        assert_eq!(stats.active_count, 0);
        assert_eq!(stats.total_bytes, 0);
        assert!(stats.peak_count >= 15);
    }

    #[test]
    fn free_blocks_coalesce_back_into_one() {
        let mut heap = arena_heap(4096);
        let big = heap.largest_free_block();
        let a = heap.alloc(64);
        let b = heap.alloc(64);
        let c = heap.alloc(64);
        // Free in an order that exercises both forward and predecessor
        // merging.
        // SAFETY: freeing pointers this heap handed out.
        unsafe {
            heap.free(b);
            heap.free(a);
            heap.free(c);
        }
        assert_eq!(heap.largest_free_block(), big);
    }

    #[test]
    fn freed_payload_is_poisoned() {
        let mut heap = arena_heap(4096);
        let p = heap.alloc(32);
        // SAFETY: p is live until the free; the poison read below inspects
        // memory still owned by the heap arena.
        unsafe {
            p.write_bytes(0xAB, 32);
            heap.free(p);
            assert_eq!(p.read(), POISON_FREE);
            assert_eq!(p.add(31).read(), POISON_FREE);
        }
    }

    #[test]
    #[should_panic(expected = "back canary")]
    fn overflow_write_panics_on_free() {
        let mut heap = arena_heap(4096);
        let p = heap.alloc(16);
        // SAFETY: deliberately corrupting the back canary to prove the heap
        // notices.
        unsafe {
            p.add(16).write(0xFF); // first byte of the back canary
            heap.free(p);
        }
    }

    #[test]
    #[should_panic(expected = "front canary")]
    fn header_trample_panics_on_free() {
        let mut heap = arena_heap(4096);
        let p = heap.alloc(16);
        // SAFETY: deliberately corrupting the header canary.
        unsafe {
            (p.sub(header_size()) as *mut u32).write(0);
            heap.free(p);
        }
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let mut heap = arena_heap(4096);
        let p = heap.alloc(16);
        // SAFETY: the second free is the deliberate fault under test.
        unsafe {
            heap.free(p);
            heap.free(p);
        }
    }

    #[test]
    fn exhaustion_returns_null_not_panic() {
        let mut heap = arena_heap(1024);
        assert!(heap.alloc(4096).is_null());
    }

    #[test]
    fn split_leaves_usable_tail() {
        let mut heap = arena_heap(4096);
        let a = heap.alloc(64);
        assert!(!a.is_null());
        let b = heap.alloc(64);
        assert!(!b.is_null());
        assert!(b as usize > a as usize);
    }

    #[test]
    fn leak_report_lists_old_allocations() {
        let mut heap = arena_heap(4096);
        let _stale = heap.alloc(40);
        let mut hits = 0;
        // Everything is "old" relative to a zero threshold.
        let n = heap.report_leaks(0, |r| {
            assert_eq!(r.size, 40);
            hits += 1;
        });
        assert_eq!(n, 1);
        assert_eq!(hits, 1);
    }

    #[test]
    fn regions_can_be_added_incrementally() {
        let mut heap = arena_heap(512);
        assert!(heap.alloc(1024).is_null());
        let extra: &'static mut [u8] = Vec::leak(vec![0u8; 4096]);
        // SAFETY: leaked arena, exclusively ours.
        unsafe { heap.add_region(extra.as_mut_ptr(), extra.len()) };
        assert!(!heap.alloc(1024).is_null());
    }
}
