//! Physical memory manager.
//!
//! One bit per 4 KiB page over a contiguous RAM window. The bitmap is the
//! canonical free/used record: freeing clears a bit, allocation sets it,
//! nothing else is bookkept.

use crate::error::{KernelError, KernelResult};
use crate::sync::IrqMutex;

/// Size of one physical page.
pub const PAGE_SIZE: usize = 4096;

/// Largest RAM window the bitmap covers (128 MiB).
pub const MAX_PAGES: usize = 32 * 1024;

const WORDS: usize = MAX_PAGES / 32;

/// Bitmap allocator over a page-granular window starting at physical 0.
pub struct FrameBitmap {
    bitmap: [u32; WORDS],
    total_pages: usize,
    free_pages: usize,
}

impl FrameBitmap {
    pub const fn empty() -> Self {
        Self {
            bitmap: [0; WORDS],
            total_pages: 0,
            free_pages: 0,
        }
    }

    /// Cover `ram_bytes` of physical memory, all pages initially free.
    pub fn new(ram_bytes: u32) -> Self {
        let mut map = Self::empty();
        map.total_pages = (ram_bytes as usize / PAGE_SIZE).min(MAX_PAGES);
        map.free_pages = map.total_pages;
        map
    }

    fn page_used(&self, page: usize) -> bool {
        self.bitmap[page / 32] & (1 << (page % 32)) != 0
    }

    fn mark_used(&mut self, page: usize) {
        debug_assert!(!self.page_used(page));
        self.bitmap[page / 32] |= 1 << (page % 32);
        self.free_pages -= 1;
    }

    fn mark_free(&mut self, page: usize) {
        debug_assert!(self.page_used(page));
        self.bitmap[page / 32] &= !(1 << (page % 32));
        self.free_pages += 1;
    }

    /// First-fit scan for `count` contiguous free pages; returns the base
    /// address of the run.
    pub fn alloc_contiguous(&mut self, count: usize) -> KernelResult<u32> {
        if count == 0 {
            return Err(KernelError::InvalidArgument {
                name: "count",
                value: "zero pages requested",
            });
        }
        if count > self.free_pages {
            return Err(KernelError::OutOfMemory {
                requested: count * PAGE_SIZE,
            });
        }

        let mut run_start = 0usize;
        let mut run_len = 0usize;
        for page in 0..self.total_pages {
            if self.page_used(page) {
                run_len = 0;
                continue;
            }
            if run_len == 0 {
                run_start = page;
            }
            run_len += 1;
            if run_len == count {
                for p in run_start..run_start + count {
                    self.mark_used(p);
                }
                return Ok((run_start * PAGE_SIZE) as u32);
            }
        }

        Err(KernelError::OutOfMemory {
            requested: count * PAGE_SIZE,
        })
    }

    /// Allocate a single page.
    pub fn alloc_page(&mut self) -> KernelResult<u32> {
        self.alloc_contiguous(1)
    }

    /// Return one page to the pool. `addr` must be page-aligned and
    /// currently allocated.
    pub fn free_page(&mut self, addr: u32) -> KernelResult<()> {
        if addr as usize % PAGE_SIZE != 0 {
            return Err(KernelError::InvalidArgument {
                name: "addr",
                value: "not page-aligned",
            });
        }
        let page = addr as usize / PAGE_SIZE;
        if page >= self.total_pages || !self.page_used(page) {
            return Err(KernelError::InvalidArgument {
                name: "addr",
                value: "page not allocated",
            });
        }
        self.mark_free(page);
        Ok(())
    }

    /// Free a contiguous run previously obtained from [`alloc_contiguous`].
    pub fn free_contiguous(&mut self, addr: u32, count: usize) -> KernelResult<()> {
        for i in 0..count {
            self.free_page(addr + (i * PAGE_SIZE) as u32)?;
        }
        Ok(())
    }

    /// Permanently mark `[start, end)` as used (kernel image, MMIO holes).
    /// Ranges outside the managed window are clipped.
    pub fn reserve_range(&mut self, start: u32, end: u32) -> KernelResult<()> {
        if end <= start {
            return Err(KernelError::InvalidArgument {
                name: "range",
                value: "end before start",
            });
        }
        let first = start as usize / PAGE_SIZE;
        let last = (end as usize).div_ceil(PAGE_SIZE);
        for page in first..last.min(self.total_pages) {
            if !self.page_used(page) {
                self.mark_used(page);
            }
        }
        Ok(())
    }

    /// True if the page holding `addr` is allocated/reserved.
    pub fn is_allocated(&self, addr: u32) -> bool {
        let page = addr as usize / PAGE_SIZE;
        page < self.total_pages && self.page_used(page)
    }

    pub fn free_pages(&self) -> usize {
        self.free_pages
    }

    pub fn total_pages(&self) -> usize {
        self.total_pages
    }
}

static PMM: IrqMutex<FrameBitmap> = IrqMutex::new(FrameBitmap::empty());

/// Initialize the global allocator over `ram_bytes` of RAM.
pub fn init(ram_bytes: u32) -> KernelResult<()> {
    let mut pmm = PMM.lock();
    if pmm.total_pages() != 0 {
        return Err(KernelError::InvalidArgument {
            name: "pmm",
            value: "already initialized",
        });
    }
    *pmm = FrameBitmap::new(ram_bytes);
    Ok(())
}

pub fn alloc_page() -> KernelResult<u32> {
    PMM.lock().alloc_page()
}

pub fn alloc_contiguous(count: usize) -> KernelResult<u32> {
    PMM.lock().alloc_contiguous(count)
}

pub fn free_page(addr: u32) -> KernelResult<()> {
    PMM.lock().free_page(addr)
}

pub fn free_contiguous(addr: u32, count: usize) -> KernelResult<()> {
    PMM.lock().free_contiguous(addr, count)
}

pub fn reserve_range(start: u32, end: u32) -> KernelResult<()> {
    PMM.lock().reserve_range(start, end)
}

pub fn free_pages() -> usize {
    PMM.lock().free_pages()
}

pub fn total_pages() -> usize {
    PMM.lock().total_pages()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_map() -> FrameBitmap {
        FrameBitmap::new(64 * PAGE_SIZE as u32)
    }

    #[test]
    fn alloc_returns_page_aligned_addresses() {
        let mut map = small_map();
        let a = map.alloc_page().unwrap();
        let b = map.alloc_page().unwrap();
        assert_eq!(a as usize % PAGE_SIZE, 0);
        assert_eq!(b as usize % PAGE_SIZE, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn zero_page_request_is_an_error() {
        let mut map = small_map();
        assert!(map.alloc_contiguous(0).is_err());
    }

    #[test]
    fn full_window_allocation_needs_all_pages_free() {
        let mut map = small_map();
        let base = map.alloc_contiguous(64).unwrap();
        assert_eq!(base, 0);
        assert_eq!(map.free_pages(), 0);
        assert!(map.alloc_page().is_err());

        map.free_contiguous(base, 64).unwrap();
        assert_eq!(map.free_pages(), 64);

        // With one page taken, the full-window run no longer exists.
        map.alloc_page().unwrap();
        assert!(map.alloc_contiguous(64).is_err());
    }

    #[test]
    fn contiguous_run_skips_reserved_holes() {
        let mut map = small_map();
        // Reserve page 2, leaving runs [0,1] and [3..).
        map.reserve_range(2 * PAGE_SIZE as u32, 3 * PAGE_SIZE as u32)
            .unwrap();
        let run = map.alloc_contiguous(4).unwrap();
        assert_eq!(run as usize / PAGE_SIZE, 3);
    }

    #[test]
    fn free_restores_prior_count() {
        let mut map = small_map();
        let before = map.free_pages();
        let run = map.alloc_contiguous(8).unwrap();
        assert_eq!(map.free_pages(), before - 8);
        map.free_contiguous(run, 8).unwrap();
        assert_eq!(map.free_pages(), before);
    }

    #[test]
    fn double_free_is_rejected() {
        let mut map = small_map();
        let page = map.alloc_page().unwrap();
        map.free_page(page).unwrap();
        assert!(map.free_page(page).is_err());
    }

    #[test]
    fn unaligned_free_is_rejected() {
        let mut map = small_map();
        let page = map.alloc_page().unwrap();
        assert!(map.free_page(page + 1).is_err());
        map.free_page(page).unwrap();
    }

    #[test]
    fn reserved_pages_are_reported_allocated() {
        let mut map = small_map();
        map.reserve_range(0, PAGE_SIZE as u32).unwrap();
        assert!(map.is_allocated(0));
        assert!(!map.is_allocated(PAGE_SIZE as u32));
    }
}
