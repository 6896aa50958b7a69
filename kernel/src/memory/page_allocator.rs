//! Physical page allocator.
//!
//! One bit per page frame over the managed span, set = allocated. Grants
//! contiguous runs by first-fit linear scan; the O(total_pages) worst case
//! is acceptable because allocations only happen on heap growth and task
//! creation.

use alloc::{boxed::Box, vec};

use crate::constants::memory::{BITMAP_ENTRY_SIZE, FULL_BITMAP_ENTRY, PAGE_SIZE};

/// One entry of the boot-supplied memory map.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub base: usize,
    pub length: usize,
    pub kind: MemoryRegionKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRegionKind {
    Usable,
    Reserved,
}

pub struct PageAllocator {
    base: usize,
    total_pages: usize,
    free_pages: usize,
    bitmap: Box<[u64]>,
}

impl PageAllocator {
    /// Builds the allocator from the boot memory map. Usable regions below
    /// `reserved_end` (the kernel image and everything the bootstrap
    /// allocator owns) are clipped away; gaps between usable regions stay
    /// marked allocated and are never handed out.
    ///
    /// Panics when the map contains no usable memory — there is nothing to
    /// run on and no safe way to continue.
    pub fn init(regions: &[MemoryRegion], reserved_end: usize) -> Self {
        let reserved_end = page_align_up(reserved_end);

        let mut span_start = usize::MAX;
        let mut span_end = 0;
        for region in regions {
            if region.kind != MemoryRegionKind::Usable {
                continue;
            }
            let mut base = region.base;
            let end = region.base + region.length;
            if base < reserved_end {
                if end <= reserved_end {
                    continue;
                }
                base = reserved_end;
            }
            let base = page_align_up(base);
            let end = end & !(PAGE_SIZE - 1);
            if base >= end {
                continue;
            }
            span_start = span_start.min(base);
            span_end = span_end.max(end);
        }

        if span_start >= span_end {
            panic!("page allocator: no usable memory map supplied");
        }

        let total_pages = (span_end - span_start) / PAGE_SIZE;
        let bitmap_words = total_pages.div_ceil(BITMAP_ENTRY_SIZE);

        // Start fully allocated, then release the usable ranges; anything
        // outside them (gaps, reserved holes) stays unavailable.
        let mut allocator = Self {
            base: span_start,
            total_pages,
            free_pages: 0,
            bitmap: vec![FULL_BITMAP_ENTRY; bitmap_words].into_boxed_slice(),
        };

        for region in regions {
            if region.kind != MemoryRegionKind::Usable {
                continue;
            }
            let mut base = region.base;
            let end = region.base + region.length;
            if base < reserved_end {
                if end <= reserved_end {
                    continue;
                }
                base = reserved_end;
            }
            let base = page_align_up(base);
            let end = end & !(PAGE_SIZE - 1);
            if base >= end {
                continue;
            }
            let first = (base - span_start) / PAGE_SIZE;
            let last = (end - span_start) / PAGE_SIZE;
            for page in first..last {
                allocator.clear_bit(page);
            }
        }

        log::info!(
            "page allocator: managing {} pages at {:#x}, {} free",
            allocator.total_pages,
            allocator.base,
            allocator.free_pages
        );

        allocator
    }

    /// Grants a contiguous run of `pages` pages, first fit. Returns the base
    /// address of the run, or `None` (nothing mutated) when the request is
    /// empty, exceeds the free count, or no run is long enough.
    pub fn alloc(&mut self, pages: usize) -> Option<usize> {
        if pages == 0 || pages > self.free_pages {
            log::warn!(
                "page allocator: not enough pages ({} requested, {} free)",
                pages,
                self.free_pages
            );
            return None;
        }

        let start = match self.find_free_run(pages) {
            Some(start) => start,
            None => {
                log::warn!("page allocator: no contiguous {} pages available", pages);
                return None;
            }
        };

        for page in start..start + pages {
            self.set_bit(page);
        }

        let addr = self.base + start * PAGE_SIZE;
        log::debug!("page allocator: allocated {} pages at {:#x}", pages, addr);
        Some(addr)
    }

    /// Returns a run previously granted by [`alloc`](Self::alloc). Misuse —
    /// null or misaligned address, out-of-range run, any page in the range
    /// not currently allocated (double free) — is diagnosed and ignored.
    pub fn free(&mut self, addr: usize, pages: usize) {
        if addr == 0 || pages == 0 {
            log::warn!(
                "page allocator: invalid free request (addr={:#x}, pages={})",
                addr,
                pages
            );
            return;
        }
        if addr % PAGE_SIZE != 0 {
            log::warn!("page allocator: unaligned free address {:#x}", addr);
            return;
        }
        if addr < self.base {
            log::warn!("page allocator: address {:#x} below managed range", addr);
            return;
        }
        let start = (addr - self.base) / PAGE_SIZE;
        if start + pages > self.total_pages {
            log::warn!("page allocator: invalid address {:#x} for free", addr);
            return;
        }

        for page in start..start + pages {
            if !self.is_bit_set(page) {
                log::warn!(
                    "page allocator: page at {:#x} was not allocated",
                    self.base + page * PAGE_SIZE
                );
                return;
            }
        }

        for page in start..start + pages {
            self.clear_bit(page);
        }
        log::debug!("page allocator: freed {} pages at {:#x}", pages, addr);
    }

    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    pub fn free_pages(&self) -> usize {
        self.free_pages
    }

    /// Whether the page containing `addr` is currently allocated.
    pub fn is_allocated(&self, addr: usize) -> bool {
        let page = (addr - self.base) / PAGE_SIZE;
        self.is_bit_set(page)
    }

    /// First run of `pages` consecutive clear bits, scanning from the
    /// bottom of the span.
    fn find_free_run(&self, pages: usize) -> Option<usize> {
        let mut run = 0;
        for page in 0..self.total_pages {
            if self.is_bit_set(page) {
                run = 0;
            } else {
                run += 1;
                if run == pages {
                    return Some(page + 1 - pages);
                }
            }
        }
        None
    }

    // The bit helpers carry the free-page counter with them, which keeps
    // `free_pages == total_pages - popcount(bitmap)` across every operation.

    fn set_bit(&mut self, page: usize) {
        debug_assert!(page < self.total_pages);
        let word = page / BITMAP_ENTRY_SIZE;
        let bit = page % BITMAP_ENTRY_SIZE;
        self.bitmap[word] |= 1 << bit;
        self.free_pages -= 1;
    }

    fn clear_bit(&mut self, page: usize) {
        debug_assert!(page < self.total_pages);
        let word = page / BITMAP_ENTRY_SIZE;
        let bit = page % BITMAP_ENTRY_SIZE;
        self.bitmap[word] &= !(1 << bit);
        self.free_pages += 1;
    }

    fn is_bit_set(&self, page: usize) -> bool {
        debug_assert!(page < self.total_pages);
        let word = page / BITMAP_ENTRY_SIZE;
        let bit = page % BITMAP_ENTRY_SIZE;
        (self.bitmap[word] & (1 << bit)) != 0
    }
}

fn page_align_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(pages: usize) -> PageAllocator {
        let base = 0x10_0000;
        PageAllocator::init(
            &[MemoryRegion {
                base,
                length: pages * PAGE_SIZE,
                kind: MemoryRegionKind::Usable,
            }],
            base,
        )
    }

    #[test]
    fn round_trip_restores_free_count() {
        let mut pmm = allocator(32);
        let before = pmm.free_pages();

        let addr = pmm.alloc(5).unwrap();
        assert_eq!(pmm.free_pages(), before - 5);
        for i in 0..5 {
            assert!(pmm.is_allocated(addr + i * PAGE_SIZE));
        }

        pmm.free(addr, 5);
        assert_eq!(pmm.free_pages(), before);
        for i in 0..5 {
            assert!(!pmm.is_allocated(addr + i * PAGE_SIZE));
        }
    }

    #[test]
    fn oversized_request_fails_without_mutation() {
        let mut pmm = allocator(8);
        let before = pmm.free_pages();
        assert_eq!(pmm.alloc(9), None);
        assert_eq!(pmm.alloc(0), None);
        assert_eq!(pmm.free_pages(), before);
    }

    #[test]
    fn distinct_allocations_do_not_overlap() {
        let mut pmm = allocator(8);
        let a = pmm.alloc(1).unwrap();
        let b = pmm.alloc(1).unwrap();
        assert_ne!(a, b);
        assert!(a.abs_diff(b) >= PAGE_SIZE);
    }

    #[test]
    fn first_fit_reuses_lowest_freed_run() {
        let mut pmm = allocator(8);
        let a = pmm.alloc(1).unwrap();
        let _b = pmm.alloc(1).unwrap();
        pmm.free(a, 1);
        // First fit scans from the bottom, so the hole at `a` wins.
        assert_eq!(pmm.alloc(1), Some(a));
    }

    #[test]
    fn double_free_is_diagnosed_and_ignored() {
        let mut pmm = allocator(8);
        let addr = pmm.alloc(2).unwrap();
        pmm.free(addr, 2);
        let after_first = pmm.free_pages();
        pmm.free(addr, 2);
        assert_eq!(pmm.free_pages(), after_first);
    }

    #[test]
    fn free_rejects_bad_addresses() {
        let mut pmm = allocator(8);
        let before = pmm.free_pages();
        pmm.free(0, 1);
        pmm.free(0x10_0001, 1); // unaligned
        pmm.free(0x1000, 1); // below the managed span
        assert_eq!(pmm.free_pages(), before);
    }

    #[test]
    fn fragmented_span_has_no_long_run() {
        let mut pmm = allocator(8);
        let before = pmm.free_pages();
        // Pin every other page, leaving only single-page holes.
        let mut pinned = alloc::vec::Vec::new();
        for _ in 0..4 {
            pinned.push(pmm.alloc(1).unwrap());
            pmm.alloc(1).unwrap();
        }
        for addr in &pinned {
            pmm.free(*addr, 1);
        }
        assert_eq!(pmm.alloc(2), None);
        assert_eq!(pmm.free_pages(), before - 4);
    }

    #[test]
    fn reserved_prefix_is_clipped() {
        let base = 0x10_0000;
        let pmm = PageAllocator::init(
            &[MemoryRegion {
                base,
                length: 16 * PAGE_SIZE,
                kind: MemoryRegionKind::Usable,
            }],
            base + 4 * PAGE_SIZE,
        );
        assert_eq!(pmm.total_pages(), 12);
        assert_eq!(pmm.free_pages(), 12);
    }

    #[test]
    #[should_panic(expected = "no usable memory map")]
    fn empty_map_is_fatal() {
        PageAllocator::init(
            &[MemoryRegion {
                base: 0,
                length: 0x8000,
                kind: MemoryRegionKind::Reserved,
            }],
            0,
        );
    }
}
