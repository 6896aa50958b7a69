//! The kernel service heap.
//!
//! Variable-size blocks carved out of page runs drawn from the page
//! allocator. Every block carries an in-band header directly in front of
//! its payload; the ordering and bookkeeping live out-of-band in a
//! [`LinkedArena`], in allocation order (not address order). Allocation is
//! best-fit with splitting; freeing coalesces with the list-adjacent
//! neighbors and hands whole page runs back to the page allocator when an
//! edge block becomes free.

use core::ptr::NonNull;

use crate::collections::{Handle, LinkedArena};
use crate::constants::memory::{HEAP_MAGIC, HEAP_SPLIT_MIN, PAGE_SIZE};
use crate::memory::page_allocator::PageAllocator;

/// In-band block header. Callers receive a pointer exactly past one of
/// these; `size` never includes the header itself.
#[repr(C)]
struct BlockHeader {
    magic: u32,
    free: u32,
    size: usize,
}

const HEADER_SIZE: usize = core::mem::size_of::<BlockHeader>();

/// Out-of-band record mirroring one in-band header.
#[derive(Debug, Clone, Copy)]
struct Block {
    /// Address of the in-band header.
    addr: usize,
    /// Payload capacity in bytes.
    size: usize,
    free: bool,
}

impl Block {
    fn payload(&self) -> usize {
        self.addr + HEADER_SIZE
    }

    fn end(&self) -> usize {
        self.addr + HEADER_SIZE + self.size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// The pointer does not sit past the header of any known block.
    UnknownBlock,
    /// The block is already free.
    NotAllocated,
    /// The in-band magic was overwritten.
    CorruptMagic,
    /// Write length exceeds the block's recorded capacity.
    WriteTooLarge,
    /// Null pointer or empty buffer.
    InvalidArgument,
}

/// All heap state. The owner decides how it is shared; the kernel keeps one
/// instance behind [`crate::memory::KERNEL_HEAP`].
///
/// Block addresses must point into memory the page allocator manages and
/// the kernel may dereference; that contract is established by
/// [`crate::memory::init`].
pub struct KernelHeap {
    blocks: LinkedArena<Block>,
}

impl KernelHeap {
    pub const fn new() -> Self {
        KernelHeap {
            blocks: LinkedArena::new(),
        }
    }

    /// Grants `size` bytes, rounded up to a 4-byte boundary. Returns a
    /// pointer just past the block's header, or `None` on a zero-size
    /// request or page-allocator exhaustion.
    pub fn allocate(&mut self, pmm: &mut PageAllocator, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            log::warn!("heap: zero-size allocation request");
            return None;
        }
        let size = (size + 3) & !3;

        let mut best: Option<(Handle, usize)> = None;
        for (handle, block) in self.blocks.iter() {
            if block.free && block.size >= size {
                match best {
                    Some((_, best_size)) if block.size >= best_size => {}
                    _ => best = Some((handle, block.size)),
                }
            }
        }

        let handle = match best {
            Some((handle, _)) => handle,
            None => self.grow(pmm, size)?,
        };

        self.split(handle, size);

        let block = self
            .blocks
            .get_mut(handle)
            .expect("heap: chosen block vanished");
        block.free = false;
        let block = *block;
        unsafe { write_header(&block) };

        log::debug!("heap: allocated {} bytes at {:#x}", size, block.payload());
        NonNull::new(block.payload() as *mut u8)
    }

    /// Returns a block to the heap. Double frees, pointers the heap never
    /// handed out, and corrupted headers are diagnosed and leave all state
    /// untouched. On success the payload is zeroed, the block coalesced
    /// with free list-neighbors, and edge blocks handed back to the page
    /// allocator when nothing else uses their pages.
    pub fn release(&mut self, pmm: &mut PageAllocator, ptr: *mut u8) -> Result<(), HeapError> {
        if ptr.is_null() {
            return Ok(());
        }
        let header_addr = ptr as usize - HEADER_SIZE;
        let handle = self.find_block(header_addr).ok_or(HeapError::UnknownBlock)?;

        let block = *self.blocks.get(handle).expect("heap: stale block handle");
        if block.free {
            return Err(HeapError::NotAllocated);
        }
        if unsafe { read_magic(block.addr) } != HEAP_MAGIC {
            return Err(HeapError::CorruptMagic);
        }

        log::debug!("heap: freeing {} bytes at {:#x}", block.size, ptr as usize);
        unsafe {
            core::ptr::write_bytes(ptr, 0, block.size);
        }
        {
            let block = self.blocks.get_mut(handle).expect("heap: stale block handle");
            block.free = true;
            let block = *block;
            unsafe { write_header(&block) };
        }

        let handle = self.coalesce(handle);
        self.try_reclaim_pages(pmm, handle);
        Ok(())
    }

    /// Bounds-checked write into a live allocation. Either the whole buffer
    /// lands or nothing does.
    pub fn write(&mut self, ptr: *mut u8, data: &[u8]) -> Result<usize, HeapError> {
        if ptr.is_null() || data.is_empty() {
            return Err(HeapError::InvalidArgument);
        }
        let header_addr = ptr as usize - HEADER_SIZE;
        let handle = self.find_block(header_addr).ok_or(HeapError::UnknownBlock)?;
        let block = *self.blocks.get(handle).expect("heap: stale block handle");

        if block.free {
            return Err(HeapError::NotAllocated);
        }
        if unsafe { read_magic(block.addr) } != HEAP_MAGIC {
            return Err(HeapError::CorruptMagic);
        }
        if data.len() > block.size {
            return Err(HeapError::WriteTooLarge);
        }

        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len());
        }
        log::debug!("heap: wrote {} bytes to {:#x}", data.len(), ptr as usize);
        Ok(data.len())
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn free_block_count(&self) -> usize {
        self.blocks.iter().filter(|(_, b)| b.free).count()
    }

    /// Draws fresh pages and appends one free block spanning exactly that
    /// run to the list tail.
    fn grow(&mut self, pmm: &mut PageAllocator, size: usize) -> Option<Handle> {
        let required = HEADER_SIZE + size;
        let pages = required.div_ceil(PAGE_SIZE);
        let base = match pmm.alloc(pages) {
            Some(base) => base,
            None => {
                log::warn!("heap: out of memory for {} bytes ({} pages)", size, pages);
                return None;
            }
        };

        let block = Block {
            addr: base,
            size: pages * PAGE_SIZE - HEADER_SIZE,
            free: true,
        };
        unsafe { write_header(&block) };
        Some(self.blocks.push_back(block))
    }

    /// Carves `size` bytes off the front of a block, splicing the remainder
    /// in immediately after it. Remainders too small to hold a header plus
    /// a useful payload stay attached as internal fragmentation.
    fn split(&mut self, handle: Handle, size: usize) {
        let block = *self.blocks.get(handle).expect("heap: stale block handle");
        if block.size < size + HEADER_SIZE + HEAP_SPLIT_MIN {
            return;
        }

        let tail = Block {
            addr: block.addr + HEADER_SIZE + size,
            size: block.size - size - HEADER_SIZE,
            free: true,
        };
        unsafe { write_header(&tail) };
        self.blocks
            .insert_after(handle, tail)
            .expect("heap: failed to splice split remainder");

        let block = self.blocks.get_mut(handle).expect("heap: stale block handle");
        block.size = size;
        let block = *block;
        unsafe { write_header(&block) };
    }

    /// Merges a free block with its list predecessor and successor when
    /// they are free and physically adjacent. Only the immediate list
    /// neighbors are considered; a physically adjacent block elsewhere in
    /// the list never merges.
    fn coalesce(&mut self, handle: Handle) -> Handle {
        let mut handle = handle;

        if let Some(prev) = self.blocks.prev(handle) {
            let prev_block = *self.blocks.get(prev).expect("heap: stale block handle");
            let block = *self.blocks.get(handle).expect("heap: stale block handle");
            if prev_block.free && prev_block.end() == block.addr {
                self.blocks.remove(handle);
                let merged = self.blocks.get_mut(prev).expect("heap: stale block handle");
                merged.size += HEADER_SIZE + block.size;
                let merged = *merged;
                unsafe { write_header(&merged) };
                handle = prev;
            }
        }

        if let Some(next) = self.blocks.next(handle) {
            let next_block = *self.blocks.get(next).expect("heap: stale block handle");
            let block = *self.blocks.get(handle).expect("heap: stale block handle");
            if next_block.free && block.end() == next_block.addr {
                self.blocks.remove(next);
                let merged = self.blocks.get_mut(handle).expect("heap: stale block handle");
                merged.size += HEADER_SIZE + next_block.size;
                let merged = *merged;
                unsafe { write_header(&merged) };
            }
        }

        handle
    }

    /// Hands the block's backing pages to the page allocator when it is
    /// free, page-aligned, sits at the list head or tail with at least one
    /// other entry, and no other block's bytes touch those pages. A free
    /// block stuck in the list interior keeps its pages; so does the sole
    /// remaining block, which stays resident for reuse.
    fn try_reclaim_pages(&mut self, pmm: &mut PageAllocator, handle: Handle) {
        let block = match self.blocks.get(handle) {
            Some(block) => *block,
            None => return,
        };
        if !block.free || block.addr % PAGE_SIZE != 0 {
            return;
        }

        let at_head = self.blocks.head() == Some(handle);
        let at_tail = self.blocks.tail() == Some(handle);
        if self.blocks.len() < 2 || !(at_head || at_tail) {
            return;
        }

        let total = HEADER_SIZE + block.size;
        let pages = total.div_ceil(PAGE_SIZE);
        let span_end = block.addr + pages * PAGE_SIZE;
        let overlaps = self
            .blocks
            .iter()
            .any(|(h, other)| h != handle && other.addr < span_end && other.end() > block.addr);
        if overlaps {
            return;
        }

        log::debug!(
            "heap: releasing {} pages at {:#x} to the page allocator",
            pages,
            block.addr
        );
        self.blocks.remove(handle);
        pmm.free(block.addr, pages);
    }

    fn find_block(&self, header_addr: usize) -> Option<Handle> {
        self.blocks
            .iter()
            .find(|(_, block)| block.addr == header_addr)
            .map(|(handle, _)| handle)
    }
}

impl Default for KernelHeap {
    fn default() -> Self {
        Self::new()
    }
}

unsafe fn write_header(block: &Block) {
    let header = block.addr as *mut BlockHeader;
    header.write(BlockHeader {
        magic: HEAP_MAGIC,
        free: block.free as u32,
        size: block.size,
    });
}

unsafe fn read_magic(addr: usize) -> u32 {
    (*(addr as *const BlockHeader)).magic
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::page_allocator::{MemoryRegion, MemoryRegionKind};
    use std::alloc::Layout;

    /// Page allocator over a leaked, page-aligned host buffer so block
    /// headers and payloads are real writable memory.
    fn fixture(pages: usize) -> (PageAllocator, KernelHeap) {
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        let base = unsafe { std::alloc::alloc_zeroed(layout) } as usize;
        let pmm = PageAllocator::init(
            &[MemoryRegion {
                base,
                length: pages * PAGE_SIZE,
                kind: MemoryRegionKind::Usable,
            }],
            base,
        );
        (pmm, KernelHeap::new())
    }

    #[test]
    fn allocate_returns_pointer_past_a_valid_header() {
        let (mut pmm, mut heap) = fixture(4);
        let ptr = heap.allocate(&mut pmm, 64).unwrap().as_ptr();
        let header_addr = ptr as usize - HEADER_SIZE;
        assert_eq!(unsafe { read_magic(header_addr) }, HEAP_MAGIC);
        // One page drawn, split into the allocation plus a free remainder.
        assert_eq!(pmm.free_pages(), 3);
        assert_eq!(heap.block_count(), 2);
        assert_eq!(heap.free_block_count(), 1);
    }

    #[test]
    fn zero_size_allocation_fails() {
        let (mut pmm, mut heap) = fixture(4);
        assert!(heap.allocate(&mut pmm, 0).is_none());
        assert_eq!(heap.block_count(), 0);
    }

    #[test]
    fn allocation_failure_when_pages_exhausted() {
        let (mut pmm, mut heap) = fixture(2);
        assert!(heap.allocate(&mut pmm, 3 * PAGE_SIZE).is_none());
        assert_eq!(pmm.free_pages(), 2);
        assert_eq!(heap.block_count(), 0);
    }

    #[test]
    fn size_rounds_up_to_four_bytes() {
        let (mut pmm, mut heap) = fixture(4);
        let ptr = heap.allocate(&mut pmm, 5).unwrap().as_ptr();
        let header_addr = ptr as usize - HEADER_SIZE;
        let size = unsafe { (*(header_addr as *const BlockHeader)).size };
        assert_eq!(size, 8);
    }

    #[test]
    fn freed_block_is_reused_before_drawing_pages() {
        let (mut pmm, mut heap) = fixture(4);
        let first = heap.allocate(&mut pmm, 64).unwrap().as_ptr();
        heap.write(first, &[0xAB; 64]).unwrap();
        heap.release(&mut pmm, first).unwrap();

        let pages_before = pmm.free_pages();
        let second = heap.allocate(&mut pmm, 64).unwrap().as_ptr();
        assert_eq!(second, first);
        assert_eq!(pmm.free_pages(), pages_before);
    }

    #[test]
    fn adjacent_blocks_coalesce_into_one() {
        let (mut pmm, mut heap) = fixture(4);
        let a = heap.allocate(&mut pmm, 64).unwrap().as_ptr();
        let b = heap.allocate(&mut pmm, 64).unwrap().as_ptr();
        let _c = heap.allocate(&mut pmm, 64).unwrap();

        heap.release(&mut pmm, a).unwrap();
        let blocks_before = heap.block_count();
        heap.release(&mut pmm, b).unwrap();
        assert_eq!(heap.block_count(), blocks_before - 1);

        // Merged block: A's payload, B's payload, and B's header.
        let a_header = a as usize - HEADER_SIZE;
        let merged_size = unsafe { (*(a_header as *const BlockHeader)).size };
        assert_eq!(merged_size, 64 + 64 + HEADER_SIZE);
    }

    #[test]
    fn double_free_is_diagnosed_and_leaves_state_unchanged() {
        let (mut pmm, mut heap) = fixture(4);
        let ptr = heap.allocate(&mut pmm, 64).unwrap().as_ptr();
        heap.release(&mut pmm, ptr).unwrap();

        let blocks = heap.block_count();
        let free_blocks = heap.free_block_count();
        let pages = pmm.free_pages();
        assert_eq!(heap.release(&mut pmm, ptr), Err(HeapError::NotAllocated));
        assert_eq!(heap.block_count(), blocks);
        assert_eq!(heap.free_block_count(), free_blocks);
        assert_eq!(pmm.free_pages(), pages);
    }

    #[test]
    fn foreign_pointer_free_is_rejected() {
        let (mut pmm, mut heap) = fixture(4);
        let ptr = heap.allocate(&mut pmm, 64).unwrap().as_ptr();
        let foreign = unsafe { ptr.add(8) };
        assert_eq!(heap.release(&mut pmm, foreign), Err(HeapError::UnknownBlock));
    }

    #[test]
    fn corrupted_magic_is_rejected() {
        let (mut pmm, mut heap) = fixture(4);
        let ptr = heap.allocate(&mut pmm, 64).unwrap().as_ptr();
        let header_addr = ptr as usize - HEADER_SIZE;
        unsafe { (header_addr as *mut u32).write(0x1BAD_B002) };
        assert_eq!(heap.release(&mut pmm, ptr), Err(HeapError::CorruptMagic));
    }

    #[test]
    fn release_zeroes_the_payload() {
        let (mut pmm, mut heap) = fixture(4);
        let ptr = heap.allocate(&mut pmm, 32).unwrap().as_ptr();
        heap.write(ptr, &[0xFF; 32]).unwrap();
        heap.release(&mut pmm, ptr).unwrap();
        let payload = unsafe { core::slice::from_raw_parts(ptr, 32) };
        assert!(payload.iter().all(|&b| b == 0));
    }

    #[test]
    fn write_respects_block_capacity() {
        let (mut pmm, mut heap) = fixture(4);
        let ptr = heap.allocate(&mut pmm, 16).unwrap().as_ptr();
        heap.write(ptr, &[1, 2, 3, 4]).unwrap();

        assert_eq!(heap.write(ptr, &[0u8; 64]), Err(HeapError::WriteTooLarge));
        // Rejected writes are all-or-nothing.
        let payload = unsafe { core::slice::from_raw_parts(ptr, 4) };
        assert_eq!(payload, &[1, 2, 3, 4]);
    }

    #[test]
    fn write_to_freed_block_is_rejected() {
        let (mut pmm, mut heap) = fixture(4);
        let ptr = heap.allocate(&mut pmm, 16).unwrap().as_ptr();
        heap.release(&mut pmm, ptr).unwrap();
        assert_eq!(heap.write(ptr, &[1]), Err(HeapError::NotAllocated));
    }

    #[test]
    fn edge_block_returns_pages_to_the_allocator() {
        let (mut pmm, mut heap) = fixture(8);
        // Two separate page chains: freeing the first leaves it at the list
        // head with a live successor, so its pages can go back.
        let a = heap.allocate(&mut pmm, 4000).unwrap().as_ptr();
        let _b = heap.allocate(&mut pmm, 4000).unwrap();
        let pages_held = pmm.free_pages();

        heap.release(&mut pmm, a).unwrap();
        assert_eq!(pmm.free_pages(), pages_held + 1);
        assert!(heap.find_block(a as usize - HEADER_SIZE).is_none());
    }

    #[test]
    fn sole_free_block_stays_resident() {
        let (mut pmm, mut heap) = fixture(4);
        let ptr = heap.allocate(&mut pmm, 64).unwrap().as_ptr();
        heap.release(&mut pmm, ptr).unwrap();
        // Coalesced back into one page-spanning block, kept for reuse.
        assert_eq!(heap.block_count(), 1);
        assert_eq!(pmm.free_pages(), 3);
    }

    #[test]
    fn interior_free_block_never_releases_pages() {
        let (mut pmm, mut heap) = fixture(8);
        let _a = heap.allocate(&mut pmm, 4000).unwrap();
        let b = heap.allocate(&mut pmm, 4000).unwrap().as_ptr();
        let _c = heap.allocate(&mut pmm, 4000).unwrap();
        let pages_held = pmm.free_pages();

        heap.release(&mut pmm, b).unwrap();
        assert_eq!(pmm.free_pages(), pages_held);
    }
}
