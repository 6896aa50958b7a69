//! Kernel memory management.
//!
//! Two allocators with distinct jobs. The [`page_allocator`] hands out
//! physical page runs; the [`heap`] carves those runs into variable-size
//! blocks. Both live behind global spin locks and are reached through the
//! `with_*` closures below, which also keep interrupts off for the
//! duration so the timer handler can never spin on a lock its own CPU
//! holds.
//!
//! Lock order: the heap lock is always taken before the page allocator
//! lock. [`with_heap`] takes both; nothing else nests them.

#[cfg(target_os = "none")]
mod bootstrap;
pub mod heap;
pub mod page_allocator;

use core::ptr::NonNull;

use spin::Mutex;

use crate::arch;

pub use heap::{HeapError, KernelHeap};
pub use page_allocator::{MemoryRegion, MemoryRegionKind, PageAllocator};

pub static PAGE_ALLOCATOR: Mutex<Option<PageAllocator>> = Mutex::new(None);
pub static KERNEL_HEAP: Mutex<Option<KernelHeap>> = Mutex::new(None);

/// Brings up both allocators from the boot memory map.
///
/// # Safety
///
/// `regions` must describe physical memory the kernel may use freely, and
/// `reserved_end` must cover the kernel image and boot structures. Must run
/// once, before any other function in this module.
pub unsafe fn init(regions: &[MemoryRegion], reserved_end: usize) {
    *PAGE_ALLOCATOR.lock() = Some(PageAllocator::init(regions, reserved_end));
    *KERNEL_HEAP.lock() = Some(KernelHeap::new());
    log::info!("memory: allocators online");
}

pub fn with_page_allocator<F, R>(f: F) -> R
where
    F: FnOnce(&mut PageAllocator) -> R,
{
    arch::without_interrupts(|| {
        let mut guard = PAGE_ALLOCATOR.lock();
        match &mut *guard {
            Some(pmm) => f(pmm),
            None => panic!("memory: page allocator used before init"),
        }
    })
}

/// Runs `f` with both allocators locked, heap first.
pub fn with_heap<F, R>(f: F) -> R
where
    F: FnOnce(&mut KernelHeap, &mut PageAllocator) -> R,
{
    arch::without_interrupts(|| {
        let mut heap_guard = KERNEL_HEAP.lock();
        let mut pmm_guard = PAGE_ALLOCATOR.lock();
        match (&mut *heap_guard, &mut *pmm_guard) {
            (Some(heap), Some(pmm)) => f(heap, pmm),
            _ => panic!("memory: heap used before init"),
        }
    })
}

/// Grants a contiguous run of physical pages.
pub fn page_alloc(pages: usize) -> Option<usize> {
    with_page_allocator(|pmm| pmm.alloc(pages))
}

/// Returns a page run granted by [`page_alloc`].
pub fn page_free(addr: usize, pages: usize) {
    with_page_allocator(|pmm| pmm.free(addr, pages))
}

/// Grants `size` bytes from the service heap.
pub fn heap_alloc(size: usize) -> Option<NonNull<u8>> {
    with_heap(|heap, pmm| heap.allocate(pmm, size))
}

/// Returns a heap block. Misuse is logged and reported, never fatal.
pub fn heap_free(ptr: *mut u8) -> Result<(), HeapError> {
    let result = with_heap(|heap, pmm| heap.release(pmm, ptr));
    if let Err(err) = result {
        log::warn!("heap: rejected free of {:#x}: {:?}", ptr as usize, err);
    }
    result
}

/// Bounds-checked write into a live heap block.
pub fn heap_write(ptr: *mut u8, data: &[u8]) -> Result<usize, HeapError> {
    let result = with_heap(|heap, _| heap.write(ptr, data));
    if let Err(err) = result {
        log::warn!("heap: rejected write to {:#x}: {:?}", ptr as usize, err);
    }
    result
}

pub fn total_pages() -> usize {
    with_page_allocator(|pmm| pmm.total_pages())
}

pub fn free_pages() -> usize {
    with_page_allocator(|pmm| pmm.free_pages())
}
