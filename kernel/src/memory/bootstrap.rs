//! Bootstrap allocator for `alloc` collections.
//!
//! The page allocator's bitmap and the scheduler's task table are heap
//! collections themselves, so something must serve `alloc` before the
//! kernel's own allocators exist. A talc arena over a static buffer fills
//! that role for the kernel's whole lifetime; the service heap in
//! [`super::heap`] is a separate, explicitly addressed facility.

use talc::{ClaimOnOom, Span, Talc, Talck};

use crate::constants::memory::BOOTSTRAP_HEAP_SIZE;

static mut ARENA: [u8; BOOTSTRAP_HEAP_SIZE] = [0; BOOTSTRAP_HEAP_SIZE];

#[global_allocator]
static ALLOCATOR: Talck<spin::Mutex<()>, ClaimOnOom> = Talc::new(unsafe {
    ClaimOnOom::new(Span::from_const_array(core::ptr::addr_of!(ARENA)))
})
.lock();
