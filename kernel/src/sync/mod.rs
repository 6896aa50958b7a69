//! Blocking synchronization primitives.
//!
//! Both primitives pair a lock-prefixed atomic fast path with a FIFO wait
//! queue of blocked tasks. Waits park the caller through the scheduler;
//! wakes hand a READY transition to the queue head, not ownership, so a
//! woken task re-races for the resource.

pub mod mutex;
pub mod semaphore;

pub use mutex::Mutex;
pub use semaphore::Semaphore;
