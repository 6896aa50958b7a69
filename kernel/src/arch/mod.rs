//! Platform boundary.
//!
//! Everything that touches an instruction the rest of the kernel should not
//! know about lives here: the context switch, initial task stack frames,
//! interrupt-flag control, and the PIT/PIC register glue. Off the kernel
//! target the interrupt-flag operations are no-ops so the subsystem logic
//! can run under the host test harness.

pub mod context;
pub mod pic;
pub mod pit;

pub use context::{context_switch, prepare_task_stack};

/// Runs `f` with interrupts disabled, restoring the previous state after.
#[cfg(target_os = "none")]
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    x86_64::instructions::interrupts::without_interrupts(f)
}

#[cfg(not(target_os = "none"))]
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    f()
}

#[cfg(target_os = "none")]
pub fn enable_interrupts() {
    x86_64::instructions::interrupts::enable();
}

#[cfg(not(target_os = "none"))]
pub fn enable_interrupts() {}

#[cfg(target_os = "none")]
pub fn disable_interrupts() {
    x86_64::instructions::interrupts::disable();
}

#[cfg(not(target_os = "none"))]
pub fn disable_interrupts() {}

/// Waits for the next interrupt.
#[cfg(target_os = "none")]
pub fn halt() {
    x86_64::instructions::hlt();
}

#[cfg(not(target_os = "none"))]
pub fn halt() {
    core::hint::spin_loop();
}
