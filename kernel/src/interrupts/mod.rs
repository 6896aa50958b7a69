//! Interrupt handling.
//!
//! Only built for the kernel target; the host test harness never takes an
//! interrupt.

#[cfg(target_os = "none")]
pub mod idt;

/// Loads the IDT and remaps the interrupt controller with every line
/// masked. Lines are unmasked by their drivers, the timer first.
#[cfg(target_os = "none")]
pub fn init() {
    idt::init();
    unsafe { crate::arch::pic::init() };
    log::info!("interrupts: IDT loaded, PIC remapped");
}
