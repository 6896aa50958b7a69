#![cfg_attr(not(test), no_std)]
#![cfg_attr(target_os = "none", feature(abi_x86_interrupt))]
extern crate alloc;

pub mod arch;
pub mod collections;
pub mod constants;
pub mod devices;
pub mod interrupts;
pub mod logging;
pub mod memory;
pub mod sched;
pub mod sync;
pub mod time;

pub use devices::serial;

pub mod prelude {
    pub use crate::debug_print;
    pub use crate::debug_println;
    pub use crate::serial_print;
    pub use crate::serial_println;
}

#[macro_export]
macro_rules! debug_print {
    ($($arg:tt)*) => {
        #[cfg(debug_assertions)]
        $crate::serial_print!($($arg)*);
    }
}

#[macro_export]
macro_rules! debug_println {
    ($($arg:tt)*) => {
        #[cfg(debug_assertions)]
        $crate::serial_println!($($arg)*);
    }
}

/// Parks the CPU forever. Timer interrupts still fire, so a task spinning
/// here keeps getting preempted like any other.
pub fn idle_loop() -> ! {
    loop {
        arch::halt();
    }
}
