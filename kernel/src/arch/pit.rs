//! Programmable interval timer (8253/8254) glue.

use x86_64::instructions::port::Port;

use crate::constants::ports::{PIT_CHANNEL_0, PIT_MODE_CMD};
use crate::constants::timer::PIT_BASE_FREQ;

struct Pit {
    channel0: Port<u8>,
    mode_cmd: Port<u8>,
}

impl Pit {
    const fn new() -> Self {
        Self {
            channel0: Port::new(PIT_CHANNEL_0),
            mode_cmd: Port::new(PIT_MODE_CMD),
        }
    }

    unsafe fn set_reload(&mut self, divisor: u16) {
        // Channel 0, access mode LSB/MSB, mode 3 (square wave generator).
        self.mode_cmd.write(0x36);
        self.channel0.write((divisor & 0xFF) as u8);
        self.channel0.write((divisor >> 8) as u8);
    }
}

/// Programs channel 0 to fire periodically at `hz`.
///
/// # Safety
///
/// Reprograms the hardware timer; the caller must own the interrupt setup.
pub unsafe fn set_frequency(hz: u32) {
    let divisor = (PIT_BASE_FREQ / hz) as u16;
    Pit::new().set_reload(divisor);
}
