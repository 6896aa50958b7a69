//! 8259 programmable interrupt controller glue.
//!
//! Exposes exactly what the timer subsystem and interrupt handlers consume:
//! remap, per-line unmask, and end-of-interrupt.

use x86_64::instructions::port::Port;

use crate::constants::idt::{PIC1_VECTOR_OFFSET, PIC2_VECTOR_OFFSET};
use crate::constants::ports::{IO_WAIT_PORT, PIC1_CMD, PIC1_DATA, PIC2_CMD, PIC2_DATA};

const ICW1_INIT: u8 = 0x11;
const ICW4_8086: u8 = 0x01;
const EOI: u8 = 0x20;

fn io_wait() {
    unsafe { Port::<u8>::new(IO_WAIT_PORT).write(0) };
}

/// Remaps both PICs above the CPU exception vectors and masks every line.
/// Lines are unmasked individually as their drivers initialize.
///
/// # Safety
///
/// Must run once, with interrupts disabled, before any line is unmasked.
pub unsafe fn init() {
    let mut pic1_cmd = Port::<u8>::new(PIC1_CMD);
    let mut pic1_data = Port::<u8>::new(PIC1_DATA);
    let mut pic2_cmd = Port::<u8>::new(PIC2_CMD);
    let mut pic2_data = Port::<u8>::new(PIC2_DATA);

    pic1_cmd.write(ICW1_INIT);
    io_wait();
    pic1_data.write(PIC1_VECTOR_OFFSET);
    io_wait();
    pic1_data.write(0x04); // secondary PIC on IRQ2
    io_wait();
    pic1_data.write(ICW4_8086);
    io_wait();

    pic2_cmd.write(ICW1_INIT);
    io_wait();
    pic2_data.write(PIC2_VECTOR_OFFSET);
    io_wait();
    pic2_data.write(0x02); // cascade identity
    io_wait();
    pic2_data.write(ICW4_8086);
    io_wait();

    pic1_data.write(0xFF);
    pic2_data.write(0xFF);
}

/// Clears the mask bit for `irq`, letting the line deliver interrupts.
pub fn unmask_irq(irq: u8) {
    let (port, line) = if irq < 8 {
        (PIC1_DATA, irq)
    } else {
        (PIC2_DATA, irq - 8)
    };
    let mut data = Port::<u8>::new(port);
    unsafe {
        let mask = data.read() & !(1 << line);
        data.write(mask);
    }
    io_wait();
}

/// Acknowledges an interrupt on `irq` so the line can fire again.
pub fn end_of_interrupt(irq: u8) {
    if irq >= 8 {
        unsafe { Port::<u8>::new(PIC2_CMD).write(EOI) };
        io_wait();
    }
    unsafe { Port::<u8>::new(PIC1_CMD).write(EOI) };
    io_wait();
}
