//! Interrupt Descriptor Table configuration.

/// Vector number assigned to the timer interrupt (IRQ0 after remap).
pub const TIMER_VECTOR: u8 = 32;

/// Base vectors the two 8259 PICs are remapped to.
pub const PIC1_VECTOR_OFFSET: u8 = 0x20;
pub const PIC2_VECTOR_OFFSET: u8 = 0x28;

/// IRQ line of the programmable interval timer.
pub const TIMER_IRQ: u8 = 0;
