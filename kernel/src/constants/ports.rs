//! I/O port definitions.

/// Base I/O port address for the first serial port (COM1).
pub const SERIAL_PORT: u16 = 0x3F8;

/// PIT channel 0 data port.
pub const PIT_CHANNEL_0: u16 = 0x40;
/// PIT mode/command register.
pub const PIT_MODE_CMD: u16 = 0x43;

/// Primary 8259 PIC command and data ports.
pub const PIC1_CMD: u16 = 0x20;
pub const PIC1_DATA: u16 = 0x21;
/// Secondary 8259 PIC command and data ports.
pub const PIC2_CMD: u16 = 0xA0;
pub const PIC2_DATA: u16 = 0xA1;

/// Dummy port used for a short delay between PIC configuration writes.
pub const IO_WAIT_PORT: u16 = 0x80;
