//! Timer configuration.

/// System tick frequency in Hertz. Every tick is a preemption point.
pub const TICK_HZ: u32 = 100;

/// Base clock of the programmable interval timer, in Hertz.
pub const PIT_BASE_FREQ: u32 = 1_193_182;
