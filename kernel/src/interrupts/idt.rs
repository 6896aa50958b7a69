//! Interrupt Descriptor Table setup.
//!
//! Exception handlers plus the timer vector that drives preemption.

use lazy_static::lazy_static;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame};

use crate::arch::pic;
use crate::constants::idt::{TIMER_IRQ, TIMER_VECTOR};
use crate::time;

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.double_fault.set_handler_fn(double_fault_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_fault_handler);
        idt[TIMER_VECTOR].set_handler_fn(timer_handler);
        idt
    };
}

pub fn init() {
    IDT.load();
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    log::warn!("breakpoint exception\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn general_protection_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    panic!(
        "general protection fault (error {:#x})\n{:#?}",
        error_code, stack_frame
    );
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    panic!("double fault\n{:#?}", stack_frame);
}

/// Hardware tick. The line is acknowledged before the tick work so the
/// context switch at the end of [`time::on_tick`] cannot leave the EOI
/// pending while another task runs.
extern "x86-interrupt" fn timer_handler(_stack_frame: InterruptStackFrame) {
    pic::end_of_interrupt(TIMER_IRQ);
    time::on_tick();
}
