//! Context switching for x86_64.
//!
//! A task's saved context is the System V callee-saved register set pushed
//! onto its own stack, with the stack pointer itself stored in the TCB. The
//! caller-saved half is covered by the calling convention: every switch
//! happens inside a `call` to [`context_switch`], so the compiler has
//! already spilled whatever it cared about.

/// Saves the outgoing context, stores its stack pointer through `from_sp`,
/// and resumes the context whose stack pointer is `to_sp`.
///
/// This is the only suspension point in the kernel. The function "returns"
/// when some other task switches back to the outgoing context.
///
/// # Safety
///
/// `from_sp` must point at the outgoing task's saved-stack-pointer slot and
/// stay valid until that task is resumed; `to_sp` must be a stack pointer
/// previously produced by this function or by [`prepare_task_stack`].
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(from_sp: *mut u64, to_sp: u64) {
    core::arch::naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp",
        "mov rsp, rsi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    )
}

/// First code a new task executes. The entry function pointer rides in the
/// rbx slot of the synthesized frame; interrupts are enabled first because
/// the switch that got us here may have happened inside the timer handler.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
unsafe extern "C" fn task_startup() {
    core::arch::naked_asm!(
        "sti",
        "call rbx",
        "call {trap}",
        trap = sym task_return_trap,
    )
}

/// Tasks have no exit primitive; an entry function returning is fatal.
extern "C" fn task_return_trap() -> ! {
    panic!("task entry function returned");
}

/// Writes the initial saved context for a new task onto its stack and
/// returns the stack pointer to hand to [`context_switch`]. The first
/// switch into this frame pops a zeroed register set (rbx carrying `entry`)
/// and lands in [`task_startup`].
///
/// # Safety
///
/// `stack_top` must be the top of a writable stack with at least 64 bytes
/// of headroom below it.
#[cfg(target_arch = "x86_64")]
pub unsafe fn prepare_task_stack(stack_top: u64, entry: fn()) -> u64 {
    // Keep the startup shim's return-address slot 16-byte aligned so the
    // entry function sees an ABI-conformant stack.
    let top = stack_top & !0xF;
    let mut sp = top;
    let mut push = |value: u64| {
        sp -= 8;
        (sp as *mut u64).write(value);
    };

    push(task_startup as usize as u64); // ret target of the first switch
    push(0); // rbp
    push(entry as usize as u64); // rbx
    push(0); // r12
    push(0); // r13
    push(0); // r14
    push(0); // r15
    sp
}

// Stubs so the subsystem logic still type-checks on foreign test hosts.
// Nothing on such a host ever performs a real switch.

#[cfg(not(target_arch = "x86_64"))]
pub unsafe extern "C" fn context_switch(_from_sp: *mut u64, _to_sp: u64) {
    unreachable!("context switching is only implemented for x86_64");
}

#[cfg(not(target_arch = "x86_64"))]
pub unsafe fn prepare_task_stack(_stack_top: u64, _entry: fn()) -> u64 {
    unreachable!("task stacks are only implemented for x86_64");
}
