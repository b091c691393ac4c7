//! CPU Context and Context Switching
//!
//! This module defines the saved execution context of a task and implements
//! the register-level switch between two stacks using inline assembly. A
//! freshly prepared stack boots into a fixed trampoline that hands the task
//! pointer to the runtime entry function.

/// Saved execution context.
///
/// Only the stack pointer lives in the structure; the callee-saved registers
/// are parked on the stack itself by `context_switch`, so a context is fully
/// described by where its stack currently ends.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CpuContext {
    /// Stack pointer of the suspended context
    pub sp: u64,
}

impl CpuContext {
    /// Create a new zeroed context
    pub const fn new() -> Self {
        Self { sp: 0 }
    }
}

/// Switch from the context in `current` to the context in `next`.
///
/// Saves the callee-saved register set and stack pointer of the caller into
/// `current`, then restores `next` and resumes it at its last suspension
/// point. For a stack prepared by `init_context` the first switch lands in
/// the boot trampoline instead.
///
/// # Safety
///
/// - `current` and `next` must point to valid contexts; `next` must either
///   have been prepared by `init_context` or previously saved by this
///   function.
/// - The caller resumes on a different stack; any stack borrows it holds
///   must stay valid until control returns here.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(current: *mut CpuContext, next: *const CpuContext) {
    core::arch::naked_asm!(
        // Save the System V callee-saved registers on the current stack
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        // Save the resulting stack pointer into current.sp (offset 0)
        "mov [rdi], rsp",
        // Load the next context's stack pointer
        "mov rsp, [rsi]",
        // Restore its callee-saved registers
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        // Resume: for a prepared stack this lands in boot_trampoline,
        // otherwise at the instruction after the switch that suspended it
        "ret",
    )
}

/// Boot trampoline for freshly prepared stacks.
///
/// `init_context` leaves the task pointer on the stack right above the
/// trampoline's own return slot. Popping it leaves the stack 16-byte
/// aligned, as the ABI requires before a call.
///
/// # Safety
///
/// Reached only through `context_switch` on a stack laid out by
/// `init_context`; never call it directly.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
unsafe extern "C" fn boot_trampoline() {
    core::arch::naked_asm!(
        // The prepared stack holds the task pointer; make it the argument
        "pop rdi",
        "call {entry}",
        // The entry function never returns
        "ud2",
        entry = sym crate::sched::task::task_entry,
    )
}

/// Prepare `ctx` so that the first `context_switch` into it runs the boot
/// trampoline with `arg` as its argument.
///
/// Stack layout built below `stack_top` (which must be 16-byte aligned):
///
/// ```text
/// stack_top - 8   task pointer, popped by boot_trampoline
/// stack_top - 16  boot_trampoline, popped by context_switch's ret
/// stack_top - 64  six zeroed callee-saved register slots
/// ```
///
/// # Safety
///
/// `stack_top` must be the upper end of a writable region with at least 64
/// bytes of headroom, and `arg` must stay valid until the task exits.
#[cfg(target_arch = "x86_64")]
pub unsafe fn init_context(ctx: &mut CpuContext, stack_top: *mut u8, arg: *const u8) {
    debug_assert_eq!(stack_top as usize % 16, 0);
    let mut sp = stack_top as *mut u64;

    sp = sp.sub(1);
    *sp = arg as u64;

    sp = sp.sub(1);
    *sp = boot_trampoline as usize as u64;

    // rbp, rbx, r12..r15 slots, all zero
    sp = sp.sub(6);
    core::ptr::write_bytes(sp, 0, 6);

    ctx.sp = sp as u64;
}

/// aarch64 variant. The callee-saved set (x19-x28, fp, lr and d8-d15) is
/// parked in a 160-byte save area on the stack; `sp` in the context points
/// at that area.
#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(current: *mut CpuContext, next: *const CpuContext) {
    core::arch::naked_asm!(
        "sub sp, sp, #160",
        "stp x19, x20, [sp, #0]",
        "stp x21, x22, [sp, #16]",
        "stp x23, x24, [sp, #32]",
        "stp x25, x26, [sp, #48]",
        "stp x27, x28, [sp, #64]",
        "stp x29, x30, [sp, #80]",
        "stp d8, d9, [sp, #96]",
        "stp d10, d11, [sp, #112]",
        "stp d12, d13, [sp, #128]",
        "stp d14, d15, [sp, #144]",
        "mov x2, sp",
        "str x2, [x0]",
        "ldr x2, [x1]",
        "mov sp, x2",
        "ldp x19, x20, [sp, #0]",
        "ldp x21, x22, [sp, #16]",
        "ldp x23, x24, [sp, #32]",
        "ldp x25, x26, [sp, #48]",
        "ldp x27, x28, [sp, #64]",
        "ldp x29, x30, [sp, #80]",
        "ldp d8, d9, [sp, #96]",
        "ldp d10, d11, [sp, #112]",
        "ldp d12, d13, [sp, #128]",
        "ldp d14, d15, [sp, #144]",
        "add sp, sp, #160",
        "ret",
    )
}

#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
unsafe extern "C" fn boot_trampoline() {
    core::arch::naked_asm!(
        // init_context parks the task pointer in x19
        "mov x0, x19",
        "bl {entry}",
        "brk #0",
        entry = sym crate::sched::task::task_entry,
    )
}

#[cfg(target_arch = "aarch64")]
pub unsafe fn init_context(ctx: &mut CpuContext, stack_top: *mut u8, arg: *const u8) {
    debug_assert_eq!(stack_top as usize % 16, 0);
    // Fake save area: x19 carries the task pointer, x30 the trampoline.
    let sp = (stack_top as *mut u64).sub(20);
    core::ptr::write_bytes(sp, 0, 20);
    *sp = arg as u64; // x19 slot at offset 0
    *sp.add(11) = boot_trampoline as usize as u64; // x30 slot at offset 88
    ctx.sp = sp as u64;
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("taskrt only supports x86_64 and aarch64");

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{align_of, size_of};

    /// Test that CpuContext can be created and initialized
    #[test]
    fn test_context_creation() {
        let ctx = CpuContext::new();
        assert_eq!(ctx.sp, 0);
    }

    /// Test that CpuContext has the layout the assembly assumes
    #[test]
    fn test_context_layout() {
        // The switch stores the stack pointer at offset 0
        assert_eq!(size_of::<CpuContext>(), 8);
        assert_eq!(align_of::<CpuContext>(), 8);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_init_context_frame() {
        let mut area = vec![0u8; 1024];
        let top = unsafe {
            let base = area.as_mut_ptr();
            let top = base.add(1024) as usize & !15;
            top as *mut u8
        };
        let mut ctx = CpuContext::new();
        let marker = 0xDEAD_BEEFusize as *const u8;
        unsafe { init_context(&mut ctx, top, marker) };

        // Six register slots below the trampoline slot
        assert_eq!(ctx.sp, top as u64 - 64);
        unsafe {
            let sp = ctx.sp as *const u64;
            for i in 0..6 {
                assert_eq!(*sp.add(i), 0);
            }
            assert_eq!(*(top as *const u64).sub(1), marker as u64);
        }
    }
}
