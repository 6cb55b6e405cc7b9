// =============================================================================
// AsterOS - Context Save/Restore (x86_64)
// =============================================================================
//
// Two ways in and out of a thread:
//
//   - Cooperative: `context_save` records the callee-saved set plus
//     RSP/RIP/RFLAGS (setjmp-style; returns 0 after saving, 1 when the
//     context is resumed), and `context_jump` resumes such a context.
//   - Preemptive: the timer interrupt snapshots the full `Registers`
//     frame, and `restore_full` replays one by pointing RSP at the saved
//     copy, popping every register back, and `iretq`ing out.
//
// Offsets in the assembly below mirror `Context` and `Registers` field
// order exactly.
// =============================================================================

use core::arch::global_asm;

/// Cooperative execution context: callee-saved registers plus the resume
/// point. Everything caller-saved is dead across a cooperative yield by
/// ABI contract.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Context {
    pub rbx: u64,    // 0x00
    pub rbp: u64,    // 0x08
    pub r12: u64,    // 0x10
    pub r13: u64,    // 0x18
    pub r14: u64,    // 0x20
    pub r15: u64,    // 0x28
    pub rsp: u64,    // 0x30
    pub rip: u64,    // 0x38
    pub rflags: u64, // 0x40
}

impl Context {
    pub const fn empty() -> Self {
        Self {
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rsp: 0,
            rip: 0,
            rflags: 0,
        }
    }

    /// The cooperative view of a full preemption frame, kept alongside
    /// `extra_regs` when a thread is preempted.
    pub fn from_registers(regs: &crate::arch::x86_64::interrupts::Registers) -> Self {
        Self {
            rbx: regs.rbx,
            rbp: regs.rbp,
            r12: regs.r12,
            r13: regs.r13,
            r14: regs.r14,
            r15: regs.r15,
            rsp: regs.rsp,
            rip: regs.rip,
            rflags: regs.rflags,
        }
    }
}

global_asm!(
    // fn context_save(ctx: *mut Context) -> u64
    //
    // Returns 0 to the saving call. A later context_jump on the same
    // context returns 1 from this very call site.
    ".global context_save",
    "context_save:",
    "mov [rdi + 0x00], rbx",
    "mov [rdi + 0x08], rbp",
    "mov [rdi + 0x10], r12",
    "mov [rdi + 0x18], r13",
    "mov [rdi + 0x20], r14",
    "mov [rdi + 0x28], r15",
    "lea rax, [rsp + 8]", // RSP as it will be after our return
    "mov [rdi + 0x30], rax",
    "mov rax, [rsp]", // return address = resume RIP
    "mov [rdi + 0x38], rax",
    "pushfq",
    "pop rax",
    "mov [rdi + 0x40], rax",
    "xor eax, eax",
    "ret",
    // fn context_jump(ctx: *const Context) -> !
    ".global context_jump",
    "context_jump:",
    "mov rbx, [rdi + 0x00]",
    "mov rbp, [rdi + 0x08]",
    "mov r12, [rdi + 0x10]",
    "mov r13, [rdi + 0x18]",
    "mov r14, [rdi + 0x20]",
    "mov r15, [rdi + 0x28]",
    "mov rsp, [rdi + 0x30]",
    "push qword ptr [rdi + 0x40]",
    "popfq", // restores RFLAGS; may re-enable interrupts
    "mov rax, 1",
    "jmp qword ptr [rdi + 0x38]",
    // fn restore_full(regs: *const Registers) -> !
    //
    // Point RSP at the saved frame and pop everything back; the frame's
    // tail is a hardware iretq frame. Interrupts must be disabled on
    // entry; iretq re-enables them from the saved RFLAGS.
    ".global restore_full",
    "restore_full:",
    "mov rsp, rdi",
    "add rsp, 8", // cr2 slot
    "pop rax",
    "pop rbx",
    "pop rcx",
    "pop rdx",
    "pop rsi",
    "pop rdi",
    "pop rbp",
    "pop r8",
    "pop r9",
    "pop r10",
    "pop r11",
    "pop r12",
    "pop r13",
    "pop r14",
    "pop r15",
    "add rsp, 16", // vector + error code
    "iretq",
);

extern "C" {
    /// Save the cooperative context. Returns 0 after saving; a
    /// `context_jump` of the same context returns 1 here.
    pub fn context_save(ctx: *mut Context) -> u64;

    /// Resume a saved cooperative context. Never returns to the caller.
    pub fn context_jump(ctx: *const Context) -> !;

    /// Replay a full preemption frame through `iretq`. Call with
    /// interrupts disabled. Never returns to the caller.
    pub fn restore_full(regs: *const crate::arch::x86_64::interrupts::Registers) -> !;
}
