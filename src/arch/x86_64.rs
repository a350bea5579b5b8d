//! x86_64 System V context switching.

use super::{Arch, ThreadEntry};
use core::arch::global_asm;

pub struct X86_64Arch;

/// Callee-saved state of the System V ABI.
#[repr(C)]
#[derive(Debug)]
pub struct X86_64Context {
    pub rsp: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    /// SSE control/status
    pub mxcsr: u32,
    /// x87 control word
    pub fpu_cw: u16,
    _pad: u16,
}

impl Default for X86_64Context {
    fn default() -> Self {
        Self {
            rsp: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            mxcsr: 0x1F80,
            fpu_cw: 0x037F,
            _pad: 0,
        }
    }
}

// simple_threads_switch_context(prev: rdi, next: rsi)
global_asm!(
    ".pushsection .text.simple_threads_switch_context,\"ax\",@progbits",
    ".global simple_threads_switch_context",
    ".type simple_threads_switch_context,@function",
    ".p2align 4",
    "simple_threads_switch_context:",
    "mov [rdi + 0x00], rsp",
    "mov [rdi + 0x08], rbx",
    "mov [rdi + 0x10], rbp",
    "mov [rdi + 0x18], r12",
    "mov [rdi + 0x20], r13",
    "mov [rdi + 0x28], r14",
    "mov [rdi + 0x30], r15",
    "stmxcsr dword ptr [rdi + 0x38]",
    "fnstcw word ptr [rdi + 0x3c]",
    "mov rsp, [rsi + 0x00]",
    "mov rbx, [rsi + 0x08]",
    "mov rbp, [rsi + 0x10]",
    "mov r12, [rsi + 0x18]",
    "mov r13, [rsi + 0x20]",
    "mov r14, [rsi + 0x28]",
    "mov r15, [rsi + 0x30]",
    "ldmxcsr dword ptr [rsi + 0x38]",
    "fldcw word ptr [rsi + 0x3c]",
    "ret",
    ".size simple_threads_switch_context, . - simple_threads_switch_context",
    ".popsection",
);

// First code a fresh thread runs: r12 holds the argument, r13 the entry.
// The undefined return address stops unwinders and backtraces here.
global_asm!(
    ".pushsection .text.simple_threads_bootstrap,\"ax\",@progbits",
    ".global simple_threads_bootstrap",
    ".type simple_threads_bootstrap,@function",
    ".p2align 4",
    "simple_threads_bootstrap:",
    ".cfi_startproc",
    ".cfi_undefined rip",
    "mov rdi, r12",
    "call r13",
    "ud2",
    ".cfi_endproc",
    ".size simple_threads_bootstrap, . - simple_threads_bootstrap",
    ".popsection",
);

extern "C" {
    fn simple_threads_switch_context(prev: *mut X86_64Context, next: *const X86_64Context);
    fn simple_threads_bootstrap();
}

impl Arch for X86_64Arch {
    type SavedContext = X86_64Context;

    #[inline]
    unsafe fn context_switch(prev: *mut Self::SavedContext, next: *const Self::SavedContext) {
        unsafe { simple_threads_switch_context(prev, next) }
    }

    unsafe fn init_context(
        ctx: *mut Self::SavedContext,
        stack_bottom: *mut u8,
        entry: ThreadEntry,
        arg: usize,
    ) {
        // `ret` in the switch pops the bootstrap address, leaving rsp 16-byte
        // aligned before the `call`, as the ABI expects.
        let top = stack_bottom as usize & !0xF;
        let return_slot = (top - 8) as *mut u64;
        unsafe {
            return_slot.write(simple_threads_bootstrap as usize as u64);
            ctx.write(X86_64Context {
                rsp: return_slot as u64,
                r12: arg as u64,
                r13: entry as usize as u64,
                ..X86_64Context::default()
            });
        }
    }
}
