//! AArch64 (ARM64) context switching for AAPCS64.

use super::{Arch, ThreadEntry};
use core::arch::global_asm;

pub struct Aarch64Arch;

/// Callee-saved state: x19-x30, sp and the low halves of v8-v15.
#[repr(C)]
#[derive(Debug, Default)]
pub struct Aarch64Context {
    /// x19..=x30; x29 is the frame pointer, x30 the link register
    pub x: [u64; 12],
    pub sp: u64,
    /// d8..=d15
    pub d: [u64; 8],
}

// simple_threads_switch_context(prev: x0, next: x1)
global_asm!(
    ".pushsection .text.simple_threads_switch_context,\"ax\",%progbits",
    ".global simple_threads_switch_context",
    ".type simple_threads_switch_context,%function",
    ".p2align 4",
    "simple_threads_switch_context:",
    "stp x19, x20, [x0, #0]",
    "stp x21, x22, [x0, #16]",
    "stp x23, x24, [x0, #32]",
    "stp x25, x26, [x0, #48]",
    "stp x27, x28, [x0, #64]",
    "stp x29, x30, [x0, #80]",
    "mov x9, sp",
    "str x9, [x0, #96]",
    "stp d8, d9, [x0, #104]",
    "stp d10, d11, [x0, #120]",
    "stp d12, d13, [x0, #136]",
    "stp d14, d15, [x0, #152]",
    "ldp x19, x20, [x1, #0]",
    "ldp x21, x22, [x1, #16]",
    "ldp x23, x24, [x1, #32]",
    "ldp x25, x26, [x1, #48]",
    "ldp x27, x28, [x1, #64]",
    "ldp x29, x30, [x1, #80]",
    "ldr x9, [x1, #96]",
    "mov sp, x9",
    "ldp d8, d9, [x1, #104]",
    "ldp d10, d11, [x1, #120]",
    "ldp d12, d13, [x1, #136]",
    "ldp d14, d15, [x1, #152]",
    "ret",
    ".size simple_threads_switch_context, . - simple_threads_switch_context",
    ".popsection",
);

// First code a fresh thread runs: x19 holds the argument, x20 the entry.
global_asm!(
    ".pushsection .text.simple_threads_bootstrap,\"ax\",%progbits",
    ".global simple_threads_bootstrap",
    ".type simple_threads_bootstrap,%function",
    ".p2align 4",
    "simple_threads_bootstrap:",
    ".cfi_startproc",
    ".cfi_undefined x30",
    "mov x0, x19",
    "blr x20",
    "brk #0x1",
    ".cfi_endproc",
    ".size simple_threads_bootstrap, . - simple_threads_bootstrap",
    ".popsection",
);

extern "C" {
    fn simple_threads_switch_context(prev: *mut Aarch64Context, next: *const Aarch64Context);
    fn simple_threads_bootstrap();
}

impl Arch for Aarch64Arch {
    type SavedContext = Aarch64Context;

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
        let mut context = Aarch64Context::default();
        context.x[0] = arg as u64;
        context.x[1] = entry as usize as u64;
        // `ret` in the switch branches to x30
        context.x[11] = simple_threads_bootstrap as usize as u64;
        context.sp = (stack_bottom as usize & !0xF) as u64;
        unsafe { ctx.write(context) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::offset_of;

    #[test]
    fn test_context_layout_matches_assembly() {
        assert_eq!(offset_of!(Aarch64Context, x), 0);
        assert_eq!(offset_of!(Aarch64Context, sp), 96);
        assert_eq!(offset_of!(Aarch64Context, d), 104);
        assert_eq!(core::mem::size_of::<Aarch64Context>(), 168);
    }
}
