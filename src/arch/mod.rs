//! Architecture abstraction layer for context switching.
//!
//! A context switch saves the callee-saved registers and stack pointer of
//! the running thread and restores another thread's, so each target only
//! has to provide the register layout and two small assembly routines.

/// Entry trampoline for a fresh thread. Receives the argument given to
/// [`Arch::init_context`] and never returns.
pub type ThreadEntry = extern "C" fn(usize) -> !;

/// Architecture abstraction trait.
///
/// # Safety
///
/// Implementations involve inline assembly. All methods marked as unsafe
/// have specific preconditions that must be upheld by the caller.
pub trait Arch {
    /// Architecture-specific saved context type.
    ///
    /// This type must contain every register the platform ABI requires a
    /// function call to preserve, plus the stack pointer.
    type SavedContext: Default;

    /// Save the running execution state into `prev` and resume `next`.
    ///
    /// Returns when some later switch resumes `prev`.
    ///
    /// # Safety
    ///
    /// - `prev` must point to a valid, writable SavedContext
    /// - `next` must hold state saved by an earlier switch or prepared by
    ///   [`init_context`](Self::init_context)
    /// - The stack `next` refers to must still be allocated
    unsafe fn context_switch(prev: *mut Self::SavedContext, next: *const Self::SavedContext);

    /// Prepare `ctx` so that switching to it calls `entry(arg)` on the stack
    /// ending at `stack_bottom`.
    ///
    /// # Safety
    ///
    /// - `stack_bottom` must be the 16-byte aligned upper end of a writable
    ///   region large enough to run `entry`
    /// - `ctx` must point to a valid, writable SavedContext
    unsafe fn init_context(
        ctx: *mut Self::SavedContext,
        stack_bottom: *mut u8,
        entry: ThreadEntry,
        arg: usize,
    );
}

#[cfg(not(target_os = "linux"))]
compile_error!("simple-threads needs Linux POSIX timers and thread-directed signals.");

#[cfg(target_arch = "x86_64")]
pub mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use x86_64::X86_64Arch as DefaultArch;

#[cfg(target_arch = "aarch64")]
pub mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use aarch64::Aarch64Arch as DefaultArch;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("simple-threads supports x86_64 and aarch64 only.");

/// Saved context of the target architecture.
pub type SavedContext = <DefaultArch as Arch>::SavedContext;
