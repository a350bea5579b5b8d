//! Thread stacks.
//!
//! Every spawned thread owns one heap-allocated [`Stack`]; it is released
//! when the thread's control block is harvested by `join`.

use core::ptr::NonNull;
use std::alloc::{alloc, dealloc, Layout};

/// Smallest stack a thread may be given: 16 KiB
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Stack size used when neither the builder nor the config picks one: 256 KiB
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Pattern written at the lowest address of every stack.
pub const STACK_CANARY: u64 = 0xDEAD_BEEF_CAFE_BABE;

const PAGE_SIZE: usize = 4096;

/// A thread stack with an overflow canary.
pub struct Stack {
    /// Start of the stack memory (lowest address)
    memory: NonNull<u8>,
    /// Size in bytes, a multiple of the page size
    size: usize,
}

impl Stack {
    /// Allocate a stack of at least `size` bytes and install the canary.
    ///
    /// Returns `None` when the allocator has no memory left.
    pub fn allocate(size: usize) -> Option<Stack> {
        let size = size.max(MIN_STACK_SIZE).checked_add(PAGE_SIZE - 1)? & !(PAGE_SIZE - 1);
        let layout = Layout::from_size_align(size, PAGE_SIZE).ok()?;
        // SAFETY: `layout` has a non-zero size.
        let memory = NonNull::new(unsafe { alloc(layout) })?;

        let stack = Stack { memory, size };
        stack.install_canary();
        Some(stack)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Highest usable address, aligned to 16 bytes. Stacks grow down from here.
    pub fn stack_bottom(&self) -> *mut u8 {
        // SAFETY: one-past-the-end of the allocation.
        let end = unsafe { self.memory.as_ptr().add(self.size) } as usize;
        (end & !0xF) as *mut u8
    }

    /// Lowest address of the stack, where the canary lives.
    pub fn stack_top(&self) -> *const u8 {
        self.memory.as_ptr()
    }

    fn install_canary(&self) {
        let canary_location = self.memory.as_ptr() as *mut u64;
        // SAFETY: the allocation is page aligned and at least MIN_STACK_SIZE long.
        unsafe {
            canary_location.write_volatile(STACK_CANARY);
        }
    }

    /// `true` if the canary is intact, `false` if the thread ran past the
    /// end of its stack.
    pub fn check_canary(&self) -> bool {
        let canary_location = self.memory.as_ptr() as *const u64;
        // SAFETY: same location as written by `install_canary`.
        unsafe { canary_location.read_volatile() == STACK_CANARY }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        if let Ok(layout) = Layout::from_size_align(self.size, PAGE_SIZE) {
            // SAFETY: allocated in `allocate` with this exact layout.
            unsafe {
                dealloc(self.memory.as_ptr(), layout);
            }
        }
    }
}

impl core::fmt::Debug for Stack {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Stack")
            .field("memory", &self.memory)
            .field("size", &self.size)
            .finish()
    }
}
