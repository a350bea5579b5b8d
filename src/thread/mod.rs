//! Thread control blocks and identifiers.

use crate::arch::{Arch, DefaultArch, SavedContext, ThreadEntry};
use crate::mem::Stack;
use core::cell::UnsafeCell;
use core::num::NonZeroUsize;

pub mod builder;

pub use builder::ThreadBuilder;

/// Identifier of a user-level thread, unique within its runtime.
///
/// The thread that initialized the runtime gets id 1; spawned threads are
/// numbered upward from there and ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(NonZeroUsize);

impl core::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ThreadId {
    /// Ids are handed out by the runtime; zero maps to 1.
    pub(crate) fn new(id: usize) -> Self {
        Self(NonZeroUsize::new(id).unwrap_or(NonZeroUsize::MIN))
    }

    /// Get the raw id value.
    pub fn get(self) -> usize {
        self.0.get()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Eligible to be picked by the scheduler
    Ready,
    /// Currently executing; exactly one thread per runtime
    Running,
    /// Blocked in `join` until some thread finishes
    Waiting,
    /// Finished, waiting to be harvested by `join`
    Terminated,
}

/// Thread control block.
///
/// Owned by the runtime's [`TcbStore`](crate::sched::TcbStore) from spawn
/// until a joiner harvests it; dropping it releases the stack.
pub struct Tcb {
    id: ThreadId,
    state: ThreadState,
    name: Option<String>,
    context: UnsafeCell<SavedContext>,
    stack: Option<Stack>,
    entry: Option<Box<dyn FnMut()>>,
}

impl Tcb {
    /// Control block for the thread that initialized the runtime.
    ///
    /// It runs on its own OS stack, so no stack is attached and the context
    /// is filled in by the first switch away from it.
    pub(crate) fn root(id: ThreadId) -> Self {
        Self {
            id,
            state: ThreadState::Running,
            name: Some(String::from("main")),
            context: UnsafeCell::new(SavedContext::default()),
            stack: None,
            entry: None,
        }
    }

    /// Control block for a spawned thread. Its context is not runnable
    /// until [`setup_initial_context`](Self::setup_initial_context) is called.
    pub(crate) fn new(
        id: ThreadId,
        stack: Stack,
        entry: Box<dyn FnMut()>,
        name: Option<String>,
    ) -> Self {
        Self {
            id,
            state: ThreadState::Ready,
            name,
            context: UnsafeCell::new(SavedContext::default()),
            stack: Some(stack),
            entry: Some(entry),
        }
    }

    /// Point the saved context at `trampoline(arg)` running on this
    /// thread's own stack.
    pub(crate) fn setup_initial_context(&mut self, trampoline: ThreadEntry, arg: usize) {
        let Some(stack) = self.stack.as_ref() else {
            return;
        };
        // SAFETY: the context is exclusively borrowed through `&mut self` and
        // `stack_bottom` is the aligned upper end of memory owned by `stack`.
        unsafe {
            DefaultArch::init_context(self.context.get(), stack.stack_bottom(), trampoline, arg);
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ThreadState) {
        self.state = state;
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Size of the owned stack; zero for the root thread.
    pub fn stack_size(&self) -> usize {
        self.stack.as_ref().map_or(0, Stack::size)
    }

    pub(crate) fn has_stack(&self) -> bool {
        self.stack.is_some()
    }

    /// `false` if the stack canary has been overwritten.
    pub(crate) fn stack_intact(&self) -> bool {
        self.stack.as_ref().map_or(true, Stack::check_canary)
    }

    /// The entry closure. The box stays owned by the TCB and is freed when
    /// the thread is harvested; the closure itself is moved out and dropped
    /// on the thread's own stack when it returns or calls `finish`.
    pub(crate) fn entry_ptr(&mut self) -> Option<*mut dyn FnMut()> {
        self.entry
            .as_deref_mut()
            .map(|entry| entry as *mut dyn FnMut())
    }

    /// Pointer to the saved execution state, for the context switch.
    pub(crate) fn context_ptr(&self) -> *mut SavedContext {
        self.context.get()
    }
}

impl core::fmt::Debug for Tcb {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Tcb")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("name", &self.name)
            .field("stack_size", &self.stack_size())
            .finish()
    }
}
