#![deny(unsafe_op_in_unsafe_fn)]
#![warn(unreachable_pub)]

//! User-level threads for Linux, multiplexed onto a single OS thread.
//!
//! A [`Runtime`] turns the calling context into the first thread and keeps
//! every thread it spawns in an ordered store. Control moves between threads
//! in round-robin order, either when a thread calls a lifecycle operation or
//! when the preemption timer expires.
//!
//! # Lifecycle
//!
//! - [`spawn`] creates a ready thread with its own stack.
//! - [`yield_now`] hands the CPU to the next ready thread.
//! - [`finish`] ends the calling thread once some thread is waiting in
//!   [`join`], and releases every waiter.
//! - [`join`] waits until a thread has finished, frees it and returns its id.
//!
//! # Preemption
//!
//! See [`PreemptionMode`]. In the default signal mode the timer can switch
//! threads at any instruction; threads must not be preempted while holding
//! non-reentrant state they share with other threads of the same runtime
//! (the allocator, stdio). [`PreemptionMode::Checkpoint`] defers the switch
//! to the next [`preemption_point`] call instead.
//!
//! # Quick Start
//!
//! ```no_run
//! use simple_threads::{Runtime, SchedulerConfig};
//!
//! let rt = Runtime::new(SchedulerConfig::cooperative());
//! rt.initialize().expect("runtime already active");
//!
//! for n in 0..3 {
//!     rt.spawn(move || {
//!         for step in 0..4 {
//!             log::info!("thread {} step {}", n, step);
//!             simple_threads::yield_now();
//!         }
//!     });
//! }
//! for _ in 0..3 {
//!     rt.join();
//! }
//! ```
//!
//! # Configuration
//!
//! [`SchedulerConfig::from_env`] reads the `STHREADS_*` variables; see the
//! [`config`] module.

// Core modules
pub mod arch;
pub mod config;
pub mod errors;
pub mod mem;
pub mod platform_timer;
pub mod runtime;
pub mod sched;
pub mod thread;
pub mod time;

// ============================================================================
// Public API
// ============================================================================

pub use config::{PreemptionMode, SchedulerConfig};
pub use errors::{ConfigError, InitError, SpawnError, TimerError};
pub use mem::{DEFAULT_STACK_SIZE, MIN_STACK_SIZE};
pub use runtime::{Runtime, RuntimeStats};
pub use sched::{RoundRobinScheduler, Scheduler};
pub use thread::{ThreadBuilder, ThreadId, ThreadState};
pub use time::ClockBasis;

// ============================================================================
// Convenience Functions
// ============================================================================
//
// These act on the runtime initialized on the calling OS thread and abort
// the process if there is none.

/// Spawn a thread on the current runtime.
pub fn spawn<F>(entry: F) -> ThreadId
where
    F: FnOnce() + 'static,
{
    runtime::spawn(entry)
}

/// Yield the CPU to the next ready thread.
///
/// The caller stays ready and runs again after every other ready thread
/// has had its turn. Aborts with a deadlock diagnostic if no other thread
/// is ready.
#[inline]
pub fn yield_now() {
    runtime::yield_now()
}

/// Terminate the calling thread.
///
/// If no thread is waiting in [`join`] yet, the caller keeps yielding until
/// one is. Returning from a thread's entry closure is equivalent.
///
/// The calling thread's frames are unwound first, so the entry closure and
/// everything it captured are dropped before the thread terminates. A
/// `catch_unwind` in the thread's own code must not swallow that unwind.
/// Under `panic = "abort"` nothing is unwound and captured state is leaked.
pub fn finish() -> ! {
    runtime::finish()
}

/// Block until some thread has finished, harvest it and return its id.
pub fn join() -> ThreadId {
    runtime::join()
}

/// Harvest a finished thread if there is one, without blocking.
pub fn try_join() -> Option<ThreadId> {
    runtime::try_join()
}

/// Id of the calling thread.
pub fn current() -> ThreadId {
    runtime::current()
}

/// Switch threads here if a checkpoint preemption is pending.
///
/// Does nothing outside [`PreemptionMode::Checkpoint`] or without a runtime.
#[inline]
pub fn preemption_point() {
    runtime::preemption_point()
}
