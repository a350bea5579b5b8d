//! Scheduler trait definition.

use super::TcbStore;

/// Selection policy for the next thread to run.
///
/// The runtime calls this with the scheduler state locked whenever the
/// running thread gives up control, so implementations must not allocate
/// or block: the call may come from the timer signal handler.
pub trait Scheduler {
    /// Pick the next thread to run.
    ///
    /// # Arguments
    ///
    /// * `store` - All threads of the runtime
    /// * `current` - Position of the thread giving up control; it is never
    ///   a candidate
    ///
    /// # Returns
    ///
    /// Position of a ready thread, or `None` if no other thread is ready.
    fn pick_next(&self, store: &TcbStore, current: usize) -> Option<usize>;
}
