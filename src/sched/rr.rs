//! Round-robin scheduler.

use super::trait_def::Scheduler;
use super::TcbStore;
use crate::thread::ThreadState;

/// Circular scan over the store: first the threads after the current one,
/// then from the head up to, but excluding, the current one.
#[derive(Debug, Default, Clone, Copy)]
pub struct RoundRobinScheduler;

impl RoundRobinScheduler {
    pub const fn new() -> Self {
        Self
    }
}

impl Scheduler for RoundRobinScheduler {
    fn pick_next(&self, store: &TcbStore, current: usize) -> Option<usize> {
        let is_ready = |tcb: &crate::thread::Tcb| tcb.state() == ThreadState::Ready;

        if let Some(offset) = store.iter_from(current).position(is_ready) {
            return Some(current + 1 + offset);
        }
        store.iter().take(current).position(is_ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::store::tests::store_with;
    use ThreadState::*;

    #[test]
    fn test_picks_first_ready_after_current() {
        let store = store_with(&[Ready, Running, Waiting, Ready, Ready]);
        assert_eq!(RoundRobinScheduler.pick_next(&store, 1), Some(3));
    }

    #[test]
    fn test_wraps_to_head() {
        let store = store_with(&[Waiting, Ready, Running, Terminated]);
        assert_eq!(RoundRobinScheduler.pick_next(&store, 2), Some(1));
    }

    #[test]
    fn test_current_is_never_picked() {
        let store = store_with(&[Waiting, Ready, Terminated]);
        // position 1 gave up control while marked ready
        assert_eq!(RoundRobinScheduler.pick_next(&store, 1), None);

        let lone = store_with(&[Ready]);
        assert_eq!(RoundRobinScheduler.pick_next(&lone, 0), None);
    }

    #[test]
    fn test_full_cycle_visits_every_ready_thread() {
        let mut store = store_with(&[Ready, Ready, Running, Ready]);
        let mut current = 2;
        let mut order = Vec::new();
        for _ in 0..4 {
            let next = RoundRobinScheduler.pick_next(&store, current).unwrap();
            store[current].set_state(Ready);
            store[next].set_state(Running);
            order.push(next);
            current = next;
        }
        assert_eq!(order, vec![3, 0, 1, 2]);
    }
}
