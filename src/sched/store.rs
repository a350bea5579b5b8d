//! Ordered collection of thread control blocks.
//!
//! Position 0 is the head. Newly spawned threads are inserted at the head,
//! so iteration order is newest first; the scheduler scans it circularly.

use crate::thread::{Tcb, ThreadId, ThreadState};
use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct TcbStore {
    threads: VecDeque<Box<Tcb>>,
}

impl TcbStore {
    pub fn new() -> Self {
        Self {
            threads: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Insert at the head of the iteration order.
    pub fn insert_front(&mut self, tcb: Box<Tcb>) {
        self.threads.push_front(tcb);
    }

    /// Position of the thread with the given id.
    pub fn position(&self, id: ThreadId) -> Option<usize> {
        self.threads.iter().position(|tcb| tcb.id() == id)
    }

    pub fn get(&self, pos: usize) -> Option<&Tcb> {
        self.threads.get(pos).map(|tcb| &**tcb)
    }

    pub fn find(&self, id: ThreadId) -> Option<&Tcb> {
        self.position(id).and_then(|pos| self.get(pos))
    }

    /// Threads strictly after `pos`, up to the tail.
    pub fn iter_from(&self, pos: usize) -> impl Iterator<Item = &Tcb> + '_ {
        self.threads.iter().skip(pos.saturating_add(1)).map(|tcb| &**tcb)
    }

    /// All threads, head first.
    pub fn iter(&self) -> impl Iterator<Item = &Tcb> + '_ {
        self.threads.iter().map(|tcb| &**tcb)
    }

    pub fn count(&self, state: ThreadState) -> usize {
        self.iter().filter(|tcb| tcb.state() == state).count()
    }

    pub fn has_waiters(&self) -> bool {
        self.iter().any(|tcb| tcb.state() == ThreadState::Waiting)
    }

    /// Move every waiting thread to ready; returns how many were released.
    pub fn release_waiters(&mut self) -> usize {
        let mut released = 0;
        for tcb in self.threads.iter_mut() {
            if tcb.state() == ThreadState::Waiting {
                tcb.set_state(ThreadState::Ready);
                released += 1;
            }
        }
        released
    }

    /// Unlink the first terminated thread in iteration order.
    pub fn remove_first_terminated(&mut self) -> Option<Box<Tcb>> {
        let pos = self
            .threads
            .iter()
            .position(|tcb| tcb.state() == ThreadState::Terminated)?;
        self.threads.remove(pos)
    }

    /// Unlink every thread, head first.
    pub fn drain(&mut self) -> Vec<Box<Tcb>> {
        self.threads.drain(..).collect()
    }
}

impl core::ops::Index<usize> for TcbStore {
    type Output = Tcb;

    fn index(&self, pos: usize) -> &Tcb {
        &self.threads[pos]
    }
}

impl core::ops::IndexMut<usize> for TcbStore {
    fn index_mut(&mut self, pos: usize) -> &mut Tcb {
        &mut self.threads[pos]
    }
}
