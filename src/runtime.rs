//! The runtime: lifecycle operations over the thread store, the round-robin
//! scheduler, the context switch and the preemption timer.
//!
//! Every operation that changes scheduler state follows the same protocol:
//! block the timer signal and disarm the timer, lock the state, mutate it,
//! release the lock, re-arm the timer for whichever thread runs next and
//! switch. The side that resumes after the switch unblocks the signal.

use crate::arch::{Arch, DefaultArch};
use crate::config::{PreemptionMode, SchedulerConfig};
use crate::errors::{fatal, FatalError, InitError, SpawnError};
use crate::mem::{Stack, MIN_STACK_SIZE};
use crate::platform_timer::PreemptionTimer;
use crate::sched::{DefaultScheduler, Scheduler, TcbStore};
use crate::thread::{Tcb, ThreadId, ThreadState};
use core::cell::Cell;
use core::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use portable_atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use spin::{Mutex, MutexGuard};

thread_local! {
    /// Runtime active on this OS thread, null if none.
    static ACTIVE: Cell<*const RuntimeInner> = const { Cell::new(core::ptr::null()) };
}

/// A set of user-level threads multiplexed onto the calling OS thread.
///
/// # Examples
///
/// ```no_run
/// use simple_threads::{Runtime, SchedulerConfig};
///
/// let rt = Runtime::new(SchedulerConfig::cooperative());
/// rt.initialize().unwrap();
/// for _ in 0..3 {
///     rt.spawn(|| {
///         for _ in 0..4 {
///             simple_threads::yield_now();
///         }
///     });
/// }
/// for _ in 0..3 {
///     let id = rt.join();
///     println!("joined {}", id);
/// }
/// ```
pub struct Runtime {
    inner: Box<RuntimeInner>,
    /// Bound to the OS thread that created it
    _not_send: PhantomData<*const ()>,
}

/// Snapshot of a runtime's bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    pub total: usize,
    pub ready: usize,
    pub running: usize,
    pub waiting: usize,
    pub terminated: usize,
    pub stacks_allocated: usize,
    pub stacks_released: usize,
    pub switches: u64,
    pub preemptions: u64,
    pub timer_expirations: u64,
}

pub(crate) struct RuntimeInner {
    config: SchedulerConfig,
    scheduler: DefaultScheduler,
    timer: PreemptionTimer,
    state: Mutex<SchedState>,
    initialized: AtomicBool,
    stacks_allocated: AtomicUsize,
    stacks_released: AtomicUsize,
    switches: AtomicU64,
    preemptions: AtomicU64,
}

struct SchedState {
    store: TcbStore,
    /// Thread that owns the CPU
    current: Option<ThreadId>,
    /// Thread that called `initialize`
    root: Option<ThreadId>,
    next_id: usize,
}

impl SchedState {
    fn allocate_id(&mut self) -> ThreadId {
        let id = ThreadId::new(self.next_id);
        self.next_id += 1;
        id
    }

    /// Position of the running thread, if the state is consistent.
    fn on_spawned_thread(&self) -> bool {
        self.current.is_some() && self.current != self.root
    }

    fn running_position(&self) -> Option<usize> {
        let pos = self.store.position(self.current?)?;
        (self.store[pos].state() == ThreadState::Running).then_some(pos)
    }
}

impl Runtime {
    /// Build an uninitialized runtime.
    pub fn new(config: SchedulerConfig) -> Self {
        let timer = PreemptionTimer::new(config.preemption, config.clock, config.interval);
        Self {
            inner: Box::new(RuntimeInner {
                config,
                scheduler: DefaultScheduler::new(),
                timer,
                state: Mutex::new(SchedState {
                    store: TcbStore::new(),
                    current: None,
                    root: None,
                    next_id: 1,
                }),
                initialized: AtomicBool::new(false),
                stacks_allocated: AtomicUsize::new(0),
                stacks_released: AtomicUsize::new(0),
                switches: AtomicU64::new(0),
                preemptions: AtomicU64::new(0),
            }),
            _not_send: PhantomData,
        }
    }

    /// Runtime configured from the `STHREADS_*` environment variables.
    pub fn from_env() -> Result<Self, InitError> {
        Ok(Self::new(SchedulerConfig::from_env()?))
    }

    /// Turn the calling context into the first thread and start the timer.
    ///
    /// Fails if this runtime, or any other, is already active on the
    /// calling OS thread.
    pub fn initialize(&self) -> Result<(), InitError> {
        self.inner.initialize()
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.is_initialized()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Create a ready thread that will run `entry`.
    ///
    /// Aborts the process if the runtime is not initialized or no stack can
    /// be allocated; see [`try_spawn`](Self::try_spawn).
    pub fn spawn<F>(&self, entry: F) -> ThreadId
    where
        F: FnOnce() + 'static,
    {
        self.inner
            .spawn(entry, None, None)
            .unwrap_or_else(|e| fatal(e.into()))
    }

    pub fn try_spawn<F>(&self, entry: F) -> Result<ThreadId, SpawnError>
    where
        F: FnOnce() + 'static,
    {
        self.inner.spawn(entry, None, None)
    }

    /// Give up the CPU to the next ready thread.
    pub fn yield_now(&self) {
        self.inner.yield_now()
    }

    /// Terminate the calling thread once some thread is waiting in `join`.
    ///
    /// See [`crate::finish`] for how the caller's frames are released.
    pub fn finish(&self) -> ! {
        self.inner.finish()
    }

    /// Wait until some thread terminates and harvest it.
    pub fn join(&self) -> ThreadId {
        self.inner.join()
    }

    /// Harvest a terminated thread if one exists, without waiting.
    pub fn try_join(&self) -> Option<ThreadId> {
        self.inner.try_join()
    }

    pub fn current(&self) -> ThreadId {
        self.inner.current()
    }

    /// State of `id`, or `None` once it has been harvested.
    pub fn thread_state(&self, id: ThreadId) -> Option<ThreadState> {
        self.inner.inspect(|state| state.store.find(id).map(Tcb::state))
    }

    pub fn thread_name(&self, id: ThreadId) -> Option<String> {
        self.inner
            .inspect(|state| state.store.find(id).and_then(|tcb| tcb.name().map(String::from)))
    }

    pub fn stats(&self) -> RuntimeStats {
        self.inner.stats()
    }

    /// Switch threads here if a checkpoint preemption is pending.
    pub fn preemption_point(&self) {
        self.inner.preemption_point()
    }

    pub(crate) fn inner(&self) -> &RuntimeInner {
        &self.inner
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl core::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.inner.config)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl RuntimeInner {
    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn lock_state(&self, op: &'static str) -> MutexGuard<'_, SchedState> {
        match self.state.try_lock() {
            Some(guard) => guard,
            None => fatal(FatalError::UsageViolation {
                op,
                detail: "scheduler state re-entered",
            }),
        }
    }

    fn running_position(&self, state: &SchedState, op: &'static str) -> usize {
        if !self.is_initialized() {
            fatal(FatalError::UsageViolation {
                op,
                detail: "runtime not initialized",
            });
        }
        match state.running_position() {
            Some(pos) => pos,
            None => fatal(FatalError::UsageViolation {
                op,
                detail: "caller is not the running thread",
            }),
        }
    }

    /// Read-only access with the timer signal blocked.
    fn inspect<R>(&self, f: impl FnOnce(&SchedState) -> R) -> R {
        self.timer.block();
        let result = f(&self.lock_state("inspect"));
        self.timer.unblock();
        result
    }

    /// Exit path for operations that keep the current thread running.
    fn leave(&self) {
        self.timer.arm();
        self.timer.unblock();
    }

    fn initialize(&self) -> Result<(), InitError> {
        if self.is_initialized() || !active_ptr().is_null() {
            return Err(InitError::AlreadyInitialized);
        }
        self.config.validate()?;

        let root = {
            let mut state = self.lock_state("initialize");
            let id = state.allocate_id();
            state.store.insert_front(Box::new(Tcb::root(id)));
            state.current = Some(id);
            state.root = Some(id);
            id
        };
        self.initialized.store(true, Ordering::Release);
        ACTIVE.with(|active| active.set(self as *const RuntimeInner));

        if let Err(e) = self.timer.install() {
            fatal(e.into());
        }
        self.timer.arm();

        log::debug!(
            "runtime initialized: root thread {}, preemption {:?} every {:?} ({} clock)",
            root,
            self.config.preemption,
            self.config.interval,
            self.config.clock.as_str()
        );
        Ok(())
    }

    pub(crate) fn spawn<F>(
        &self,
        entry: F,
        name: Option<String>,
        stack_size: Option<usize>,
    ) -> Result<ThreadId, SpawnError>
    where
        F: FnOnce() + 'static,
    {
        if !self.is_initialized() {
            return Err(SpawnError::NotInitialized);
        }
        let size = stack_size.unwrap_or(self.config.stack_size);
        if size < MIN_STACK_SIZE {
            return Err(SpawnError::InvalidStackSize(size));
        }

        self.timer.suspend();
        let result = self.insert_thread(entry, name, size);
        self.leave();

        if let Ok(id) = result {
            log::debug!("spawned thread {} with {} byte stack", id, size);
        }
        result
    }

    /// Allocates, so it must run with the timer signal blocked.
    fn insert_thread(
        &self,
        entry: impl FnOnce() + 'static,
        name: Option<String>,
        size: usize,
    ) -> Result<ThreadId, SpawnError> {
        // the closure moves out on its first call, leaving the box to the TCB
        let mut entry = Some(entry);
        let entry: Box<dyn FnMut()> = Box::new(move || {
            if let Some(entry) = entry.take() {
                entry();
            }
        });
        let stack = Stack::allocate(size).ok_or(SpawnError::OutOfMemory)?;
        self.stacks_allocated.fetch_add(1, Ordering::Relaxed);

        let mut state = self.lock_state("spawn");
        let id = state.allocate_id();
        let mut tcb = Box::new(Tcb::new(id, stack, entry, name));
        tcb.setup_initial_context(thread_entry, self as *const RuntimeInner as usize);
        state.store.insert_front(tcb);
        Ok(id)
    }

    fn yield_now(&self) {
        self.timer.suspend();
        let mut state = self.lock_state("yield_now");
        let pos = self.running_position(&state, "yield_now");
        state.store[pos].set_state(ThreadState::Ready);
        self.switch_from(state, pos);
        self.timer.unblock();
    }

    fn finish(&self) -> ! {
        if cfg!(panic = "unwind")
            && !std::thread::panicking()
            && self.inspect(SchedState::on_spawned_thread)
        {
            // unwind out of the entry closure so everything it owns is
            // dropped; `thread_entry` catches this and terminates the thread
            self.timer.suspend();
            panic::resume_unwind(Box::new(ThreadFinished));
        }
        self.terminate()
    }

    fn terminate(&self) -> ! {
        log::trace!("thread {} finishing", self.current());
        loop {
            self.timer.suspend();
            let mut state = self.lock_state("finish");
            let pos = self.running_position(&state, "finish");
            if state.root == state.current {
                fatal(FatalError::UsageViolation {
                    op: "finish",
                    detail: "the initializing thread cannot finish",
                });
            }

            if state.store.has_waiters() {
                state.store.release_waiters();
                state.store[pos].set_state(ThreadState::Terminated);
                self.switch_from(state, pos);
                fatal(FatalError::ContextSwitch("terminated thread was resumed"));
            }

            // nobody to hand the exit to yet
            state.store[pos].set_state(ThreadState::Ready);
            self.switch_from(state, pos);
            self.timer.unblock();
            log::trace!("thread {} still lingering", self.current());
        }
    }

    fn join(&self) -> ThreadId {
        self.timer.suspend();
        loop {
            let mut state = self.lock_state("join");
            let pos = self.running_position(&state, "join");
            state.store[pos].set_state(ThreadState::Waiting);
            self.switch_from(state, pos);

            let mut state = self.lock_state("join");
            let harvested = state.store.remove_first_terminated();
            drop(state);

            if let Some(tcb) = harvested {
                let id = tcb.id();
                self.release(tcb);
                self.timer.unblock();
                log::debug!("joined thread {}", id);
                return id;
            }
            // another joiner took the thread that released us; wait again
        }
    }

    fn try_join(&self) -> Option<ThreadId> {
        self.timer.suspend();
        let mut state = self.lock_state("try_join");
        self.running_position(&state, "try_join");
        let harvested = state.store.remove_first_terminated();
        drop(state);

        let id = harvested.map(|tcb| {
            let id = tcb.id();
            self.release(tcb);
            id
        });
        self.leave();
        if let Some(id) = id {
            log::debug!("joined thread {}", id);
        }
        id
    }

    fn current(&self) -> ThreadId {
        match self.inspect(|state| state.current) {
            Some(id) if self.is_initialized() => id,
            _ => fatal(FatalError::UsageViolation {
                op: "current",
                detail: "runtime not initialized",
            }),
        }
    }

    fn stats(&self) -> RuntimeStats {
        let mut stats = self.inspect(|state| RuntimeStats {
            total: state.store.len(),
            ready: state.store.count(ThreadState::Ready),
            running: state.store.count(ThreadState::Running),
            waiting: state.store.count(ThreadState::Waiting),
            terminated: state.store.count(ThreadState::Terminated),
            ..RuntimeStats::default()
        });
        stats.stacks_allocated = self.stacks_allocated.load(Ordering::Relaxed);
        stats.stacks_released = self.stacks_released.load(Ordering::Relaxed);
        stats.switches = self.switches.load(Ordering::Relaxed);
        stats.preemptions = self.preemptions.load(Ordering::Relaxed);
        stats.timer_expirations = self.timer.expirations();
        stats
    }

    fn preemption_point(&self) {
        if !self.timer.take_pending() {
            return;
        }
        self.timer.suspend();
        let mut state = self.lock_state("preemption_point");
        let pos = self.running_position(&state, "preemption_point");
        match self.scheduler.pick_next(&state.store, pos) {
            Some(next) => {
                self.preemptions.fetch_add(1, Ordering::Relaxed);
                state.store[pos].set_state(ThreadState::Ready);
                self.switch_to(state, pos, next);
                self.timer.unblock();
            }
            None => {
                drop(state);
                self.leave();
            }
        }
    }

    /// Timer expiry, running inside the signal handler with the signal
    /// blocked by the kernel.
    fn on_timer_expired(&self) {
        self.timer.note_expired();
        if self.config.preemption != PreemptionMode::Signal {
            return;
        }
        // busy means a lifecycle operation is in progress and will re-arm
        let Some(mut state) = self.state.try_lock() else {
            return;
        };
        let Some(pos) = state.running_position() else {
            return;
        };
        match self.scheduler.pick_next(&state.store, pos) {
            Some(next) => {
                self.preemptions.fetch_add(1, Ordering::Relaxed);
                state.store[pos].set_state(ThreadState::Ready);
                self.switch_to(state, pos, next);
            }
            None => {
                drop(state);
                self.timer.arm();
            }
        }
        // returning from the handler restores the interrupted signal mask
    }

    /// Pick the successor of the thread at `from` and switch to it.
    /// Aborts with a deadlock diagnostic if nothing else is ready.
    fn switch_from(&self, state: MutexGuard<'_, SchedState>, from: usize) {
        match self.scheduler.pick_next(&state.store, from) {
            Some(next) => self.switch_to(state, from, next),
            None => fatal(FatalError::Deadlock {
                current: state.store[from].id(),
                waiting: state.store.count(ThreadState::Waiting),
                terminated: state.store.count(ThreadState::Terminated),
            }),
        }
    }

    /// Hand the CPU from `from` to `next`. Returns once `from` is resumed,
    /// with the timer signal still blocked.
    fn switch_to(&self, mut state: MutexGuard<'_, SchedState>, from: usize, next: usize) {
        let prev = &state.store[from];
        if !prev.stack_intact() {
            fatal(FatalError::StackOverflow(prev.id()));
        }
        let prev_ctx = prev.context_ptr();

        let next_tcb = &mut state.store[next];
        next_tcb.set_state(ThreadState::Running);
        let next_id = next_tcb.id();
        let next_ctx = next_tcb.context_ptr() as *const _;
        state.current = Some(next_id);
        drop(state);

        self.switches.fetch_add(1, Ordering::Relaxed);
        self.timer.arm();
        // SAFETY: both contexts live in boxed TCBs owned by the store. A TCB
        // is only removed by `join` after it terminated and was switched away
        // from, so `prev` stays valid until it is resumed and `next` holds
        // state saved by its last switch or prepared at spawn.
        unsafe {
            DefaultArch::context_switch(prev_ctx, next_ctx);
        }
    }

    /// Free a harvested thread.
    fn release(&self, tcb: Box<Tcb>) {
        if !tcb.stack_intact() {
            fatal(FatalError::StackOverflow(tcb.id()));
        }
        if tcb.has_stack() {
            self.stacks_released.fetch_add(1, Ordering::Relaxed);
        }
        drop(tcb);
    }

    fn entry_ptr(&self) -> Option<*mut dyn FnMut()> {
        let mut state = self.lock_state("start");
        let pos = self.running_position(&state, "start");
        state.store[pos].entry_ptr()
    }

    fn shutdown(&self) {
        if !self.is_initialized() {
            return;
        }
        self.timer.suspend();
        let mut state = self.lock_state("drop");
        if state.current != state.root {
            fatal(FatalError::UsageViolation {
                op: "drop",
                detail: "runtime dropped outside the initializing thread",
            });
        }
        let remaining = state.store.drain();
        state.current = None;
        drop(state);

        self.timer.shutdown();
        if active_ptr() == self as *const RuntimeInner {
            ACTIVE.with(|active| active.set(core::ptr::null()));
        }
        self.initialized.store(false, Ordering::Release);
        self.timer.unblock();

        let released = remaining.iter().filter(|tcb| tcb.has_stack()).count();
        self.stacks_released.fetch_add(released, Ordering::Relaxed);
        log::debug!("runtime dropped with {} unjoined threads", released);
        drop(remaining);
    }
}

/// Unwind payload used by `finish` to leave a thread's entry closure.
struct ThreadFinished;

/// First Rust frame of every spawned thread.
extern "C" fn thread_entry(inner: usize) -> ! {
    // SAFETY: `inner` is the address of the boxed RuntimeInner that spawned
    // this thread; it outlives every thread it runs.
    let inner = unsafe { &*(inner as *const RuntimeInner) };
    let entry = inner.entry_ptr();
    inner.timer.unblock();
    if let Some(entry) = entry {
        // SAFETY: the closure box belongs to this thread's TCB, which is only
        // freed after this thread has terminated.
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| unsafe { (*entry)() }));
        if let Err(payload) = outcome {
            if !payload.is::<ThreadFinished>() {
                fatal(FatalError::ThreadPanicked(inner.current()));
            }
            drop(payload);
        }
    }
    inner.terminate()
}

fn active_ptr() -> *const RuntimeInner {
    ACTIVE
        .try_with(|active| active.get())
        .unwrap_or(core::ptr::null())
}

fn active_or_fatal(op: &'static str) -> *const RuntimeInner {
    let ptr = active_ptr();
    if ptr.is_null() {
        fatal(FatalError::UsageViolation {
            op,
            detail: "no runtime initialized on this thread",
        });
    }
    ptr
}

/// Run `f` against the runtime active on this OS thread.
pub(crate) fn with_active<R>(op: &'static str, f: impl FnOnce(&RuntimeInner) -> R) -> R {
    let ptr = active_or_fatal(op);
    // SAFETY: registered by `initialize`, cleared by `shutdown` before the
    // RuntimeInner is freed.
    f(unsafe { &*ptr })
}

/// Like [`with_active`], but `None` instead of aborting without a runtime.
pub(crate) fn try_with_active<R>(f: impl FnOnce(&RuntimeInner) -> R) -> Option<R> {
    let ptr = active_ptr();
    // SAFETY: see `with_active`.
    (!ptr.is_null()).then(|| f(unsafe { &*ptr }))
}

/// Called from the timer signal handler.
pub(crate) fn on_timer_expired() {
    let ptr = active_ptr();
    if ptr.is_null() {
        return;
    }
    // SAFETY: see `with_active`.
    unsafe { &*ptr }.on_timer_expired();
}

pub(crate) fn spawn<F>(entry: F) -> ThreadId
where
    F: FnOnce() + 'static,
{
    with_active("spawn", |rt| rt.spawn(entry, None, None)).unwrap_or_else(|e| fatal(e.into()))
}

pub(crate) fn yield_now() {
    with_active("yield_now", RuntimeInner::yield_now)
}

pub(crate) fn finish() -> ! {
    let ptr = active_or_fatal("finish");
    // SAFETY: see `with_active`.
    unsafe { &*ptr }.finish()
}

pub(crate) fn join() -> ThreadId {
    with_active("join", RuntimeInner::join)
}

pub(crate) fn try_join() -> Option<ThreadId> {
    with_active("try_join", RuntimeInner::try_join)
}

pub(crate) fn current() -> ThreadId {
    with_active("current", RuntimeInner::current)
}

/// No-op without an active runtime, so library code may call it freely.
pub(crate) fn preemption_point() {
    let ptr = active_ptr();
    if !ptr.is_null() {
        // SAFETY: see `with_active`.
        unsafe { &*ptr }.preemption_point();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_creates_running_root() {
        let rt = Runtime::new(SchedulerConfig::cooperative());
        assert!(!rt.is_initialized());
        rt.initialize().unwrap();

        let root = rt.current();
        assert_eq!(root.get(), 1);
        assert_eq!(rt.thread_state(root), Some(ThreadState::Running));
        assert_eq!(rt.thread_name(root).as_deref(), Some("main"));
        let stats = rt.stats();
        assert_eq!((stats.total, stats.running), (1, 1));
    }

    #[test]
    fn test_second_runtime_on_same_thread_is_rejected() {
        let first = Runtime::new(SchedulerConfig::cooperative());
        first.initialize().unwrap();
        assert_eq!(first.initialize(), Err(InitError::AlreadyInitialized));

        let second = Runtime::new(SchedulerConfig::cooperative());
        assert_eq!(second.initialize(), Err(InitError::AlreadyInitialized));

        drop(first);
        assert!(second.initialize().is_ok());
    }

    #[test]
    fn test_invalid_config_is_reported() {
        let rt = Runtime::new(SchedulerConfig::cooperative().with_stack_size(1024));
        assert!(matches!(rt.initialize(), Err(InitError::InvalidConfig(_))));
        assert!(!rt.is_initialized());
    }

    #[test]
    fn test_try_spawn_requires_initialization() {
        let rt = Runtime::new(SchedulerConfig::cooperative());
        assert_eq!(rt.try_spawn(|| {}), Err(SpawnError::NotInitialized));
    }

    #[test]
    fn test_spawn_is_newest_first_and_ready() {
        let rt = Runtime::new(SchedulerConfig::cooperative());
        rt.initialize().unwrap();
        let a = rt.spawn(|| {});
        let b = rt.spawn(|| {});
        assert_eq!((a.get(), b.get()), (2, 3));
        assert_eq!(rt.thread_state(a), Some(ThreadState::Ready));

        let order: Vec<usize> =
            rt.inner().inspect(|state| state.store.iter().map(|t| t.id().get()).collect());
        assert_eq!(order, vec![3, 2, 1]);
        assert_eq!(rt.stats().stacks_allocated, 2);
    }

    #[test]
    fn test_drop_releases_unjoined_stacks() {
        use std::rc::Rc;

        let marker = Rc::new(());
        let rt = Runtime::new(SchedulerConfig::cooperative());
        rt.initialize().unwrap();
        let held = Rc::clone(&marker);
        rt.spawn(move || drop(held));
        assert_eq!(Rc::strong_count(&marker), 2);
        drop(rt);
        // the never-started closure is dropped with its thread
        assert_eq!(Rc::strong_count(&marker), 1);
        assert!(active_ptr().is_null());
    }
}
