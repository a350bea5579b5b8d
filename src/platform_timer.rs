//! Timer and signal plumbing for preemptive scheduling.
//!
//! Each runtime owns one POSIX timer aimed at its own OS thread
//! (`SIGEV_THREAD_ID`). The timer is one-shot: the runtime re-arms it every
//! time a thread is about to run and disarms it while scheduler state is
//! being changed.

use crate::config::PreemptionMode;
use crate::errors::{fatal, TimerError};
use crate::time::{to_timespec, ClockBasis};
use core::cell::Cell;
use core::time::Duration;
use portable_atomic::{AtomicBool, AtomicU64, Ordering};

pub struct PreemptionTimer {
    mode: PreemptionMode,
    clock: ClockBasis,
    interval: Duration,
    timer: Cell<Option<libc::timer_t>>,
    armed: AtomicBool,
    pending: AtomicBool,
    expirations: AtomicU64,
}

impl PreemptionTimer {
    pub(crate) fn new(mode: PreemptionMode, clock: ClockBasis, interval: Duration) -> Self {
        Self {
            mode,
            clock,
            interval,
            timer: Cell::new(None),
            armed: AtomicBool::new(false),
            pending: AtomicBool::new(false),
            expirations: AtomicU64::new(0),
        }
    }

    /// Install the signal handler and create a timer that delivers to the
    /// calling OS thread. No-op when preemption is disabled.
    pub(crate) fn install(&self) -> Result<(), TimerError> {
        if !self.mode.uses_timer() || self.timer.get().is_some() {
            return Ok(());
        }
        let signal = self.clock.signal();

        // SAFETY: plain FFI on zero-initialized, correctly typed structs.
        unsafe {
            let mut action: libc::sigaction = core::mem::zeroed();
            action.sa_sigaction = on_timer_signal as extern "C" fn(libc::c_int) as usize;
            action.sa_flags = libc::SA_RESTART;
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(signal, &action, core::ptr::null_mut()) != 0 {
                return Err(TimerError::SignalInstall(errno()));
            }

            let mut event: libc::sigevent = core::mem::zeroed();
            event.sigev_notify = libc::SIGEV_THREAD_ID;
            event.sigev_signo = signal;
            event.sigev_notify_thread_id = libc::syscall(libc::SYS_gettid) as libc::c_int;

            let mut timer: libc::timer_t = core::ptr::null_mut();
            if libc::timer_create(self.clock.clock_id(), &mut event, &mut timer) != 0 {
                return Err(TimerError::Create(errno()));
            }
            self.timer.set(Some(timer));
        }
        Ok(())
    }

    /// Start a fresh one-shot time slice.
    pub(crate) fn arm(&self) {
        self.set_time(self.interval);
        if self.timer.get().is_some() {
            self.armed.store(true, Ordering::Relaxed);
        }
    }

    pub(crate) fn disarm(&self) {
        self.armed.store(false, Ordering::Relaxed);
        self.set_time(Duration::ZERO);
    }

    fn set_time(&self, value: Duration) {
        let Some(timer) = self.timer.get() else {
            return;
        };
        let spec = libc::itimerspec {
            it_interval: to_timespec(Duration::ZERO),
            it_value: to_timespec(value),
        };
        // SAFETY: `timer` was returned by timer_create and not yet deleted.
        if unsafe { libc::timer_settime(timer, 0, &spec, core::ptr::null_mut()) } != 0 {
            fatal(TimerError::SetTime(errno()).into());
        }
    }

    /// Keep the timer signal from being delivered to this OS thread.
    pub(crate) fn block(&self) {
        self.set_mask(libc::SIG_BLOCK);
    }

    pub(crate) fn unblock(&self) {
        self.set_mask(libc::SIG_UNBLOCK);
    }

    fn set_mask(&self, how: libc::c_int) {
        if self.timer.get().is_none() {
            return;
        }
        // SAFETY: the set is initialized by sigemptyset before use.
        let rc = unsafe {
            let mut set: libc::sigset_t = core::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, self.clock.signal());
            libc::pthread_sigmask(how, &set, core::ptr::null_mut())
        };
        if rc != 0 {
            fatal(TimerError::SignalMask(rc).into());
        }
    }

    /// Block the signal, then disarm. Entry sequence of every lifecycle
    /// operation.
    ///
    /// Ends the current time slice: an expiry queued before the disarm and
    /// a checkpoint request not yet taken are both dropped, so the next
    /// thread to run starts with a full interval.
    pub(crate) fn suspend(&self) {
        self.block();
        self.disarm();
        self.discard_queued();
        self.pending.store(false, Ordering::Release);
    }

    /// Consume a timer signal that fired after `block` but before `disarm`.
    /// Must be called with the signal blocked.
    fn discard_queued(&self) {
        if self.timer.get().is_none() {
            return;
        }
        let zero = to_timespec(Duration::ZERO);
        // SAFETY: the set is initialized by sigemptyset before use; a null
        // siginfo pointer is allowed.
        unsafe {
            let mut set: libc::sigset_t = core::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, self.clock.signal());
            while libc::sigtimedwait(&set, core::ptr::null_mut(), &zero) > 0 {}
        }
    }

    /// Record an expiry. Called from the signal handler.
    pub(crate) fn note_expired(&self) {
        self.armed.store(false, Ordering::Relaxed);
        self.expirations.fetch_add(1, Ordering::Relaxed);
        if self.mode == PreemptionMode::Checkpoint {
            self.pending.store(true, Ordering::Release);
        }
    }

    /// Consume a pending checkpoint request.
    pub(crate) fn take_pending(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Relaxed)
    }

    pub fn expirations(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }

    /// Disarm and delete the timer. The signal handler stays installed and
    /// ignores expiries that find no runtime.
    pub(crate) fn shutdown(&self) {
        self.disarm();
        if let Some(timer) = self.timer.take() {
            // SAFETY: created by timer_create; taken out of the cell so it is
            // deleted once.
            unsafe {
                libc::timer_delete(timer);
            }
        }
    }
}

impl Drop for PreemptionTimer {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            // SAFETY: see `shutdown`.
            unsafe {
                libc::timer_delete(timer);
            }
        }
    }
}

fn errno() -> i32 {
    // SAFETY: errno is thread-local and always readable.
    unsafe { *libc::__errno_location() }
}

extern "C" fn on_timer_signal(_signal: libc::c_int) {
    let saved = errno();
    crate::runtime::on_timer_expired();
    // SAFETY: restores this thread's errno for the interrupted code.
    unsafe {
        *libc::__errno_location() = saved;
    }
}

/// Give up the CPU if the timer has expired since the last check.
///
/// Only has an effect in [`PreemptionMode::Checkpoint`]; long-running
/// threads call it, directly or through [`preemption_point!`], to be
/// time-sliced without being interrupted at arbitrary instructions.
pub fn preemption_checkpoint() {
    crate::runtime::preemption_point();
}

/// Cooperative preemption points - insert these in long-running code
#[macro_export]
macro_rules! preemption_point {
    () => {
        $crate::platform_timer::preemption_checkpoint();
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_timer_is_inert() {
        let timer = PreemptionTimer::new(
            PreemptionMode::Disabled,
            ClockBasis::ThreadCpu,
            Duration::from_millis(1),
        );
        timer.install().unwrap();
        timer.suspend();
        timer.arm();
        assert!(!timer.is_armed());
        timer.unblock();
        timer.shutdown();
    }

    #[test]
    fn test_arm_and_disarm_thread_timer() {
        let timer = PreemptionTimer::new(
            PreemptionMode::Signal,
            ClockBasis::ThreadCpu,
            Duration::from_secs(5),
        );
        timer.install().unwrap();
        timer.arm();
        assert!(timer.is_armed());
        timer.suspend();
        assert!(!timer.is_armed());
        timer.unblock();
        timer.shutdown();
        // deleted timers are not touched again
        timer.arm();
        assert!(!timer.is_armed());
    }

    #[test]
    fn test_checkpoint_request_is_consumed_once() {
        let timer = PreemptionTimer::new(
            PreemptionMode::Checkpoint,
            ClockBasis::Wall,
            Duration::from_secs(1),
        );
        assert!(!timer.take_pending());
        timer.note_expired();
        assert_eq!(timer.expirations(), 1);
        assert!(timer.take_pending());
        assert!(!timer.take_pending());
    }

    #[test]
    fn test_suspend_ends_the_slice_and_drops_the_request() {
        let timer = PreemptionTimer::new(
            PreemptionMode::Checkpoint,
            ClockBasis::Wall,
            Duration::from_secs(1),
        );
        timer.note_expired();
        timer.suspend();
        timer.unblock();
        assert!(!timer.take_pending());
        assert_eq!(timer.expirations(), 1);
    }

    #[test]
    fn test_signal_mode_expiry_does_not_request_checkpoint() {
        let timer = PreemptionTimer::new(
            PreemptionMode::Signal,
            ClockBasis::Wall,
            Duration::from_secs(1),
        );
        timer.note_expired();
        assert!(!timer.take_pending());
    }
}
