//! Error types for the threading system.
//!
//! Recoverable failures (`InitError`, `SpawnError`, `ConfigError`) are
//! returned to the caller. Everything else means the scheduler's state
//! machine can no longer be trusted; those are described by [`FatalError`]
//! and end the process through [`fatal`].

#![allow(clippy::uninlined_format_args)]

use crate::thread::ThreadId;
use core::fmt::{self, Write};

/// Errors returned by `Runtime::initialize`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitError {
    /// This runtime, or another one on the same OS thread, is already active
    AlreadyInitialized,
    /// The configuration failed validation
    InvalidConfig(ConfigError),
}

/// Errors that can occur during thread spawning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnError {
    /// Runtime has not been initialized
    NotInitialized,
    /// Out of memory for the stack or the control block
    OutOfMemory,
    /// Requested stack size is below the minimum
    InvalidStackSize(usize),
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment override could not be parsed
    InvalidValue {
        /// Variable name
        key: &'static str,
        /// Raw value found
        value: String,
    },
    /// Stack size below `MIN_STACK_SIZE`
    StackTooSmall(usize),
    /// Preemption enabled with a zero interval
    ZeroInterval,
}

/// Timer and signal installation errors. The payload is the OS `errno`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerError {
    /// `sigaction` failed
    SignalInstall(i32),
    /// `pthread_sigmask` failed
    SignalMask(i32),
    /// `timer_create` failed
    Create(i32),
    /// `timer_settime` failed while arming or disarming
    SetTime(i32),
}

/// Conditions that terminate the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalError {
    /// An operation was invoked in a state that its contract forbids
    UsageViolation {
        /// Operation name
        op: &'static str,
        /// Violated requirement
        detail: &'static str,
    },
    /// Stack or control block allocation failed
    ResourceExhausted(&'static str),
    /// No ready thread exists to switch to
    Deadlock {
        /// Thread that gave up control
        current: ThreadId,
        /// Threads blocked in join
        waiting: usize,
        /// Terminated threads not yet joined
        terminated: usize,
    },
    /// Timer subsystem failure
    Timer(TimerError),
    /// Saved execution state is missing or inconsistent
    ContextSwitch(&'static str),
    /// A thread's stack canary was overwritten
    StackOverflow(ThreadId),
    /// A panic escaped a thread's entry closure
    ThreadPanicked(ThreadId),
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitError::AlreadyInitialized => {
                write!(f, "Runtime already initialized on this thread")
            }
            InitError::InvalidConfig(e) => write!(f, "Invalid configuration: {}", e),
        }
    }
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnError::NotInitialized => write!(f, "Runtime not initialized"),
            SpawnError::OutOfMemory => write!(f, "Out of memory for thread creation"),
            SpawnError::InvalidStackSize(size) => write!(f, "Invalid stack size: {}", size),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidValue { key, value } => {
                write!(f, "Invalid value for {}: {:?}", key, value)
            }
            ConfigError::StackTooSmall(size) => write!(f, "Stack size too small: {} bytes", size),
            ConfigError::ZeroInterval => write!(f, "Preemption interval must be non-zero"),
        }
    }
}

impl fmt::Display for TimerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerError::SignalInstall(errno) => write!(f, "sigaction failed (errno {})", errno),
            TimerError::SignalMask(errno) => write!(f, "pthread_sigmask failed (errno {})", errno),
            TimerError::Create(errno) => write!(f, "timer_create failed (errno {})", errno),
            TimerError::SetTime(errno) => write!(f, "timer_settime failed (errno {})", errno),
        }
    }
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalError::UsageViolation { op, detail } => {
                write!(f, "usage violation in {}: {}", op, detail)
            }
            FatalError::ResourceExhausted(what) => write!(f, "resource exhausted: {}", what),
            FatalError::Deadlock { current, waiting, terminated } => write!(
                f,
                "scheduling deadlock: no ready threads (current {}, {} waiting, {} terminated)",
                current, waiting, terminated
            ),
            FatalError::Timer(e) => write!(f, "timer failure: {}", e),
            FatalError::ContextSwitch(detail) => write!(f, "context switch failed: {}", detail),
            FatalError::StackOverflow(id) => write!(f, "stack overflow detected in thread {}", id),
            FatalError::ThreadPanicked(id) => write!(f, "thread {} panicked", id),
        }
    }
}

impl std::error::Error for InitError {}
impl std::error::Error for SpawnError {}
impl std::error::Error for ConfigError {}
impl std::error::Error for TimerError {}

impl From<ConfigError> for InitError {
    fn from(error: ConfigError) -> Self {
        InitError::InvalidConfig(error)
    }
}

impl From<TimerError> for FatalError {
    fn from(error: TimerError) -> Self {
        FatalError::Timer(error)
    }
}

impl From<SpawnError> for FatalError {
    fn from(error: SpawnError) -> Self {
        match error {
            SpawnError::NotInitialized => FatalError::UsageViolation {
                op: "spawn",
                detail: "runtime not initialized",
            },
            SpawnError::OutOfMemory => FatalError::ResourceExhausted("thread stack"),
            SpawnError::InvalidStackSize(_) => FatalError::UsageViolation {
                op: "spawn",
                detail: "stack size below minimum",
            },
        }
    }
}

/// Fixed-capacity formatter; output past the end is dropped.
struct StackBuf {
    buf: [u8; 256],
    len: usize,
}

impl Write for StackBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.buf.len() - self.len;
        let n = s.len().min(room);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

fn render(error: &FatalError) -> StackBuf {
    let mut out = StackBuf { buf: [0; 256], len: 0 };
    let _ = write!(out, "simple-threads: fatal: {}", error);
    // keep room for the newline
    if out.len == out.buf.len() {
        out.len -= 1;
    }
    out.buf[out.len] = b'\n';
    out.len += 1;
    out
}

/// Report `error` on stderr and abort.
///
/// Async-signal-safe: formats into a stack buffer and uses `write(2)`, so it
/// may be reached from the timer signal handler.
#[cold]
pub(crate) fn fatal(error: FatalError) -> ! {
    let out = render(&error);
    let mut written = 0;
    while written < out.len {
        // SAFETY: the pointer and length describe initialized bytes of `out.buf`.
        let n = unsafe {
            libc::write(
                libc::STDERR_FILENO,
                out.buf[written..].as_ptr().cast(),
                out.len - written,
            )
        };
        if n <= 0 {
            break;
        }
        written += n as usize;
    }
    std::process::abort()
}
