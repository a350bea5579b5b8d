//! Clocks that drive preemption.

use core::str::FromStr;
use core::time::Duration;

/// Default preemption interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(50);

/// Which clock measures a thread's time slice.
///
/// Each basis pairs a POSIX clock with the signal its expiry delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockBasis {
    /// CPU time consumed by the OS thread hosting the runtime (`SIGVTALRM`)
    #[default]
    ThreadCpu,
    /// CPU time consumed by the whole process (`SIGPROF`)
    ProcessCpu,
    /// Monotonic wall-clock time (`SIGALRM`)
    Wall,
}

impl ClockBasis {
    pub fn clock_id(self) -> libc::clockid_t {
        match self {
            ClockBasis::ThreadCpu => libc::CLOCK_THREAD_CPUTIME_ID,
            ClockBasis::ProcessCpu => libc::CLOCK_PROCESS_CPUTIME_ID,
            ClockBasis::Wall => libc::CLOCK_MONOTONIC,
        }
    }

    pub fn signal(self) -> libc::c_int {
        match self {
            ClockBasis::ThreadCpu => libc::SIGVTALRM,
            ClockBasis::ProcessCpu => libc::SIGPROF,
            ClockBasis::Wall => libc::SIGALRM,
        }
    }

    /// Current reading of this clock. Async-signal-safe.
    pub fn now(self) -> Duration {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: `ts` is a valid out-pointer; the clock ids are always
        // supported on Linux, and on failure `ts` stays zeroed.
        unsafe {
            libc::clock_gettime(self.clock_id(), &mut ts);
        }
        Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ClockBasis::ThreadCpu => "thread",
            ClockBasis::ProcessCpu => "process",
            ClockBasis::Wall => "wall",
        }
    }
}

impl FromStr for ClockBasis {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "thread" | "virtual" => Ok(ClockBasis::ThreadCpu),
            "process" | "prof" => Ok(ClockBasis::ProcessCpu),
            "wall" | "real" => Ok(ClockBasis::Wall),
            _ => Err(()),
        }
    }
}

/// `Duration` as a `timespec`; zero disarms a timer.
pub(crate) fn to_timespec(duration: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: duration.as_secs() as libc::time_t,
        tv_nsec: duration.subsec_nanos() as libc::c_long,
    }
}
