//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

/// Set in the environment of re-executed test children.
pub const CHILD_ENV: &str = "SIMPLE_THREADS_TEST_CHILD";

/// How long a child may run before the watchdog kills it.
pub const CHILD_TIMEOUT: Duration = Duration::from_secs(20);

/// `true` when running as a child started by [`run_isolated`].
pub fn in_child() -> bool {
    std::env::var_os(CHILD_ENV).is_some()
}

#[derive(Debug)]
pub struct ChildOutcome {
    /// `None` if the watchdog had to kill the child
    pub status: Option<ExitStatus>,
    pub stderr: String,
}

impl ChildOutcome {
    /// Assert the child ended on its own, unsuccessfully, and reported `needle`.
    pub fn assert_aborted_with(&self, needle: &str) {
        let status = self
            .status
            .unwrap_or_else(|| panic!("child hung and was killed; stderr:\n{}", self.stderr));
        assert!(!status.success(), "child exited successfully; stderr:\n{}", self.stderr);
        assert!(
            self.stderr.contains(needle),
            "expected {:?} in child stderr:\n{}",
            needle,
            self.stderr
        );
    }

    pub fn assert_aborted(&self) {
        self.assert_aborted_with("");
    }
}

/// Re-run the single test `name` of the current test binary in a child
/// process, killing it after [`CHILD_TIMEOUT`].
pub fn run_isolated(name: &str) -> ChildOutcome {
    let exe = std::env::current_exe().expect("test binary path");
    let mut child = Command::new(exe)
        .args(["--exact", name, "--nocapture", "--test-threads", "1"])
        .env(CHILD_ENV, "1")
        .env("RUST_BACKTRACE", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn child test process");

    let mut pipe = child.stderr.take().expect("piped stderr");
    let reader = std::thread::spawn(move || {
        let mut out = String::new();
        let _ = pipe.read_to_string(&mut out);
        out
    });

    let deadline = Instant::now() + CHILD_TIMEOUT;
    let status = loop {
        match child.try_wait().expect("poll child") {
            Some(status) => break Some(status),
            None if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                break None;
            }
            None => std::thread::sleep(Duration::from_millis(10)),
        }
    };

    let stderr = reader.join().unwrap_or_default();
    ChildOutcome { status, stderr }
}

/// Spin until `$condition` holds, failing once the calling OS thread has
/// burned `$budget` of CPU time. Uses no allocation, so it is safe to run
/// under signal preemption.
#[macro_export]
macro_rules! assert_eventually_cpu {
    ($condition:expr, $budget:expr) => {{
        let start = simple_threads::ClockBasis::ThreadCpu.now();
        while !$condition {
            if simple_threads::ClockBasis::ThreadCpu.now() - start > $budget {
                panic!(
                    "condition {} not reached within {:?} of CPU time",
                    stringify!($condition),
                    $budget
                );
            }
            core::hint::spin_loop();
        }
    }};
}
