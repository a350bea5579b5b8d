//! Timer-driven preemption. Workloads only touch atomics while they can be
//! preempted.

mod common;

use simple_threads::{ClockBasis, PreemptionMode, Runtime, SchedulerConfig};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const SLICE: Duration = Duration::from_millis(5);
const BUDGET: Duration = Duration::from_secs(5);

fn preemptive_runtime(mode: PreemptionMode) -> Runtime {
    let rt = Runtime::new(
        SchedulerConfig::default()
            .with_preemption(mode)
            .with_clock(ClockBasis::ThreadCpu)
            .with_interval(SLICE),
    );
    rt.initialize().expect("fresh OS thread has no runtime");
    rt
}

#[test]
fn signal_preemption_interleaves_spinning_threads() {
    let rt = preemptive_runtime(PreemptionMode::Signal);
    let counter = Arc::new(AtomicU64::new(0));

    let spinner = Arc::clone(&counter);
    rt.spawn(move || loop {
        spinner.fetch_add(1, Ordering::Relaxed);
        core::hint::spin_loop();
    });

    // the root never yields; only the timer can let the spinner run
    assert_eventually_cpu!(counter.load(Ordering::Relaxed) > 0, BUDGET);

    let stats = rt.stats();
    assert!(stats.preemptions >= 2, "{:?}", stats);
    assert!(stats.timer_expirations >= stats.preemptions, "{:?}", stats);
}

#[test]
fn signal_preemption_reaches_every_spinner() {
    let rt = preemptive_runtime(PreemptionMode::Signal);
    let counters: Arc<[AtomicU64; 3]> = Arc::new(Default::default());

    for slot in 0..3 {
        let counters = Arc::clone(&counters);
        rt.spawn(move || loop {
            counters[slot].fetch_add(1, Ordering::Relaxed);
            core::hint::spin_loop();
        });
    }

    assert_eventually_cpu!(
        counters.iter().all(|c| c.load(Ordering::Relaxed) > 0),
        BUDGET
    );
}

#[test]
fn checkpoint_preemption_switches_at_preemption_points() {
    let rt = preemptive_runtime(PreemptionMode::Checkpoint);
    let counter = Arc::new(AtomicU64::new(0));

    let spinner = Arc::clone(&counter);
    rt.spawn(move || loop {
        spinner.fetch_add(1, Ordering::Relaxed);
        simple_threads::preemption_point!();
    });

    let progressed = || {
        simple_threads::preemption_point();
        counter.load(Ordering::Relaxed) > 0
    };
    assert_eventually_cpu!(progressed(), BUDGET);
    assert!(rt.stats().preemptions >= 2);
}

#[test]
fn checkpoint_mode_never_interrupts_between_points() {
    let rt = preemptive_runtime(PreemptionMode::Checkpoint);
    let ran = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&ran);
    rt.spawn(move || flag.store(true, Ordering::Relaxed));

    // burn several slices without a preemption point
    let start = ClockBasis::ThreadCpu.now();
    while ClockBasis::ThreadCpu.now() - start < SLICE * 4 {
        core::hint::spin_loop();
    }
    assert!(!ran.load(Ordering::Relaxed));
    assert!(rt.stats().timer_expirations >= 1);

    rt.join();
    assert!(ran.load(Ordering::Relaxed));
}

#[test]
fn checkpoint_request_does_not_carry_over_to_the_next_thread() {
    let rt = preemptive_runtime(PreemptionMode::Checkpoint);
    let counter = Arc::new(AtomicU64::new(0));

    let spinner = Arc::clone(&counter);
    rt.spawn(move || loop {
        spinner.fetch_add(1, Ordering::Relaxed);
        simple_threads::preemption_point!();
    });

    // let the root's slice expire without taking the request
    let start = ClockBasis::ThreadCpu.now();
    while ClockBasis::ThreadCpu.now() - start < SLICE * 3 {
        core::hint::spin_loop();
    }
    assert!(rt.stats().timer_expirations >= 1);

    // the spinner gets a fresh slice and only comes back when it expires
    rt.yield_now();
    let first_slice = counter.load(Ordering::Relaxed);
    assert!(first_slice > 1, "spinner ran {} iterations", first_slice);
    assert_eq!(rt.stats().preemptions, 1);
}

#[test]
fn lone_thread_keeps_running_when_timer_expires() {
    let rt = preemptive_runtime(PreemptionMode::Signal);

    let start = ClockBasis::ThreadCpu.now();
    while ClockBasis::ThreadCpu.now() - start < SLICE * 6 {
        core::hint::spin_loop();
    }

    let stats = rt.stats();
    assert!(stats.timer_expirations >= 2, "{:?}", stats);
    assert_eq!(stats.preemptions, 0);
    assert_eq!(stats.switches, 0);
}

#[test]
fn preempted_workers_can_still_be_joined() {
    let rt = preemptive_runtime(PreemptionMode::Signal);
    let done = Arc::new(AtomicU64::new(0));

    for _ in 0..3 {
        let done = Arc::clone(&done);
        rt.spawn(move || {
            let start = ClockBasis::ThreadCpu.now();
            while ClockBasis::ThreadCpu.now() - start < SLICE * 3 {
                core::hint::spin_loop();
            }
            done.fetch_add(1, Ordering::Relaxed);
        });
    }

    for _ in 0..3 {
        rt.join();
    }
    assert_eq!(done.load(Ordering::Relaxed), 3);
    assert_eq!(rt.stats().total, 1);
}
