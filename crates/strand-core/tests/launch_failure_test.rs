#![cfg(all(target_os = "linux", target_arch = "x86_64"))]
#![allow(unsafe_code)]

//! Launches whose post-clone scheduling step fails.
//!
//! The affinity mask names only CPU 1000, which no test machine has online,
//! so `sched_setaffinity` on the new task fails with `EINVAL` after the clone
//! already succeeded.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use strand_core::config::{self, SchedFailurePolicy};
use strand_core::pthread::{CpuSet, REGISTRY, ThreadAttr, create_thread, join_thread};

static TEST_GUARD_HELD: AtomicBool = AtomicBool::new(false);
static BODY_RUNS: AtomicUsize = AtomicUsize::new(0);

struct TestGuard;

impl Drop for TestGuard {
    fn drop(&mut self) {
        config::set_sched_failure_policy(SchedFailurePolicy::Warn);
        TEST_GUARD_HELD.store(false, Ordering::Release);
    }
}

fn acquire_test_guard(policy: SchedFailurePolicy) -> TestGuard {
    loop {
        if TEST_GUARD_HELD
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            BODY_RUNS.store(0, Ordering::SeqCst);
            config::set_sched_failure_policy(policy);
            return TestGuard;
        }
        std::thread::yield_now();
    }
}

fn wait_until(label: &str, timeout: Duration, mut done: impl FnMut() -> bool) {
    let start = Instant::now();
    while !done() {
        if start.elapsed() > timeout {
            panic!("timeout waiting for {label}");
        }
        std::thread::yield_now();
    }
}

fn offline_affinity() -> ThreadAttr {
    let mut cpus = CpuSet::new();
    cpus.set(1000).expect("cpu within capacity");
    let mut attr = ThreadAttr::new();
    attr.set_affinity(&cpus).expect("affinity");
    attr
}

unsafe extern "C" fn count_run(arg: usize) -> usize {
    BODY_RUNS.fetch_add(1, Ordering::SeqCst);
    arg
}

#[test]
fn fail_policy_returns_error_and_thread_reclaims_itself() {
    let _guard = acquire_test_guard(SchedFailurePolicy::Fail);
    let baseline = REGISTRY.len();
    let attr = offline_affinity();

    // SAFETY: `count_run` only touches an atomic.
    let err = unsafe { create_thread(Some(&attr), count_run, 7) }.unwrap_err();
    assert_eq!(err.errno(), libc::EINVAL);

    wait_until("degraded thread to reclaim itself", Duration::from_secs(10), || {
        REGISTRY.len() == baseline
    });
    assert_eq!(BODY_RUNS.load(Ordering::SeqCst), 0);
}

#[test]
fn warn_policy_runs_the_thread_anyway() {
    let _guard = acquire_test_guard(SchedFailurePolicy::Warn);
    let baseline = REGISTRY.len();
    let attr = offline_affinity();

    // SAFETY: `count_run` only touches an atomic.
    let handle = unsafe { create_thread(Some(&attr), count_run, 9) }.expect("create");
    assert_eq!(join_thread(handle), Ok(9));
    assert_eq!(BODY_RUNS.load(Ordering::SeqCst), 1);
    assert_eq!(REGISTRY.len(), baseline);
}

#[test]
fn repeated_failures_do_not_leak_registry_entries() {
    let _guard = acquire_test_guard(SchedFailurePolicy::Fail);
    let baseline = REGISTRY.len();
    let attr = offline_affinity();

    for i in 0..16 {
        // SAFETY: `count_run` only touches an atomic.
        let result = unsafe { create_thread(Some(&attr), count_run, i) };
        assert!(result.is_err(), "launch {i} succeeded");
    }
    wait_until("every degraded thread to exit", Duration::from_secs(10), || {
        REGISTRY.len() == baseline
    });
    assert_eq!(BODY_RUNS.load(Ordering::SeqCst), 0);
}
