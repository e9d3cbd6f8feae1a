//! Lock-order observer: predicts deadlocks from the order in which each
//! thread nests guarded mutexes.
//!
//! Off unless `STRAND_PTHREAD_DEBUG` (or [`crate::config::set_lock_debug_level`])
//! enables it. When on, [`on_lock`] runs after every guarded acquisition and
//! [`on_unlock`] before every release. A predicted deadlock is only logged;
//! the acquisition it was predicted for always goes ahead.
//!
//! All graph state sits behind one futex mutex and lives in anonymous
//! mappings, so the observer is usable from runtime threads.
//!
//! A thread's held locks are forgotten when it exits: runtime threads do it in
//! their exit path, host threads through a thread-local destructor armed the
//! first time the observer sees them.

mod backtrace;
mod graph;
mod report;
mod storage;

use core::sync::atomic::{AtomicBool, Ordering};

pub use backtrace::{CallStack, MAX_FRAMES};
pub use graph::{LockOutcome, ObserverStats};
pub use storage::{MapFailed, MmapVec};

use crate::config::{self, LockDebugLevel};
use crate::pthread::futex::{FutexMutex, RawFutexMutex};
use crate::syscall;
use graph::LockGraph;
use parking_lot::lock_api::RawMutex as _;

static GRAPH: FutexMutex<LockGraph> = FutexMutex::const_new(RawFutexMutex::INIT, LockGraph::new());
static BANNER_LOGGED: AtomicBool = AtomicBool::new(false);

struct ForgetOnExit;

impl Drop for ForgetOnExit {
    fn drop(&mut self) {
        forget_current_thread();
    }
}

std::thread_local! {
    static FORGET_ON_EXIT: ForgetOnExit = const { ForgetOnExit };
}

/// One-time setup on the creating side once observation is enabled: logs the
/// enablement banner and warms up stack capture.
pub(crate) fn prepare() {
    let level = config::lock_debug_level();
    if !level.enabled() || BANNER_LOGGED.swap(true, Ordering::AcqRel) {
        return;
    }
    log_info!(
        "lockorder",
        "pthread deadlock detection level {} enabled for pid {}",
        level as u8,
        syscall::sys_getpid()
    );
    if level.captures_stacks() {
        let _ = CallStack::capture();
    }
}

fn observing(tid: i32) -> Option<LockDebugLevel> {
    let level = config::lock_debug_level();
    if !level.enabled() || report::is_reporting(tid) {
        return None;
    }
    Some(level)
}

/// Record that the calling thread now holds `mutex`.
///
/// Returns `None` when observation is off for this call.
pub fn on_lock(mutex: usize) -> Option<LockOutcome> {
    let tid = syscall::sys_gettid();
    let level = observing(tid)?;
    prepare();
    // Capture before taking the graph lock.
    let stack = level.captures_stacks().then(CallStack::capture);
    let mut graph = GRAPH.lock();
    let first_sighting = !graph.knows_thread(tid);
    let outcome = graph.on_lock(mutex, tid, stack, level.captures_stacks());
    drop(graph);
    // Runtime threads have no host TLS to hang a destructor on.
    if first_sighting && !crate::pthread::on_runtime_thread() {
        let _ = FORGET_ON_EXIT.try_with(|_| {});
    }
    Some(outcome)
}

/// Record that the calling thread is about to release `mutex`.
pub fn on_unlock(mutex: usize) {
    let tid = syscall::sys_gettid();
    if observing(tid).is_none() {
        return;
    }
    GRAPH.lock().on_unlock(mutex, tid);
}

/// Forget whatever the calling thread still holds. Runs on thread exit.
pub(crate) fn forget_current_thread() {
    if !config::lock_debug_level().enabled() {
        return;
    }
    GRAPH.lock().forget_thread(syscall::sys_gettid());
}

/// Number of locks the observer believes `tid` holds.
#[must_use]
pub fn held_count(tid: i32) -> usize {
    GRAPH.lock().held_by(tid).count()
}

/// Whether acquiring `child` while holding `parent` is a recorded order.
#[must_use]
pub fn has_edge(parent: usize, child: usize) -> bool {
    GRAPH.lock().has_edge(parent, child)
}

/// Predicted deadlocks so far.
#[must_use]
pub fn predicted_deadlocks() -> u64 {
    GRAPH.lock().stats().predicted_deadlocks
}

#[must_use]
pub fn stats() -> ObserverStats {
    GRAPH.lock().stats()
}

/// Drop every node, edge and held stack.
pub fn reset_for_tests() {
    let old = core::mem::replace(&mut *GRAPH.lock(), LockGraph::new());
    drop(old);
}
