//! End-to-end scenarios over the thread runtime.
//!
//! Each scenario logs a `scenario_start` record, one record per phase and a
//! closing `scenario_end` carrying the overall [`Outcome`]. Runs are
//! serialized because they share process-wide state (the registry, the
//! observer graph and the log sink).

use std::collections::HashSet;
use std::time::Instant;

use parking_lot::Mutex;
use parking_lot::lock_api::RawMutex as _;
use serde::Serialize;
use strand_core::ThreadError;
use strand_core::config::{self, LockDebugLevel, LogPriority};
use strand_core::lockorder;
use strand_core::pthread::{
    FutexMutex, GuardedMutex, MutexKind, REGISTRY, RawFutexMutex, ThreadAttr, ThreadHandle,
    create_thread, join_thread,
};

use crate::error::HarnessError;
use crate::structured_log::{CoreLine, LogEmitter, LogLevel, Outcome, StreamKind};

static SCENARIO_LOCK: Mutex<()> = parking_lot::const_mutex(());

/// Result of one scenario run.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioSummary {
    pub scenario: String,
    pub outcome: Outcome,
    pub threads: usize,
    pub predicted_deadlocks: u64,
    pub failures: Vec<String>,
}

impl ScenarioSummary {
    fn new(scenario: &str) -> Self {
        Self {
            scenario: scenario.to_string(),
            outcome: Outcome::Pass,
            threads: 0,
            predicted_deadlocks: 0,
            failures: Vec::new(),
        }
    }

    fn fail(&mut self, reason: String) {
        self.outcome = Outcome::Fail;
        self.failures.push(reason);
    }

    /// Turn a failed summary into an error.
    pub fn into_result(self) -> Result<Self, HarnessError> {
        if self.outcome == Outcome::Pass {
            Ok(self)
        } else {
            Err(HarnessError::ScenarioFailed {
                scenario: self.scenario,
                reason: self.failures.join("; "),
            })
        }
    }
}

fn finish(
    emitter: &mut LogEmitter,
    summary: &ScenarioSummary,
    started: Instant,
) -> Result<(), HarnessError> {
    let level = if summary.outcome == Outcome::Pass {
        LogLevel::Info
    } else {
        LogLevel::Error
    };
    let entry = emitter
        .entry(level, "scenario_end")
        .with_stream(StreamKind::Scenario)
        .with_outcome(summary.outcome)
        .with_thread_count(summary.threads)
        .with_predicted_deadlocks(summary.predicted_deadlocks)
        .with_duration_ms(started.elapsed().as_millis() as u64)
        .with_details(serde_json::json!({ "failures": summary.failures }));
    emitter.emit_entry(entry)?;
    emitter.flush()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// spawn
// ---------------------------------------------------------------------------

/// Parameters for [`run_spawn`].
#[derive(Debug, Clone, Copy)]
pub struct SpawnConfig {
    /// Host threads creating runtime threads at the same time.
    pub creators: usize,
    pub threads_per_creator: usize,
    /// Explicit stack size; `None` uses the runtime default.
    pub stack_size: Option<usize>,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            creators: 4,
            threads_per_creator: 8,
            stack_size: None,
        }
    }
}

static SPAWN_GATE: FutexMutex<()> = FutexMutex::const_new(RawFutexMutex::INIT, ());

extern "C" fn park_at_spawn_gate(arg: usize) -> usize {
    drop(SPAWN_GATE.lock());
    arg
}

#[allow(unsafe_code)]
fn spawn_parked(attr: &ThreadAttr, arg: usize) -> Result<ThreadHandle, ThreadError> {
    // SAFETY: `park_at_spawn_gate` only takes a futex lock.
    unsafe { create_thread(Some(attr), park_at_spawn_gate, arg) }
}

struct Created {
    handle: ThreadHandle,
    arg: usize,
    latency_ns: u64,
}

/// Create threads from several host threads at once, hold them parked, then
/// check registry accounting before and after joining.
pub fn run_spawn(
    config: &SpawnConfig,
    emitter: &mut LogEmitter,
) -> Result<ScenarioSummary, HarnessError> {
    let _serial = SCENARIO_LOCK.lock();
    let started = Instant::now();
    let mut summary = ScenarioSummary::new("spawn");
    let expected = config.creators * config.threads_per_creator;

    let mut attr = ThreadAttr::new();
    if let Some(size) = config.stack_size {
        attr.set_stack_size(size)?;
    }

    let start = emitter
        .entry(LogLevel::Info, "scenario_start")
        .with_stream(StreamKind::Scenario)
        .with_thread_count(expected)
        .with_details(serde_json::json!({
            "creators": config.creators,
            "threads_per_creator": config.threads_per_creator,
            "stack_size": config.stack_size,
        }));
    emitter.emit_entry(start)?;

    let gate = SPAWN_GATE.lock();
    let per_creator = config.threads_per_creator;
    let creators: Vec<_> = (0..config.creators)
        .map(move |c| {
            std::thread::spawn(move || {
                (0..per_creator)
                    .map(|i| {
                        let arg = c * per_creator + i + 1;
                        let t = Instant::now();
                        spawn_parked(&attr, arg).map(|handle| Created {
                            handle,
                            arg,
                            latency_ns: t.elapsed().as_nanos() as u64,
                        })
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut created = Vec::with_capacity(expected);
    for creator in creators {
        let Ok(results) = creator.join() else {
            summary.fail("creator thread panicked".to_string());
            continue;
        };
        for result in results {
            match result {
                Ok(c) => created.push(c),
                Err(e) => {
                    let entry = emitter
                        .entry(LogLevel::Error, "create_failed")
                        .with_stream(StreamKind::Scenario)
                        .with_errno(e.errno())
                        .with_outcome(Outcome::Fail);
                    emitter.emit_entry(entry)?;
                    summary.fail(format!("create_thread: {e}"));
                }
            }
        }
    }

    let distinct: HashSet<usize> = created.iter().map(|c| c.handle.as_raw()).collect();
    if distinct.len() != created.len() {
        summary.fail("duplicate thread handles".to_string());
    }
    let unregistered = created
        .iter()
        .filter(|c| !REGISTRY.contains(c.handle.as_raw()))
        .count();
    if unregistered != 0 {
        summary.fail(format!("{unregistered} live thread(s) missing from registry"));
    }
    let mut latencies: Vec<u64> = created.iter().map(|c| c.latency_ns).collect();
    latencies.sort_unstable();
    let p50 = latencies.get(latencies.len() / 2).copied().unwrap_or(0);
    let max = latencies.last().copied().unwrap_or(0);
    let phase = emitter
        .entry(LogLevel::Info, "threads_parked")
        .with_stream(StreamKind::Perf)
        .with_thread_count(created.len())
        .with_latency_ns(p50)
        .with_details(serde_json::json!({
            "registry_len": REGISTRY.len(),
            "create_latency_max_ns": max,
        }));
    emitter.emit_entry(phase)?;

    drop(gate);
    for c in &created {
        match join_thread(c.handle) {
            Ok(value) if value == c.arg => {}
            Ok(value) => summary.fail(format!("thread {} returned {value}", c.arg)),
            Err(e) => summary.fail(format!("join thread {}: {e}", c.arg)),
        }
    }
    let lingering = created
        .iter()
        .filter(|c| REGISTRY.contains(c.handle.as_raw()))
        .count();
    if lingering != 0 {
        summary.fail(format!("{lingering} joined thread(s) still registered"));
    }
    summary.threads = created.len();
    let joined = emitter
        .entry(LogLevel::Info, "threads_joined")
        .with_stream(StreamKind::Scenario)
        .with_thread_count(created.len())
        .with_details(serde_json::json!({ "registry_len": REGISTRY.len() }));
    emitter.emit_entry(joined)?;

    finish(emitter, &summary, started)?;
    Ok(summary)
}

// ---------------------------------------------------------------------------
// lock-order
// ---------------------------------------------------------------------------

/// Parameters for [`run_lock_order`].
#[derive(Debug, Clone, Copy)]
pub struct LockOrderConfig {
    /// Runtime threads taking the locks in the established order.
    pub workers: usize,
    pub iterations: usize,
    /// Take the locks in the opposite order once afterwards.
    pub inversion: bool,
    pub capture_stacks: bool,
}

impl Default for LockOrderConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            iterations: 1_000,
            inversion: true,
            capture_stacks: false,
        }
    }
}

static LOCK_A: GuardedMutex = GuardedMutex::new(MutexKind::Normal);
static LOCK_B: GuardedMutex = GuardedMutex::new(MutexKind::Normal);
static CAPTURED: Mutex<Vec<String>> = parking_lot::const_mutex(Vec::new());

fn capture_core_line(_: LogPriority, line: &str) {
    CAPTURED.lock().push(line.to_owned());
}

extern "C" fn lock_in_order(iterations: usize) -> usize {
    let mut failures = 0;
    for _ in 0..iterations {
        if LOCK_A.lock().is_err() {
            failures += 1;
            continue;
        }
        if LOCK_B.lock().is_ok() {
            let _ = LOCK_B.unlock();
        } else {
            failures += 1;
        }
        let _ = LOCK_A.unlock();
    }
    failures
}

#[allow(unsafe_code)]
fn spawn_lock_worker(iterations: usize) -> Result<ThreadHandle, ThreadError> {
    // SAFETY: `lock_in_order` only uses guarded mutexes.
    unsafe { create_thread(None, lock_in_order, iterations) }
}

fn lock_inverted() -> Result<(), HarnessError> {
    LOCK_B.lock()?;
    let inner = LOCK_A.lock();
    if inner.is_ok() {
        LOCK_A.unlock()?;
    }
    LOCK_B.unlock()?;
    inner.map_err(HarnessError::from)
}

struct ObserverSession;

impl ObserverSession {
    fn start(level: LockDebugLevel) -> Self {
        lockorder::reset_for_tests();
        config::set_lock_debug_level(level);
        Self
    }
}

impl Drop for ObserverSession {
    fn drop(&mut self) {
        strand_core::set_log_sink(None);
        config::set_lock_debug_level(LockDebugLevel::Disabled);
    }
}

/// Hammer two locks in one order from runtime threads, then optionally take
/// them in the other order and check the observer predicts exactly one
/// deadlock.
pub fn run_lock_order(
    config: &LockOrderConfig,
    emitter: &mut LogEmitter,
) -> Result<ScenarioSummary, HarnessError> {
    let _serial = SCENARIO_LOCK.lock();
    let started = Instant::now();
    let mut summary = ScenarioSummary::new("lock-order");
    let level = if config.capture_stacks {
        LockDebugLevel::CaptureCallStacks
    } else {
        LockDebugLevel::Enabled
    };

    let start = emitter
        .entry(LogLevel::Info, "scenario_start")
        .with_stream(StreamKind::Scenario)
        .with_thread_count(config.workers)
        .with_details(serde_json::json!({
            "iterations": config.iterations,
            "inversion": config.inversion,
            "level": format!("{level:?}"),
        }));
    emitter.emit_entry(start)?;

    let session = ObserverSession::start(level);
    let a = LOCK_A.id();
    let b = LOCK_B.id();

    let t = Instant::now();
    let mut handles = Vec::with_capacity(config.workers);
    for _ in 0..config.workers {
        match spawn_lock_worker(config.iterations) {
            Ok(h) => handles.push(h),
            Err(e) => summary.fail(format!("create_thread: {e}")),
        }
    }
    for h in handles {
        match join_thread(h) {
            Ok(0) => summary.threads += 1,
            Ok(n) => summary.fail(format!("worker saw {n} lock failure(s)")),
            Err(e) => summary.fail(format!("join: {e}")),
        }
    }
    let stats = lockorder::stats();
    if stats.predicted_deadlocks != 0 {
        summary.fail(format!(
            "{} false positive(s) under a consistent order",
            stats.predicted_deadlocks
        ));
    }
    if summary.threads > 0 && !lockorder::has_edge(a, b) {
        summary.fail("established order was not recorded".to_string());
    }
    let phase = emitter
        .entry(LogLevel::Info, "consistent_order")
        .with_stream(StreamKind::Scenario)
        .with_thread_count(summary.threads)
        .with_predicted_deadlocks(stats.predicted_deadlocks)
        .with_duration_ms(t.elapsed().as_millis() as u64)
        .with_details(serde_json::json!({
            "nodes": stats.nodes,
            "edges": stats.edges,
            "threads_seen": stats.threads,
        }));
    emitter.emit_entry(phase)?;

    if config.inversion {
        CAPTURED.lock().clear();
        strand_core::set_log_sink(Some(capture_core_line));
        let inverted = lock_inverted();
        strand_core::set_log_sink(None);
        if let Err(e) = inverted {
            summary.fail(format!("inverted locking failed: {e}"));
        }

        let lines = std::mem::take(&mut *CAPTURED.lock());
        for line in &lines {
            if let Some(core) = CoreLine::parse(line) {
                emitter.emit_entry(core.into_entry())?;
            }
        }
        let predicted = lockorder::predicted_deadlocks();
        if predicted != 1 {
            summary.fail(format!("expected one predicted deadlock, saw {predicted}"));
        }
        if !lines.iter().any(|l| l.contains("Illegal lock attempt:")) {
            summary.fail("no report was logged for the inversion".to_string());
        }
        if lockorder::has_edge(b, a) {
            summary.fail("cycle-closing edge was kept".to_string());
        }
        let phase = emitter
            .entry(LogLevel::Warn, "inversion")
            .with_stream(StreamKind::Scenario)
            .with_predicted_deadlocks(predicted)
            .with_details(serde_json::json!({ "report_lines": lines.len() }));
        emitter.emit_entry(phase)?;
    }

    summary.predicted_deadlocks = lockorder::predicted_deadlocks();
    drop(session);
    finish(emitter, &summary, started)?;
    Ok(summary)
}
