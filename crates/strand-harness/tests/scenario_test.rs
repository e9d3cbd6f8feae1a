#![cfg(all(target_os = "linux", target_arch = "x86_64"))]

//! Integration test: scenario runs and their JSONL logs.
//!
//! Validates that:
//! 1. The spawn scenario passes and accounts for every thread.
//! 2. The lock-order scenario predicts exactly one deadlock for an inversion.
//! 3. Without an inversion nothing is predicted.
//! 4. Every emitted record passes schema validation, including forwarded
//!    core lines.
//!
//! Run: cargo test -p strand-harness --test scenario_test

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use strand_harness::structured_log::{LogEmitter, validate_log_file, validate_log_line};
use strand_harness::{LockOrderConfig, Outcome, SpawnConfig, run_lock_order, run_spawn};

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl SharedBuffer {
    fn records(&self) -> Vec<serde_json::Value> {
        let bytes = self.0.lock().clone();
        let text = String::from_utf8(bytes).expect("utf-8 log");
        text.lines()
            .enumerate()
            .map(|(i, line)| {
                validate_log_line(line, i + 1).unwrap_or_else(|errs| {
                    panic!("line {} invalid: {}", i + 1, errs[0]);
                });
                serde_json::from_str(line).expect("json")
            })
            .collect()
    }
}

fn emitter(scenario: &str) -> (LogEmitter, SharedBuffer) {
    let buffer = SharedBuffer::default();
    let emitter = LogEmitter::to_writer(Box::new(buffer.clone()), scenario, "test");
    (emitter, buffer)
}

fn events(records: &[serde_json::Value]) -> Vec<&str> {
    records
        .iter()
        .map(|r| r["event"].as_str().expect("event"))
        .collect()
}

#[test]
fn spawn_scenario_accounts_for_every_thread() {
    let (mut log, buffer) = emitter("spawn");
    let config = SpawnConfig {
        creators: 3,
        threads_per_creator: 5,
        stack_size: Some(128 * 1024),
    };
    let summary = run_spawn(&config, &mut log).expect("scenario runs");
    assert_eq!(summary.outcome, Outcome::Pass, "{:?}", summary.failures);
    assert_eq!(summary.threads, 15);

    let records = buffer.records();
    assert_eq!(
        events(&records),
        ["scenario_start", "threads_parked", "threads_joined", "scenario_end"]
    );
    assert_eq!(records[1]["thread_count"], 15);
    assert_eq!(records[3]["outcome"], "pass");
    assert_eq!(records[0]["trace_id"], "spawn::test::001");
}

#[test]
fn spawn_scenario_rejects_undersized_stack() {
    let (mut log, _) = emitter("spawn");
    let config = SpawnConfig {
        creators: 1,
        threads_per_creator: 1,
        stack_size: Some(1),
    };
    let err = run_spawn(&config, &mut log).unwrap_err();
    assert!(err.to_string().contains("invalid argument"), "{err}");
}

#[test]
fn lock_order_scenario_predicts_the_inversion_once() {
    let (mut log, buffer) = emitter("lock-order");
    let config = LockOrderConfig {
        workers: 3,
        iterations: 500,
        inversion: true,
        capture_stacks: true,
    };
    let summary = run_lock_order(&config, &mut log).expect("scenario runs");
    assert_eq!(summary.outcome, Outcome::Pass, "{:?}", summary.failures);
    assert_eq!(summary.predicted_deadlocks, 1);
    assert_eq!(summary.threads, 3);

    let records = buffer.records();
    let core: Vec<_> = records.iter().filter(|r| r["stream"] == "core").collect();
    assert!(!core.is_empty());
    assert!(core.iter().all(|r| r["details"]["tag"] == "lockorder"));
    assert!(
        core.iter()
            .any(|r| r["details"]["message"] == "Illegal lock attempt:")
    );
    let inversion = records
        .iter()
        .find(|r| r["event"] == "inversion")
        .expect("inversion record");
    assert_eq!(inversion["predicted_deadlocks"], 1);
    assert_eq!(records.last().expect("end")["outcome"], "pass");
}

#[test]
fn lock_order_scenario_without_inversion_is_quiet() {
    let (mut log, buffer) = emitter("lock-order");
    let config = LockOrderConfig {
        workers: 2,
        iterations: 200,
        inversion: false,
        capture_stacks: false,
    };
    let summary = run_lock_order(&config, &mut log).expect("scenario runs");
    assert_eq!(summary.outcome, Outcome::Pass, "{:?}", summary.failures);
    assert_eq!(summary.predicted_deadlocks, 0);

    let records = buffer.records();
    assert_eq!(
        events(&records),
        ["scenario_start", "consistent_order", "scenario_end"]
    );
    assert_eq!(records[1]["details"]["nodes"], 2);
    assert_eq!(records[1]["details"]["edges"], 1);
}

#[test]
fn file_logs_validate_end_to_end() {
    let path: PathBuf = std::env::temp_dir().join(format!(
        "strand-harness-{}-spawn.jsonl",
        std::process::id()
    ));
    {
        let mut log = LogEmitter::to_file(&path, "spawn", "file").expect("create log");
        let config = SpawnConfig {
            creators: 1,
            threads_per_creator: 2,
            stack_size: None,
        };
        run_spawn(&config, &mut log).expect("scenario runs");
    }
    let (lines, errors) = validate_log_file(&path).expect("read log");
    assert_eq!(lines, 4);
    assert!(errors.is_empty(), "{}", errors[0]);
    let _ = std::fs::remove_file(&path);
}
