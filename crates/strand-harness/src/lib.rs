//! # strand-harness
//!
//! Drives `strand-core` through end-to-end scenarios and records each run as
//! structured JSONL.

#![deny(unsafe_code)]

pub mod error;
pub mod scenarios;
pub mod structured_log;

pub use error::HarnessError;
pub use scenarios::{LockOrderConfig, ScenarioSummary, SpawnConfig, run_lock_order, run_spawn};
pub use structured_log::{LogEmitter, LogEntry, LogLevel, Outcome};
