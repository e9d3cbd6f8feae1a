//! # strand-core
//!
//! A thread runtime built directly on `clone(2)`: runtime-allocated thread
//! regions, a process-wide thread registry, a launcher with a startup
//! handshake, and an opt-in lock-order observer that predicts deadlocks.
//!
//! `unsafe` is denied at the crate level; the modules that talk to the kernel
//! opt in item by item.

#![deny(unsafe_code)]

pub mod config;
pub mod error;
#[macro_use]
pub mod log;
#[allow(unsafe_code)]
#[cfg(target_arch = "x86_64")]
pub mod syscall;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod lockorder;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod pthread;

pub use config::{LockDebugLevel, LogPriority, SchedFailurePolicy};
pub use error::ThreadError;
pub use log::{LogSink, set_log_sink};
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use pthread::{
    GuardedMutex, MutexKind, ThreadAttr, ThreadHandle, create_thread, detach_thread, join_thread,
};
