//! Runtime configuration read from the environment.
//!
//! - `STRAND_PTHREAD_DEBUG`: lock-order prediction level. `0` (default)
//!   disables it, `1` enables edge tracking, `2` or more also captures call
//!   stacks for every acquisition and edge.
//! - `STRAND_SCHED_FAILURE`: `warn` or `fail`. Decides whether a scheduling
//!   failure after the kernel task exists is fatal to `create_thread`.
//! - `STRAND_LOG`: minimum diagnostic priority (`debug|info|warn|error`).
//!
//! Each value is resolved at most once per process and cached in an atomic.
//! The launcher resolves everything on the creating side, so runtime threads
//! only ever hit the cached fast path and never call into the environment.

use std::sync::atomic::{AtomicU8, Ordering};

/// How much work the lock-order observer does.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockDebugLevel {
    #[default]
    Disabled,
    /// Track ownership and the lock graph; report cycles without stacks.
    Enabled,
    /// As `Enabled`, plus a call stack per acquisition and per edge.
    CaptureCallStacks,
}

impl LockDebugLevel {
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().parse::<i64>() {
            Ok(n) if n <= 0 => Self::Disabled,
            Ok(1) => Self::Enabled,
            Ok(_) => Self::CaptureCallStacks,
            Err(_) => Self::Disabled,
        }
    }

    #[must_use]
    pub const fn enabled(self) -> bool {
        !matches!(self, Self::Disabled)
    }

    #[must_use]
    pub const fn captures_stacks(self) -> bool {
        matches!(self, Self::CaptureCallStacks)
    }

    const fn to_u8(self) -> u8 {
        match self {
            Self::Disabled => 1,
            Self::Enabled => 2,
            Self::CaptureCallStacks => 3,
        }
    }

    const fn from_u8(v: u8) -> Self {
        match v {
            2 => Self::Enabled,
            3 => Self::CaptureCallStacks,
            _ => Self::Disabled,
        }
    }
}

/// What `create_thread` does when applying the scheduling policy fails after
/// the kernel task already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedFailurePolicy {
    /// Log a warning and carry on with inherited scheduling.
    Warn,
    /// Degrade the new thread to a detached no-op and return the error.
    Fail,
}

impl Default for SchedFailurePolicy {
    fn default() -> Self {
        if cfg!(target_pointer_width = "64") {
            Self::Fail
        } else {
            Self::Warn
        }
    }
}

impl SchedFailurePolicy {
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "warn" | "ignore" | "log" => Self::Warn,
            "fail" | "error" | "strict" => Self::Fail,
            _ => Self::default(),
        }
    }

    const fn to_u8(self) -> u8 {
        match self {
            Self::Warn => 1,
            Self::Fail => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Warn,
            2 => Self::Fail,
            _ => Self::default(),
        }
    }
}

/// Severity of a diagnostic line.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogPriority {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogPriority {
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" | "trace" | "verbose" => Self::Debug,
            "warn" | "warning" => Self::Warn,
            "error" | "fatal" => Self::Error,
            _ => Self::Info,
        }
    }

    /// Single-letter tag used in the diagnostic line prefix.
    #[must_use]
    pub const fn letter(self) -> char {
        match self {
            Self::Debug => 'D',
            Self::Info => 'I',
            Self::Warn => 'W',
            Self::Error => 'E',
        }
    }

    const fn to_u8(self) -> u8 {
        match self {
            Self::Debug => 1,
            Self::Info => 2,
            Self::Warn => 3,
            Self::Error => 4,
        }
    }

    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Debug,
            3 => Self::Warn,
            4 => Self::Error,
            _ => Self::Info,
        }
    }
}

// Cache states: 0 = unresolved, 255 = resolving, anything else is an encoded
// value. Non-blocking on purpose: a caller that races the resolver gets the
// default instead of waiting.
const UNRESOLVED: u8 = 0;
const RESOLVING: u8 = 255;

static LOCK_DEBUG: AtomicU8 = AtomicU8::new(UNRESOLVED);
static SCHED_FAILURE: AtomicU8 = AtomicU8::new(UNRESOLVED);
static LOG_PRIORITY: AtomicU8 = AtomicU8::new(UNRESOLVED);

fn resolve_cached(cache: &AtomicU8, var: &str, parse: impl Fn(Option<&str>) -> u8) -> u8 {
    let cached = cache.load(Ordering::Acquire);
    if cached != UNRESOLVED {
        return cached;
    }
    if cache
        .compare_exchange(UNRESOLVED, RESOLVING, Ordering::SeqCst, Ordering::Acquire)
        .is_err()
    {
        return cache.load(Ordering::Acquire);
    }
    let encoded = parse(std::env::var(var).ok().as_deref());
    cache.store(encoded, Ordering::Release);
    encoded
}

/// Lock-order prediction level (`STRAND_PTHREAD_DEBUG`).
#[must_use]
pub fn lock_debug_level() -> LockDebugLevel {
    let v = resolve_cached(&LOCK_DEBUG, "STRAND_PTHREAD_DEBUG", |raw| {
        raw.map(LockDebugLevel::from_str_loose)
            .unwrap_or_default()
            .to_u8()
    });
    LockDebugLevel::from_u8(v)
}

/// Scheduling-failure policy (`STRAND_SCHED_FAILURE`).
#[must_use]
pub fn sched_failure_policy() -> SchedFailurePolicy {
    let v = resolve_cached(&SCHED_FAILURE, "STRAND_SCHED_FAILURE", |raw| {
        raw.map(SchedFailurePolicy::from_str_loose)
            .unwrap_or_default()
            .to_u8()
    });
    SchedFailurePolicy::from_u8(v)
}

/// Minimum priority the logger emits (`STRAND_LOG`).
#[must_use]
pub fn log_priority() -> LogPriority {
    let v = resolve_cached(&LOG_PRIORITY, "STRAND_LOG", |raw| {
        raw.map(LogPriority::from_str_loose)
            .unwrap_or_default()
            .to_u8()
    });
    LogPriority::from_u8(v)
}

/// Resolve every setting now, on the calling thread.
pub fn resolve_all() {
    let _ = lock_debug_level();
    let _ = sched_failure_policy();
    let _ = log_priority();
}

/// Pin the lock-order level, bypassing the environment.
pub fn set_lock_debug_level(level: LockDebugLevel) {
    LOCK_DEBUG.store(level.to_u8(), Ordering::Release);
}

/// Pin the scheduling-failure policy, bypassing the environment.
pub fn set_sched_failure_policy(policy: SchedFailurePolicy) {
    SCHED_FAILURE.store(policy.to_u8(), Ordering::Release);
}

/// Pin the minimum log priority, bypassing the environment.
pub fn set_log_priority(priority: LogPriority) {
    LOG_PRIORITY.store(priority.to_u8(), Ordering::Release);
}
