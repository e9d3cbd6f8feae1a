//! Thread attributes and initial-thread stack discovery.

use super::region::{PAGE_SIZE, page_round_up};
use crate::error::ThreadError;
use crate::syscall;

/// Default stack size for runtime-allocated stacks: 2 MiB.
pub const DEFAULT_STACK_SIZE: usize = 2 * 1024 * 1024;
/// Default guard size: one page.
pub const DEFAULT_GUARD_SIZE: usize = PAGE_SIZE;
/// Smallest stack a caller may ask for.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Stack size assumed for the initial thread when `RLIMIT_STACK` is infinite.
const MAIN_THREAD_FALLBACK_STACK: usize = 8 * 1024 * 1024;

pub const PTHREAD_SCOPE_SYSTEM: i32 = 0;
pub const PTHREAD_SCOPE_PROCESS: i32 = 1;

pub const PTHREAD_CREATE_JOINABLE: i32 = 0;
pub const PTHREAD_CREATE_DETACHED: i32 = 1;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetachState {
    #[default]
    Joinable,
    Detached,
}

impl DetachState {
    pub const fn from_raw(raw: i32) -> Result<Self, ThreadError> {
        match raw {
            PTHREAD_CREATE_JOINABLE => Ok(Self::Joinable),
            PTHREAD_CREATE_DETACHED => Ok(Self::Detached),
            _ => Err(ThreadError::InvalidArgument("unknown detach state")),
        }
    }

    #[must_use]
    pub const fn as_raw(self) -> i32 {
        match self {
            Self::Joinable => PTHREAD_CREATE_JOINABLE,
            Self::Detached => PTHREAD_CREATE_DETACHED,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedPolicy {
    #[default]
    Other,
    Fifo,
    RoundRobin,
    Batch,
    Idle,
}

impl SchedPolicy {
    #[must_use]
    pub const fn as_raw(self) -> i32 {
        match self {
            Self::Other => libc::SCHED_OTHER,
            Self::Fifo => libc::SCHED_FIFO,
            Self::RoundRobin => libc::SCHED_RR,
            Self::Batch => libc::SCHED_BATCH,
            Self::Idle => libc::SCHED_IDLE,
        }
    }

    /// Valid static priorities for this policy.
    #[must_use]
    pub const fn priority_range(self) -> (i32, i32) {
        match self {
            Self::Fifo | Self::RoundRobin => (1, 99),
            _ => (0, 0),
        }
    }
}

const CPU_SET_WORDS: usize = 16;

/// CPU affinity mask covering `CpuSet::CAPACITY` CPUs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CpuSet {
    words: [u64; CPU_SET_WORDS],
}

impl CpuSet {
    pub const CAPACITY: usize = CPU_SET_WORDS * 64;

    #[must_use]
    pub const fn new() -> Self {
        Self {
            words: [0; CPU_SET_WORDS],
        }
    }

    pub fn set(&mut self, cpu: usize) -> Result<(), ThreadError> {
        if cpu >= Self::CAPACITY {
            return Err(ThreadError::InvalidArgument("cpu index out of range"));
        }
        self.words[cpu / 64] |= 1 << (cpu % 64);
        Ok(())
    }

    pub fn clear(&mut self, cpu: usize) {
        if cpu < Self::CAPACITY {
            self.words[cpu / 64] &= !(1 << (cpu % 64));
        }
    }

    #[must_use]
    pub fn is_set(&self, cpu: usize) -> bool {
        cpu < Self::CAPACITY && self.words[cpu / 64] & (1 << (cpu % 64)) != 0
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    #[must_use]
    pub fn as_words(&self) -> &[u64] {
        &self.words
    }
}

/// Creation-time configuration for a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadAttr {
    pub(crate) detach_state: DetachState,
    pub(crate) sched_policy: SchedPolicy,
    pub(crate) sched_priority: i32,
    pub(crate) explicit_sched: bool,
    /// Zero unless the caller supplied a stack.
    pub(crate) stack_base: usize,
    pub(crate) stack_size: usize,
    pub(crate) guard_size: usize,
    pub(crate) affinity: Option<CpuSet>,
}

impl Default for ThreadAttr {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadAttr {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            detach_state: DetachState::Joinable,
            sched_policy: SchedPolicy::Other,
            sched_priority: 0,
            explicit_sched: false,
            stack_base: 0,
            stack_size: DEFAULT_STACK_SIZE,
            guard_size: DEFAULT_GUARD_SIZE,
            affinity: None,
        }
    }

    pub fn set_detach_state(&mut self, state: DetachState) {
        self.detach_state = state;
    }

    #[must_use]
    pub const fn detach_state(&self) -> DetachState {
        self.detach_state
    }

    /// Request an explicit policy and priority for the new thread.
    pub fn set_scheduling(&mut self, policy: SchedPolicy, priority: i32) -> Result<(), ThreadError> {
        let (lo, hi) = policy.priority_range();
        if priority < lo || priority > hi {
            return Err(ThreadError::InvalidArgument("priority outside policy range"));
        }
        self.sched_policy = policy;
        self.sched_priority = priority;
        self.explicit_sched = true;
        Ok(())
    }

    #[must_use]
    pub const fn scheduling(&self) -> (SchedPolicy, i32) {
        (self.sched_policy, self.sched_priority)
    }

    pub fn set_stack_size(&mut self, size: usize) -> Result<(), ThreadError> {
        if size < MIN_STACK_SIZE {
            return Err(ThreadError::InvalidArgument("stack size below minimum"));
        }
        self.stack_size = size;
        Ok(())
    }

    #[must_use]
    pub const fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Use caller memory `[base, base + size)` as the thread's stack.
    pub fn set_stack(&mut self, base: usize, size: usize) -> Result<(), ThreadError> {
        if size < MIN_STACK_SIZE {
            return Err(ThreadError::InvalidArgument("stack size below minimum"));
        }
        if base == 0 || base % PAGE_SIZE != 0 || size % PAGE_SIZE != 0 {
            return Err(ThreadError::InvalidArgument("stack not page aligned"));
        }
        if base.checked_add(size).is_none() {
            return Err(ThreadError::InvalidArgument("stack wraps the address space"));
        }
        self.stack_base = base;
        self.stack_size = size;
        Ok(())
    }

    /// `(base, size)`; base is zero when the runtime allocates the stack.
    #[must_use]
    pub const fn stack(&self) -> (usize, usize) {
        (self.stack_base, self.stack_size)
    }

    /// Guard size; rounded up to a page multiple when the stack is mapped.
    /// Ignored for caller-supplied stacks.
    pub fn set_guard_size(&mut self, size: usize) {
        self.guard_size = size;
    }

    #[must_use]
    pub const fn guard_size(&self) -> usize {
        self.guard_size
    }

    pub fn set_affinity(&mut self, cpus: &CpuSet) -> Result<(), ThreadError> {
        if cpus.is_empty() {
            return Err(ThreadError::InvalidArgument("empty cpu set"));
        }
        self.affinity = Some(*cpus);
        Ok(())
    }

    #[must_use]
    pub const fn affinity(&self) -> Option<&CpuSet> {
        self.affinity.as_ref()
    }

    /// Only system scope exists; process scope is recognised but unsupported.
    pub fn set_scope(&mut self, scope: i32) -> Result<(), ThreadError> {
        match scope {
            PTHREAD_SCOPE_SYSTEM => Ok(()),
            PTHREAD_SCOPE_PROCESS => Err(ThreadError::NotSupported("process contention scope")),
            _ => Err(ThreadError::InvalidArgument("unknown contention scope")),
        }
    }

    #[must_use]
    pub const fn scope(&self) -> i32 {
        PTHREAD_SCOPE_SYSTEM
    }

    pub(crate) fn uses_borrowed_stack(&self) -> bool {
        self.stack_base != 0
    }

    /// Re-check invariants the setters enforce; attributes are plain data
    /// and may have been built by hand inside the crate.
    pub(crate) fn validate(&self) -> Result<(), ThreadError> {
        if self.stack_size < MIN_STACK_SIZE {
            return Err(ThreadError::InvalidArgument("stack size below minimum"));
        }
        if self.uses_borrowed_stack()
            && (self.stack_base % PAGE_SIZE != 0 || self.stack_size % PAGE_SIZE != 0)
        {
            return Err(ThreadError::InvalidArgument("stack not page aligned"));
        }
        if page_round_up(self.stack_size).is_none() || page_round_up(self.guard_size).is_none() {
            return Err(ThreadError::InvalidArgument("stack or guard size overflows"));
        }
        Ok(())
    }
}

/// Stack bounds of the initial thread as `(base, size)`.
///
/// The size is `RLIMIT_STACK` (8 MiB when unlimited); the top is the end of
/// the mapping in `/proc/self/maps` that contains `startstack` from
/// `/proc/self/stat`. Runs on fixed buffers and raw syscalls only.
pub(crate) fn main_thread_stack() -> Result<(usize, usize), ThreadError> {
    let (soft, _) = syscall::sys_getrlimit(libc::RLIMIT_STACK as i32).map_err(ThreadError::Os)?;
    let size = if soft == libc::RLIM_INFINITY as u64 || soft > usize::MAX as u64 {
        MAIN_THREAD_FALLBACK_STACK
    } else {
        soft as usize
    };

    let mut stat = [0u8; 1024];
    let len = read_small_file(b"/proc/self/stat\0", &mut stat).map_err(ThreadError::Os)?;
    let Some(startstack) = parse_startstack(&stat[..len]) else {
        log_error!("strand", "no startstack in /proc/self/stat");
        return Err(ThreadError::Os(libc::ENOENT));
    };

    let mut top = None;
    for_each_line(b"/proc/self/maps\0", |line| {
        match parse_mapping_range(line) {
            Some((lo, hi)) if lo <= startstack && startstack < hi => {
                top = Some(hi);
                true
            }
            _ => false,
        }
    })
    .map_err(ThreadError::Os)?;

    match top {
        Some(top) => Ok((top.saturating_sub(size), size)),
        None => {
            log_error!("strand", "no /proc/self/maps entry contains {startstack:#x}");
            Err(ThreadError::Os(libc::ENOENT))
        }
    }
}

/// `startstack` is field 28 of `/proc/self/stat`; fields are counted after
/// the parenthesized command name, which may itself contain spaces.
fn parse_startstack(stat: &[u8]) -> Option<usize> {
    let close = stat.iter().rposition(|&b| b == b')')?;
    let rest = core::str::from_utf8(&stat[close + 1..]).ok()?;
    // The first field after ')' is field 3.
    rest.split_ascii_whitespace().nth(28 - 3)?.parse().ok()
}

/// Parse the `lo-hi` range at the start of a maps line.
fn parse_mapping_range(line: &[u8]) -> Option<(usize, usize)> {
    let line = core::str::from_utf8(line).ok()?;
    let range = line.split_ascii_whitespace().next()?;
    let (lo, hi) = range.split_once('-')?;
    Some((
        usize::from_str_radix(lo, 16).ok()?,
        usize::from_str_radix(hi, 16).ok()?,
    ))
}

#[allow(unsafe_code)]
fn open_readonly(path: &[u8]) -> Result<i32, i32> {
    debug_assert_eq!(path.last(), Some(&0));
    // SAFETY: `path` is NUL-terminated.
    unsafe { syscall::sys_openat(libc::AT_FDCWD, path.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC, 0) }
}

#[allow(unsafe_code)]
fn read_small_file(path: &[u8], buf: &mut [u8]) -> Result<usize, i32> {
    let fd = open_readonly(path)?;
    let mut filled = 0;
    let result = loop {
        if filled == buf.len() {
            break Ok(filled);
        }
        let rest = &mut buf[filled..];
        // SAFETY: `rest` is a live writable slice.
        match unsafe { syscall::sys_read(fd, rest.as_mut_ptr(), rest.len()) } {
            Ok(0) => break Ok(filled),
            Ok(n) => filled += n,
            Err(libc::EINTR) => {}
            Err(e) => break Err(e),
        }
    };
    let _ = syscall::sys_close(fd);
    result
}

/// Feed each line of a file to `f` until it returns `true`. Lines longer
/// than the internal buffer are skipped.
#[allow(unsafe_code)]
fn for_each_line(path: &[u8], mut f: impl FnMut(&[u8]) -> bool) -> Result<(), i32> {
    let fd = open_readonly(path)?;
    let mut buf = [0u8; 4096];
    let mut filled = 0;
    let mut skipping = false;
    let result = 'outer: loop {
        let rest = &mut buf[filled..];
        // SAFETY: `rest` is a live writable slice.
        let n = match unsafe { syscall::sys_read(fd, rest.as_mut_ptr(), rest.len()) } {
            Ok(n) => n,
            Err(libc::EINTR) => continue,
            Err(e) => break Err(e),
        };
        if n == 0 {
            if filled > 0 && !skipping {
                f(&buf[..filled]);
            }
            break Ok(());
        }
        filled += n;

        let mut start = 0;
        while let Some(pos) = buf[start..filled].iter().position(|&b| b == b'\n') {
            let line = &buf[start..start + pos];
            start += pos + 1;
            if skipping {
                skipping = false;
                continue;
            }
            if f(line) {
                break 'outer Ok(());
            }
        }
        buf.copy_within(start..filled, 0);
        filled -= start;
        if filled == buf.len() {
            filled = 0;
            skipping = true;
        }
    };
    let _ = syscall::sys_close(fd);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let attr = ThreadAttr::new();
        assert_eq!(attr.detach_state(), DetachState::Joinable);
        assert_eq!(attr.stack_size(), DEFAULT_STACK_SIZE);
        assert_eq!(attr.guard_size(), PAGE_SIZE);
        assert_eq!(attr.stack(), (0, DEFAULT_STACK_SIZE));
        assert_eq!(attr.scheduling(), (SchedPolicy::Other, 0));
        assert_eq!(attr.scope(), PTHREAD_SCOPE_SYSTEM);
        assert!(attr.affinity().is_none());
        assert!(attr.validate().is_ok());
    }

    #[test]
    fn detach_state_from_raw() {
        assert_eq!(DetachState::from_raw(1), Ok(DetachState::Detached));
        assert_eq!(DetachState::from_raw(0), Ok(DetachState::Joinable));
        assert_eq!(DetachState::from_raw(7).unwrap_err().errno(), libc::EINVAL);
    }

    #[test]
    fn stack_size_below_minimum_is_rejected() {
        let mut attr = ThreadAttr::new();
        assert_eq!(attr.set_stack_size(0).unwrap_err().errno(), libc::EINVAL);
        assert_eq!(
            attr.set_stack_size(MIN_STACK_SIZE - 1).unwrap_err().errno(),
            libc::EINVAL
        );
        assert_eq!(attr.stack_size(), DEFAULT_STACK_SIZE);
        attr.set_stack_size(MIN_STACK_SIZE).unwrap();
        assert_eq!(attr.stack_size(), MIN_STACK_SIZE);
    }

    #[test]
    fn set_stack_requires_page_alignment() {
        let mut attr = ThreadAttr::new();
        assert!(attr.set_stack(0x10_0001, 64 * 1024).is_err());
        assert!(attr.set_stack(0x10_0000, 64 * 1024 + 1).is_err());
        assert!(attr.set_stack(0x10_0000, 4096).is_err());
        attr.set_stack(0x10_0000, 64 * 1024).unwrap();
        assert_eq!(attr.stack(), (0x10_0000, 64 * 1024));
        assert!(attr.uses_borrowed_stack());
    }

    #[test]
    fn scheduling_priority_checked_per_policy() {
        let mut attr = ThreadAttr::new();
        assert!(attr.set_scheduling(SchedPolicy::Fifo, 0).is_err());
        assert!(attr.set_scheduling(SchedPolicy::Other, 5).is_err());
        attr.set_scheduling(SchedPolicy::RoundRobin, 10).unwrap();
        assert_eq!(attr.scheduling(), (SchedPolicy::RoundRobin, 10));
        assert!(attr.explicit_sched);
    }

    #[test]
    fn scope_handling() {
        let mut attr = ThreadAttr::new();
        assert!(attr.set_scope(PTHREAD_SCOPE_SYSTEM).is_ok());
        assert_eq!(
            attr.set_scope(PTHREAD_SCOPE_PROCESS).unwrap_err().errno(),
            libc::ENOTSUP
        );
        assert_eq!(attr.set_scope(42).unwrap_err().errno(), libc::EINVAL);
    }

    #[test]
    fn cpu_set_and_affinity() {
        let mut set = CpuSet::new();
        let mut attr = ThreadAttr::new();
        assert!(attr.set_affinity(&set).is_err());
        set.set(0).unwrap();
        set.set(65).unwrap();
        assert!(set.set(CpuSet::CAPACITY).is_err());
        assert!(set.is_set(65));
        assert_eq!(set.count(), 2);
        set.clear(65);
        assert_eq!(set.count(), 1);
        attr.set_affinity(&set).unwrap();
        assert_eq!(attr.affinity(), Some(&set));
    }

    #[test]
    fn startstack_parsing_handles_spaces_in_comm() {
        let mut stat = String::from("1234 (my prog) S");
        for field in 4..=27 {
            stat.push_str(&format!(" {field}"));
        }
        stat.push_str(" 140737488347136 29 30\n");
        assert_eq!(parse_startstack(stat.as_bytes()), Some(140_737_488_347_136));
        assert_eq!(parse_startstack(b"1 (x) S 2 3"), None);
    }

    #[test]
    fn mapping_range_parsing() {
        let line = b"7ffd1000-7ffd3000 rw-p 00000000 00:00 0                          [stack]";
        assert_eq!(parse_mapping_range(line), Some((0x7ffd_1000, 0x7ffd_3000)));
        assert_eq!(parse_mapping_range(b"garbage"), None);
    }

    #[test]
    fn main_thread_stack_is_discoverable() {
        let (base, size) = main_thread_stack().unwrap();
        assert!(size >= PAGE_SIZE);
        assert!(base.checked_add(size).is_some());
    }
}
