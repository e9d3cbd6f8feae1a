//! Thread creation and lifecycle, clone-based.
//!
//! ## Architecture
//!
//! Each thread owns one region (see [`super::region`]) holding its stack, its
//! TLS block and its [`ThreadControl`]. The [`ThreadHandle`] returned to
//! callers is the control block's address.
//!
//! Creation runs on the caller:
//!
//! 1. resolve attributes, allocate or borrow the region, lay it out
//! 2. write the control block and TLS block in place
//! 3. `clone` the kernel task; it parks on the startup handshake
//! 4. apply scheduling, register the control block, release the handshake
//!
//! The kernel writes the child's tid into `ThreadControl::tid` at clone time
//! (`CLONE_PARENT_SETTID`) and clears it plus futex-wakes it when the task
//! exits (`CLONE_CHILD_CLEARTID`). Joiners wait on that word.
//!
//! Each runtime thread gets its own thread register (`CLONE_SETTLS`) pointing
//! at the TLS block in its region. That block is not a host C library thread
//! header, so everything a runtime thread runs in here avoids the allocator
//! and host TLS.

use core::cell::UnsafeCell;
use core::convert::Infallible;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};

use super::attr::{self, DetachState, ThreadAttr};
use super::futex::futex_wait_tid_zero;
use super::handshake::Handshake;
use super::region::{PAGE_SIZE, RegionLayout, ThreadRegion, page_round_up};
use super::registry::{REGISTRY, RegistryLinks};
use super::tls::{self, TlsBlock, current_stack_guard};
use crate::config::{self, SchedFailurePolicy};
use crate::error::ThreadError;
use crate::syscall;

/// Entry point of a runtime thread: receives the creation argument and
/// returns the value handed to the joiner.
pub type StartRoutine = unsafe extern "C" fn(usize) -> usize;

const CLONE_THREAD_FLAGS: usize = (libc::CLONE_VM
    | libc::CLONE_FS
    | libc::CLONE_FILES
    | libc::CLONE_SIGHAND
    | libc::CLONE_THREAD
    | libc::CLONE_SYSVSEM
    | libc::CLONE_SETTLS
    | libc::CLONE_PARENT_SETTID
    | libc::CLONE_CHILD_CLEARTID) as usize;

/// Who is responsible for reclaiming a thread.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinState {
    Joinable = 0,
    /// Start routine finished; waiting for a joiner or detacher.
    ExitedNotJoined = 1,
    /// A joiner (or late detacher) has claimed the thread.
    Joined = 2,
    /// The thread reclaims itself on exit.
    Detached = 3,
}

impl JoinState {
    const fn from_u32(v: u32) -> Self {
        match v {
            1 => Self::ExitedNotJoined,
            2 => Self::Joined,
            3 => Self::Detached,
            _ => Self::Joinable,
        }
    }
}

/// A cleanup handler record, linked on the owning thread's cleanup stack.
#[derive(Debug)]
pub struct CleanupHandler {
    routine: fn(usize),
    arg: usize,
    next: *mut CleanupHandler,
}

impl CleanupHandler {
    #[must_use]
    pub const fn new(routine: fn(usize), arg: usize) -> Self {
        Self {
            routine,
            arg,
            next: ptr::null_mut(),
        }
    }
}

/// Per-thread control block, placed at the top of the thread region.
#[repr(C)]
pub struct ThreadControl {
    /// Kernel tid; set at clone, cleared by the kernel on exit.
    tid: AtomicI32,
    cached_pid: AtomicI32,
    join_state: AtomicU32,
    attr: UnsafeCell<ThreadAttr>,
    tls: usize,
    start_routine: UnsafeCell<StartRoutine>,
    start_arg: usize,
    retval: UnsafeCell<usize>,
    cleanup_stack: UnsafeCell<*mut CleanupHandler>,
    pub(super) links: UnsafeCell<RegistryLinks>,
    handshake: Handshake,
    region: ThreadRegion,
    stack_top: usize,
    alt_stack: UnsafeCell<usize>,
    is_main: bool,
}

// SAFETY: shared fields are atomics; the UnsafeCells are written either
// before publication (handshake), by the owning thread only (cleanup stack,
// alt stack, retval) or under the registry lock (links).
#[allow(unsafe_code)]
unsafe impl Send for ThreadControl {}
#[allow(unsafe_code)]
unsafe impl Sync for ThreadControl {}

unsafe extern "C" fn do_nothing(_: usize) -> usize {
    0
}

#[allow(unsafe_code)]
impl ThreadControl {
    fn new(
        attr: ThreadAttr,
        region: ThreadRegion,
        stack_top: usize,
        tls: usize,
        start: StartRoutine,
        arg: usize,
    ) -> Self {
        let join_state = match attr.detach_state {
            DetachState::Joinable => JoinState::Joinable,
            DetachState::Detached => JoinState::Detached,
        };
        Self {
            tid: AtomicI32::new(0),
            cached_pid: AtomicI32::new(syscall::sys_getpid()),
            join_state: AtomicU32::new(join_state as u32),
            attr: UnsafeCell::new(attr),
            tls,
            start_routine: UnsafeCell::new(start),
            start_arg: arg,
            retval: UnsafeCell::new(0),
            cleanup_stack: UnsafeCell::new(ptr::null_mut()),
            links: UnsafeCell::new(RegistryLinks::new()),
            handshake: Handshake::new_locked(),
            region,
            stack_top,
            alt_stack: UnsafeCell::new(0),
            is_main: false,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(tid: i32) -> Self {
        let tcb = Self::new(
            ThreadAttr::new(),
            ThreadRegion::borrowed(0, 0),
            0,
            0,
            do_nothing,
            0,
        );
        tcb.tid.store(tid, Ordering::Relaxed);
        tcb
    }

    pub(crate) fn kernel_tid(&self) -> i32 {
        self.tid.load(Ordering::Acquire)
    }

    pub(crate) fn is_current_tid(&self, tid: i32) -> bool {
        tid != 0 && self.kernel_tid() == tid
    }

    fn join_state(&self) -> JoinState {
        JoinState::from_u32(self.join_state.load(Ordering::Acquire))
    }

    fn transition(&self, from: JoinState, to: JoinState) -> Result<(), JoinState> {
        self.join_state
            .compare_exchange(from as u32, to as u32, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(JoinState::from_u32)
    }

    fn as_mut_ptr(&self) -> *mut ThreadControl {
        self as *const Self as *mut Self
    }

    /// `[lo, hi)` of a runtime thread's stack; `None` for the initial thread.
    pub(crate) fn stack_bounds(&self) -> Option<(usize, usize)> {
        if self.is_main {
            return None;
        }
        let lo = if self.region.is_owned() {
            self.region.stack_base()
        } else {
            self.region.base()
        };
        Some((lo, self.stack_top))
    }

    /// Pointer to this thread's TLS block.
    pub fn tls_block(&self) -> *const TlsBlock {
        self.tls as *const TlsBlock
    }
}

/// Opaque, comparable identifier of a runtime thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadHandle(usize);

impl ThreadHandle {
    #[must_use]
    pub const fn as_raw(self) -> usize {
        self.0
    }

    #[must_use]
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// Kernel tid while the thread is live; 0 once it has exited.
    pub fn kernel_tid(self) -> Result<i32, ThreadError> {
        REGISTRY
            .with_control(self.0, ThreadControl::kernel_tid)
            .ok_or(ThreadError::NoSuchThread)
    }

    /// Current join state.
    pub fn join_state(self) -> Result<JoinState, ThreadError> {
        REGISTRY
            .with_control(self.0, ThreadControl::join_state)
            .ok_or(ThreadError::NoSuchThread)
    }

    /// Value of one of the thread's TLS slots.
    #[allow(unsafe_code)]
    pub fn tls_slot(self, index: usize) -> Result<Option<usize>, ThreadError> {
        REGISTRY
            .with_control(self.0, |tcb| {
                if tcb.tls == 0 {
                    return None;
                }
                // SAFETY: the TLS block lives in the registered thread's region.
                unsafe { (*tcb.tls_block()).slot(index) }
            })
            .ok_or(ThreadError::NoSuchThread)
    }
}

static THREADED: AtomicBool = AtomicBool::new(false);

/// Whether this process ever created a runtime thread.
#[must_use]
pub fn is_threaded() -> bool {
    THREADED.load(Ordering::Acquire)
}

/// Create a thread running `start(arg)`.
///
/// With `attr == None` the thread is joinable with a runtime-allocated
/// default stack. Configuration errors are reported before anything is
/// allocated. If a post-launch step fails the new task still exists: it is
/// detached, runs nothing and reclaims itself, and the error is returned.
///
/// # Safety
///
/// The new thread's thread register points at its own [`TlsBlock`], not at a
/// host C library thread header. `start`, and everything it calls, must not
/// touch host thread-local state: no `thread_local!`, no `std::thread`
/// queries, no panics, no heap allocation, no libc calls that read or set
/// `errno`. Atomics, futex locks from this crate, [`GuardedMutex`] and the
/// functions in this module are fine.
///
/// [`GuardedMutex`]: super::GuardedMutex
#[allow(unsafe_code)]
pub unsafe fn create_thread(
    attr: Option<&ThreadAttr>,
    start: StartRoutine,
    arg: usize,
) -> Result<ThreadHandle, ThreadError> {
    // Runtime threads must only ever see cached configuration.
    config::resolve_all();
    crate::lockorder::prepare();

    let mut attr = attr.copied().unwrap_or_default();
    attr.validate()?;

    let region = if attr.uses_borrowed_stack() {
        attr.guard_size = 0;
        ThreadRegion::borrowed(attr.stack_base, attr.stack_size)
    } else {
        let region = ThreadRegion::allocate(attr.stack_size, attr.guard_size)?;
        attr.guard_size = region.guard_size();
        region
    };
    let layout = match region.layout() {
        Ok(layout) => layout,
        Err(err) => {
            region.release();
            return Err(err);
        }
    };
    if !region.is_owned() {
        // Report the usable part of a borrowed stack the way it was given.
        attr.stack_size = layout.stack_top - layout.stack_base;
    } else {
        attr.stack_base = 0;
        attr.stack_size = layout.usable_stack();
    }

    let tcb_ptr = layout.control as *mut ThreadControl;
    // SAFETY: the layout places both blocks inside the region, suitably
    // aligned, and nothing else references that memory yet.
    let tcb = unsafe {
        let tls = TlsBlock::init_at(layout.tls, layout.control, current_stack_guard());
        tcb_ptr.write(ThreadControl::new(
            attr,
            region,
            layout.stack_top,
            tls as usize,
            start,
            arg,
        ));
        &*tcb_ptr
    };

    let child_sp = prepare_child_frame(&layout, tcb_ptr as usize);
    let tid_ptr = tcb.tid.as_ptr();
    // SAFETY: child_sp holds [thread_start, tcb]; the tid word and the TLS
    // block live as long as the region, which outlives the task.
    let clone_result = unsafe {
        syscall::sys_clone_thread(CLONE_THREAD_FLAGS, child_sp, tid_ptr, tid_ptr, layout.tls)
    };
    let tid = match clone_result {
        Ok(tid) => tid,
        Err(errno) => {
            tcb.handshake.release();
            region.release();
            log_warn!("strand", "create_thread failed: clone failed: errno {errno}");
            return Err(ThreadError::Os(errno));
        }
    };

    let init_error = apply_scheduling(&attr, tid);

    // SAFETY: the control block lives until the thread is reaped, and it
    // cannot be reaped before it is registered.
    unsafe { REGISTRY.insert(tcb_ptr) };
    THREADED.store(true, Ordering::Release);

    if let Some(err) = init_error {
        tcb.join_state
            .store(JoinState::Detached as u32, Ordering::Release);
        // SAFETY: the child does not read its start routine before the
        // handshake is released.
        unsafe { *tcb.start_routine.get() = do_nothing };
        tcb.handshake.release();
        return Err(err);
    }

    tcb.handshake.release();
    log_debug!("strand", "created thread {tid} at {:#x}", tcb_ptr as usize);
    Ok(ThreadHandle(tcb_ptr as usize))
}

/// Place the frame the clone trampoline pops: entry function, then argument.
#[allow(unsafe_code)]
fn prepare_child_frame(layout: &RegionLayout, tcb_addr: usize) -> usize {
    let sp = layout.stack_top - 2 * core::mem::size_of::<usize>();
    // SAFETY: `sp` is 16 bytes below the aligned stack top, inside the stack.
    unsafe {
        let frame = sp as *mut usize;
        frame.write(thread_start as StartRoutine as usize);
        frame.add(1).write(tcb_addr);
    }
    sp
}

fn apply_scheduling(attr: &ThreadAttr, tid: i32) -> Option<ThreadError> {
    let fatal = config::sched_failure_policy() == SchedFailurePolicy::Fail;
    if attr.explicit_sched {
        let (policy, priority) = attr.scheduling();
        if let Err(errno) = syscall::sys_sched_setscheduler(tid, policy.as_raw(), priority) {
            log_warn!(
                "strand",
                "create_thread sched_setscheduler call failed: errno {errno}"
            );
            if fatal {
                return Some(ThreadError::from_errno(errno));
            }
        }
    }
    if let Some(cpus) = attr.affinity() {
        if let Err(errno) = syscall::sys_sched_setaffinity(tid, cpus.as_words()) {
            log_warn!(
                "strand",
                "create_thread sched_setaffinity call failed: errno {errno}"
            );
            if fatal {
                return Some(ThreadError::from_errno(errno));
            }
        }
    }
    None
}

/// First Rust code a runtime thread executes.
#[allow(unsafe_code)]
unsafe extern "C" fn thread_start(tcb_addr: usize) -> usize {
    // SAFETY: the creator passed its freshly written control block.
    let tcb = unsafe { &*(tcb_addr as *const ThreadControl) };
    tcb.handshake.acquire_and_retire();
    install_alt_stack(tcb);

    // SAFETY: published before the handshake was released.
    let start = unsafe { *tcb.start_routine.get() };
    // SAFETY: `create_thread`'s caller guarantees the routine stays off host
    // TLS, which this thread does not have.
    let retval = unsafe { start(tcb.start_arg) };
    finish(tcb, retval)
}

#[allow(unsafe_code)]
fn install_alt_stack(tcb: &ThreadControl) {
    let Some(size) = page_round_up(libc::SIGSTKSZ) else {
        return;
    };
    // SAFETY: fresh anonymous mapping.
    let base = match unsafe {
        syscall::sys_mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    } {
        Ok(base) => base as usize,
        Err(errno) => {
            log_debug!("strand", "no alternate signal stack: errno {errno}");
            return;
        }
    };
    let ss = syscall::SignalStack {
        ss_sp: base,
        ss_flags: 0,
        ss_size: size,
    };
    if syscall::sys_sigaltstack(Some(&ss), None).is_err() {
        // SAFETY: nobody else knows about the mapping.
        let _ = unsafe { syscall::sys_munmap(base as *mut u8, size) };
        return;
    }
    // SAFETY: only the owning thread touches its alt stack slot.
    unsafe { *tcb.alt_stack.get() = base };
}

#[allow(unsafe_code)]
fn teardown_alt_stack(tcb: &ThreadControl) {
    // SAFETY: only the owning thread touches its alt stack slot.
    let base = unsafe { *tcb.alt_stack.get() };
    if base == 0 {
        return;
    }
    let disable = syscall::SignalStack {
        ss_sp: 0,
        ss_flags: libc::SS_DISABLE,
        ss_size: 0,
    };
    let _ = syscall::sys_sigaltstack(Some(&disable), None);
    if let Some(size) = page_round_up(libc::SIGSTKSZ) {
        // SAFETY: the stack was just uninstalled.
        let _ = unsafe { syscall::sys_munmap(base as *mut u8, size) };
    }
    // SAFETY: as above.
    unsafe { *tcb.alt_stack.get() = 0 };
}

#[allow(unsafe_code)]
fn run_cleanup_handlers(tcb: &ThreadControl) {
    loop {
        // SAFETY: the cleanup stack belongs to the calling thread.
        let top = unsafe { *tcb.cleanup_stack.get() };
        if top.is_null() {
            return;
        }
        // SAFETY: handlers stay alive until popped, per `cleanup_push`.
        let handler = unsafe { &*top };
        // SAFETY: only this thread touches its cleanup stack.
        unsafe { *tcb.cleanup_stack.get() = handler.next };
        (handler.routine)(handler.arg);
    }
}

/// Exit path shared by returning from the start routine and `exit_thread`.
#[allow(unsafe_code)]
fn finish(tcb: &ThreadControl, retval: usize) -> ! {
    run_cleanup_handlers(tcb);
    teardown_alt_stack(tcb);
    crate::lockorder::forget_current_thread();
    // SAFETY: read by the joiner only after the kernel clears the tid.
    unsafe { *tcb.retval.get() = retval };

    match tcb.transition(JoinState::Joinable, JoinState::ExitedNotJoined) {
        Ok(()) | Err(JoinState::Joined) => syscall::sys_exit_thread(0),
        Err(_) => reclaim_self(tcb),
    }
}

/// Detached exit: unregister, stop the kernel from touching the control
/// block, block signals and unmap the region we are running on.
#[allow(unsafe_code)]
fn reclaim_self(tcb: &ThreadControl) -> ! {
    let region = tcb.region;
    // SAFETY: the control block is still live.
    unsafe { REGISTRY.remove(tcb.as_mut_ptr()) };
    // SAFETY: null disables the exit-time clear/wake.
    unsafe { syscall::sys_set_tid_address(ptr::null_mut()) };
    let all: u64 = !0;
    let _ = syscall::sys_rt_sigprocmask(libc::SIG_BLOCK, Some(&all), None);
    if region.is_owned() {
        // SAFETY: nothing but this task references the region any more, and
        // the unmap-and-exit sequence runs from registers only.
        unsafe { syscall::munmap_and_exit(region.base(), region.size()) }
    } else {
        syscall::sys_exit_thread(0)
    }
}

/// Wait for a claimed thread's task to die, then release its resources.
#[allow(unsafe_code)]
fn reap(tcb_ptr: *mut ThreadControl) -> usize {
    // SAFETY: the caller won the claim, so nobody else reclaims tcb_ptr.
    let tcb = unsafe { &*tcb_ptr };
    futex_wait_tid_zero(&tcb.tid);
    // SAFETY: the task is gone; its return value is final.
    let retval = unsafe { *tcb.retval.get() };
    let region = tcb.region;
    // SAFETY: still live until the region is released below.
    unsafe { REGISTRY.remove(tcb_ptr) };
    region.release();
    retval
}

/// Wait for `handle` to finish and return its start routine's result.
pub fn join_thread(handle: ThreadHandle) -> Result<usize, ThreadError> {
    let me = syscall::sys_gettid();
    let claimed = REGISTRY
        .with_control(handle.0, |tcb| {
            if tcb.is_main {
                return Err(ThreadError::InvalidArgument("initial thread cannot be joined"));
            }
            if tcb.is_current_tid(me) {
                return Err(ThreadError::Deadlock);
            }
            loop {
                match tcb.join_state() {
                    JoinState::Detached | JoinState::Joined => {
                        return Err(ThreadError::InvalidArgument("thread is not joinable"));
                    }
                    from => {
                        if tcb.transition(from, JoinState::Joined).is_ok() {
                            return Ok(tcb.as_mut_ptr());
                        }
                    }
                }
            }
        })
        .ok_or(ThreadError::NoSuchThread)??;
    Ok(reap(claimed))
}

/// Make `handle` reclaim itself on exit, or reclaim it now if it already
/// finished.
pub fn detach_thread(handle: ThreadHandle) -> Result<(), ThreadError> {
    let to_reap = REGISTRY
        .with_control(handle.0, |tcb| {
            if tcb.is_main {
                return Err(ThreadError::InvalidArgument("initial thread cannot be detached"));
            }
            loop {
                match tcb.join_state() {
                    JoinState::Detached | JoinState::Joined => {
                        return Err(ThreadError::InvalidArgument("thread is not joinable"));
                    }
                    JoinState::Joinable => {
                        if tcb
                            .transition(JoinState::Joinable, JoinState::Detached)
                            .is_ok()
                        {
                            return Ok(None);
                        }
                    }
                    JoinState::ExitedNotJoined => {
                        if tcb
                            .transition(JoinState::ExitedNotJoined, JoinState::Joined)
                            .is_ok()
                        {
                            return Ok(Some(tcb.as_mut_ptr()));
                        }
                    }
                }
            }
        })
        .ok_or(ThreadError::NoSuchThread)??;
    if let Some(tcb) = to_reap {
        reap(tcb);
    }
    Ok(())
}

fn current_control() -> Option<usize> {
    REGISTRY
        .find_by_tls(tls::thread_pointer())
        .or_else(|| REGISTRY.find_by_tid(syscall::sys_gettid()))
}

/// Handle of the calling thread, if it is a runtime thread or the initial
/// thread.
#[must_use]
pub fn self_thread() -> Option<ThreadHandle> {
    if let Some(addr) = current_control() {
        return Some(ThreadHandle(addr));
    }
    if syscall::sys_gettid() == syscall::sys_getpid() {
        return main_thread().ok();
    }
    None
}

/// Terminate the calling runtime thread with `retval`.
///
/// Cleanup handlers run; Rust destructors of the abandoned frames do not.
/// Fails if the caller is not a thread created by [`create_thread`].
#[allow(unsafe_code)]
pub fn exit_thread(retval: usize) -> Result<Infallible, ThreadError> {
    let addr = current_control().ok_or(ThreadError::InvalidArgument("not a runtime thread"))?;
    // SAFETY: a registered control block of the calling thread stays alive
    // at least until this thread finishes.
    let tcb = unsafe { &*(addr as *const ThreadControl) };
    if tcb.is_main {
        return Err(ThreadError::InvalidArgument("not a runtime thread"));
    }
    finish(tcb, retval)
}

/// Push `handler` onto the calling thread's cleanup stack.
///
/// # Safety
///
/// `handler` must stay at the same address until popped by
/// [`cleanup_pop`] or run by thread exit.
#[allow(unsafe_code)]
pub unsafe fn cleanup_push(handler: &mut CleanupHandler) -> Result<(), ThreadError> {
    let addr = current_control().ok_or(ThreadError::InvalidArgument("not a runtime thread"))?;
    // SAFETY: the calling thread owns its control block's cleanup stack.
    unsafe {
        let tcb = &*(addr as *const ThreadControl);
        handler.next = *tcb.cleanup_stack.get();
        *tcb.cleanup_stack.get() = handler as *mut CleanupHandler;
    }
    Ok(())
}

/// Pop the most recent cleanup handler, running it when `execute` is set.
/// Popping an empty stack is a no-op.
#[allow(unsafe_code)]
pub fn cleanup_pop(execute: bool) -> Result<(), ThreadError> {
    let addr = current_control().ok_or(ThreadError::InvalidArgument("not a runtime thread"))?;
    // SAFETY: the calling thread owns its control block's cleanup stack, and
    // pushed handlers are alive until popped.
    let handler = unsafe {
        let tcb = &*(addr as *const ThreadControl);
        let top = *tcb.cleanup_stack.get();
        if top.is_null() {
            return Ok(());
        }
        *tcb.cleanup_stack.get() = (*top).next;
        (*top).next = ptr::null_mut();
        &*top
    };
    if execute {
        (handler.routine)(handler.arg);
    }
    Ok(())
}

static MAIN_CONTROL: AtomicUsize = AtomicUsize::new(0);

/// Handle of the initial thread, registering it on first use.
#[allow(unsafe_code)]
pub fn main_thread() -> Result<ThreadHandle, ThreadError> {
    let existing = MAIN_CONTROL.load(Ordering::Acquire);
    if existing != 0 {
        return Ok(ThreadHandle(existing));
    }

    let size = page_round_up(core::mem::size_of::<ThreadControl>()).unwrap_or(PAGE_SIZE);
    // SAFETY: fresh anonymous mapping, never unmapped once published.
    let page = unsafe {
        syscall::sys_mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    }
    .map_err(|_| ThreadError::ResourceExhausted("initial thread control block"))?;
    let tcb_ptr = page.cast::<ThreadControl>();

    let mut attr = ThreadAttr::new();
    attr.guard_size = 0;
    let mut tcb = ThreadControl::new(
        attr,
        ThreadRegion::borrowed(0, 0),
        0,
        0,
        do_nothing,
        0,
    );
    tcb.is_main = true;
    tcb.tid = AtomicI32::new(syscall::sys_getpid());
    // SAFETY: page-aligned, large enough and exclusively ours.
    unsafe { tcb_ptr.write(tcb) };

    match MAIN_CONTROL.compare_exchange(0, tcb_ptr as usize, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => {
            // SAFETY: the mapping is leaked for the life of the process.
            unsafe { REGISTRY.insert(tcb_ptr) };
            Ok(ThreadHandle(tcb_ptr as usize))
        }
        Err(winner) => {
            // SAFETY: we lost the race; nobody saw our page.
            let _ = unsafe { syscall::sys_munmap(page, size) };
            Ok(ThreadHandle(winner))
        }
    }
}

/// Effective attributes of a registered thread.
///
/// The detach state reflects the current join state. For the initial thread
/// the stack bounds are discovered now from `/proc/self`.
#[allow(unsafe_code)]
pub fn get_attributes(handle: ThreadHandle) -> Result<ThreadAttr, ThreadError> {
    let (mut out, is_main) = REGISTRY
        .with_control(handle.0, |tcb| {
            // SAFETY: attributes are fixed once the thread is published.
            let mut attr = unsafe { *tcb.attr.get() };
            if tcb.join_state() == JoinState::Detached {
                attr.detach_state = DetachState::Detached;
            }
            if tcb.region.is_owned() {
                attr.stack_base = tcb.region.stack_base();
                attr.stack_size = tcb.stack_top - tcb.region.stack_base();
            }
            (attr, tcb.is_main)
        })
        .ok_or(ThreadError::NoSuchThread)?;
    if is_main {
        let (base, size) = attr::main_thread_stack()?;
        out.stack_base = base;
        out.stack_size = size;
    }
    Ok(out)
}
