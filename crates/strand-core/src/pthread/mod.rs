//! POSIX-style threads on raw `clone`.
//!
//! Thread regions, the thread registry, the launcher and the guarded mutex.

pub mod attr;
pub(crate) mod futex;
pub mod handshake;
pub mod mutex;
pub mod region;
pub mod registry;
#[allow(unsafe_code)]
pub mod thread;
pub mod tls;

pub use attr::{
    CpuSet, DEFAULT_GUARD_SIZE, DEFAULT_STACK_SIZE, DetachState, MIN_STACK_SIZE,
    PTHREAD_CREATE_DETACHED, PTHREAD_CREATE_JOINABLE, PTHREAD_SCOPE_PROCESS,
    PTHREAD_SCOPE_SYSTEM, SchedPolicy, ThreadAttr,
};
pub use futex::{FutexMutex, FutexMutexGuard, FutexRwLock, RawFutexMutex, RawFutexRwLock};
pub use handshake::Handshake;
pub use mutex::{
    GuardedMutex, MutexKind, PTHREAD_MUTEX_DEFAULT, PTHREAD_MUTEX_ERRORCHECK,
    PTHREAD_MUTEX_NORMAL, PTHREAD_MUTEX_RECURSIVE,
};
pub use region::{PAGE_SIZE, RegionLayout, ThreadRegion, page_round_up};
pub use registry::{REGISTRY, ThreadRegistry};
pub use thread::{
    CleanupHandler, JoinState, StartRoutine, ThreadControl, ThreadHandle, cleanup_pop,
    cleanup_push, create_thread, detach_thread, exit_thread, get_attributes, is_threaded,
    join_thread, main_thread, self_thread,
};
pub use tls::{
    TLS_SLOT_DLERROR, TLS_SLOT_ERRNO, TLS_SLOT_SAFESTACK, TLS_SLOT_SELF, TLS_SLOT_STACK_GUARD,
    TLS_SLOT_THREAD_ID, TLS_SLOTS, TlsBlock, current_stack_guard, thread_pointer,
};


/// Whether the calling thread was created by [`create_thread`].
pub(crate) fn on_runtime_thread() -> bool {
    is_threaded() && REGISTRY.find_by_tls(thread_pointer()).is_some()
}

/// Stack bounds of the calling thread if it is a runtime thread.
///
/// Runtime threads have no host C library thread header, so callers use this
/// to decide whether host-library facilities are off limits.
pub(crate) fn runtime_stack_bounds() -> Option<(usize, usize)> {
    if !is_threaded() {
        return None;
    }
    let addr = REGISTRY.find_by_tls(thread_pointer())?;
    REGISTRY
        .with_control(addr, ThreadControl::stack_bounds)
        .flatten()
}
