//! Futex-backed raw locks.
//!
//! `parking_lot`'s own raw locks park through thread-local state, which runtime
//! threads (running on a bare TLS block) cannot use. These raw locks
//! plug into `lock_api` instead and only ever issue raw futex syscalls.

use core::sync::atomic::{AtomicU32, Ordering};

use parking_lot::lock_api::{self, GuardSend};

use crate::syscall;

const FUTEX_WAIT_PRIVATE: i32 = libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG;
const FUTEX_WAKE_PRIVATE: i32 = libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG;

/// Sleep while `*word == expected`. Spurious returns are the caller's problem.
#[allow(unsafe_code)]
pub(crate) fn futex_wait(word: &AtomicU32, expected: u32) {
    // SAFETY: `word` is a live aligned u32; null timeout.
    let _ = unsafe {
        syscall::sys_futex(
            word as *const AtomicU32 as *const u32,
            FUTEX_WAIT_PRIVATE,
            expected,
            0,
            0,
            0,
        )
    };
}

#[allow(unsafe_code)]
pub(crate) fn futex_wake(word: &AtomicU32, count: u32) {
    // SAFETY: `word` is a live aligned u32.
    let _ = unsafe {
        syscall::sys_futex(
            word as *const AtomicU32 as *const u32,
            FUTEX_WAKE_PRIVATE,
            count,
            0,
            0,
            0,
        )
    };
}

/// Wait for a kernel-cleared tid word (CLONE_CHILD_CLEARTID) to reach zero.
#[allow(unsafe_code)]
pub(crate) fn futex_wait_tid_zero(tid: &core::sync::atomic::AtomicI32) {
    loop {
        let current = tid.load(Ordering::Acquire);
        if current == 0 {
            return;
        }
        // SAFETY: `tid` is a live aligned i32. The kernel wakes it with a
        // shared (non-private) wake, so no private flag here.
        let _ = unsafe {
            syscall::sys_futex(
                tid as *const core::sync::atomic::AtomicI32 as *const u32,
                libc::FUTEX_WAIT,
                current as u32,
                0,
                0,
                0,
            )
        };
    }
}

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

/// Three-state futex mutex: 0 unlocked, 1 locked, 2 locked with waiters.
pub struct RawFutexMutex {
    state: AtomicU32,
}

#[allow(unsafe_code)]
unsafe impl lock_api::RawMutex for RawFutexMutex {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        state: AtomicU32::new(UNLOCKED),
    };

    type GuardMarker = GuardSend;

    fn lock(&self) {
        if self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        loop {
            let observed = self.state.load(Ordering::Relaxed);
            if observed == UNLOCKED {
                // Someone may still be parked; keep the contended marker.
                if self
                    .state
                    .compare_exchange(UNLOCKED, CONTENDED, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
                continue;
            }
            if observed == LOCKED {
                let _ = self.state.compare_exchange(
                    LOCKED,
                    CONTENDED,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                );
            }
            futex_wait(&self.state, CONTENDED);
        }
    }

    fn try_lock(&self) -> bool {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock(&self) {
        if self.state.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            futex_wake(&self.state, 1);
        }
    }

    fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != UNLOCKED
    }
}

const WRITER: u32 = u32::MAX;

/// Reader/writer futex lock.
///
/// `state` holds the reader count, or `WRITER` while exclusively held.
/// Unlockers wake everybody when `waiters` is non-zero; the registry sees
/// little contention so fairness is not attempted.
pub struct RawFutexRwLock {
    state: AtomicU32,
    waiters: AtomicU32,
}

impl RawFutexRwLock {
    fn park(&self, observed: u32) {
        self.waiters.fetch_add(1, Ordering::SeqCst);
        futex_wait(&self.state, observed);
        self.waiters.fetch_sub(1, Ordering::SeqCst);
    }

    fn wake_all(&self) {
        if self.waiters.load(Ordering::SeqCst) != 0 {
            futex_wake(&self.state, i32::MAX as u32);
        }
    }
}

#[allow(unsafe_code)]
unsafe impl lock_api::RawRwLock for RawFutexRwLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        state: AtomicU32::new(0),
        waiters: AtomicU32::new(0),
    };

    type GuardMarker = GuardSend;

    fn lock_shared(&self) {
        loop {
            let s = self.state.load(Ordering::SeqCst);
            if s < WRITER - 1 {
                if self
                    .state
                    .compare_exchange_weak(s, s + 1, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
                continue;
            }
            self.park(s);
        }
    }

    fn try_lock_shared(&self) -> bool {
        let s = self.state.load(Ordering::SeqCst);
        s < WRITER - 1
            && self
                .state
                .compare_exchange(s, s + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
    }

    unsafe fn unlock_shared(&self) {
        if self.state.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.wake_all();
        }
    }

    fn lock_exclusive(&self) {
        loop {
            match self
                .state
                .compare_exchange(0, WRITER, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(observed) => self.park(observed),
            }
        }
    }

    fn try_lock_exclusive(&self) -> bool {
        self.state
            .compare_exchange(0, WRITER, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock_exclusive(&self) {
        self.state.store(0, Ordering::SeqCst);
        self.wake_all();
    }

    fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != 0
    }
}

pub type FutexMutex<T> = lock_api::Mutex<RawFutexMutex, T>;
pub type FutexMutexGuard<'a, T> = lock_api::MutexGuard<'a, RawFutexMutex, T>;
pub type FutexRwLock<T> = lock_api::RwLock<RawFutexRwLock, T>;
