//! Guarded mutex: a futex mutex with POSIX kind semantics that reports every
//! acquisition and release to the lock-order observer.

use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use parking_lot::lock_api::RawMutex as _;

use super::futex::RawFutexMutex;
use crate::error::ThreadError;
use crate::{lockorder, syscall};

/// Normal mutex: no error checking, relocking by the owner deadlocks.
pub const PTHREAD_MUTEX_NORMAL: i32 = 0;
/// Recursive mutex: the owner may relock; each lock needs an unlock.
pub const PTHREAD_MUTEX_RECURSIVE: i32 = 1;
/// Error-checking mutex: relock is `EDEADLK`, foreign unlock is `EPERM`.
pub const PTHREAD_MUTEX_ERRORCHECK: i32 = 2;
pub const PTHREAD_MUTEX_DEFAULT: i32 = PTHREAD_MUTEX_NORMAL;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutexKind {
    #[default]
    Normal,
    Recursive,
    ErrorCheck,
}

impl MutexKind {
    /// Parse a `PTHREAD_MUTEX_*` constant.
    pub const fn from_raw(raw: i32) -> Result<Self, ThreadError> {
        match raw {
            PTHREAD_MUTEX_NORMAL => Ok(Self::Normal),
            PTHREAD_MUTEX_RECURSIVE => Ok(Self::Recursive),
            PTHREAD_MUTEX_ERRORCHECK => Ok(Self::ErrorCheck),
            _ => Err(ThreadError::InvalidArgument("unknown mutex kind")),
        }
    }

    #[must_use]
    pub const fn as_raw(self) -> i32 {
        match self {
            Self::Normal => PTHREAD_MUTEX_NORMAL,
            Self::Recursive => PTHREAD_MUTEX_RECURSIVE,
            Self::ErrorCheck => PTHREAD_MUTEX_ERRORCHECK,
        }
    }
}

/// Futex-backed mutex with owner tracking.
///
/// `owner` and `depth` are only written by the thread holding `raw`.
pub struct GuardedMutex {
    raw: RawFutexMutex,
    kind: MutexKind,
    owner: AtomicI32,
    /// Extra recursive acquisitions beyond the first.
    depth: AtomicU32,
}

impl GuardedMutex {
    #[must_use]
    pub const fn new(kind: MutexKind) -> Self {
        Self {
            raw: RawFutexMutex::INIT,
            kind,
            owner: AtomicI32::new(0),
            depth: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> MutexKind {
        self.kind
    }

    /// Identity reported to the observer; the mutex's address.
    #[must_use]
    pub fn id(&self) -> usize {
        self as *const Self as usize
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    fn owned_by(&self, tid: i32) -> bool {
        self.owner.load(Ordering::Relaxed) == tid
    }

    /// Relock by the current owner. `None` means fall through to the futex.
    fn relock(&self, tid: i32) -> Option<Result<(), ThreadError>> {
        if !self.owned_by(tid) {
            return None;
        }
        match self.kind {
            MutexKind::Normal => None,
            MutexKind::ErrorCheck => Some(Err(ThreadError::Deadlock)),
            MutexKind::Recursive => {
                let depth = self.depth.load(Ordering::Relaxed);
                if depth == u32::MAX {
                    return Some(Err(ThreadError::ResourceExhausted("recursion depth")));
                }
                self.depth.store(depth + 1, Ordering::Relaxed);
                lockorder::on_lock(self.id());
                Some(Ok(()))
            }
        }
    }

    fn acquired(&self, tid: i32) {
        self.owner.store(tid, Ordering::Relaxed);
        self.depth.store(0, Ordering::Relaxed);
        lockorder::on_lock(self.id());
    }

    pub fn lock(&self) -> Result<(), ThreadError> {
        let tid = syscall::sys_gettid();
        if let Some(result) = self.relock(tid) {
            return result;
        }
        self.raw.lock();
        self.acquired(tid);
        Ok(())
    }

    /// Like [`lock`](Self::lock) but fails with `Busy` instead of waiting.
    pub fn try_lock(&self) -> Result<(), ThreadError> {
        let tid = syscall::sys_gettid();
        if let Some(result) = self.relock(tid) {
            return result.map_err(|e| match e {
                ThreadError::Deadlock => ThreadError::Busy,
                other => other,
            });
        }
        if !self.raw.try_lock() {
            return Err(ThreadError::Busy);
        }
        self.acquired(tid);
        Ok(())
    }

    #[allow(unsafe_code)]
    pub fn unlock(&self) -> Result<(), ThreadError> {
        let tid = syscall::sys_gettid();
        let owned = self.owned_by(tid);
        match self.kind {
            MutexKind::Recursive | MutexKind::ErrorCheck if !owned => {
                return Err(ThreadError::NotOwner);
            }
            MutexKind::Normal if !self.raw.is_locked() => {
                return Err(ThreadError::NotOwner);
            }
            _ => {}
        }
        lockorder::on_unlock(self.id());
        if owned {
            let depth = self.depth.load(Ordering::Relaxed);
            if depth > 0 {
                self.depth.store(depth - 1, Ordering::Relaxed);
                return Ok(());
            }
            self.owner.store(0, Ordering::Relaxed);
        }
        // A foreign unlock of a normal mutex leaves `owner` to the holder; the
        // next acquisition overwrites it.
        // SAFETY: the mutex is held; owner checks above cover the kinds that
        // promise them.
        unsafe { self.raw.unlock() };
        Ok(())
    }
}

impl Default for GuardedMutex {
    fn default() -> Self {
        Self::new(MutexKind::Normal)
    }
}

impl core::fmt::Debug for GuardedMutex {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GuardedMutex")
            .field("kind", &self.kind)
            .field("owner", &self.owner.load(Ordering::Relaxed))
            .finish()
    }
}
