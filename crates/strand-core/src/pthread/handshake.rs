//! One-shot startup rendezvous between a creator and its new thread.
//!
//! The creator builds the handshake locked, launches the child, publishes
//! the thread and then releases. The child acquires (blocking until the
//! release) and retires it. Release/acquire ordering gives the child a
//! happens-before edge over everything the creator wrote before releasing.

use core::sync::atomic::{AtomicU32, Ordering};

use super::futex::{futex_wait, futex_wake};

const LOCKED: u32 = 0;
const RELEASED: u32 = 1;
const RETIRED: u32 = 2;

#[derive(Debug)]
#[repr(transparent)]
pub struct Handshake {
    state: AtomicU32,
}

impl Handshake {
    #[must_use]
    pub const fn new_locked() -> Self {
        Self {
            state: AtomicU32::new(LOCKED),
        }
    }

    /// Let the waiting side proceed. Idempotent.
    pub fn release(&self) {
        if self
            .state
            .compare_exchange(LOCKED, RELEASED, Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            futex_wake(&self.state, 1);
        }
    }

    /// Block until released, then retire the handshake.
    pub fn acquire_and_retire(&self) {
        while self.state.load(Ordering::Acquire) == LOCKED {
            futex_wait(&self.state, LOCKED);
        }
        self.state.store(RETIRED, Ordering::Release);
    }

    #[must_use]
    pub fn is_retired(&self) -> bool {
        self.state.load(Ordering::Acquire) == RETIRED
    }
}
