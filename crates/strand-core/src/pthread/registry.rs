//! Process-wide registry of live and exited-but-unjoined threads.
//!
//! An intrusive doubly linked list threaded through the control blocks,
//! guarded by one reader/writer lock. Insertion and removal are O(1) under
//! the write lock; lookups scan under the read lock. The lock is a futex
//! rwlock so runtime threads can unregister themselves on exit.

use core::cell::UnsafeCell;
use core::ptr;

use parking_lot::lock_api::RawRwLock as _;

use super::futex::{FutexRwLock, RawFutexRwLock};
use super::thread::ThreadControl;

/// List links embedded in every control block.
#[derive(Debug)]
pub(crate) struct RegistryLinks {
    prev: *mut ThreadControl,
    next: *mut ThreadControl,
    linked: bool,
}

impl RegistryLinks {
    pub(crate) const fn new() -> Self {
        Self {
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
            linked: false,
        }
    }
}

struct ListHead {
    head: *mut ThreadControl,
    len: usize,
}

// SAFETY: the raw pointers are only followed while the registry lock is held.
#[allow(unsafe_code)]
unsafe impl Send for ListHead {}
#[allow(unsafe_code)]
unsafe impl Sync for ListHead {}

pub struct ThreadRegistry {
    list: FutexRwLock<ListHead>,
}

/// The process-wide registry.
pub static REGISTRY: ThreadRegistry = ThreadRegistry::new();

#[allow(unsafe_code)]
fn links_of(tcb: *mut ThreadControl) -> *mut RegistryLinks {
    // SAFETY: callers pass live control blocks and hold the registry lock.
    unsafe { UnsafeCell::raw_get(ptr::addr_of!((*tcb).links)) }
}

#[allow(unsafe_code)]
impl ThreadRegistry {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            list: FutexRwLock::const_new(
                RawFutexRwLock::INIT,
                ListHead {
                    head: ptr::null_mut(),
                    len: 0,
                },
            ),
        }
    }

    /// Link `tcb` at the head. Returns `false` if it was already linked.
    ///
    /// # Safety
    ///
    /// `tcb` must stay valid until it is removed again.
    pub(crate) unsafe fn insert(&self, tcb: *mut ThreadControl) -> bool {
        let mut list = self.list.write();
        // SAFETY: write lock held; tcb is live per the caller.
        unsafe {
            let links = &mut *links_of(tcb);
            if links.linked {
                return false;
            }
            links.prev = ptr::null_mut();
            links.next = list.head;
            links.linked = true;
            if !list.head.is_null() {
                (*links_of(list.head)).prev = tcb;
            }
        }
        list.head = tcb;
        list.len += 1;
        true
    }

    /// Unlink `tcb`. Returns `false` if it was not linked.
    ///
    /// # Safety
    ///
    /// `tcb` must point to a live control block.
    pub(crate) unsafe fn remove(&self, tcb: *mut ThreadControl) -> bool {
        let mut list = self.list.write();
        // SAFETY: write lock held; tcb and its neighbours are live.
        unsafe {
            let links = &mut *links_of(tcb);
            if !links.linked {
                return false;
            }
            if links.prev.is_null() {
                list.head = links.next;
            } else {
                (*links_of(links.prev)).next = links.next;
            }
            if !links.next.is_null() {
                (*links_of(links.next)).prev = links.prev;
            }
            *links = RegistryLinks::new();
        }
        list.len -= 1;
        true
    }

    fn scan<R>(
        head: *mut ThreadControl,
        mut f: impl FnMut(*mut ThreadControl) -> Option<R>,
    ) -> Option<R> {
        let mut cur = head;
        while !cur.is_null() {
            if let Some(r) = f(cur) {
                return Some(r);
            }
            // SAFETY: linked entries are live while the lock is held.
            cur = unsafe { (*links_of(cur)).next };
        }
        None
    }

    /// Whether `addr` is a registered control block.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        let list = self.list.read();
        Self::scan(list.head, |tcb| (tcb as usize == addr).then_some(())).is_some()
    }

    /// Run `f` on the control block at `addr` with the read lock held, so it
    /// cannot be reaped underneath.
    pub(crate) fn with_control<R>(&self, addr: usize, f: impl FnOnce(&ThreadControl) -> R) -> Option<R> {
        let list = self.list.read();
        let found = Self::scan(list.head, |tcb| (tcb as usize == addr).then_some(tcb))?;
        // SAFETY: registered and the read lock is held.
        Some(f(unsafe { &*found }))
    }

    /// Control block address of the thread with kernel id `tid`.
    #[must_use]
    pub fn find_by_tid(&self, tid: i32) -> Option<usize> {
        let list = self.list.read();
        Self::scan(list.head, |tcb| {
            // SAFETY: registered and the read lock is held.
            let t = unsafe { &*tcb };
            (t.is_current_tid(tid)).then_some(tcb as usize)
        })
    }

    /// Control block address of the runtime thread whose TLS block is `tls`.
    #[must_use]
    pub fn find_by_tls(&self, tls: usize) -> Option<usize> {
        if tls == 0 {
            return None;
        }
        let list = self.list.read();
        Self::scan(list.head, |tcb| {
            // SAFETY: registered and the read lock is held.
            let t = unsafe { &*tcb };
            (t.tls_block() as usize == tls).then_some(tcb as usize)
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.list.read().len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of registered kernel tids, newest first. Exited-but-unjoined
    /// threads report 0. Allocates; not for use on runtime threads.
    #[must_use]
    pub fn tids(&self) -> Vec<i32> {
        let list = self.list.read();
        let mut out = Vec::with_capacity(list.len);
        Self::scan(list.head, |tcb| {
            // SAFETY: registered and the read lock is held.
            out.push(unsafe { (*tcb).kernel_tid() });
            None::<()>
        });
        out
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use crate::pthread::thread::ThreadControl;

    fn boxed(tid: i32) -> *mut ThreadControl {
        Box::into_raw(Box::new(ThreadControl::for_tests(tid)))
    }

    fn free(tcb: *mut ThreadControl) {
        // SAFETY: produced by `boxed` and no longer linked.
        drop(unsafe { Box::from_raw(tcb) });
    }

    #[test]
    fn insert_is_head_first_and_remove_tolerates_head() {
        let reg = ThreadRegistry::new();
        let (a, b, c) = (boxed(10), boxed(11), boxed(12));
        // SAFETY: all three outlive their membership.
        unsafe {
            assert!(reg.insert(a));
            assert!(reg.insert(b));
            assert!(reg.insert(c));
            assert!(!reg.insert(b));
        }
        assert_eq!(reg.tids(), vec![12, 11, 10]);
        assert_eq!(reg.len(), 3);

        // SAFETY: live control blocks.
        unsafe {
            assert!(reg.remove(c));
            assert!(!reg.remove(c));
        }
        assert_eq!(reg.tids(), vec![11, 10]);
        assert!(!reg.contains(c as usize));
        assert!(reg.contains(a as usize));

        // SAFETY: live control blocks.
        unsafe {
            assert!(reg.remove(a));
            assert!(reg.remove(b));
        }
        assert!(reg.is_empty());
        for t in [a, b, c] {
            free(t);
        }
    }

    #[test]
    fn middle_removal_relinks_neighbours() {
        let reg = ThreadRegistry::new();
        let (a, b, c) = (boxed(1), boxed(2), boxed(3));
        // SAFETY: all three outlive their membership.
        unsafe {
            reg.insert(a);
            reg.insert(b);
            reg.insert(c);
            assert!(reg.remove(b));
        }
        assert_eq!(reg.tids(), vec![3, 1]);
        assert_eq!(reg.find_by_tid(1), Some(a as usize));
        assert_eq!(reg.find_by_tid(2), None);
        assert_eq!(reg.with_control(c as usize, |t| t.kernel_tid()), Some(3));
        // SAFETY: live control blocks.
        unsafe {
            reg.remove(a);
            reg.remove(c);
        }
        for t in [a, b, c] {
            free(t);
        }
    }

    #[test]
    fn concurrent_insert_remove_keeps_count() {
        use std::sync::Arc;
        let reg = Arc::new(ThreadRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let reg = Arc::clone(&reg);
                std::thread::spawn(move || {
                    let mine: Vec<usize> = (0..100).map(|j| boxed(i * 1000 + j) as usize).collect();
                    for &t in &mine {
                        // SAFETY: freed only after removal below.
                        unsafe { reg.insert(t as *mut ThreadControl) };
                    }
                    for &t in &mine {
                        assert!(reg.contains(t));
                        // SAFETY: still live.
                        assert!(unsafe { reg.remove(t as *mut ThreadControl) });
                        free(t as *mut ThreadControl);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(reg.is_empty());
    }
}
