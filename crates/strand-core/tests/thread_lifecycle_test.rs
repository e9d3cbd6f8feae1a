#![cfg(all(target_os = "linux", target_arch = "x86_64"))]
#![allow(unsafe_code)]

//! Creation, join, detach and attribute queries against real runtime threads.
//!
//! Start routines run on a bare TLS block, so they only touch atomics, futex
//! locks and the runtime's own thread functions.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::lock_api::RawMutex as _;
use strand_core::pthread::{
    CleanupHandler, DetachState, FutexMutex, JoinState, MIN_STACK_SIZE, PAGE_SIZE, REGISTRY,
    RawFutexMutex, TLS_SLOT_SELF, TLS_SLOT_STACK_GUARD, TLS_SLOT_THREAD_ID, ThreadAttr,
    ThreadHandle, cleanup_pop, cleanup_push, create_thread, current_stack_guard, detach_thread,
    exit_thread, get_attributes, join_thread, main_thread, self_thread, thread_pointer,
};
use strand_core::ThreadError;

fn wait_until(label: &str, timeout: Duration, mut done: impl FnMut() -> bool) {
    let start = Instant::now();
    while !done() {
        if start.elapsed() > timeout {
            panic!("timeout waiting for {label}");
        }
        std::thread::yield_now();
    }
}

fn gone(handle: ThreadHandle) -> bool {
    !REGISTRY.contains(handle.as_raw())
}

#[test]
fn stack_below_minimum_is_rejected_before_allocation() {
    let mut attr = ThreadAttr::new();
    for size in [0, 1, MIN_STACK_SIZE - 1] {
        assert_eq!(
            attr.set_stack_size(size).map_err(|e| e.errno()),
            Err(libc::EINVAL)
        );
    }
    assert_eq!(
        attr.set_stack(PAGE_SIZE * 16, 0).map_err(|e| e.errno()),
        Err(libc::EINVAL)
    );
    assert_eq!(
        attr.set_stack(PAGE_SIZE * 16 + 8, MIN_STACK_SIZE)
            .map_err(|e| e.errno()),
        Err(libc::EINVAL)
    );
    // The rejected calls left the attributes untouched.
    assert_eq!(attr, ThreadAttr::new());
}

static SENTINEL: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn write_sentinel(arg: usize) -> usize {
    SENTINEL.store(arg, Ordering::SeqCst);
    arg + 1
}

#[test]
fn joined_thread_leaves_sentinel_and_registry_entry_goes_away() {
    // SAFETY: `write_sentinel` only stores to an atomic.
    let handle = unsafe { create_thread(None, write_sentinel, 0xC0FFEE) }.expect("create");
    assert!(REGISTRY.contains(handle.as_raw()));
    assert_eq!(join_thread(handle), Ok(0xC0FFEF));
    assert_eq!(SENTINEL.load(Ordering::SeqCst), 0xC0FFEE);
    assert!(gone(handle));
    assert_eq!(join_thread(handle), Err(ThreadError::NoSuchThread));
}

static SPAWN_GATE: FutexMutex<()> = FutexMutex::const_new(RawFutexMutex::INIT, ());

unsafe extern "C" fn wait_at_spawn_gate(arg: usize) -> usize {
    drop(SPAWN_GATE.lock());
    arg
}

#[test]
fn concurrent_creators_get_distinct_registry_entries() {
    let gate = SPAWN_GATE.lock();
    let creators: Vec<_> = (0..4)
        .map(|c| {
            std::thread::spawn(move || {
                (0..4)
                    .map(|i| {
                        // SAFETY: `wait_at_spawn_gate` only takes a futex lock.
                        unsafe { create_thread(None, wait_at_spawn_gate, c * 10 + i) }
                            .expect("create")
                            .as_raw()
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    let handles: Vec<usize> = creators
        .into_iter()
        .flat_map(|h| h.join().expect("creator"))
        .collect();

    let distinct: HashSet<_> = handles.iter().copied().collect();
    assert_eq!(distinct.len(), 16);
    for &h in &handles {
        assert!(REGISTRY.contains(h));
        let tid = ThreadHandle::from_raw(h).kernel_tid().expect("registered");
        assert!(tid > 0);
    }

    drop(gate);
    let mut sum = 0;
    for &h in &handles {
        sum += join_thread(ThreadHandle::from_raw(h)).expect("join");
        assert!(!REGISTRY.contains(h));
    }
    assert_eq!(sum, (0..4).map(|c| (0..4).map(|i| c * 10 + i).sum::<usize>()).sum());
}

unsafe extern "C" fn touch_stack(arg: usize) -> usize {
    let local = [arg; 64];
    local.iter().sum()
}

#[test]
fn caller_stack_is_not_released() {
    let size = 64 * 1024;
    // SAFETY: fresh anonymous mapping owned by this test.
    let base = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    assert_ne!(base, libc::MAP_FAILED);
    let marker = base.cast::<u64>();
    // SAFETY: inside the mapping, far below anything the thread touches.
    unsafe { marker.write_volatile(0xFEED_FACE) };

    let mut attr = ThreadAttr::new();
    attr.set_stack(base as usize, size).expect("stack");
    // SAFETY: `touch_stack` only uses its own stack.
    let handle = unsafe { create_thread(Some(&attr), touch_stack, 2) }.expect("create");
    assert_eq!(join_thread(handle), Ok(128));

    // Still mapped and untouched after the thread is gone.
    // SAFETY: the runtime never unmaps a caller stack.
    assert_eq!(unsafe { marker.read_volatile() }, 0xFEED_FACE);
    // The same memory can host another thread.
    // SAFETY: `touch_stack` only uses its own stack.
    let again = unsafe { create_thread(Some(&attr), touch_stack, 1) }.expect("create again");
    assert_eq!(join_thread(again), Ok(64));

    // SAFETY: no thread uses the mapping any more.
    assert_eq!(unsafe { libc::munmap(base, size) }, 0);
}

static CLEANUP_ORDER: AtomicUsize = AtomicUsize::new(0);

fn record_cleanup(step: usize) {
    let _ = CLEANUP_ORDER.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v * 10 + step));
}

unsafe extern "C" fn with_cleanup_handlers(_: usize) -> usize {
    let mut first = CleanupHandler::new(record_cleanup, 1);
    let mut second = CleanupHandler::new(record_cleanup, 2);
    let mut third = CleanupHandler::new(record_cleanup, 3);
    // SAFETY: the handlers live on this frame until the thread exits.
    unsafe {
        let _ = cleanup_push(&mut first);
        let _ = cleanup_push(&mut second);
        let _ = cleanup_push(&mut third);
    }
    let _ = cleanup_pop(true);
    let _ = cleanup_pop(false);
    // `first` runs on the way out.
    5
}

#[test]
fn cleanup_handlers_run_lifo_on_exit() {
    // SAFETY: cleanup handlers only update an atomic.
    let handle = unsafe { create_thread(None, with_cleanup_handlers, 0) }.expect("create");
    assert_eq!(join_thread(handle), Ok(5));
    assert_eq!(CLEANUP_ORDER.load(Ordering::SeqCst), 31);
}

unsafe extern "C" fn exit_early(arg: usize) -> usize {
    let _ = exit_thread(arg * 3);
    0
}

#[test]
fn exit_thread_value_reaches_joiner() {
    // SAFETY: `exit_early` only calls `exit_thread`.
    let handle = unsafe { create_thread(None, exit_early, 7) }.expect("create");
    assert_eq!(join_thread(handle), Ok(21));
}

static SELF_SEEN: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn report_self(_: usize) -> usize {
    SELF_SEEN.store(self_thread().map_or(0, ThreadHandle::as_raw), Ordering::SeqCst);
    0
}

#[test]
fn self_thread_matches_handle() {
    // SAFETY: `report_self` only queries the registry and stores to an atomic.
    let handle = unsafe { create_thread(None, report_self, 0) }.expect("create");
    join_thread(handle).expect("join");
    assert_eq!(SELF_SEEN.load(Ordering::SeqCst), handle.as_raw());
}

static REGISTER_GATE: FutexMutex<()> = FutexMutex::const_new(RawFutexMutex::INIT, ());
static CHILD_POINTER: AtomicUsize = AtomicUsize::new(0);
static CHILD_GUARD: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn report_thread_register(_: usize) -> usize {
    CHILD_POINTER.store(thread_pointer(), Ordering::SeqCst);
    CHILD_GUARD.store(current_stack_guard(), Ordering::SeqCst);
    drop(REGISTER_GATE.lock());
    0
}

#[test]
fn thread_register_points_at_own_tls_block() {
    let gate = REGISTER_GATE.lock();
    // SAFETY: `report_thread_register` reads fs, stores to atomics and takes
    // a futex lock.
    let handle = unsafe { create_thread(None, report_thread_register, 0) }.expect("create");
    wait_until("child to report its register", Duration::from_secs(10), || {
        CHILD_POINTER.load(Ordering::SeqCst) != 0
    });

    let block = handle
        .tls_slot(TLS_SLOT_SELF)
        .expect("registered")
        .expect("slot");
    assert_eq!(CHILD_POINTER.load(Ordering::SeqCst), block);
    assert_ne!(block, thread_pointer());
    assert_eq!(
        handle.tls_slot(TLS_SLOT_STACK_GUARD),
        Ok(Some(current_stack_guard()))
    );
    assert_eq!(CHILD_GUARD.load(Ordering::SeqCst), current_stack_guard());

    drop(gate);
    assert_eq!(join_thread(handle), Ok(0));
}

static DETACH_GATE:FutexMutex<()> = FutexMutex::const_new(RawFutexMutex::INIT, ());

unsafe extern "C" fn wait_at_detach_gate(_: usize) -> usize {
    drop(DETACH_GATE.lock());
    0
}

unsafe extern "C" fn return_at_once(arg: usize) -> usize {
    arg
}

#[test]
fn detach_running_thread_reclaims_on_exit() {
    let gate = DETACH_GATE.lock();
    // SAFETY: `wait_at_detach_gate` only takes a futex lock.
    let handle = unsafe { create_thread(None, wait_at_detach_gate, 0) }.expect("create");
    assert_eq!(detach_thread(handle), Ok(()));
    assert_eq!(handle.join_state(), Ok(JoinState::Detached));
    assert!(join_thread(handle).is_err());
    assert!(detach_thread(handle).is_err());
    drop(gate);
    wait_until("detached thread to reclaim itself", Duration::from_secs(10), || {
        gone(handle)
    });
}

#[test]
fn detach_after_exit_reaps_immediately() {
    // SAFETY: `return_at_once` does nothing but return.
    let handle = unsafe { create_thread(None, return_at_once, 1) }.expect("create");
    wait_until("thread to finish", Duration::from_secs(10), || {
        handle.join_state() == Ok(JoinState::ExitedNotJoined)
    });
    assert_eq!(detach_thread(handle), Ok(()));
    assert!(gone(handle));
}

#[test]
fn created_detached_thread_cleans_up_after_itself() {
    let mut attr = ThreadAttr::new();
    attr.set_detach_state(DetachState::Detached);
    // SAFETY: `return_at_once` does nothing but return.
    let handle = unsafe { create_thread(Some(&attr), return_at_once, 0) }.expect("create");
    wait_until("detached thread to exit", Duration::from_secs(10), || {
        gone(handle)
    });
    assert_eq!(join_thread(handle), Err(ThreadError::NoSuchThread));
}

static ATTR_GATE: FutexMutex<()> = FutexMutex::const_new(RawFutexMutex::INIT, ());

unsafe extern "C" fn wait_at_attr_gate(_: usize) -> usize {
    drop(ATTR_GATE.lock());
    0
}

#[test]
fn attributes_of_a_live_thread() {
    let mut attr = ThreadAttr::new();
    attr.set_stack_size(256 * 1024).expect("size");
    attr.set_guard_size(2 * PAGE_SIZE);
    let gate = ATTR_GATE.lock();
    // SAFETY: `wait_at_attr_gate` only takes a futex lock.
    let handle = unsafe { create_thread(Some(&attr), wait_at_attr_gate, 0) }.expect("create");

    let seen = get_attributes(handle).expect("attributes");
    assert_eq!(seen.detach_state(), DetachState::Joinable);
    assert_eq!(seen.guard_size(), 2 * PAGE_SIZE);
    let (base, size) = seen.stack();
    assert_ne!(base, 0);
    assert!(size > 0 && size <= 256 * 1024);
    assert_eq!(base % PAGE_SIZE, 0);
    assert_eq!(handle.tls_slot(TLS_SLOT_THREAD_ID), Ok(Some(handle.as_raw())));

    detach_thread(handle).expect("detach");
    let seen = get_attributes(handle).expect("attributes after detach");
    assert_eq!(seen.detach_state(), DetachState::Detached);
    drop(gate);
    wait_until("thread to exit", Duration::from_secs(10), || gone(handle));
    assert_eq!(get_attributes(handle), Err(ThreadError::NoSuchThread));
}

#[test]
fn initial_thread_is_described_but_not_joinable() {
    let main = main_thread().expect("main thread");
    assert_eq!(main_thread(), Ok(main));
    let attr = get_attributes(main).expect("main attributes");
    let (base, size) = attr.stack();
    assert!(size > 0);
    assert!(base > 0);
    assert_eq!(join_thread(main).map_err(|e| e.errno()), Err(libc::EINVAL));
    assert!(detach_thread(main).is_err());
}

#[test]
fn unknown_handle_is_no_such_thread() {
    let bogus = ThreadHandle::from_raw(0x10);
    assert_eq!(join_thread(bogus), Err(ThreadError::NoSuchThread));
    assert_eq!(detach_thread(bogus), Err(ThreadError::NoSuchThread));
    assert_eq!(bogus.kernel_tid(), Err(ThreadError::NoSuchThread));
}
