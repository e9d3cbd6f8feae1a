//! Raw Linux x86_64 syscall veneer.
//!
//! Typed wrappers over the inline-assembly primitives in [`raw`]. Every
//! wrapper returns `Result<_, i32>` with the positive errno on failure and
//! never touches `errno`, so threads created by this crate (whose thread
//! register points at a bare TLS block) can call them freely.
//!
//! # Safety
//!
//! The kernel trusts the caller for pointer validity. Wrappers that take
//! pointers are `unsafe`; the rest are safe to call with any value.

#[allow(unsafe_code)]
mod raw;

pub use raw::munmap_and_exit;

pub const SYS_READ: usize = 0;
pub const SYS_WRITE: usize = 1;
pub const SYS_CLOSE: usize = 3;
pub const SYS_MMAP: usize = 9;
pub const SYS_MPROTECT: usize = 10;
pub const SYS_MUNMAP: usize = 11;
pub const SYS_RT_SIGPROCMASK: usize = 14;
pub const SYS_GETPID: usize = 39;
pub const SYS_CLONE: usize = 56;
pub const SYS_EXIT: usize = 60;
pub const SYS_GETRLIMIT: usize = 97;
pub const SYS_SIGALTSTACK: usize = 131;
pub const SYS_SCHED_SETSCHEDULER: usize = 144;
pub const SYS_GETTID: usize = 186;
pub const SYS_FUTEX: usize = 202;
pub const SYS_SCHED_SETAFFINITY: usize = 203;
pub const SYS_SET_TID_ADDRESS: usize = 218;
pub const SYS_OPENAT: usize = 257;

const MAX_ERRNO: usize = 4095;

/// Convert a raw syscall return value to `Result<usize, i32>`.
///
/// Errors come back as `-errno`, i.e. the top 4095 values of `usize`.
#[inline]
pub fn syscall_result(ret: usize) -> Result<usize, i32> {
    if ret > usize::MAX - MAX_ERRNO {
        Err(-(ret as isize) as i32)
    } else {
        Ok(ret)
    }
}

/// # Safety
///
/// `buf` must be writable for `count` bytes.
#[inline]
#[allow(unsafe_code)]
pub unsafe fn sys_read(fd: i32, buf: *mut u8, count: usize) -> Result<usize, i32> {
    // SAFETY: caller guarantees buf validity.
    let ret = unsafe { raw::syscall3(SYS_READ, fd as usize, buf as usize, count) };
    syscall_result(ret)
}

/// # Safety
///
/// `buf` must be readable for `count` bytes.
#[inline]
#[allow(unsafe_code)]
pub unsafe fn sys_write(fd: i32, buf: *const u8, count: usize) -> Result<usize, i32> {
    // SAFETY: caller guarantees buf validity.
    let ret = unsafe { raw::syscall3(SYS_WRITE, fd as usize, buf as usize, count) };
    syscall_result(ret)
}

/// `openat(dirfd, path, flags, mode)`.
///
/// # Safety
///
/// `path` must be NUL-terminated.
#[inline]
#[allow(unsafe_code)]
pub unsafe fn sys_openat(dirfd: i32, path: *const u8, flags: i32, mode: u32) -> Result<i32, i32> {
    // SAFETY: caller guarantees path is a C string.
    let ret = unsafe {
        raw::syscall4(
            SYS_OPENAT,
            dirfd as usize,
            path as usize,
            flags as usize,
            mode as usize,
        )
    };
    syscall_result(ret).map(|v| v as i32)
}

#[inline]
#[allow(unsafe_code)]
pub fn sys_close(fd: i32) -> Result<(), i32> {
    // SAFETY: a bad fd only yields EBADF.
    let ret = unsafe { raw::syscall1(SYS_CLOSE, fd as usize) };
    syscall_result(ret).map(|_| ())
}

/// `mmap(addr, length, prot, flags, fd, offset)`.
///
/// # Safety
///
/// A fixed mapping replaces whatever was there; callers must own the range.
#[inline]
#[allow(unsafe_code)]
pub unsafe fn sys_mmap(
    addr: *mut u8,
    length: usize,
    prot: i32,
    flags: i32,
    fd: i32,
    offset: i64,
) -> Result<*mut u8, i32> {
    // SAFETY: caller is responsible for mapping validity.
    let ret = unsafe {
        raw::syscall6(
            SYS_MMAP,
            addr as usize,
            length,
            prot as usize,
            flags as usize,
            fd as usize,
            offset as usize,
        )
    };
    syscall_result(ret).map(|v| v as *mut u8)
}

/// # Safety
///
/// No live references may point into `[addr, addr + length)`.
#[inline]
#[allow(unsafe_code)]
pub unsafe fn sys_munmap(addr: *mut u8, length: usize) -> Result<(), i32> {
    // SAFETY: caller guarantees the range is unused.
    let ret = unsafe { raw::syscall2(SYS_MUNMAP, addr as usize, length) };
    syscall_result(ret).map(|_| ())
}

/// # Safety
///
/// `addr` must be page-aligned and the range mapped and owned by the caller.
#[inline]
#[allow(unsafe_code)]
pub unsafe fn sys_mprotect(addr: *mut u8, length: usize, prot: i32) -> Result<(), i32> {
    // SAFETY: caller guarantees addr/length validity.
    let ret = unsafe { raw::syscall3(SYS_MPROTECT, addr as usize, length, prot as usize) };
    syscall_result(ret).map(|_| ())
}

/// `futex(uaddr, op, val, timeout, uaddr2, val3)`.
///
/// # Safety
///
/// `uaddr` must point to a live, aligned `u32`.
#[inline]
#[allow(unsafe_code)]
pub unsafe fn sys_futex(
    uaddr: *const u32,
    futex_op: i32,
    val: u32,
    timeout: usize,
    uaddr2: usize,
    val3: u32,
) -> Result<isize, i32> {
    // SAFETY: caller guarantees uaddr validity.
    let ret = unsafe {
        raw::syscall6(
            SYS_FUTEX,
            uaddr as usize,
            futex_op as usize,
            val as usize,
            timeout,
            uaddr2,
            val3 as usize,
        )
    };
    syscall_result(ret).map(|v| v as isize)
}

#[inline]
#[allow(unsafe_code)]
pub fn sys_getpid() -> i32 {
    // SAFETY: no preconditions.
    unsafe { raw::syscall0(SYS_GETPID) as i32 }
}

#[inline]
#[allow(unsafe_code)]
pub fn sys_gettid() -> i32 {
    // SAFETY: no preconditions.
    unsafe { raw::syscall0(SYS_GETTID) as i32 }
}

/// Terminate the calling kernel task only.
#[inline]
#[allow(unsafe_code)]
pub fn sys_exit_thread(status: i32) -> ! {
    // SAFETY: SYS_EXIT ends the calling task.
    unsafe { raw::syscall1(SYS_EXIT, status as usize) };
    loop {
        core::hint::spin_loop();
    }
}

/// `set_tid_address(tidptr)`; returns the caller's tid.
///
/// # Safety
///
/// `tidptr` must stay valid until the task exits, or be null.
#[inline]
#[allow(unsafe_code)]
pub unsafe fn sys_set_tid_address(tidptr: *mut i32) -> i32 {
    // SAFETY: caller guarantees tidptr lifetime.
    unsafe { raw::syscall1(SYS_SET_TID_ADDRESS, tidptr as usize) as i32 }
}

/// `rt_sigprocmask(how, set, oldset, 8)` over a 64-bit kernel sigset.
#[inline]
#[allow(unsafe_code)]
pub fn sys_rt_sigprocmask(how: i32, set: Option<&u64>, old: Option<&mut u64>) -> Result<(), i32> {
    let set_ptr = set.map_or(0, |s| s as *const u64 as usize);
    let old_ptr = old.map_or(0, |o| o as *mut u64 as usize);
    // SAFETY: both pointers come from live references or are null.
    let ret = unsafe { raw::syscall4(SYS_RT_SIGPROCMASK, how as usize, set_ptr, old_ptr, 8) };
    syscall_result(ret).map(|_| ())
}

/// Kernel `stack_t` for `sigaltstack`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SignalStack {
    pub ss_sp: usize,
    pub ss_flags: i32,
    pub ss_size: usize,
}

#[inline]
#[allow(unsafe_code)]
pub fn sys_sigaltstack(ss: Option<&SignalStack>, old: Option<&mut SignalStack>) -> Result<(), i32> {
    let ss_ptr = ss.map_or(0, |s| s as *const SignalStack as usize);
    let old_ptr = old.map_or(0, |o| o as *mut SignalStack as usize);
    // SAFETY: both pointers come from live references or are null.
    let ret = unsafe { raw::syscall2(SYS_SIGALTSTACK, ss_ptr, old_ptr) };
    syscall_result(ret).map(|_| ())
}

#[inline]
#[allow(unsafe_code)]
pub fn sys_sched_setscheduler(tid: i32, policy: i32, priority: i32) -> Result<(), i32> {
    let param = priority;
    // SAFETY: `param` is a live `struct sched_param` (a single int).
    let ret = unsafe {
        raw::syscall3(
            SYS_SCHED_SETSCHEDULER,
            tid as usize,
            policy as usize,
            &param as *const i32 as usize,
        )
    };
    syscall_result(ret).map(|_| ())
}

#[inline]
#[allow(unsafe_code)]
pub fn sys_sched_setaffinity(tid: i32, mask: &[u64]) -> Result<(), i32> {
    // SAFETY: the mask slice is live for the call.
    let ret = unsafe {
        raw::syscall3(
            SYS_SCHED_SETAFFINITY,
            tid as usize,
            core::mem::size_of_val(mask),
            mask.as_ptr() as usize,
        )
    };
    syscall_result(ret).map(|_| ())
}

/// `getrlimit(resource)` as `(soft, hard)`.
#[inline]
#[allow(unsafe_code)]
pub fn sys_getrlimit(resource: i32) -> Result<(u64, u64), i32> {
    let mut limit = [0u64; 2];
    // SAFETY: `limit` has the layout of `struct rlimit`.
    let ret = unsafe { raw::syscall2(SYS_GETRLIMIT, resource as usize, limit.as_mut_ptr() as usize) };
    syscall_result(ret).map(|_| (limit[0], limit[1]))
}

/// Launch a kernel task with `clone`.
///
/// The child starts on `child_sp`, which must hold the entry function pointer
/// (`unsafe extern "C" fn(usize) -> usize`) followed by its argument. The
/// child pops both, calls the function on a 16-byte aligned stack and exits
/// with its return value. The parent gets the child's tid.
///
/// # Safety
///
/// `child_sp` must be prepared as above on a stack that outlives the child;
/// `parent_tid`/`child_tid` must be valid when the matching flags are set.
#[inline]
#[allow(unsafe_code)]
pub unsafe fn sys_clone_thread(
    flags: usize,
    child_sp: usize,
    parent_tid: *mut i32,
    child_tid: *mut i32,
    tls: usize,
) -> Result<i32, i32> {
    // SAFETY: forwarded to the caller.
    let ret = unsafe {
        raw::clone_thread_asm(flags, child_sp, parent_tid as usize, child_tid as usize, tls)
    };
    syscall_result(ret).map(|v| v as i32)
}
