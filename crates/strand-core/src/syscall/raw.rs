//! Raw x86_64 Linux syscall primitives.
//!
//! Register convention: number in `rax`, arguments in `rdi`, `rsi`, `rdx`,
//! `r10`, `r8`, `r9`; result in `rax` (`-4095..=-1` encodes `-errno`); the
//! kernel clobbers `rcx` and `r11`.
//!
//! None of these touch `errno` or any other thread-local state, which is what
//! makes them usable from threads without a host C library thread header.

use core::arch::asm;

/// # Safety
///
/// `nr` must be a syscall that is sound to issue without arguments.
#[inline]
pub unsafe fn syscall0(nr: usize) -> usize {
    let ret: usize;
    // SAFETY: forwarded to the caller.
    unsafe {
        asm!(
            "syscall",
            inlateout("rax") nr => ret,
            lateout("rcx") _,
            lateout("r11") _,
            options(nostack, preserves_flags),
        );
    }
    ret
}

/// # Safety
///
/// The argument must satisfy the contract of syscall `nr`.
#[inline]
pub unsafe fn syscall1(nr: usize, a1: usize) -> usize {
    let ret: usize;
    // SAFETY: forwarded to the caller.
    unsafe {
        asm!(
            "syscall",
            inlateout("rax") nr => ret,
            in("rdi") a1,
            lateout("rcx") _,
            lateout("r11") _,
            options(nostack, preserves_flags),
        );
    }
    ret
}

/// # Safety
///
/// The arguments must satisfy the contract of syscall `nr`.
#[inline]
pub unsafe fn syscall2(nr: usize, a1: usize, a2: usize) -> usize {
    let ret: usize;
    // SAFETY: forwarded to the caller.
    unsafe {
        asm!(
            "syscall",
            inlateout("rax") nr => ret,
            in("rdi") a1,
            in("rsi") a2,
            lateout("rcx") _,
            lateout("r11") _,
            options(nostack, preserves_flags),
        );
    }
    ret
}

/// # Safety
///
/// The arguments must satisfy the contract of syscall `nr`.
#[inline]
pub unsafe fn syscall3(nr: usize, a1: usize, a2: usize, a3: usize) -> usize {
    let ret: usize;
    // SAFETY: forwarded to the caller.
    unsafe {
        asm!(
            "syscall",
            inlateout("rax") nr => ret,
            in("rdi") a1,
            in("rsi") a2,
            in("rdx") a3,
            lateout("rcx") _,
            lateout("r11") _,
            options(nostack, preserves_flags),
        );
    }
    ret
}

/// # Safety
///
/// The arguments must satisfy the contract of syscall `nr`.
#[inline]
pub unsafe fn syscall4(nr: usize, a1: usize, a2: usize, a3: usize, a4: usize) -> usize {
    let ret: usize;
    // SAFETY: forwarded to the caller.
    unsafe {
        asm!(
            "syscall",
            inlateout("rax") nr => ret,
            in("rdi") a1,
            in("rsi") a2,
            in("rdx") a3,
            in("r10") a4,
            lateout("rcx") _,
            lateout("r11") _,
            options(nostack, preserves_flags),
        );
    }
    ret
}

/// # Safety
///
/// The arguments must satisfy the contract of syscall `nr`.
#[inline]
pub unsafe fn syscall6(
    nr: usize,
    a1: usize,
    a2: usize,
    a3: usize,
    a4: usize,
    a5: usize,
    a6: usize,
) -> usize {
    let ret: usize;
    // SAFETY: forwarded to the caller.
    unsafe {
        asm!(
            "syscall",
            inlateout("rax") nr => ret,
            in("rdi") a1,
            in("rsi") a2,
            in("rdx") a3,
            in("r10") a4,
            in("r8") a5,
            in("r9") a6,
            lateout("rcx") _,
            lateout("r11") _,
            options(nostack, preserves_flags),
        );
    }
    ret
}

/// Execute `clone` with a child trampoline.
///
/// The child stack at `child_sp` must hold the entry function pointer at
/// `[child_sp]` and its argument at `[child_sp + 8]`. The child pops both,
/// realigns, calls the entry with the argument in `rdi`, and issues `SYS_exit`
/// with the low 32 bits of the return value if the entry ever returns.
///
/// The parent receives the child TID in `rax` (positive) or `-errno`.
///
/// # Safety
///
/// - `child_sp` must point into a mapped, writable stack prepared as above.
/// - `parent_tid`/`child_tid` must be valid when the matching flags are set.
/// - With `CLONE_SETTLS`, `tls` must point at a block that stays mapped for
///   the child's lifetime. The entry function must not touch host TLS.
#[inline]
pub unsafe fn clone_thread_asm(
    flags: usize,
    child_sp: usize,
    parent_tid: usize,
    child_tid: usize,
    tls: usize,
) -> usize {
    let ret: usize;
    // SAFETY: caller guarantees the prepared child stack and tid pointers.
    // The child path never falls through to the parent's continuation.
    unsafe {
        asm!(
            "syscall",
            "test rax, rax",
            "jnz 2f",
            // child: rax == 0
            "xor ebp, ebp",
            "pop rax",
            "pop rdi",
            "and rsp, -16",
            "call rax",
            "mov edi, eax",
            "mov eax, 60",
            "syscall",
            "ud2",
            "2:",
            inlateout("rax") 56usize => ret,
            in("rdi") flags,
            in("rsi") child_sp,
            in("rdx") parent_tid,
            in("r10") child_tid,
            in("r8") tls,
            lateout("rcx") _,
            lateout("r11") _,
            options(nostack),
        );
    }
    ret
}

/// Unmap `[base, base + len)` and terminate the calling thread.
///
/// Both syscalls are issued back to back using registers only, so the region
/// being unmapped may contain the caller's own stack.
///
/// # Safety
///
/// `[base, base + len)` must be a mapping owned by the calling thread and no
/// signal handler may run between the two syscalls (block signals first).
#[inline]
pub unsafe fn munmap_and_exit(base: usize, len: usize) -> ! {
    // SAFETY: caller guarantees ownership of the mapping and masked signals.
    unsafe {
        asm!(
            "syscall",
            "xor edi, edi",
            "mov eax, 60",
            "syscall",
            "ud2",
            in("rax") 11usize,
            in("rdi") base,
            in("rsi") len,
            options(noreturn, nostack),
        );
    }
}
