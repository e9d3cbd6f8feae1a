//! Thread region allocation and layout.
//!
//! One mapping per thread, low to high:
//!
//! ```text
//! base                                                         base + size
//! | guard (PROT_NONE) | stack, grows down -> | TLS block | control block |
//! ```
//!
//! Runtime-owned regions put the control block on its own page(s) at the top.
//! Caller-supplied stacks are borrowed: laid out the same way (without a
//! guard) and never unmapped.

use core::mem::size_of;

use super::thread::ThreadControl;
use super::tls::TlsBlock;
use crate::error::ThreadError;
use crate::syscall;

pub const PAGE_SIZE: usize = 4096;

const STACK_ALIGN: usize = 16;

/// Round `n` up to a page multiple, or `None` on overflow.
#[must_use]
pub const fn page_round_up(n: usize) -> Option<usize> {
    match n.checked_add(PAGE_SIZE - 1) {
        Some(v) => Some(v & !(PAGE_SIZE - 1)),
        None => None,
    }
}

/// A thread's backing memory, owned or borrowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadRegion {
    base: usize,
    size: usize,
    guard_size: usize,
    owned: bool,
}

impl ThreadRegion {
    /// Map a fresh `guard + stack` region with the guard prefix inaccessible.
    ///
    /// Both sizes are rounded up to the page size. On any failure everything
    /// mapped so far is unmapped again.
    #[allow(unsafe_code)]
    pub fn allocate(stack_size: usize, guard_size: usize) -> Result<Self, ThreadError> {
        let exhausted = ThreadError::ResourceExhausted("thread stack");
        let stack_size = page_round_up(stack_size).ok_or(exhausted)?;
        let guard_size = page_round_up(guard_size).ok_or(exhausted)?;
        let size = stack_size.checked_add(guard_size).ok_or(exhausted)?;

        // SAFETY: fresh anonymous mapping at a kernel-chosen address.
        let base = match unsafe {
            syscall::sys_mmap(
                core::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_STACK,
                -1,
                0,
            )
        } {
            Ok(base) => base,
            Err(errno) => {
                log_warn!(
                    "strand",
                    "create_thread failed: couldn't allocate {size}-byte stack: errno {errno}"
                );
                return Err(exhausted);
            }
        };

        if guard_size > 0 {
            // SAFETY: `base` starts the mapping we own; guard_size <= size.
            if let Err(errno) = unsafe { syscall::sys_mprotect(base, guard_size, libc::PROT_NONE) } {
                log_warn!(
                    "strand",
                    "create_thread failed: couldn't mprotect PROT_NONE {guard_size}-byte stack guard: errno {errno}"
                );
                // SAFETY: nothing else refers to the mapping yet.
                let _ = unsafe { syscall::sys_munmap(base, size) };
                return Err(exhausted);
            }
        }

        Ok(Self {
            base: base as usize,
            size,
            guard_size,
            owned: true,
        })
    }

    /// Describe a caller-supplied stack. Never unmapped by the runtime.
    #[must_use]
    pub const fn borrowed(base: usize, size: usize) -> Self {
        Self {
            base,
            size,
            guard_size: 0,
            owned: false,
        }
    }

    /// Unmap an owned region; borrowed regions are left alone.
    #[allow(unsafe_code)]
    pub fn release(self) {
        if self.owned {
            // SAFETY: owned regions come from `allocate` and have no users left.
            let _ = unsafe { syscall::sys_munmap(self.base as *mut u8, self.size) };
        }
    }

    #[must_use]
    pub const fn base(&self) -> usize {
        self.base
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub const fn guard_size(&self) -> usize {
        self.guard_size
    }

    #[must_use]
    pub const fn is_owned(&self) -> bool {
        self.owned
    }

    /// Lowest usable stack address (just above the guard).
    #[must_use]
    pub const fn stack_base(&self) -> usize {
        self.base + self.guard_size
    }

    /// Lay the region out for a new thread.
    pub fn layout(&self) -> Result<RegionLayout, ThreadError> {
        RegionLayout::compute(self.stack_base(), self.size - self.guard_size, self.owned)
    }
}

/// Addresses of the pieces carved out of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLayout {
    pub control: usize,
    pub tls: usize,
    pub stack_top: usize,
    pub stack_base: usize,
}

impl RegionLayout {
    /// Place the control block at the top of `[base, base + size)`, the TLS
    /// block right below it and a 16-byte aligned stack top below that.
    pub fn compute(base: usize, size: usize, owned: bool) -> Result<Self, ThreadError> {
        Self::compute_for(
            base,
            size,
            owned,
            size_of::<ThreadControl>(),
            size_of::<TlsBlock>(),
        )
    }

    fn compute_for(
        base: usize,
        size: usize,
        owned: bool,
        control_size: usize,
        tls_size: usize,
    ) -> Result<Self, ThreadError> {
        let too_small = ThreadError::InvalidArgument("stack too small for thread metadata");
        let top = base.checked_add(size).ok_or(too_small)?;
        let control_align = if owned { PAGE_SIZE } else { STACK_ALIGN };
        let control = top.checked_sub(control_size).ok_or(too_small)? & !(control_align - 1);
        let tls = control.checked_sub(tls_size).ok_or(too_small)? & !(STACK_ALIGN - 1);
        let stack_top = tls & !(STACK_ALIGN - 1);
        if stack_top <= base {
            return Err(too_small);
        }
        Ok(Self {
            control,
            tls,
            stack_top,
            stack_base: base,
        })
    }

    #[must_use]
    pub const fn usable_stack(&self) -> usize {
        self.stack_top - self.stack_base
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;

    #[test]
    fn page_rounding() {
        assert_eq!(page_round_up(0), Some(0));
        assert_eq!(page_round_up(1), Some(PAGE_SIZE));
        assert_eq!(page_round_up(PAGE_SIZE), Some(PAGE_SIZE));
        assert_eq!(page_round_up(usize::MAX), None);
    }

    #[test]
    fn allocate_rounds_and_maps_writable_stack() {
        let region = ThreadRegion::allocate(64 * 1024 + 1, 1).unwrap();
        assert!(region.is_owned());
        assert_eq!(region.guard_size(), PAGE_SIZE);
        assert_eq!(region.size(), 64 * 1024 + 2 * PAGE_SIZE);
        assert_eq!(region.base() % PAGE_SIZE, 0);

        let layout = region.layout().unwrap();
        // SAFETY: stack_top - 8 lies inside the writable part of the mapping.
        unsafe {
            let probe = (layout.stack_top - 8) as *mut u64;
            probe.write(0xdead_beef);
            assert_eq!(probe.read(), 0xdead_beef);
        }
        region.release();
    }

    #[test]
    fn owned_layout_puts_control_on_its_own_page() {
        let layout = RegionLayout::compute(0x10_0000, 16 * PAGE_SIZE, true).unwrap();
        assert_eq!(layout.control % PAGE_SIZE, 0);
        assert!(layout.control + size_of::<ThreadControl>() <= 0x10_0000 + 16 * PAGE_SIZE);
        assert!(layout.tls + size_of::<TlsBlock>() <= layout.control);
        assert_eq!(layout.stack_top % 16, 0);
        assert!(layout.stack_top <= layout.tls);
        assert_eq!(layout.stack_base, 0x10_0000);
    }

    #[test]
    fn borrowed_layout_is_only_sixteen_byte_aligned() {
        let base = 0x20_0010;
        let size = 8 * PAGE_SIZE + 40;
        let layout = RegionLayout::compute(base, size, false).unwrap();
        assert_eq!(layout.control % 16, 0);
        assert!(layout.control + size_of::<ThreadControl>() <= base + size);
        assert!(base + size - layout.control < PAGE_SIZE);
        assert_eq!(layout.stack_top % 16, 0);
    }

    #[test]
    fn tiny_region_is_rejected() {
        let err = RegionLayout::compute(0x1000, 64, false).unwrap_err();
        assert_eq!(err.errno(), libc::EINVAL);
        let err = RegionLayout::compute_for(0x1000, 256, false, 128, 128).unwrap_err();
        assert_eq!(err.errno(), libc::EINVAL);
    }

    #[test]
    fn borrowed_release_leaves_memory_mapped() {
        let backing = ThreadRegion::allocate(4 * PAGE_SIZE, 0).unwrap();
        let borrowed = ThreadRegion::borrowed(backing.base(), backing.size());
        assert!(!borrowed.is_owned());
        borrowed.release();
        // SAFETY: the owned mapping is still alive.
        unsafe {
            let p = backing.base() as *mut u8;
            p.write(1);
            assert_eq!(p.read(), 1);
        }
        backing.release();
    }

    #[test]
    fn absurd_size_is_resource_exhaustion() {
        let err = ThreadRegion::allocate(usize::MAX - PAGE_SIZE, PAGE_SIZE).unwrap_err();
        assert_eq!(err.errno(), libc::EAGAIN);
    }
}
