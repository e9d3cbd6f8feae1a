//! Per-thread TLS block carved out of the thread region.

pub const TLS_SLOTS: usize = 8;

pub const TLS_SLOT_SELF: usize = 0;
pub const TLS_SLOT_THREAD_ID: usize = 1;
pub const TLS_SLOT_ERRNO: usize = 2;
// 3 and 4 are reserved.
pub const TLS_SLOT_STACK_GUARD: usize = 5;
pub const TLS_SLOT_DLERROR: usize = 6;
pub const TLS_SLOT_SAFESTACK: usize = 7;

/// Fixed array of word-sized slots.
#[repr(C, align(16))]
#[derive(Debug)]
pub struct TlsBlock {
    slots: [usize; TLS_SLOTS],
}

impl TlsBlock {
    /// Zero the block at `addr` and fill the eagerly-initialized slots.
    ///
    /// # Safety
    ///
    /// `addr` must be 16-byte aligned and writable for `size_of::<TlsBlock>()`
    /// bytes, with no other references into that memory.
    #[allow(unsafe_code)]
    pub unsafe fn init_at(addr: usize, control: usize, stack_guard: usize) -> *mut Self {
        let block = addr as *mut Self;
        // SAFETY: forwarded to the caller.
        unsafe {
            block.write(Self {
                slots: [0; TLS_SLOTS],
            });
            let slots = &mut (*block).slots;
            slots[TLS_SLOT_SELF] = addr;
            slots[TLS_SLOT_THREAD_ID] = control;
            slots[TLS_SLOT_STACK_GUARD] = stack_guard;
        }
        block
    }

    #[must_use]
    pub fn slot(&self, index: usize) -> Option<usize> {
        self.slots.get(index).copied()
    }

    pub fn set_slot(&mut self, index: usize, value: usize) -> bool {
        match self.slots.get_mut(index) {
            Some(s) => {
                *s = value;
                true
            }
            None => false,
        }
    }
}

/// Value of the calling thread's register-relative self pointer (`fs:0`).
///
/// For a runtime thread this is the address of its [`TlsBlock`]
/// ([`TLS_SLOT_SELF`] sits at offset 0).
#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
#[allow(unsafe_code)]
#[must_use]
pub fn thread_pointer() -> usize {
    let tp: usize;
    // SAFETY: every thread of this process has fs pointing at a block whose
    // first word is its own address.
    unsafe {
        core::arch::asm!(
            "mov {}, qword ptr fs:0",
            out(reg) tp,
            options(nostack, readonly, preserves_flags),
        );
    }
    tp
}

/// The stack-protector canary of the calling thread.
///
/// Read from `fs:0x28`, which is [`TLS_SLOT_STACK_GUARD`] in a runtime
/// thread's block. The launcher copies the creator's value there, so the
/// canary is the same process-wide.
#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
#[allow(unsafe_code)]
#[must_use]
pub fn current_stack_guard() -> usize {
    let guard: usize;
    // SAFETY: on x86_64 Linux fs points at either the libc thread header or
    // a runtime TLS block; both keep the canary at 0x28.
    unsafe {
        core::arch::asm!(
            "mov {}, qword ptr fs:0x28",
            out(reg) guard,
            options(nostack, readonly, preserves_flags),
        );
    }
    guard
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;

    #[test]
    fn init_sets_well_known_slots_and_zeroes_the_rest() {
        let mut backing = TlsBlock {
            slots: [usize::MAX; TLS_SLOTS],
        };
        let addr = &mut backing as *mut TlsBlock as usize;
        // SAFETY: `backing` is a live, aligned TlsBlock we own exclusively.
        let block = unsafe { &*TlsBlock::init_at(addr, 0x5000, 0xabcd) };
        assert_eq!(block.slot(TLS_SLOT_SELF), Some(addr));
        assert_eq!(block.slot(TLS_SLOT_THREAD_ID), Some(0x5000));
        assert_eq!(block.slot(TLS_SLOT_STACK_GUARD), Some(0xabcd));
        for idx in [TLS_SLOT_ERRNO, 3, 4, TLS_SLOT_DLERROR, TLS_SLOT_SAFESTACK] {
            assert_eq!(block.slot(idx), Some(0), "slot {idx}");
        }
        assert_eq!(block.slot(TLS_SLOTS), None);
    }

    #[test]
    fn set_slot_is_bounds_checked() {
        let mut block = TlsBlock {
            slots: [0; TLS_SLOTS],
        };
        assert!(block.set_slot(TLS_SLOT_ERRNO, 22));
        assert_eq!(block.slot(TLS_SLOT_ERRNO), Some(22));
        assert!(!block.set_slot(99, 1));
    }

    #[test]
    fn stack_guard_is_stable_per_process() {
        assert_eq!(current_stack_guard(), current_stack_guard());
    }

    #[test]
    fn guard_slot_sits_at_the_canary_offset() {
        assert_eq!(TLS_SLOT_SELF * 8, 0);
        assert_eq!(TLS_SLOT_STACK_GUARD * 8, 0x28);
        assert_ne!(thread_pointer(), 0);
    }
}
