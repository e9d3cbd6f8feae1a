//! Growable arrays backed directly by anonymous mappings.
//!
//! The observer runs inside lock/unlock on runtime threads, which must not
//! enter the host allocator, so its tables live in `MmapVec`s instead of
//! `Vec`s. Growth maps a bigger block, moves the elements and unmaps the old
//! one.

use core::marker::PhantomData;
use core::mem::{align_of, size_of};
use core::ptr::{self, NonNull};

use crate::pthread::PAGE_SIZE;
use crate::syscall;

/// Mapping failed; the vector is unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapFailed(pub i32);

pub struct MmapVec<T> {
    ptr: NonNull<T>,
    len: usize,
    cap: usize,
    _owns: PhantomData<T>,
}

// SAFETY: MmapVec owns its elements like Vec does.
#[allow(unsafe_code)]
unsafe impl<T: Send> Send for MmapVec<T> {}
#[allow(unsafe_code)]
unsafe impl<T: Sync> Sync for MmapVec<T> {}

impl<T> Default for MmapVec<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(unsafe_code)]
impl<T> MmapVec<T> {
    #[must_use]
    pub const fn new() -> Self {
        assert!(size_of::<T>() > 0 && align_of::<T>() <= PAGE_SIZE);
        Self {
            ptr: NonNull::dangling(),
            len: 0,
            cap: 0,
            _owns: PhantomData,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        // SAFETY: the first `len` slots are initialized.
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        // SAFETY: the first `len` slots are initialized and uniquely borrowed.
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&T> {
        self.as_slice().get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.as_mut_slice().get_mut(index)
    }

    fn bytes_for(cap: usize) -> Option<usize> {
        cap.checked_mul(size_of::<T>())
            .and_then(crate::pthread::page_round_up)
    }

    fn grow(&mut self) -> Result<(), MapFailed> {
        let min_cap = (PAGE_SIZE / size_of::<T>()).max(1);
        let new_cap = self.cap.checked_mul(2).unwrap_or(usize::MAX).max(min_cap);
        let bytes = Self::bytes_for(new_cap).ok_or(MapFailed(libc::ENOMEM))?;
        // SAFETY: fresh anonymous mapping.
        let block = unsafe {
            syscall::sys_mmap(
                ptr::null_mut(),
                bytes,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        }
        .map_err(MapFailed)?;
        let new_ptr = block.cast::<T>();
        if self.cap > 0 {
            // SAFETY: both blocks are valid for `len` elements and disjoint;
            // the old block is unmapped without dropping the moved values.
            unsafe {
                ptr::copy_nonoverlapping(self.ptr.as_ptr(), new_ptr, self.len);
                self.unmap();
            }
        }
        // SAFETY: mmap never returns null on success.
        self.ptr = unsafe { NonNull::new_unchecked(new_ptr) };
        // Use the whole rounded mapping.
        self.cap = bytes / size_of::<T>();
        Ok(())
    }

    unsafe fn unmap(&mut self) {
        if let Some(bytes) = Self::bytes_for(self.cap) {
            // SAFETY: `ptr`/`cap` describe our current mapping.
            let _ = unsafe { syscall::sys_munmap(self.ptr.as_ptr().cast(), bytes) };
        }
    }

    pub fn push(&mut self, value: T) -> Result<usize, MapFailed> {
        if self.len == self.cap {
            self.grow()?;
        }
        // SAFETY: len < cap after growing.
        unsafe { self.ptr.as_ptr().add(self.len).write(value) };
        self.len += 1;
        Ok(self.len - 1)
    }

    /// Remove and return the element at `index`, shifting the tail down.
    pub fn remove(&mut self, index: usize) -> Option<T> {
        if index >= self.len {
            return None;
        }
        // SAFETY: index < len; the tail shift stays in bounds.
        unsafe {
            let p = self.ptr.as_ptr().add(index);
            let value = p.read();
            ptr::copy(p.add(1), p, self.len - index - 1);
            self.len -= 1;
            Some(value)
        }
    }

    /// Drop every element, keeping the mapping for reuse.
    pub fn clear(&mut self) {
        let len = self.len;
        self.len = 0;
        // SAFETY: the first `len` slots were initialized; len is reset first
        // so a panicking destructor cannot cause a double drop.
        unsafe {
            ptr::drop_in_place(core::slice::from_raw_parts_mut(self.ptr.as_ptr(), len) as *mut [T]);
        }
    }

    pub fn iter(&self) -> core::slice::Iter<'_, T> {
        self.as_slice().iter()
    }
}

impl<T: PartialEq> MmapVec<T> {
    #[must_use]
    pub fn position(&self, value: &T) -> Option<usize> {
        self.iter().position(|v| v == value)
    }

    #[must_use]
    pub fn contains(&self, value: &T) -> bool {
        self.position(value).is_some()
    }
}

#[allow(unsafe_code)]
impl<T> Drop for MmapVec<T> {
    fn drop(&mut self) {
        if self.cap == 0 {
            return;
        }
        // SAFETY: the first `len` slots are initialized and owned.
        unsafe {
            ptr::drop_in_place(self.as_mut_slice() as *mut [T]);
            self.unmap();
        }
    }
}
