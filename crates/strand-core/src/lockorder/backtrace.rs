//! Call-stack capture and symbolization for lock-order reports.
//!
//! Host threads use the C library's `backtrace` and `dladdr`. Runtime
//! threads have no C library thread header, so they must not call into it; they walk the frame-pointer chain instead, bounded by
//! their own stack so a stray frame pointer can never fault. Symbolization is
//! skipped there and raw addresses are reported.

use core::fmt::{self, Write};

/// Most frames kept per captured stack.
pub const MAX_FRAMES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallStack {
    frames: [usize; MAX_FRAMES],
    depth: usize,
}

impl Default for CallStack {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl CallStack {
    pub const EMPTY: Self = Self {
        frames: [0; MAX_FRAMES],
        depth: 0,
    };

    #[must_use]
    pub fn frames(&self) -> &[usize] {
        &self.frames[..self.depth]
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.depth == 0
    }

    fn push(&mut self, pc: usize) -> bool {
        if self.depth == MAX_FRAMES {
            return false;
        }
        self.frames[self.depth] = pc;
        self.depth += 1;
        true
    }

    /// Capture the caller's stack.
    #[must_use]
    pub fn capture() -> Self {
        match crate::pthread::runtime_stack_bounds() {
            Some((lo, hi)) => walk_frame_pointers(lo, hi),
            None => host_backtrace(),
        }
    }

    #[cfg(test)]
    pub(crate) fn from_frames(frames: &[usize]) -> Self {
        let mut s = Self::EMPTY;
        for &f in frames {
            s.push(f);
        }
        s
    }
}

#[cfg(target_env = "gnu")]
#[allow(unsafe_code)]
unsafe extern "C" {
    fn backtrace(buffer: *mut *mut libc::c_void, size: libc::c_int) -> libc::c_int;
}

#[cfg(target_env = "gnu")]
#[allow(unsafe_code)]
fn host_backtrace() -> CallStack {
    let mut raw = [core::ptr::null_mut::<libc::c_void>(); MAX_FRAMES + 1];
    // SAFETY: `raw` has room for the requested count.
    let n = unsafe { backtrace(raw.as_mut_ptr(), raw.len() as libc::c_int) };
    let mut stack = CallStack::EMPTY;
    // Skip our own frame.
    for &pc in raw.iter().take(n.max(0) as usize).skip(1) {
        stack.push(pc as usize);
    }
    stack
}

#[cfg(not(target_env = "gnu"))]
fn host_backtrace() -> CallStack {
    CallStack::EMPTY
}

/// Follow `[rbp] -> saved rbp, [rbp + 8] -> return address` while the chain
/// stays inside `[lo, hi)` and strictly ascends.
#[allow(unsafe_code)]
#[inline(never)]
fn walk_frame_pointers(lo: usize, hi: usize) -> CallStack {
    let mut fp: usize;
    // SAFETY: reads a register.
    unsafe {
        core::arch::asm!("mov {}, rbp", out(reg) fp, options(nomem, nostack, preserves_flags));
    }
    let mut stack = CallStack::EMPTY;
    while fp >= lo && fp % 8 == 0 && fp.saturating_add(16) <= hi {
        // SAFETY: both words lie inside the thread's mapped stack.
        let (next, ret) = unsafe { (*(fp as *const usize), *((fp + 8) as *const usize)) };
        if ret == 0 || !stack.push(ret) || next <= fp {
            break;
        }
        fp = next;
    }
    stack
}

/// Writes one symbolized frame: `#NN pc 0x... module (symbol+0xoff)`.
pub(crate) fn write_frame(out: &mut impl Write, index: usize, pc: usize, symbolize: bool) -> fmt::Result {
    write!(out, "#{index:02}  pc {pc:#x}")?;
    if symbolize {
        if let Some(sym) = lookup(pc) {
            write!(out, "  {}", sym.module)?;
            if let Some(name) = sym.symbol {
                write!(out, " ({name}+{:#x})", pc - sym.symbol_addr)?;
            } else {
                write!(out, " (+{:#x})", pc - sym.module_base)?;
            }
        }
    }
    Ok(())
}

struct Symbol {
    module: &'static str,
    module_base: usize,
    symbol: Option<&'static str>,
    symbol_addr: usize,
}

#[allow(unsafe_code)]
fn c_str(p: *const libc::c_char) -> Option<&'static str> {
    if p.is_null() {
        return None;
    }
    // SAFETY: dladdr strings point into loaded images, which stay mapped
    // for the life of the process in practice.
    unsafe { core::ffi::CStr::from_ptr(p) }.to_str().ok()
}

#[allow(unsafe_code)]
fn lookup(pc: usize) -> Option<Symbol> {
    let mut info = libc::Dl_info {
        dli_fname: core::ptr::null(),
        dli_fbase: core::ptr::null_mut(),
        dli_sname: core::ptr::null(),
        dli_saddr: core::ptr::null_mut(),
    };
    // SAFETY: `info` is a valid out-parameter.
    if unsafe { libc::dladdr(pc as *const libc::c_void, &mut info) } == 0 {
        return None;
    }
    Some(Symbol {
        module: c_str(info.dli_fname).unwrap_or("<unknown>"),
        module_base: info.dli_fbase as usize,
        symbol: c_str(info.dli_sname),
        symbol_addr: info.dli_saddr as usize,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::LineBuffer;

    #[test]
    fn host_capture_finds_frames() {
        let stack = CallStack::capture();
        if cfg!(target_env = "gnu") {
            assert!(!stack.is_empty());
        }
        assert!(stack.frames().len() <= MAX_FRAMES);
    }

    #[test]
    fn frame_walk_respects_bounds() {
        // An empty range never dereferences anything.
        assert!(walk_frame_pointers(0, 0).is_empty());
    }

    #[test]
    fn frame_formatting_without_symbols() {
        let mut line = LineBuffer::new();
        write_frame(&mut line, 3, 0x1234, false).unwrap();
        assert_eq!(line.as_str(), "#03  pc 0x1234");
    }

    #[test]
    fn frame_formatting_with_symbols_names_module() {
        let pc = host_capture_finds_frames as usize;
        let mut line = LineBuffer::new();
        write_frame(&mut line, 0, pc, true).unwrap();
        assert!(line.as_str().starts_with("#00  pc "));
        assert!(line.as_str().len() > "#00  pc 0x0".len());
    }
}
