//! Allocation-free diagnostic logger.
//!
//! Lines are formatted into a fixed stack buffer and emitted with a single
//! `write(2)` to stderr, or handed to an installed [`LogSink`]. Nothing here
//! allocates or touches thread-local storage, so runtime threads may log.
//! Their lines skip the sink.
//!
//! Line format: `<letter>/<tag>(<tid>): <message>`.

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::config::{self, LogPriority};
use crate::syscall;

const LINE_CAPACITY: usize = 1024;

/// Receives every line emitted on a host thread (without the trailing
/// newline). Runtime threads always write straight to stderr, so a sink is
/// free to allocate.
pub type LogSink = fn(LogPriority, &str);

static SINK: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

/// Route log lines to `sink` instead of stderr; `None` restores stderr.
pub fn set_log_sink(sink: Option<LogSink>) {
    let raw = sink.map_or(core::ptr::null_mut(), |f| f as *mut ());
    SINK.store(raw, Ordering::Release);
}

#[allow(unsafe_code)]
fn current_sink() -> Option<LogSink> {
    let raw = SINK.load(Ordering::Acquire);
    if raw.is_null() {
        None
    } else {
        // SAFETY: only `set_log_sink` stores non-null values, and it stores
        // a `LogSink` cast to a data pointer.
        Some(unsafe { core::mem::transmute::<*mut (), LogSink>(raw) })
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn on_runtime_thread() -> bool {
    crate::pthread::on_runtime_thread()
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
fn on_runtime_thread() -> bool {
    false
}

/// Fixed-capacity line buffer; output past capacity is dropped.
pub(crate) struct LineBuffer {
    buf: [u8; LINE_CAPACITY],
    len: usize,
}

impl LineBuffer {
    pub(crate) const fn new() -> Self {
        Self {
            buf: [0; LINE_CAPACITY],
            len: 0,
        }
    }

    pub(crate) fn as_str(&self) -> &str {
        // Truncation happens on char boundaries in `write_str`.
        core::str::from_utf8(&self.buf[..self.len]).unwrap_or("")
    }
}

impl Write for LineBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        // Keep one byte for the newline.
        let room = LINE_CAPACITY - 1 - self.len;
        let mut take = s.len().min(room);
        while !s.is_char_boundary(take) {
            take -= 1;
        }
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

/// Whether a line at `priority` would be emitted.
#[must_use]
pub fn enabled(priority: LogPriority) -> bool {
    priority >= config::log_priority()
}

/// Format and emit one line. Prefer the `log_*!` macros.
#[allow(unsafe_code)]
pub fn write_log(priority: LogPriority, tag: &str, args: fmt::Arguments<'_>) {
    if !enabled(priority) {
        return;
    }
    let mut line = LineBuffer::new();
    let _ = write!(
        line,
        "{}/{}({}): ",
        priority.letter(),
        tag,
        syscall::sys_gettid()
    );
    let _ = line.write_fmt(args);

    if let Some(sink) = current_sink().filter(|_| !on_runtime_thread()) {
        sink(priority, line.as_str());
        return;
    }
    line.buf[line.len] = b'\n';
    let bytes = &line.buf[..line.len + 1];
    // SAFETY: `bytes` is a live stack slice.
    let _ = unsafe { syscall::sys_write(2, bytes.as_ptr(), bytes.len()) };
}

#[macro_export]
macro_rules! log_debug {
    ($tag:expr, $($arg:tt)+) => {
        $crate::log::write_log($crate::config::LogPriority::Debug, $tag, format_args!($($arg)+))
    };
}

#[macro_export]
macro_rules! log_info {
    ($tag:expr, $($arg:tt)+) => {
        $crate::log::write_log($crate::config::LogPriority::Info, $tag, format_args!($($arg)+))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($tag:expr, $($arg:tt)+) => {
        $crate::log::write_log($crate::config::LogPriority::Warn, $tag, format_args!($($arg)+))
    };
}

#[macro_export]
macro_rules! log_error {
    ($tag:expr, $($arg:tt)+) => {
        $crate::log::write_log($crate::config::LogPriority::Error, $tag, format_args!($($arg)+))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_buffer_truncates_on_char_boundary() {
        let mut line = LineBuffer::new();
        let long = "é".repeat(LINE_CAPACITY);
        let _ = line.write_str(&long);
        assert!(line.as_str().len() <= LINE_CAPACITY - 1);
        assert!(line.as_str().chars().all(|c| c == 'é'));
    }

    #[test]
    fn line_buffer_formats_args() {
        let mut line = LineBuffer::new();
        let _ = write!(line, "mutex {:#x} held {}", 0x10usize, 3);
        assert_eq!(line.as_str(), "mutex 0x10 held 3");
    }

    #[test]
    fn error_lines_pass_default_filter() {
        assert!(enabled(LogPriority::Error));
    }
}
