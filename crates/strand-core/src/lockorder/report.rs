//! Predicted-deadlock report.
//!
//! Emitted at warn level while the graph lock is held. The reporting thread
//! is excluded from observation until the report is complete, so a log sink
//! that itself takes guarded mutexes cannot re-enter the observer.

use core::fmt;
use core::sync::atomic::{AtomicI32, Ordering};

use super::backtrace::{CallStack, write_frame};
use super::graph::LockGraph;
use crate::syscall;

const TAG: &str = "lockorder";
pub(crate) const START_BANNER: &str = "=============== predicted deadlock ===============";
pub(crate) const END_BANNER: &str = "=============== end predicted deadlock ===============";

static REPORTING_TID: AtomicI32 = AtomicI32::new(0);

/// Whether `tid` is currently writing a report.
pub(crate) fn is_reporting(tid: i32) -> bool {
    REPORTING_TID.load(Ordering::Acquire) == tid
}

struct Frame {
    index: usize,
    pc: usize,
    symbolize: bool,
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_frame(f, self.index, self.pc, self.symbolize)
    }
}

fn log_stack(stack: &CallStack, symbolize: bool) {
    for (index, &pc) in stack.frames().iter().enumerate() {
        log_warn!(TAG, "          {}", Frame { index, pc, symbolize });
    }
}

/// Report that acquiring node `closing` after `prev` closes a cycle.
///
/// Expects the search path left by the cycle search in `graph`.
pub(crate) fn emit(graph: &LockGraph, tid: i32, prev: u32, closing: u32, capture_stacks: bool) {
    REPORTING_TID.store(tid, Ordering::Release);
    // dladdr needs the C library's thread header, which runtime threads lack.
    let symbolize = crate::pthread::runtime_stack_bounds().is_none();

    log_warn!(TAG, "{}", START_BANNER);
    log_warn!(TAG, "pid: {}, tid: {} >>> lock order violation <<<", syscall::sys_getpid(), tid);
    log_warn!(TAG, "Illegal lock attempt:");
    log_warn!(TAG, "--- mutex at {:#x}", graph.node(closing).mutex);
    log_stack(&CallStack::capture(), symbolize);

    log_warn!(TAG, "+++ Currently held locks in this thread (in reverse order):");
    for held in graph.held_by(tid) {
        log_warn!(TAG, "--- mutex at {:#x}", held.mutex);
        if capture_stacks {
            log_stack(&held.stack, symbolize);
        }
    }

    log_warn!(TAG, "+++ Earlier, the following lock order (from last to first) was established");
    // Deepest first; each node's parent is the one before it on the path,
    // and the path's first node hangs off `prev` via the rejected edge.
    let mut path = graph.cycle_path().rev().peekable();
    while let Some(id) = path.next() {
        let parent = path.peek().copied().unwrap_or(prev);
        let node = graph.node(id);
        log_warn!(TAG, "--- mutex at {:#x}", node.mutex);
        if capture_stacks {
            log_stack(node.edge_stack(parent).unwrap_or(&node.stack), symbolize);
        }
    }

    log_warn!(TAG, "{}", END_BANNER);
    REPORTING_TID.store(0, Ordering::Release);
}
