//! Mutex dependency graph and per-thread held-lock stacks.
//!
//! Every mutex seen by the observer gets a [`LockNode`], created on first
//! use and never destroyed. An edge `a -> b` means some thread acquired `b`
//! while `a` was its most recently acquired held lock. A new edge that
//! closes a cycle is a predicted deadlock: it is reported and removed again,
//! so the graph stays acyclic.
//!
//! Nodes and thread entries are addressed by 1-based `u32` ids; 0 is "none".

use super::backtrace::CallStack;
use super::report;
use super::storage::{MapFailed, MmapVec};

pub(crate) const NONE: u32 = 0;
const BUCKETS: usize = 256;

/// 31-multiplier byte hash, bytes taken as signed chars.
fn hashcode(key: &[u8]) -> u32 {
    key.iter().fold(key.len() as u32, |h, &b| {
        h.wrapping_mul(31).wrapping_add(b as i8 as i32 as u32)
    })
}

/// Doug Lea's supplemental hash, folded to a bucket index.
fn bucket_index(mut h: u32) -> usize {
    h = h.wrapping_add(!(h << 9));
    h ^= h >> 14;
    h = h.wrapping_add(h << 4);
    h ^= h >> 10;
    (h as usize) & (BUCKETS - 1)
}

pub(crate) struct LockNode {
    pub(crate) mutex: usize,
    pub(crate) owner: i32,
    /// Extra acquisitions by the owner beyond the first.
    pub(crate) lock_count: u32,
    hash_next: u32,
    /// Held-stack links: `held_next` is the lock acquired before this one.
    held_prev: u32,
    held_next: u32,
    pub(crate) children: MmapVec<u32>,
    pub(crate) parents: MmapVec<u32>,
    /// Call stack of each incoming edge, index-aligned with `parents`.
    pub(crate) parent_stacks: MmapVec<CallStack>,
    /// Stack of the most recent acquisition.
    pub(crate) stack: CallStack,
    on_path: bool,
    visited: u32,
}

impl LockNode {
    fn new(mutex: usize) -> Self {
        Self {
            mutex,
            owner: 0,
            lock_count: 0,
            hash_next: NONE,
            held_prev: NONE,
            held_next: NONE,
            children: MmapVec::new(),
            parents: MmapVec::new(),
            parent_stacks: MmapVec::new(),
            stack: CallStack::EMPTY,
            on_path: false,
            visited: 0,
        }
    }

    /// Stack recorded for the edge `parent -> self`.
    pub(crate) fn edge_stack(&self, parent: u32) -> Option<&CallStack> {
        let idx = self.parents.iter().rposition(|&p| p == parent)?;
        self.parent_stacks.get(idx)
    }
}

struct ThreadEntry {
    tid: i32,
    held_head: u32,
    hash_next: u32,
}

#[derive(Clone, Copy)]
struct DfsFrame {
    node: u32,
    /// Children not yet explored are `children[..remaining]`.
    remaining: u32,
}

/// What `on_lock` concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// Owner re-acquired a lock it holds.
    Reentrant,
    /// Acquired with nothing else held, or along a known edge.
    Acquired,
    /// Acquired and recorded a new ordering edge.
    NewEdge,
    /// The acquisition closes a cycle; reported, edge dropped.
    PredictedDeadlock,
    /// Bookkeeping could not be allocated; nothing recorded.
    Untracked,
}

/// Observer counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ObserverStats {
    pub nodes: usize,
    pub edges: usize,
    pub threads: usize,
    pub predicted_deadlocks: u64,
}

pub(crate) struct LockGraph {
    nodes: MmapVec<LockNode>,
    node_buckets: [u32; BUCKETS],
    threads: MmapVec<ThreadEntry>,
    thread_buckets: [u32; BUCKETS],
    dfs: MmapVec<DfsFrame>,
    epoch: u32,
    edges: usize,
    predicted: u64,
}

impl LockGraph {
    pub(crate) const fn new() -> Self {
        Self {
            nodes: MmapVec::new(),
            node_buckets: [NONE; BUCKETS],
            threads: MmapVec::new(),
            thread_buckets: [NONE; BUCKETS],
            dfs: MmapVec::new(),
            epoch: 0,
            edges: 0,
            predicted: 0,
        }
    }

    pub(crate) fn node(&self, id: u32) -> &LockNode {
        &self.nodes.as_slice()[id as usize - 1]
    }

    fn node_mut(&mut self, id: u32) -> &mut LockNode {
        &mut self.nodes.as_mut_slice()[id as usize - 1]
    }

    fn find_node(&self, mutex: usize) -> Option<u32> {
        let mut id = self.node_buckets[bucket_index(hashcode(&mutex.to_ne_bytes()))];
        while id != NONE {
            let node = self.node(id);
            if node.mutex == mutex {
                return Some(id);
            }
            id = node.hash_next;
        }
        None
    }

    fn node_for(&mut self, mutex: usize) -> Result<u32, MapFailed> {
        if let Some(id) = self.find_node(mutex) {
            return Ok(id);
        }
        let bucket = bucket_index(hashcode(&mutex.to_ne_bytes()));
        let mut node = LockNode::new(mutex);
        node.hash_next = self.node_buckets[bucket];
        let id = self.nodes.push(node)? as u32 + 1;
        self.node_buckets[bucket] = id;
        Ok(id)
    }

    fn find_thread(&self, tid: i32) -> Option<u32> {
        let mut id = self.thread_buckets[bucket_index(hashcode(&tid.to_ne_bytes()))];
        while id != NONE {
            let entry = &self.threads.as_slice()[id as usize - 1];
            if entry.tid == tid {
                return Some(id);
            }
            id = entry.hash_next;
        }
        None
    }

    pub(crate) fn knows_thread(&self, tid: i32) -> bool {
        self.find_thread(tid).is_some()
    }

    fn thread_for(&mut self, tid: i32) -> Result<u32, MapFailed> {
        if let Some(id) = self.find_thread(tid) {
            return Ok(id);
        }
        let bucket = bucket_index(hashcode(&tid.to_ne_bytes()));
        let id = self.threads.push(ThreadEntry {
            tid,
            held_head: NONE,
            hash_next: self.thread_buckets[bucket],
        })? as u32
            + 1;
        self.thread_buckets[bucket] = id;
        Ok(id)
    }

    fn thread_head(&self, thread: u32) -> u32 {
        self.threads.as_slice()[thread as usize - 1].held_head
    }

    fn set_thread_head(&mut self, thread: u32, head: u32) {
        self.threads.as_mut_slice()[thread as usize - 1].held_head = head;
    }

    /// Locks held by `tid`, most recent first.
    pub(crate) fn held_by(&self, tid: i32) -> HeldIter<'_> {
        let head = self.find_thread(tid).map_or(NONE, |t| self.thread_head(t));
        HeldIter {
            graph: self,
            cur: head,
        }
    }

    fn push_held(&mut self, thread: u32, id: u32) {
        let head = self.thread_head(thread);
        {
            let node = self.node_mut(id);
            node.held_prev = NONE;
            node.held_next = head;
        }
        if head != NONE {
            self.node_mut(head).held_prev = id;
        }
        self.set_thread_head(thread, id);
    }

    fn remove_held(&mut self, thread: u32, id: u32) {
        let mut cur = self.thread_head(thread);
        while cur != NONE && cur != id {
            cur = self.node(cur).held_next;
        }
        if cur == NONE {
            return;
        }
        let (prev, next) = {
            let node = self.node(id);
            (node.held_prev, node.held_next)
        };
        if prev == NONE {
            self.set_thread_head(thread, next);
        } else {
            self.node_mut(prev).held_next = next;
        }
        if next != NONE {
            self.node_mut(next).held_prev = prev;
        }
        let node = self.node_mut(id);
        node.held_prev = NONE;
        node.held_next = NONE;
    }

    fn link(&mut self, parent: u32, child: u32, stack: CallStack) -> Result<(), MapFailed> {
        self.node_mut(parent).children.push(child)?;
        let node = self.node_mut(child);
        let pushed = match node.parents.push(parent) {
            Ok(_) => match node.parent_stacks.push(stack) {
                Ok(_) => Ok(()),
                Err(e) => {
                    let last = node.parents.len() - 1;
                    node.parents.remove(last);
                    Err(e)
                }
            },
            Err(e) => Err(e),
        };
        if let Err(e) = pushed {
            let p = self.node_mut(parent);
            let last = p.children.len() - 1;
            p.children.remove(last);
            return Err(e);
        }
        self.edges += 1;
        Ok(())
    }

    fn unlink(&mut self, parent: u32, child: u32) {
        let p = self.node_mut(parent);
        if let Some(i) = p.children.iter().rposition(|&c| c == child) {
            p.children.remove(i);
        }
        let c = self.node_mut(child);
        if let Some(i) = c.parents.iter().rposition(|&p| p == parent) {
            c.parents.remove(i);
            c.parent_stacks.remove(i);
        }
        self.edges -= 1;
    }

    /// Depth-first search from `start` for a path back onto itself.
    ///
    /// On success the path from `start` to the last node before the cycle
    /// closes is left in `self.dfs`, and the id of the node that closes it
    /// is returned.
    fn find_cycle(&mut self, start: u32) -> Result<Option<u32>, MapFailed> {
        self.epoch = self.epoch.wrapping_add(1).max(1);
        let epoch = self.epoch;
        self.dfs.clear();

        let remaining = self.node(start).children.len() as u32;
        self.dfs.push(DfsFrame {
            node: start,
            remaining,
        })?;
        {
            let n = self.node_mut(start);
            n.on_path = true;
            n.visited = epoch;
        }

        let mut result = Ok(None);
        while let Some(&top) = self.dfs.as_slice().last() {
            if top.remaining == 0 {
                self.node_mut(top.node).on_path = false;
                let last = self.dfs.len() - 1;
                self.dfs.remove(last);
                continue;
            }
            let idx = top.remaining - 1;
            let last = self.dfs.len() - 1;
            self.dfs.as_mut_slice()[last].remaining = idx;
            let child = self.node(top.node).children.as_slice()[idx as usize];
            let child_node = self.node(child);
            if child_node.on_path {
                result = Ok(Some(child));
                break;
            }
            if child_node.visited == epoch {
                continue;
            }
            let remaining = child_node.children.len() as u32;
            if let Err(e) = self.dfs.push(DfsFrame {
                node: child,
                remaining,
            }) {
                result = Err(e);
                break;
            }
            let n = self.node_mut(child);
            n.on_path = true;
            n.visited = epoch;
        }

        for i in 0..self.dfs.len() {
            let node = self.dfs.as_slice()[i].node;
            self.node_mut(node).on_path = false;
        }
        result
    }

    /// Nodes on the path the last `find_cycle` left behind, start first.
    pub(crate) fn cycle_path(&self) -> impl DoubleEndedIterator<Item = u32> + '_ {
        self.dfs.iter().map(|f| f.node)
    }

    /// Record that `tid` acquired `mutex`. Call after the lock is held.
    pub(crate) fn on_lock(
        &mut self,
        mutex: usize,
        tid: i32,
        stack: Option<CallStack>,
        capture_stacks: bool,
    ) -> LockOutcome {
        let Ok(id) = self.node_for(mutex) else {
            return LockOutcome::Untracked;
        };
        {
            let node = self.node_mut(id);
            if node.owner == tid {
                node.lock_count += 1;
                return LockOutcome::Reentrant;
            }
            node.owner = tid;
            node.lock_count = 0;
            if let Some(stack) = stack {
                node.stack = stack;
            }
        }
        let Ok(thread) = self.thread_for(tid) else {
            return LockOutcome::Untracked;
        };

        let prev = self.thread_head(thread);
        let mut outcome = LockOutcome::Acquired;
        if prev != NONE && prev != id && !self.node(prev).children.contains(&id) {
            let edge_stack = if capture_stacks {
                self.node(id).stack
            } else {
                CallStack::EMPTY
            };
            outcome = match self.link(prev, id, edge_stack) {
                Err(_) => LockOutcome::Untracked,
                Ok(()) => match self.find_cycle(id) {
                    Ok(Some(closing)) => {
                        self.predicted += 1;
                        report::emit(self, tid, prev, closing, capture_stacks);
                        self.unlink(prev, id);
                        LockOutcome::PredictedDeadlock
                    }
                    Ok(None) => LockOutcome::NewEdge,
                    Err(_) => {
                        self.unlink(prev, id);
                        LockOutcome::Untracked
                    }
                },
            };
        }
        self.push_held(thread, id);
        outcome
    }

    /// Record that `tid` is about to release `mutex`.
    pub(crate) fn on_unlock(&mut self, mutex: usize, tid: i32) {
        let Some(id) = self.find_node(mutex) else {
            return;
        };
        {
            let node = self.node_mut(id);
            if node.owner != tid {
                return;
            }
            if node.lock_count > 0 {
                node.lock_count -= 1;
                return;
            }
            node.owner = 0;
        }
        if let Some(thread) = self.find_thread(tid) {
            self.remove_held(thread, id);
        }
    }

    /// Drop `tid`'s held stack, e.g. when the thread exits.
    pub(crate) fn forget_thread(&mut self, tid: i32) {
        let Some(thread) = self.find_thread(tid) else {
            return;
        };
        while self.thread_head(thread) != NONE {
            let id = self.thread_head(thread);
            {
                let node = self.node_mut(id);
                node.owner = 0;
                node.lock_count = 0;
            }
            self.remove_held(thread, id);
        }
    }

    pub(crate) fn has_edge(&self, parent_mutex: usize, child_mutex: usize) -> bool {
        match (self.find_node(parent_mutex), self.find_node(child_mutex)) {
            (Some(p), Some(c)) => self.node(p).children.contains(&c),
            _ => false,
        }
    }

    pub(crate) fn stats(&self) -> ObserverStats {
        ObserverStats {
            nodes: self.nodes.len(),
            edges: self.edges,
            threads: self.threads.len(),
            predicted_deadlocks: self.predicted,
        }
    }
}

pub(crate) struct HeldIter<'a> {
    graph: &'a LockGraph,
    cur: u32,
}

impl<'a> Iterator for HeldIter<'a> {
    type Item = &'a LockNode;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur == NONE {
            return None;
        }
        let node = self.graph.node(self.cur);
        self.cur = node.held_next;
        Some(node)
    }
}
