//! Dynamic-tree edge sets.
//!
//! Both structures grow by random descent so that concurrent operations
//! diffuse across the tree instead of serialising on one word. A thread
//! that loses a CAS restarts from the root; the loss implies another thread
//! made visible progress.
//!
//! The incounter keeps two roots: `in` holds one leaf per unresolved edge,
//! `out` collects detached leaves until a reclamation walk frees them. The
//! outset's slots are tagged unions (`empty`, `leaf`, `interior`, and their
//! `finished` variants); finishing freezes every slot exactly once.

use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::edge::{self, Outset, OutsetKind, Status};
use crate::tag;
use crate::task::{Body, BlockId, Context, TaskRef};
use crate::Frame;

const MINUS: usize = 1;

pub(crate) struct IncounterNode {
    children: Box<[AtomicUsize]>,
}

impl IncounterNode {
    fn alloc(branching: usize, init: usize) -> *mut IncounterNode {
        let children = (0..branching).map(|_| AtomicUsize::new(init)).collect();
        Box::into_raw(Box::new(IncounterNode { children }))
    }

    fn is_leaf(&self) -> bool {
        self.children
            .iter()
            .all(|slot| tag::pointer::<IncounterNode>(slot.load(Ordering::Acquire)).is_null())
    }
}

/// Incounter represented as a dynamic tree of arrival leaves.
pub struct DyntreeIncounter {
    /// Root of the live tree; null once activated.
    in_: AtomicUsize,
    /// Minus-tagged root of the consumed tree.
    out: AtomicUsize,
    branching: usize,
}

unsafe impl Send for DyntreeIncounter {}
unsafe impl Sync for DyntreeIncounter {}

impl DyntreeIncounter {
    /// An empty counter with the given branching factor.
    pub fn new(branching: usize) -> Self {
        assert!(branching >= 2);
        let out_root = IncounterNode::alloc(branching, minus_word());
        Self {
            in_: AtomicUsize::new(0),
            out: AtomicUsize::new(tag::pack(out_root, MINUS)),
            branching,
        }
    }

    /// Activated once every arrival has been matched.
    pub fn is_activated(&self) -> bool {
        self.in_.load(Ordering::Acquire) == 0
    }

    /// Record one arrival: claim a free slot with a fresh leaf.
    pub fn increment(&self) {
        let leaf = IncounterNode::alloc(self.branching, 0);
        loop {
            let root = self.in_.load(Ordering::Acquire);
            if root == 0 {
                // First arrival. Only the thread running the owning task
                // installs the root; concurrent arrivals exist only once
                // `in` is visible.
                self.in_.store(leaf as usize, Ordering::Release);
                return;
            }
            let mut current = root as *mut IncounterNode;
            loop {
                let i = fastrand::usize(0..self.branching);
                let slot = unsafe { &(*current).children[i] };
                let next = slot.load(Ordering::Acquire);
                if tag::tag_of(next) == MINUS {
                    break;
                }
                if next == 0 {
                    if slot
                        .compare_exchange(0, leaf as usize, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return;
                    }
                    break;
                }
                current = next as *mut IncounterNode;
            }
        }
    }

    /// Match one arrival: detach some leaf. Returns [`Status::Activated`]
    /// exactly when the last leaf (the root) is detached.
    pub fn decrement(&self) -> Status {
        loop {
            let root_word = self.in_.load(Ordering::Acquire);
            assert_ne!(root_word, 0, "decrement on an empty incounter");
            let root = root_word as *mut IncounterNode;
            if unsafe { &*root }.is_leaf() && self.try_detach(root) {
                // Detaching re-verified emptiness slot by slot, so an
                // arrival racing past the leaf check cannot be lost.
                self.in_.store(0, Ordering::Release);
                self.add_to_out(root);
                return Status::Activated;
            }
            let mut current = root;
            loop {
                let i = fastrand::usize(0..self.branching);
                let slot = unsafe { &(*current).children[i] };
                let next = slot.load(Ordering::Acquire);
                if next == 0 || tag::tag_of(next) == MINUS {
                    break;
                }
                let child = next as *mut IncounterNode;
                if unsafe { &*child }.is_leaf() {
                    if self.try_detach(child) {
                        // The slot is freed only after the leaf is parked:
                        // the root cannot become a leaf, and the counter
                        // cannot activate, while a park is in flight.
                        self.add_to_out(child);
                        slot.store(0, Ordering::Release);
                        return Status::NotActivated;
                    }
                    break;
                }
                current = child;
            }
        }
    }

    /// Permanently claim every slot of a leaf. Rolls back on partial
    /// failure; the transient minus marks are visible only to this thread's
    /// CAS victims, which restart from the root anyway.
    fn try_detach(&self, node: *mut IncounterNode) -> bool {
        let children = unsafe { &(*node).children };
        for i in 0..self.branching {
            if children[i]
                .compare_exchange(0, minus_word(), Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                for j in (0..i).rev() {
                    children[j].store(0, Ordering::Release);
                }
                return false;
            }
        }
        true
    }

    /// Move a detached leaf into the consumed tree.
    fn add_to_out(&self, node: *mut IncounterNode) {
        let word = tag::pack(node, MINUS);
        loop {
            let mut current = tag::pointer::<IncounterNode>(self.out.load(Ordering::Acquire));
            loop {
                let i = fastrand::usize(0..self.branching);
                let slot = unsafe { &(*current).children[i] };
                let next = slot.load(Ordering::Acquire);
                if tag::pointer::<IncounterNode>(next).is_null() {
                    if slot
                        .compare_exchange(next, word, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return;
                    }
                    break;
                }
                current = tag::pointer::<IncounterNode>(next);
            }
        }
    }

    /// Detach the consumed tree for reclamation.
    pub(crate) fn take_out_root(&mut self) -> Option<*mut IncounterNode> {
        let word = self.out.swap(0, Ordering::AcqRel);
        let root = tag::pointer::<IncounterNode>(word);
        if root.is_null() {
            None
        } else {
            Some(root)
        }
    }
}

impl Drop for DyntreeIncounter {
    fn drop(&mut self) {
        free_incounter_tree(tag::pointer(self.in_.load(Ordering::Acquire)));
        free_incounter_tree(tag::pointer(self.out.load(Ordering::Acquire)));
    }
}

fn minus_word() -> usize {
    tag::pack(std::ptr::null_mut::<IncounterNode>(), MINUS)
}

fn free_incounter_tree(root: *mut IncounterNode) {
    let mut todo = Vec::new();
    if !root.is_null() {
        todo.push(root);
    }
    while let Some(node) = todo.pop() {
        let boxed = unsafe { Box::from_raw(node) };
        for slot in boxed.children.iter() {
            let child = tag::pointer::<IncounterNode>(slot.load(Ordering::Acquire));
            if !child.is_null() {
                todo.push(child);
            }
        }
    }
}

const EMPTY: usize = 1;
const LEAF: usize = 2;
const INTERIOR: usize = 3;
const FINISHED_EMPTY: usize = 4;
const FINISHED_LEAF: usize = 5;
const FINISHED_INTERIOR: usize = 6;

pub(crate) struct OutsetNode {
    children: Box<[AtomicUsize]>,
}

impl OutsetNode {
    fn alloc(branching: usize) -> *mut OutsetNode {
        let children = (0..branching)
            .map(|_| AtomicUsize::new(empty_word()))
            .collect();
        Box::into_raw(Box::new(OutsetNode { children }))
    }

    fn alloc_pair(branching: usize, child0: usize, child1: usize) -> *mut OutsetNode {
        let node = Self::alloc(branching);
        unsafe {
            (*node).children[0].store(child0, Ordering::Relaxed);
            (*node).children[1].store(child1, Ordering::Relaxed);
        }
        node
    }
}

fn empty_word() -> usize {
    tag::pack(std::ptr::null_mut::<OutsetNode>(), EMPTY)
}

/// The only freeze transition: a slot keeps its shape, finished.
fn make_finished(word: usize) -> usize {
    let tag = tag::tag_of(word);
    debug_assert!((EMPTY..=INTERIOR).contains(&tag));
    tag::retag(word, tag + 3)
}

/// Outset represented as a dynamic tree of tagged-union slots.
pub struct DyntreeOutset {
    root: AtomicUsize,
    branching: usize,
}

unsafe impl Send for DyntreeOutset {}
unsafe impl Sync for DyntreeOutset {}

impl DyntreeOutset {
    /// An empty outset with the given branching factor.
    pub fn new(branching: usize) -> Self {
        assert!(branching >= 2);
        Self {
            root: AtomicUsize::new(OutsetNode::alloc(branching) as usize),
            branching,
        }
    }

    /// Register a target. Fails exactly if the outset has finished.
    pub fn insert(&self, target: TaskRef) -> bool {
        let val = tag::pack(target.addr() as *mut OutsetNode, LEAF);
        let mut current = self.root.load(Ordering::Acquire) as *mut OutsetNode;
        loop {
            let next;
            loop {
                let i = fastrand::usize(0..self.branching);
                let slot = unsafe { &(*current).children[i] };
                let mut word = slot.load(Ordering::Acquire);
                let mut tag_ = tag::tag_of(word);
                if tag_ >= FINISHED_EMPTY {
                    return false;
                }
                if tag_ == EMPTY {
                    if slot
                        .compare_exchange(word, val, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return true;
                    }
                    word = slot.load(Ordering::Acquire);
                    tag_ = tag::tag_of(word);
                }
                if tag_ == LEAF {
                    // Grow: an interior node adopts the old leaf and the
                    // new value.
                    let interior = OutsetNode::alloc_pair(self.branching, val, word);
                    let replacement = tag::pack(interior, INTERIOR);
                    if slot
                        .compare_exchange(word, replacement, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return true;
                    }
                    drop(unsafe { Box::from_raw(interior) });
                    word = slot.load(Ordering::Acquire);
                    tag_ = tag::tag_of(word);
                }
                if tag_ == INTERIOR {
                    next = tag::pointer::<OutsetNode>(word);
                    break;
                }
            }
            current = next;
        }
    }

    fn root_ptr(&self) -> *mut OutsetNode {
        self.root.load(Ordering::Acquire) as *mut OutsetNode
    }

    /// Detach the tree for reclamation.
    pub(crate) fn take_root(&mut self) -> Option<*mut OutsetNode> {
        let root = self.root.swap(0, Ordering::AcqRel) as *mut OutsetNode;
        if root.is_null() {
            None
        } else {
            Some(root)
        }
    }
}

impl Drop for DyntreeOutset {
    fn drop(&mut self) {
        let root = self.root.load(Ordering::Acquire) as *mut OutsetNode;
        let mut todo = Vec::new();
        if !root.is_null() {
            todo.push(root);
        }
        while let Some(node) = todo.pop() {
            let boxed = unsafe { Box::from_raw(node) };
            for slot in boxed.children.iter() {
                let word = slot.load(Ordering::Acquire);
                if matches!(tag::tag_of(word), INTERIOR | FINISHED_INTERIOR) {
                    todo.push(tag::pointer(word));
                }
            }
        }
    }
}

/// Freeze up to `communication_delay` nodes, decrementing leaf targets and
/// queueing interior children.
fn notify_partial(frame: &Frame, todo: &mut VecDeque<*mut OutsetNode>, branching: usize) {
    let mut k = 0;
    while k < frame.config.communication_delay && !todo.is_empty() {
        let current = todo.pop_back().unwrap();
        for i in 0..branching {
            let slot = unsafe { &(*current).children[i] };
            let mut word;
            loop {
                word = slot.load(Ordering::Acquire);
                if slot
                    .compare_exchange(word, make_finished(word), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    break;
                }
            }
            match tag::tag_of(word) {
                LEAF => {
                    let target = TaskRef::from_addr(word & !tag::TAG_MASK)
                        .expect("leaf slot without a target");
                    edge::decrement_incounter(frame, None, target);
                }
                INTERIOR => todo.push_back(tag::pointer(word)),
                _ => {}
            }
        }
        k += 1;
    }
}

/// Freeze and drain a dyntree outset, spawning a parallel walk if one batch
/// is not enough.
pub(crate) fn notify_outset(frame: &Frame, outset: NonNull<Outset>) {
    let (root, branching) = match &unsafe { outset.as_ref() }.kind {
        OutsetKind::Dyntree(out) => (out.root_ptr(), out.branching),
        _ => unreachable!("not a dyntree outset"),
    };
    let mut todo = VecDeque::new();
    todo.push_back(root);
    notify_partial(frame, &mut todo, branching);
    if todo.is_empty() {
        edge::outset_drained(frame, outset);
    } else {
        let walk = TaskRef::new(NotifyPar {
            outset,
            branching,
            todo,
        });
        edge::prepare(walk, edge::in_ready(), edge::out_noop());
        edge::add_node(frame, walk);
    }
}

const ENTRY: BlockId = 0;
const EXIT: BlockId = 1;

/// Outer notify task: runs the recursive walk under a `finish`, then hands
/// the drained outset back for destruction.
struct NotifyPar {
    outset: NonNull<Outset>,
    branching: usize,
    todo: VecDeque<*mut OutsetNode>,
}

unsafe impl Send for NotifyPar {}

impl Body for NotifyPar {
    fn run(&mut self, block: BlockId, cx: &mut Context) {
        match block {
            ENTRY => {
                let rec = TaskRef::new(NotifyRec {
                    join: cx.me(),
                    branching: self.branching,
                    todo: std::mem::take(&mut self.todo),
                });
                cx.finish(rec, EXIT);
            }
            EXIT => edge::outset_drained(cx.frame, self.outset),
            _ => unreachable!(),
        }
    }
}

const PROCESS: BlockId = 0;
const REPEAT: BlockId = 1;

/// Splittable recursive notify walk.
struct NotifyRec {
    join: TaskRef,
    branching: usize,
    todo: VecDeque<*mut OutsetNode>,
}

unsafe impl Send for NotifyRec {}

impl Body for NotifyRec {
    fn run(&mut self, block: BlockId, cx: &mut Context) {
        match block {
            PROCESS => {
                notify_partial(cx.frame, &mut self.todo, self.branching);
                cx.jump_to(REPEAT);
            }
            REPEAT => {
                if !self.todo.is_empty() {
                    cx.jump_to(PROCESS);
                }
            }
            _ => unreachable!(),
        }
    }

    fn size(&self) -> usize {
        self.todo.len()
    }

    fn split(&mut self, cx: &mut Context) -> Option<TaskRef> {
        let node = self.todo.pop_front()?;
        let sibling = TaskRef::new(NotifyRec {
            join: self.join,
            branching: self.branching,
            todo: VecDeque::from(vec![node]),
        });
        cx.adopt_split_sibling(sibling, Some(self.join));
        Some(sibling)
    }
}

fn dealloc_incounter_partial(frame: &Frame, todo: &mut VecDeque<*mut IncounterNode>) {
    let mut k = 0;
    while k < frame.config.communication_delay && !todo.is_empty() {
        let node = todo.pop_back().unwrap();
        let boxed = unsafe { Box::from_raw(node) };
        for slot in boxed.children.iter() {
            let child = tag::pointer::<IncounterNode>(slot.load(Ordering::Acquire));
            if !child.is_null() {
                todo.push_back(child);
            }
        }
        k += 1;
    }
}

/// Free a consumed incounter tree, spawning a parallel walk if one batch is
/// not enough.
pub(crate) fn deallocate_incounter_tree(frame: &Frame, root: *mut IncounterNode) {
    let mut todo = VecDeque::new();
    todo.push_back(root);
    dealloc_incounter_partial(frame, &mut todo);
    if !todo.is_empty() {
        let walk = TaskRef::new(IncounterReclaim { todo });
        edge::prepare(walk, edge::in_ready(), edge::out_noop());
        edge::add_node(frame, walk);
    }
}

/// Splittable deallocation walk over a consumed incounter tree.
struct IncounterReclaim {
    todo: VecDeque<*mut IncounterNode>,
}

unsafe impl Send for IncounterReclaim {}

impl Body for IncounterReclaim {
    fn run(&mut self, block: BlockId, cx: &mut Context) {
        match block {
            PROCESS => {
                dealloc_incounter_partial(cx.frame, &mut self.todo);
                cx.jump_to(REPEAT);
            }
            REPEAT => {
                if !self.todo.is_empty() {
                    cx.jump_to(PROCESS);
                }
            }
            _ => unreachable!(),
        }
    }

    fn size(&self) -> usize {
        self.todo.len()
    }

    fn split(&mut self, cx: &mut Context) -> Option<TaskRef> {
        let node = self.todo.pop_front()?;
        let sibling = TaskRef::new(IncounterReclaim {
            todo: VecDeque::from(vec![node]),
        });
        cx.adopt_split_sibling(sibling, None);
        Some(sibling)
    }
}

fn dealloc_outset_partial(frame: &Frame, todo: &mut VecDeque<*mut OutsetNode>) {
    let mut k = 0;
    while k < frame.config.communication_delay && !todo.is_empty() {
        let node = todo.pop_back().unwrap();
        let boxed = unsafe { Box::from_raw(node) };
        for slot in boxed.children.iter() {
            let word = slot.load(Ordering::Acquire);
            debug_assert!(tag::tag_of(word) >= FINISHED_EMPTY, "reclaiming an unfinished outset");
            if tag::tag_of(word) == FINISHED_INTERIOR {
                todo.push_back(tag::pointer(word));
            }
        }
        k += 1;
    }
}

/// Free a finished outset tree, spawning a parallel walk if one batch is not
/// enough.
pub(crate) fn deallocate_outset_tree(frame: &Frame, root: *mut OutsetNode) {
    let mut todo = VecDeque::new();
    todo.push_back(root);
    dealloc_outset_partial(frame, &mut todo);
    if !todo.is_empty() {
        let walk = TaskRef::new(OutsetReclaim { todo });
        edge::prepare(walk, edge::in_ready(), edge::out_noop());
        edge::add_node(frame, walk);
    }
}

/// Splittable deallocation walk over a finished outset tree.
struct OutsetReclaim {
    todo: VecDeque<*mut OutsetNode>,
}

unsafe impl Send for OutsetReclaim {}

impl Body for OutsetReclaim {
    fn run(&mut self, block: BlockId, cx: &mut Context) {
        match block {
            PROCESS => {
                dealloc_outset_partial(cx.frame, &mut self.todo);
                cx.jump_to(REPEAT);
            }
            REPEAT => {
                if !self.todo.is_empty() {
                    cx.jump_to(PROCESS);
                }
            }
            _ => unreachable!(),
        }
    }

    fn size(&self) -> usize {
        self.todo.len()
    }

    fn split(&mut self, cx: &mut Context) -> Option<TaskRef> {
        let node = self.todo.pop_front()?;
        let sibling = TaskRef::new(OutsetReclaim {
            todo: VecDeque::from(vec![node]),
        });
        cx.adopt_split_sibling(sibling, None);
        Some(sibling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increment_then_drain() {
        let counter = DyntreeIncounter::new(2);
        for _ in 0..100 {
            counter.increment();
        }
        assert!(!counter.is_activated());
        let mut activations = 0;
        for _ in 0..100 {
            if counter.decrement() == Status::Activated {
                activations += 1;
            }
        }
        assert_eq!(activations, 1);
        assert!(counter.is_activated());
    }

    #[test]
    fn reactivates_after_rearm() {
        let counter = DyntreeIncounter::new(3);
        counter.increment();
        assert_eq!(counter.decrement(), Status::Activated);
        counter.increment();
        counter.increment();
        assert_eq!(counter.decrement(), Status::NotActivated);
        assert_eq!(counter.decrement(), Status::Activated);
    }
}
