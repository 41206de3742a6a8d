//! The bottom-up (port-passing) family.
//!
//! Instead of hashing from an edge set's root, every participating task
//! holds a *port* into each incounter and outset it may later affect. Ports
//! fork when tasks fork, so an increment or decrement is a short walk from a
//! pre-issued node. An incounter is a binary tree of pending arrivals whose
//! leaves are exactly the outstanding ports; it activates when the unique
//! root is removed. An outset is a binary relay tree: each subscriber's node
//! records the target and the inport to decrement through.

use std::collections::{HashMap, VecDeque};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::edge::{self, Incounter, Outset, Status};
use crate::tag;
use crate::task::{Body, BlockId, Context, PortMode, Ports, TaskRef};
use crate::Frame;

/// A node in the binary tree of pending arrivals. A port is a pointer to
/// one of these.
pub struct ArrivalNode {
    parent: *mut ArrivalNode,
    removed: AtomicU32,
}

unsafe impl Send for ArrivalNode {}
unsafe impl Sync for ArrivalNode {}

fn alloc_arrival(parent: *mut ArrivalNode) -> *mut ArrivalNode {
    Box::into_raw(Box::new(ArrivalNode {
        parent,
        removed: AtomicU32::new(0),
    }))
}

/// Create the first pending arrival of a fresh counter: its root.
pub(crate) fn root_arrival() -> *mut ArrivalNode {
    alloc_arrival(std::ptr::null_mut())
}

/// Fork a port: two fresh children replace it, one for each side of a task
/// fork. The forked node becomes interior and is freed by the second of its
/// children to depart.
pub(crate) fn fork_arrival(port: *mut ArrivalNode) -> (*mut ArrivalNode, *mut ArrivalNode) {
    debug_assert!(!port.is_null());
    (alloc_arrival(port), alloc_arrival(port))
}

/// Bottom-up incounter: owner plus the arrival tree reached through ports.
pub struct PortIncounter {
    owner: TaskRef,
}

impl PortIncounter {
    pub(crate) fn new(owner: TaskRef) -> Self {
        Self { owner }
    }

    pub(crate) fn owner(&self) -> TaskRef {
        self.owner
    }

    /// Remove the arrival at `port` and climb. At each ancestor the first
    /// arriving child marks it and stops; the second frees it and
    /// continues. Removing the root activates.
    pub fn decrement(&self, port: *mut ArrivalNode) -> Status {
        assert!(!port.is_null());
        let mut current = port;
        let mut next = unsafe { (*current).parent };
        while !next.is_null() {
            drop(unsafe { Box::from_raw(current) });
            loop {
                let removed = unsafe { &(*next).removed };
                if removed.load(Ordering::Acquire) != 0 {
                    break;
                }
                if removed
                    .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Status::NotActivated;
                }
            }
            current = next;
            next = unsafe { (*current).parent };
        }
        drop(unsafe { Box::from_raw(current) });
        Status::Activated
    }
}

const FROZEN: usize = 1;

/// A node in a bottom-up outset: an optional subscription plus two child
/// slots handed out to forking holders.
pub struct RelayNode {
    target: usize,
    inport: *mut ArrivalNode,
    children: [AtomicUsize; 2],
}

unsafe impl Send for RelayNode {}
unsafe impl Sync for RelayNode {}

fn alloc_relay(target: usize, inport: *mut ArrivalNode) -> *mut RelayNode {
    Box::into_raw(Box::new(RelayNode {
        target,
        inport,
        children: [AtomicUsize::new(0), AtomicUsize::new(0)],
    }))
}

/// Bottom-up outset: a relay tree plus the producing task.
pub struct PortOutset {
    root: AtomicUsize,
    owner: AtomicUsize,
}

unsafe impl Send for PortOutset {}
unsafe impl Sync for PortOutset {}

impl PortOutset {
    pub(crate) fn new(owner: Option<TaskRef>) -> Self {
        Self {
            root: AtomicUsize::new(alloc_relay(0, std::ptr::null_mut()) as usize),
            owner: AtomicUsize::new(owner.map_or(0, TaskRef::addr)),
        }
    }

    pub(crate) fn set_owner(&self, owner: TaskRef) {
        debug_assert_eq!(self.owner.load(Ordering::Acquire), 0);
        self.owner.store(owner.addr(), Ordering::Release);
    }

    fn root_ptr(&self) -> *mut RelayNode {
        self.root.load(Ordering::Acquire) as *mut RelayNode
    }

    /// Walk to a current leaf; used to seed a subscriber's outport.
    pub(crate) fn find_leaf(&self) -> *mut RelayNode {
        let mut current = self.root_ptr();
        loop {
            let mut next = std::ptr::null_mut();
            for slot in unsafe { &(*current).children } {
                let child = tag::pointer::<RelayNode>(slot.load(Ordering::Acquire));
                if !child.is_null() {
                    next = child;
                    break;
                }
            }
            if next.is_null() {
                return current;
            }
            current = next;
        }
    }

    /// Finished once the freeze walk has reached the root.
    pub(crate) fn is_finished(&self) -> bool {
        let word = unsafe { &(*self.root_ptr()).children[0] }.load(Ordering::Acquire);
        tag::tag_of(word) == FROZEN
    }

    /// Subscribe `target` under the caller's `outport`. Fails exactly if
    /// the freeze walk got there first.
    pub(crate) fn insert_at(
        &self,
        outport: *mut RelayNode,
        target: TaskRef,
        inport: *mut ArrivalNode,
    ) -> Option<*mut RelayNode> {
        if self.is_finished() {
            return None;
        }
        let node = alloc_relay(target.addr(), inport);
        let slot = unsafe { &(*outport).children[0] };
        if slot
            .compare_exchange(0, node as usize, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Some(node)
        } else {
            drop(unsafe { Box::from_raw(node) });
            None
        }
    }

    /// Install two fresh children under `port` for a forking pair of
    /// holders. Fails once the outset is frozen; a branch installed before
    /// the losing CAS stays in the tree, target-less, and is freed with it.
    pub(crate) fn fork2(&self, port: *mut RelayNode) -> Option<(*mut RelayNode, *mut RelayNode)> {
        debug_assert!(!port.is_null());
        let mut branches = [std::ptr::null_mut(); 2];
        for i in (0..2).rev() {
            let node = alloc_relay(0, std::ptr::null_mut());
            let slot = unsafe { &(*port).children[i] };
            if slot
                .compare_exchange(0, node as usize, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                drop(unsafe { Box::from_raw(node) });
                return None;
            }
            branches[i] = node;
        }
        Some((branches[0], branches[1]))
    }

    /// Detach the relay tree for reclamation.
    pub(crate) fn take_root(&mut self) -> Option<*mut RelayNode> {
        let root = self.root.swap(0, Ordering::AcqRel) as *mut RelayNode;
        if root.is_null() {
            None
        } else {
            Some(root)
        }
    }
}

impl Drop for PortOutset {
    fn drop(&mut self) {
        let root = self.root.load(Ordering::Acquire) as *mut RelayNode;
        let mut todo = Vec::new();
        if !root.is_null() {
            todo.push(root);
        }
        while let Some(node) = todo.pop() {
            let boxed = unsafe { Box::from_raw(node) };
            for slot in boxed.children.iter() {
                let child = tag::pointer::<RelayNode>(slot.load(Ordering::Acquire));
                if !child.is_null() {
                    todo.push(child);
                }
            }
        }
    }
}

unsafe fn ports_mut<'a>(task: TaskRef) -> &'a mut Ports {
    &mut *task.get().ports.get()
}

/// Record `task`'s port into the incounter identified by `in_word`.
pub(crate) fn insert_inport(task: TaskRef, in_word: usize, port: *mut ArrivalNode) {
    unsafe { ports_mut(task) }.inports.insert(in_word, port);
}

/// Record `task`'s port into the outset at `outset_addr`.
pub(crate) fn insert_outport(task: TaskRef, outset_addr: usize, port: *mut RelayNode) {
    debug_assert!(!port.is_null());
    unsafe { ports_mut(task) }.outports.insert(outset_addr, port);
}

/// Look up the caller's port into an outset; the caller must have listened
/// on it or inherited it.
pub(crate) fn find_outport(task: TaskRef, outset_addr: usize) -> *mut RelayNode {
    *unsafe { ports_mut(task) }
        .outports
        .get(&outset_addr)
        .expect("force without an outport; listen_on the future first")
}

pub(crate) fn remove_outport(task: TaskRef, outset_addr: usize) {
    unsafe { ports_mut(task) }.outports.remove(&outset_addr);
}

/// Decrement the incounter recorded in `in_word` through `port`.
fn decrement_inport_entry(frame: &Frame, in_word: usize, port: *mut ArrivalNode) {
    debug_assert_eq!(tag::tag_of(in_word), 0, "inport to a sentinel incounter");
    // The owner is read before the climb: once the climb returns, the
    // activating sibling may already have released the counter.
    let (owner, status) = match unsafe { &*tag::pointer::<Incounter>(in_word) } {
        Incounter::Port(counter) => (counter.owner(), counter.decrement(port)),
        _ => unreachable!("inport to a top-down incounter"),
    };
    if status == Status::Activated {
        edge::activate(frame, owner);
    }
}

/// Release every claim the finished `task` holds: one decrement per inport.
pub(crate) fn decrement_inports(frame: &Frame, task: TaskRef) {
    let inports = std::mem::take(&mut unsafe { ports_mut(task) }.inports);
    for (in_word, port) in inports {
        decrement_inport_entry(frame, in_word, port);
    }
}

/// Decrement `target`'s incounter through `port`, dispatching on its
/// current tagged word (subscribers of a future wait behind a unary word).
pub(crate) fn decrement_port(frame: &Frame, target: TaskRef, port: *mut ArrivalNode) {
    let in_word = target.get().in_word.load(Ordering::Acquire);
    match tag::tag_of(in_word) {
        0 => decrement_inport_entry(frame, in_word, port),
        _ => {
            debug_assert!(port.is_null());
            edge::decrement_incounter(frame, None, target);
        }
    }
}

fn apply_mode<V: Copy>(mode: PortMode, parent: &HashMap<usize, V>, child: &mut HashMap<usize, V>) {
    match mode {
        PortMode::Default => {
            *child = parent.clone();
        }
        PortMode::Intersection => {
            let kept = parent
                .iter()
                .filter(|(key, _)| child.contains_key(key))
                .map(|(key, value)| (*key, *value))
                .collect();
            *child = kept;
        }
        PortMode::Difference => {
            let kept = parent
                .iter()
                .filter(|(key, _)| !child.contains_key(key))
                .map(|(key, value)| (*key, *value))
                .collect();
            *child = kept;
        }
    }
}

/// Hand `child` its view of `parent`'s ports: apply the child's inheritance
/// modes, then fork every port now shared so each side holds a private one.
/// Entries whose outset has already frozen are dropped from both.
pub(crate) fn propagate_ports(parent: TaskRef, child: TaskRef) {
    debug_assert_ne!(parent.addr(), child.addr());
    let parent_ports = unsafe { ports_mut(parent) };
    let child_ports = unsafe { ports_mut(child) };

    apply_mode(
        child_ports.inport_mode,
        &parent_ports.inports,
        &mut child_ports.inports,
    );
    for (in_word, child_entry) in child_ports.inports.iter_mut() {
        if let Some(parent_entry) = parent_ports.inports.get_mut(in_word) {
            let (left, right) = fork_arrival(*parent_entry);
            *parent_entry = left;
            *child_entry = right;
        }
    }

    apply_mode(
        child_ports.outport_mode,
        &parent_ports.outports,
        &mut child_ports.outports,
    );
    let mut dead = Vec::new();
    for (outset_addr, child_entry) in child_ports.outports.iter_mut() {
        if let Some(parent_entry) = parent_ports.outports.get_mut(outset_addr) {
            let outset = unsafe { &*(*outset_addr as *const Outset) };
            match outset.port().fork2(*parent_entry) {
                Some((left, right)) => {
                    *parent_entry = left;
                    *child_entry = right;
                }
                None => dead.push(*outset_addr),
            }
        }
    }
    for outset_addr in dead {
        parent_ports.outports.remove(&outset_addr);
        child_ports.outports.remove(&outset_addr);
    }
}

/// Freeze up to `communication_delay` relay nodes, decrementing each
/// recorded target exactly once and queueing children.
fn notify_relay_partial(frame: &Frame, todo: &mut VecDeque<*mut RelayNode>) {
    let mut k = 0;
    while k < frame.config.communication_delay && !todo.is_empty() {
        let node = todo.pop_back().unwrap();
        if let Some(target) = TaskRef::from_addr(unsafe { (*node).target }) {
            decrement_port(frame, target, unsafe { (*node).inport });
        }
        for slot in unsafe { &(*node).children } {
            let mut orig;
            loop {
                orig = slot.load(Ordering::Acquire);
                if slot
                    .compare_exchange(orig, orig | FROZEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    break;
                }
            }
            let child = tag::pointer::<RelayNode>(orig);
            if !child.is_null() {
                todo.push_back(child);
            }
        }
        k += 1;
    }
}

/// The producing task of `outset` has terminated: release its inport
/// claims, then freeze and drain the relay tree.
pub(crate) fn outset_finished(frame: &Frame, outset: NonNull<Outset>) {
    let out = unsafe { outset.as_ref() }.port();
    if let Some(owner) = TaskRef::from_addr(out.owner.load(Ordering::Acquire)) {
        decrement_inports(frame, owner);
    }
    let mut todo = VecDeque::from(vec![out.root_ptr()]);
    notify_relay_partial(frame, &mut todo);
    if todo.is_empty() {
        edge::outset_drained(frame, outset);
    } else {
        let walk = TaskRef::new(RelayNotifyPar { outset, todo });
        edge::prepare(walk, edge::in_ready(), edge::out_noop());
        edge::add_node(frame, walk);
    }
}

const ENTRY: BlockId = 0;
const EXIT: BlockId = 1;

/// Outer notify task: the recursive walk runs under a `finish`, then the
/// drained outset is handed back for destruction.
struct RelayNotifyPar {
    outset: NonNull<Outset>,
    todo: VecDeque<*mut RelayNode>,
}

unsafe impl Send for RelayNotifyPar {}

impl Body for RelayNotifyPar {
    fn run(&mut self, block: BlockId, cx: &mut Context) {
        match block {
            ENTRY => {
                let rec = TaskRef::new(RelayNotifyRec {
                    join: cx.me(),
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

/// Splittable recursive notify walk over a relay tree.
struct RelayNotifyRec {
    join: TaskRef,
    todo: VecDeque<*mut RelayNode>,
}

unsafe impl Send for RelayNotifyRec {}

impl Body for RelayNotifyRec {
    fn run(&mut self, block: BlockId, cx: &mut Context) {
        match block {
            PROCESS => {
                notify_relay_partial(cx.frame, &mut self.todo);
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
        let sibling = TaskRef::new(RelayNotifyRec {
            join: self.join,
            todo: VecDeque::from(vec![node]),
        });
        cx.adopt_split_sibling(sibling, Some(self.join));
        Some(sibling)
    }
}

fn dealloc_relay_partial(frame: &Frame, todo: &mut VecDeque<*mut RelayNode>) {
    let mut k = 0;
    while k < frame.config.communication_delay && !todo.is_empty() {
        let node = todo.pop_back().unwrap();
        let boxed = unsafe { Box::from_raw(node) };
        for slot in boxed.children.iter() {
            let child = tag::pointer::<RelayNode>(slot.load(Ordering::Acquire));
            if !child.is_null() {
                todo.push_back(child);
            }
        }
        k += 1;
    }
}

/// Free a drained relay tree, spawning a parallel walk if one batch is not
/// enough.
pub(crate) fn deallocate_relay_tree(frame: &Frame, root: *mut RelayNode) {
    let mut todo = VecDeque::from(vec![root]);
    dealloc_relay_partial(frame, &mut todo);
    if !todo.is_empty() {
        let walk = TaskRef::new(RelayReclaim { todo });
        edge::prepare(walk, edge::in_ready(), edge::out_noop());
        edge::add_node(frame, walk);
    }
}

/// Splittable deallocation walk over a drained relay tree.
struct RelayReclaim {
    todo: VecDeque<*mut RelayNode>,
}

unsafe impl Send for RelayReclaim {}

impl Body for RelayReclaim {
    fn run(&mut self, block: BlockId, cx: &mut Context) {
        match block {
            PROCESS => {
                dealloc_relay_partial(cx.frame, &mut self.todo);
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
        let sibling = TaskRef::new(RelayReclaim { todo: VecDeque::from(vec![node]) });
        cx.adopt_split_sibling(sibling, None);
        Some(sibling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arrival_tree_last_removal_activates() {
        let owner = TaskRef::new(crate::loops::NopBody);
        let counter = PortIncounter::new(owner);
        let root = root_arrival();
        let (a, b) = fork_arrival(root);
        let (c, d) = fork_arrival(b);
        assert_eq!(counter.decrement(a), Status::NotActivated);
        assert_eq!(counter.decrement(c), Status::NotActivated);
        assert_eq!(counter.decrement(d), Status::Activated);
        unsafe { owner.destroy() };
    }

    #[test]
    fn fork2_fails_once_frozen() {
        let outset = PortOutset::new(None);
        let leaf = outset.find_leaf();
        let frame_less_freeze = |node: *mut RelayNode| {
            for slot in unsafe { &(*node).children } {
                let orig = slot.load(Ordering::Acquire);
                slot.store(orig | FROZEN, Ordering::Release);
            }
        };
        frame_less_freeze(leaf);
        assert!(outset.is_finished());
        assert!(outset.fork2(leaf).is_none());
    }
}
