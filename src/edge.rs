//! Edge enforcement: tagged `in`/`out` words, their sentinel fast paths,
//! and dispatch into the structured incounter and outset representations.
//!
//! Incounter word tags:
//! `READY = 1` (always activated), `UNARY = 2` (exactly one pending edge),
//! `FETCH_ADD = 3` (signed count in the pointer bits), `0` = pointer to an
//! [`Incounter`].
//!
//! Outset word tags:
//! `NOOP = 1` (notifications dropped), `UNARY = 2` (target task in the
//! pointer bits), `DISTRIBUTED_UNARY = 3` (SNZI leaf of the target's
//! incounter in the pointer bits), `PORT_UNARY = 4` (the source task itself;
//! finishing drains its inports), `0` = pointer to an [`Outset`].

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::dyntree::{self, DyntreeIncounter, DyntreeOutset};
use crate::port::{self, PortIncounter, PortOutset};
use crate::simple::SimpleOutset;
use crate::snzi::{SnziNode, SnziTree};
use crate::tag;
use crate::task::TaskRef;
use crate::{Algo, EdgeAlgo, Frame};

const IN_READY: usize = 1;
const IN_UNARY: usize = 2;
const IN_FETCH_ADD: usize = 3;

const OUT_NOOP: usize = 1;
const OUT_UNARY: usize = 2;
const OUT_DISTRIBUTED_UNARY: usize = 3;
const OUT_PORT_UNARY: usize = 4;

/// The always-activated incounter word.
pub(crate) fn in_ready() -> usize {
    tag::pack(std::ptr::null_mut::<u8>(), IN_READY)
}

/// The one-pending-edge incounter word.
pub(crate) fn in_unary() -> usize {
    tag::pack(std::ptr::null_mut::<u8>(), IN_UNARY)
}

/// A zero-count fetch-add incounter word.
pub(crate) fn in_fetch_add() -> usize {
    tag::pack_count(0, IN_FETCH_ADD)
}

/// The dropped-notifications outset word.
pub(crate) fn out_noop() -> usize {
    tag::pack(std::ptr::null_mut::<u8>(), OUT_NOOP)
}

/// An unaimed unary outset word; `add_edge` aims it.
pub(crate) fn out_unary() -> usize {
    tag::pack(std::ptr::null_mut::<u8>(), OUT_UNARY)
}

/// The bottom-up unary outset word: finishing `source` drains its inports.
pub(crate) fn out_port_unary(source: TaskRef) -> usize {
    tag::pack(source.addr() as *mut u8, OUT_PORT_UNARY)
}

/// The unary outset word this run's configuration calls for: under the
/// distributed representation a unary edge departs a SNZI leaf directly.
pub(crate) fn out_unary_for(frame: &Frame) -> usize {
    match (frame.config.algo, frame.config.edge_algo) {
        (Algo::Direct, EdgeAlgo::Distributed) => {
            tag::pack(std::ptr::null_mut::<SnziNode>(), OUT_DISTRIBUTED_UNARY)
        }
        _ => out_unary(),
    }
}

/// Result of removing one incoming edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    /// This removal took the counter to its activated state.
    Activated,
    /// Edges remain.
    NotActivated,
}

/// A structured incounter: the scalable representations behind tag `0`.
pub enum Incounter {
    /// SNZI tree; source identities shard arrivals across leaves.
    Distributed(SnziTree),
    /// Two-root dynamic tree of arrival leaves.
    Dyntree(DyntreeIncounter),
    /// Bottom-up counter; arrivals live in the port tree, not here.
    Port(PortIncounter),
}

impl Incounter {
    /// Stable true once the activating condition has been reached.
    pub fn is_activated(&self) -> bool {
        match self {
            Self::Distributed(tree) => !tree.is_nonzero(),
            Self::Dyntree(counter) => counter.is_activated(),
            Self::Port(_) => unreachable!("port-passing counters are observed through ports"),
        }
    }

    /// Record one new incoming edge. `ident` shards the arrival for the
    /// distributed representation; zero means anonymous.
    pub fn increment(&self, ident: usize) {
        match self {
            Self::Distributed(tree) => tree.leaf_for(ident).arrive(),
            Self::Dyntree(counter) => counter.increment(),
            Self::Port(_) => unreachable!("port-passing counters are incremented through ports"),
        }
    }

    /// Remove one incoming edge.
    pub fn decrement(&self, ident: usize) -> Status {
        match self {
            Self::Distributed(tree) => {
                if tree.leaf_for(ident).depart() {
                    Status::Activated
                } else {
                    Status::NotActivated
                }
            }
            Self::Dyntree(counter) => counter.decrement(),
            Self::Port(_) => unreachable!("port-passing counters are decremented through ports"),
        }
    }
}

const DRAINED: u8 = 1;
const RELEASED: u8 = 2;

/// A structured outset: the representations behind tag `0`.
pub struct Outset {
    /// Externally owned (future) outsets survive their finish walk.
    external: AtomicBool,
    /// Destruction handshake between the finish walk and the owner.
    state: AtomicU8,
    pub(crate) kind: OutsetKind,
}

/// The concrete outset representations.
pub enum OutsetKind {
    /// Treiber stack of subscriber cells.
    Simple(SimpleOutset),
    /// Tree of tagged-union slots.
    Dyntree(DyntreeOutset),
    /// Bottom-up relay tree.
    Port(PortOutset),
}

impl Outset {
    /// Mark the outset as externally owned, disabling
    /// deallocate-at-finish.
    pub fn enable_future(&self) {
        self.external.store(true, Ordering::Release);
    }

    /// Register `target`; fails exactly if the outset has already finished.
    pub(crate) fn insert(&self, _frame: &Frame, target: TaskRef) -> bool {
        match &self.kind {
            OutsetKind::Simple(outset) => outset.insert(target),
            OutsetKind::Dyntree(outset) => outset.insert(target),
            OutsetKind::Port(_) => {
                unreachable!("port-passing outsets are inserted into through ports")
            }
        }
    }

    /// The bottom-up representation, for port operations.
    pub(crate) fn port(&self) -> &PortOutset {
        match &self.kind {
            OutsetKind::Port(outset) => outset,
            _ => unreachable!("not a port-passing outset"),
        }
    }

    /// Record the producing task (bottom-up futures learn theirs late).
    pub(crate) fn set_owner(&self, owner: TaskRef) {
        self.port().set_owner(owner);
    }
}

/// Handle to a producer's outset, used as the subscription point for
/// `force`. The producer's completion notifies every subscriber.
#[derive(Clone, Copy)]
pub struct Future(pub(crate) NonNull<Outset>);

unsafe impl Send for Future {}
unsafe impl Sync for Future {}

impl Future {
    pub(crate) fn outset(&self) -> &Outset {
        unsafe { self.0.as_ref() }
    }

    pub(crate) fn addr(&self) -> usize {
        self.0.as_ptr() as usize
    }

    pub(crate) fn word(&self) -> usize {
        tag::pack(self.0.as_ptr(), 0)
    }
}

fn new_outset(frame: &Frame, owner: Option<TaskRef>) -> NonNull<Outset> {
    let kind = match (frame.config.algo, frame.config.edge_algo) {
        (Algo::PortPassing, _) => OutsetKind::Port(PortOutset::new(owner)),
        (Algo::Direct, EdgeAlgo::Simple) => OutsetKind::Simple(SimpleOutset::new()),
        (Algo::Direct, _) => OutsetKind::Dyntree(DyntreeOutset::new(frame.config.branching_factor)),
    };
    let boxed = Box::new(Outset {
        external: AtomicBool::new(false),
        state: AtomicU8::new(0),
        kind,
    });
    unsafe { NonNull::new_unchecked(Box::into_raw(boxed)) }
}

/// Allocate an externally owned outset for a future.
pub(crate) fn outset_future(frame: &Frame) -> Future {
    let outset = new_outset(frame, None);
    unsafe { outset.as_ref() }.enable_future();
    Future(outset)
}

/// Allocate a default (auto-deallocating) outset word for `owner`.
pub(crate) fn outset_default(frame: &Frame, owner: TaskRef) -> usize {
    tag::pack(new_outset(frame, Some(owner)).as_ptr(), 0)
}

/// Allocate the structured incounter this run's configuration calls for.
pub(crate) fn incounter_new(frame: &Frame, owner: TaskRef) -> usize {
    let incounter = match (frame.config.algo, frame.config.edge_algo) {
        (Algo::Direct, EdgeAlgo::Simple) => return in_fetch_add(),
        (Algo::Direct, EdgeAlgo::Distributed) => {
            let tree = SnziTree::new(frame.config.branching_factor, frame.config.nb_levels);
            tree.set_root_annotation(owner.addr());
            Incounter::Distributed(tree)
        }
        (Algo::Direct, EdgeAlgo::Dyntree) => {
            Incounter::Dyntree(DyntreeIncounter::new(frame.config.branching_factor))
        }
        (Algo::PortPassing, _) => Incounter::Port(PortIncounter::new(owner)),
    };
    tag::pack(Box::into_raw(Box::new(incounter)), 0)
}

/// Install an incounter and an outset word on a task.
pub(crate) fn prepare(task: TaskRef, in_word: usize, out_word: usize) {
    task.get().in_word.store(in_word, Ordering::Release);
    task.get().out_word.store(out_word, Ordering::Release);
}

/// Hand a prepared task to the pool. A structured incounter that was never
/// armed is released here.
pub(crate) fn add_node(frame: &Frame, task: TaskRef) {
    let in_word = task.get().in_word.load(Ordering::Acquire);
    if tag::tag_of(in_word) == 0 {
        task.get().in_word.store(in_ready(), Ordering::Release);
        destroy_incounter(frame, in_word);
    }
    frame.schedule(task);
}

/// Activation: the task's structured incounter reached its activating state.
/// Releases the counter and schedules the task.
pub(crate) fn activate(frame: &Frame, task: TaskRef) {
    let in_word = task.get().in_word.swap(in_ready(), Ordering::AcqRel);
    if tag::tag_of(in_word) == 0 {
        destroy_incounter(frame, in_word);
    }
    frame.schedule(task);
}

/// Free a structured incounter. The dyntree representation defers its
/// consumed-arrivals tree to a parallel walk.
pub(crate) fn destroy_incounter(frame: &Frame, in_word: usize) {
    debug_assert_eq!(tag::tag_of(in_word), 0);
    let mut boxed = unsafe { Box::from_raw(tag::pointer::<Incounter>(in_word)) };
    if let Incounter::Dyntree(ref mut counter) = *boxed {
        if let Some(root) = counter.take_out_root() {
            dyntree::deallocate_incounter_tree(frame, root);
        }
    }
    drop(boxed);
}

/// True when the tagged incounter word reports activated.
pub(crate) fn incounter_is_activated(in_word: usize) -> bool {
    match tag::tag_of(in_word) {
        IN_READY => true,
        IN_UNARY => false,
        IN_FETCH_ADD => tag::count_of(in_word) == 0,
        _ => unsafe { &*tag::pointer::<Incounter>(in_word) }.is_activated(),
    }
}

/// If `task`'s incounter is activated, schedule it.
pub(crate) fn check(frame: &Frame, task: TaskRef) {
    let in_word = task.get().in_word.load(Ordering::Acquire);
    if incounter_is_activated(in_word) {
        activate(frame, task);
    }
}

/// Record one new incoming edge on `target`.
pub(crate) fn increment_incounter(_frame: &Frame, source: Option<TaskRef>, target: TaskRef) {
    let in_word = target.get().in_word.load(Ordering::Acquire);
    match tag::tag_of(in_word) {
        IN_READY => panic!("increment on an activated incounter"),
        IN_UNARY => {}
        IN_FETCH_ADD => {
            target.get().in_word.fetch_add(tag::COUNT_UNIT, Ordering::AcqRel);
        }
        _ => {
            let incounter = unsafe { &*tag::pointer::<Incounter>(in_word) };
            incounter.increment(source.map_or(0, TaskRef::addr));
        }
    }
}

/// Remove one incoming edge from `target`, scheduling it on activation.
pub(crate) fn decrement_incounter(frame: &Frame, source: Option<TaskRef>, target: TaskRef) {
    let in_word = target.get().in_word.load(Ordering::Acquire);
    match tag::tag_of(in_word) {
        IN_READY => panic!("decrement on a ready incounter"),
        IN_UNARY => frame.schedule(target),
        IN_FETCH_ADD => {
            let old = target.get().in_word.fetch_sub(tag::COUNT_UNIT, Ordering::AcqRel);
            if tag::count_of(old) == 1 {
                frame.schedule(target);
            }
        }
        _ => {
            let incounter = unsafe { &*tag::pointer::<Incounter>(in_word) };
            if incounter.decrement(source.map_or(0, TaskRef::addr)) == Status::Activated {
                activate(frame, target);
            }
        }
    }
}

/// Combined increment or decrement with scheduling on activation.
pub(crate) fn delta(frame: &Frame, source: Option<TaskRef>, target: TaskRef, d: i64) {
    match d {
        1 => increment_incounter(frame, source, target),
        -1 => decrement_incounter(frame, source, target),
        _ => panic!("delta must be +1 or -1"),
    }
}

/// Register `target` in `source`'s outset. Returns false exactly if the
/// outset has already finished.
///
/// The unary fast paths rewrite `source`'s `out` word without a CAS; this is
/// sound because edges out of a task are only created before the task has
/// been handed to the pool.
pub(crate) fn outset_insert(frame: &Frame, source: TaskRef, target: TaskRef) -> bool {
    let out_word = source.get().out_word.load(Ordering::Acquire);
    match tag::tag_of(out_word) {
        OUT_NOOP => panic!("insert into a noop outset"),
        OUT_UNARY => {
            let aimed = tag::pack(target.addr() as *mut u8, OUT_UNARY);
            source.get().out_word.store(aimed, Ordering::Release);
            true
        }
        OUT_DISTRIBUTED_UNARY => {
            let target_in = target.get().in_word.load(Ordering::Acquire);
            let aimed = if tag::tag_of(target_in) == 0 {
                match unsafe { &*tag::pointer::<Incounter>(target_in) } {
                    Incounter::Distributed(tree) => {
                        let leaf = tree.leaf_for(source.addr()) as *const SnziNode;
                        tag::pack(leaf as *mut SnziNode, OUT_DISTRIBUTED_UNARY)
                    }
                    _ => tag::pack(target.addr() as *mut u8, OUT_UNARY),
                }
            } else {
                tag::pack(target.addr() as *mut u8, OUT_UNARY)
            };
            source.get().out_word.store(aimed, Ordering::Release);
            true
        }
        OUT_PORT_UNARY => {
            unreachable!("port-passing edges are wired through port maps")
        }
        _ => {
            let outset = unsafe { &*tag::pointer::<Outset>(out_word) };
            outset.insert(frame, target)
        }
    }
}

/// Add one edge `source -> target`.
///
/// The increment happens before the insertion attempt so that a source
/// finishing concurrently can never miss an activation; a failed insert is
/// compensated by decrementing.
pub(crate) fn add_edge(frame: &Frame, source: TaskRef, target: TaskRef) {
    increment_incounter(frame, Some(source), target);
    if !outset_insert(frame, source, target) {
        decrement_incounter(frame, Some(source), target);
    }
}

/// The source task has terminated: freeze and drain its outset.
pub(crate) fn outset_finished(frame: &Frame, source: TaskRef) {
    let out_word = source.get().out_word.load(Ordering::Acquire);
    match tag::tag_of(out_word) {
        OUT_NOOP => {}
        OUT_UNARY => {
            if let Some(target) = TaskRef::from_addr(out_word & !tag::TAG_MASK) {
                decrement_incounter(frame, Some(source), target);
            }
        }
        OUT_DISTRIBUTED_UNARY => {
            let leaf = tag::pointer::<SnziNode>(out_word);
            if !leaf.is_null() {
                let leaf = unsafe { &*leaf };
                if leaf.depart() {
                    let annotated = TaskRef::from_addr(leaf.root_annotation())
                        .expect("distributed incounter without a root annotation");
                    activate(frame, annotated);
                }
            }
        }
        OUT_PORT_UNARY => {
            let owner = TaskRef::from_addr(out_word & !tag::TAG_MASK)
                .expect("port-passing unary outset without its source");
            port::decrement_inports(frame, owner);
        }
        _ => {
            let outset = unsafe { NonNull::new_unchecked(tag::pointer::<Outset>(out_word)) };
            outset_object_finished(frame, outset);
        }
    }
}

/// Freeze and drain a structured outset.
pub(crate) fn outset_object_finished(frame: &Frame, outset: NonNull<Outset>) {
    match &unsafe { outset.as_ref() }.kind {
        OutsetKind::Simple(simple) => {
            simple.finish(frame);
            outset_drained(frame, outset);
        }
        OutsetKind::Dyntree(_) => dyntree::notify_outset(frame, outset),
        OutsetKind::Port(_) => port::outset_finished(frame, outset),
    }
}

/// The finish walk of `outset` has notified every subscriber. Auto-owned
/// outsets die here; externally owned ones wait for their release.
pub(crate) fn outset_drained(frame: &Frame, outset: NonNull<Outset>) {
    let shared = unsafe { outset.as_ref() };
    if !shared.external.load(Ordering::Acquire) {
        destroy_outset(frame, outset);
    } else if shared.state.fetch_or(DRAINED, Ordering::AcqRel) & RELEASED != 0 {
        destroy_outset(frame, outset);
    }
}

/// Release an externally owned future. Destruction is deferred to the finish
/// walk if that walk is still running.
pub(crate) fn release_future(frame: &Frame, future: Future) {
    let shared = future.outset();
    debug_assert!(shared.external.load(Ordering::Acquire));
    if shared.state.fetch_or(RELEASED, Ordering::AcqRel) & DRAINED != 0 {
        destroy_outset(frame, future.0);
    }
}

/// Free a drained outset; tree-shaped storage goes to a parallel walk.
fn destroy_outset(frame: &Frame, outset: NonNull<Outset>) {
    let mut boxed = unsafe { Box::from_raw(outset.as_ptr()) };
    match &mut boxed.kind {
        OutsetKind::Simple(_) => {}
        OutsetKind::Dyntree(out) => {
            if let Some(root) = out.take_root() {
                dyntree::deallocate_outset_tree(frame, root);
            }
        }
        OutsetKind::Port(out) => {
            if let Some(root) = out.take_root() {
                port::deallocate_relay_tree(frame, root);
            }
        }
    }
    drop(boxed);
}
