//! The resumable task object and its control-flow constructs.
//!
//! A task is a small state machine: a body dispatching on a block label,
//! plus a header carrying the label to resume at and the two tagged words
//! (`in`, `out`) that tie the task into the graph. Tasks are heap objects
//! handed around as raw [`TaskRef`] handles and destroyed when they return
//! from a block without transferring; see the protocol notes on [`Task`].

use std::cell::{Cell, UnsafeCell};
use std::collections::HashMap;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::edge::{self, Future};
use crate::loops::RangeBody;
use crate::port::{self, ArrivalNode, RelayNode};
use crate::{Algo, Frame};

/// Label of one straight-line block of a task body.
pub type BlockId = i32;

/// Label every fresh task starts at.
pub const ENTRY_BLOCK: BlockId = 0;

/// Sentinel meaning "must not resume".
pub const UNINITIALIZED_BLOCK: BlockId = -1;

/// How a spawned child inherits its parent's port maps
/// (bottom-up family only).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortMode {
    /// Child receives a copy of the parent's map.
    Default,
    /// Child keeps only the keys it pre-declared that the parent also holds.
    Intersection,
    /// Child receives the parent's entries except the keys it pre-declared.
    Difference,
}

/// Port state of one task: its private access points into foreign edge sets.
pub(crate) struct Ports {
    pub inport_mode: PortMode,
    pub outport_mode: PortMode,
    /// Incounter identity (tagged `in` word) to this task's arrival node.
    pub inports: HashMap<usize, *mut ArrivalNode>,
    /// Outset identity (object address) to this task's relay node.
    pub outports: HashMap<usize, *mut RelayNode>,
}

impl Ports {
    fn new() -> Self {
        Self {
            inport_mode: PortMode::Default,
            outport_mode: PortMode::Default,
            inports: HashMap::new(),
            outports: HashMap::new(),
        }
    }
}

/// One schedulable node of the task graph.
///
/// The header fields are accessed under the one-runner-at-a-time protocol:
/// a task is executed by at most one worker at any instant, and every
/// hand-off between workers goes through a release/acquire pair (an edge
/// decrement followed by the queue push). Only `in_word` and `out_word` are
/// touched by other threads, and only through their atomic operations.
pub struct Task {
    current_block: Cell<BlockId>,
    continuation_block: Cell<BlockId>,
    /// Tagged incounter word; see the tag table in [`crate::edge`].
    pub(crate) in_word: AtomicUsize,
    /// Tagged outset word.
    pub(crate) out_word: AtomicUsize,
    pub(crate) ports: UnsafeCell<Ports>,
    body: UnsafeCell<Box<dyn Body>>,
}

// One runner at a time; cross-thread hand-offs synchronize through the
// scheduler queue and the edge atomics.
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

/// Copyable handle to a [`Task`].
///
/// The handle does not own the task; the runtime destroys a task when it
/// terminates. Holding a handle past that point is allowed, using it is not.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskRef(NonNull<Task>);

unsafe impl Send for TaskRef {}
unsafe impl Sync for TaskRef {}

impl TaskRef {
    /// Allocate a task around a body. The task starts at [`ENTRY_BLOCK`]
    /// once prepared and scheduled.
    pub fn new<B: Body + 'static>(body: B) -> Self {
        let task = Box::new(Task {
            current_block: Cell::new(UNINITIALIZED_BLOCK),
            continuation_block: Cell::new(ENTRY_BLOCK),
            in_word: AtomicUsize::new(edge::in_ready()),
            out_word: AtomicUsize::new(edge::out_noop()),
            ports: UnsafeCell::new(Ports::new()),
            body: UnsafeCell::new(Box::new(body)),
        });
        Self(unsafe { NonNull::new_unchecked(Box::into_raw(task)) })
    }

    #[inline]
    pub(crate) fn get(&self) -> &Task {
        unsafe { self.0.as_ref() }
    }

    #[inline]
    pub(crate) fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    pub(crate) fn from_addr(addr: usize) -> Option<Self> {
        NonNull::new(addr as *mut Task).map(Self)
    }

    /// Choose how this task will inherit inports when it is spawned.
    /// Must be called before the task is handed to any construct.
    pub fn set_inport_mode(&self, mode: PortMode) {
        unsafe { &mut *self.get().ports.get() }.inport_mode = mode;
    }

    /// Choose how this task will inherit outports when it is spawned.
    /// Must be called before the task is handed to any construct.
    pub fn set_outport_mode(&self, mode: PortMode) {
        unsafe { &mut *self.get().ports.get() }.outport_mode = mode;
    }

    /// Free the task.
    ///
    /// The pool destroys a task itself when it terminates; call this only
    /// for a task that was never scheduled.
    ///
    /// # Safety
    /// No use of any handle to this task may follow.
    pub unsafe fn destroy(self) {
        drop(Box::from_raw(self.0.as_ptr()));
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "{:#x}", self.addr())
    }
}

/// A task body: the state machine run by the pool.
///
/// After invoking a suspending construct on the [`Context`] (`finish`,
/// `call`, `parallel_for`, `force`), the body must return from the current
/// block without touching `self` again: the spawned work may satisfy the
/// recorded edge and resume the task on another worker before the current
/// activation unwinds. The requeue-style constructs (`jump_to`, `fork`,
/// `future`, `detach`) only hand the task back after the body returns.
pub trait Body: Send {
    /// Execute the block named by `block`.
    fn run(&mut self, block: BlockId, cx: &mut Context);

    /// Remaining work, for splittable bodies. Zero means not splittable.
    fn size(&self) -> usize {
        0
    }

    /// Hand off roughly half of the remaining work as a new task.
    /// Implementations prepare the sibling via
    /// [`Context::adopt_split_sibling`]; the pool schedules it.
    fn split(&mut self, _cx: &mut Context) -> Option<TaskRef> {
        None
    }
}

/// What the finished activation asked the pool to do with the task.
pub(crate) enum Transfer {
    /// Put the task back on the queue; it continues at its new label.
    Requeue,
    /// The task waits on its incounter; an edge will reschedule it.
    Wait,
}

/// Per-activation view of the runtime handed to a running body.
pub struct Context<'a> {
    pub(crate) frame: &'a Frame,
    me: TaskRef,
    pub(crate) transfer: Option<Transfer>,
}

impl<'a> Context<'a> {
    /// Handle of the task currently running.
    pub fn me(&self) -> TaskRef {
        self.me
    }

    /// The batch size used by loop and reclamation bodies.
    pub fn communication_delay(&self) -> usize {
        self.frame.config.communication_delay
    }

    /// This run's configuration.
    pub fn config(&self) -> crate::Config {
        self.frame.config
    }

    fn prepare_for_transfer(&mut self, label: BlockId) {
        self.me.get().continuation_block.set(label);
        self.transfer = Some(Transfer::Wait);
    }

    /// Transfer to `label` and requeue self.
    pub fn jump_to(&mut self, label: BlockId) {
        self.prepare_for_transfer(label);
        self.me.get().in_word.store(edge::in_ready(), Ordering::Release);
        self.transfer = Some(Transfer::Requeue);
    }

    /// Spawn `producer`; its completion satisfies one edge into `consumer`.
    /// Self continues at `label`.
    pub fn fork(&mut self, producer: TaskRef, consumer: TaskRef, label: BlockId) {
        match self.frame.config.algo {
            Algo::Direct => {
                edge::prepare(producer, edge::in_ready(), edge::out_unary_for(self.frame));
                edge::add_edge(self.frame, producer, consumer);
            }
            Algo::PortPassing => {
                edge::prepare(producer, edge::in_ready(), edge::out_port_unary(producer));
                let consumer_in = consumer.get().in_word.load(Ordering::Acquire);
                port::insert_inport(producer, consumer_in, std::ptr::null_mut());
                port::propagate_ports(self.me, producer);
            }
        }
        self.jump_to(label);
        edge::add_node(self.frame, producer);
    }

    /// Spawn `producer` and suspend self at `label` until every task spawned
    /// in the new scope has completed.
    pub fn finish(&mut self, producer: TaskRef, label: BlockId) {
        let consumer = self.me;
        match self.frame.config.algo {
            Algo::Direct => {
                edge::prepare(producer, edge::in_ready(), edge::out_unary_for(self.frame));
                self.prepare_for_transfer(label);
                let in_word = edge::incounter_new(self.frame, consumer);
                consumer.get().in_word.store(in_word, Ordering::Release);
                edge::add_edge(self.frame, producer, consumer);
            }
            Algo::PortPassing => {
                edge::prepare(producer, edge::in_ready(), edge::out_port_unary(producer));
                let in_word = edge::incounter_new(self.frame, consumer);
                consumer.get().in_word.store(in_word, Ordering::Release);
                port::propagate_ports(consumer, producer);
                let root_port = port::root_arrival();
                port::insert_inport(producer, in_word, root_port);
                self.prepare_for_transfer(label);
            }
        }
        edge::add_node(self.frame, producer);
    }

    /// `finish` under its call-like name: run `target` to completion, then
    /// continue at `label`.
    pub fn call(&mut self, target: TaskRef, label: BlockId) {
        self.finish(target, label);
    }

    /// Allocate an externally owned outset for use as a future.
    pub fn allocate_future(&self) -> Future {
        edge::outset_future(self.frame)
    }

    /// Spawn `producer` writing through the pre-allocated `future`.
    /// Self continues at `label`; consumers subscribe via [`Context::force`].
    pub fn future_with(&mut self, producer: TaskRef, future: Future, label: BlockId) {
        edge::prepare(producer, edge::in_ready(), future.word());
        if let Algo::PortPassing = self.frame.config.algo {
            future.outset().set_owner(producer);
            port::propagate_ports(self.me, producer);
            self.listen_on(future);
        }
        self.jump_to(label);
        edge::add_node(self.frame, producer);
    }

    /// Spawn `producer` as a future, allocating its outset.
    pub fn future(&mut self, producer: TaskRef, label: BlockId) -> Future {
        let future = self.allocate_future();
        self.future_with(producer, future, label);
        future
    }

    /// Register self as a subscriber of an already shared `future`
    /// (bottom-up family; no-op top-down).
    pub fn listen_on(&self, future: Future) {
        if let Algo::PortPassing = self.frame.config.algo {
            let leaf = future.outset().port().find_leaf();
            port::insert_outport(self.me, future.addr(), leaf);
        }
    }

    /// Suspend self at `label` until `future`'s producer has finished.
    /// Resumes immediately if it already has.
    pub fn force(&mut self, future: Future, label: BlockId) {
        let consumer = self.me;
        self.prepare_for_transfer(label);
        consumer.get().in_word.store(edge::in_unary(), Ordering::Release);
        let subscribed = match self.frame.config.algo {
            Algo::Direct => future.outset().insert(self.frame, consumer),
            Algo::PortPassing => {
                let out = future.outset().port();
                let subscribed = if out.is_finished() {
                    false
                } else {
                    let outport = port::find_outport(consumer, future.addr());
                    out.insert_at(outport, consumer, std::ptr::null_mut()).is_some()
                };
                port::remove_outport(consumer, future.addr());
                subscribed
            }
        };
        if !subscribed {
            // The producer is done; undo the reservation by resuming now.
            self.transfer = Some(Transfer::Requeue);
        }
    }

    /// Release an externally owned future. Legal once its producer has
    /// finished and the caller no longer forces it.
    pub fn deallocate_future(&self, future: Future) {
        if let Algo::PortPassing = self.frame.config.algo {
            port::remove_outport(self.me, future.addr());
        }
        edge::release_future(self.frame, future);
    }

    /// Run `body` over `lo..hi` as a splittable range task; self suspends at
    /// `label` until the whole range is done.
    pub fn parallel_for<F>(&mut self, lo: i64, hi: i64, body: F, label: BlockId)
    where
        F: Fn(i64) + Send + Sync + 'static,
    {
        let producer = TaskRef::new(RangeBody::new(lo, hi, self.me, body));
        self.finish(producer, label);
    }

    /// Transfer to `label` without requeueing; self resumes only when some
    /// other task `call`s or schedules it.
    pub fn detach(&mut self, label: BlockId) {
        self.prepare_for_transfer(label);
        self.me.get().in_word.store(edge::in_ready(), Ordering::Release);
    }

    /// Combined increment/decrement with scheduling on activation.
    pub fn delta(&self, source: Option<TaskRef>, target: TaskRef, d: i64) {
        edge::delta(self.frame, source, target, d);
    }

    /// Schedule `target` if its incounter is activated; used to resume a
    /// detached task.
    pub fn check(&self, target: TaskRef) {
        edge::check(self.frame, target);
    }

    /// Wire a freshly split `sibling` the way this family expects: the
    /// sibling joins `join` if given, otherwise runs unobserved.
    pub fn adopt_split_sibling(&mut self, sibling: TaskRef, join: Option<TaskRef>) {
        match (self.frame.config.algo, join) {
            (Algo::Direct, Some(join)) => {
                edge::prepare(sibling, edge::in_ready(), edge::out_unary_for(self.frame));
                edge::add_edge(self.frame, sibling, join);
            }
            (Algo::PortPassing, Some(join)) => {
                edge::prepare(sibling, edge::in_ready(), edge::out_port_unary(sibling));
                let join_in = join.get().in_word.load(Ordering::Acquire);
                port::insert_inport(sibling, join_in, std::ptr::null_mut());
                port::propagate_ports(self.me, sibling);
            }
            (_, None) => {
                edge::prepare(sibling, edge::in_ready(), edge::out_noop());
            }
        }
    }
}

/// Run one activation of `task` on the current worker.
pub(crate) fn execute(frame: &Frame, task: TaskRef, worker_index: usize) {
    profiling::scope!("execute");
    let header = task.get();
    let block = header.continuation_block.replace(UNINITIALIZED_BLOCK);
    assert_ne!(block, UNINITIALIZED_BLOCK, "task resumed without a continuation");
    header.current_block.set(block);
    log::debug!("task {:?} runs block {} on thread[{}]", task, block, worker_index);

    let mut cx = Context {
        frame,
        me: task,
        transfer: None,
    };
    let body = unsafe { &mut **header.body.get() };
    if body.size() >= 2 && frame.has_parked() {
        if let Some(sibling) = body.split(&mut cx) {
            log::trace!("task {:?} split off {:?}", task, sibling);
            edge::add_node(frame, sibling);
        }
    }
    body.run(block, &mut cx);

    match cx.transfer {
        None => {
            log::trace!("task {:?} finished", task);
            edge::outset_finished(frame, task);
            unsafe { task.destroy() };
        }
        Some(Transfer::Requeue) => {
            // No wake-up: this very thread is about to look for work.
            frame.requeue(task);
        }
        Some(Transfer::Wait) => {}
    }
}
