/*! Parallel task-graph runtime.

Programs are dynamically-unfolding DAGs of small resumable tasks running on
a fixed pool of worker threads. A task suspends only by recording edges:
an *incounter* on a task counts its unresolved incoming edges and makes the
task schedulable when it reaches the activated state; an *outset* on a task
records every target to notify when it finishes. The crate's substance is
the scalable concurrent representations of those two halves; see
[`edge`], [`dyntree`], [`snzi`] and [`port`].

Lifetime of a task:
  1. Created: a body wrapped by [`TaskRef::new`].
  2. Prepared: an incounter and outset are installed by a construct.
  3. Scheduled: handed to the pool, run block by block.
  4. Retired: a block returns without transferring; the outset drains.
!*/

#![allow(
    clippy::new_without_default,
    clippy::match_like_matches_macro,
    clippy::too_many_arguments
)]
#![warn(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_qualifications,
    clippy::pattern_type_mismatch
)]

pub mod dyntree;
pub mod edge;
pub mod loops;
pub mod port;
pub mod simple;
pub mod snzi;
pub mod tag;
mod task;

pub use edge::{Future, Incounter, Outset, Status};
pub use loops::{EagerFor, NopBody};
pub use task::{Body, BlockId, Context, PortMode, TaskRef, ENTRY_BLOCK, UNINITIALIZED_BLOCK};

use crossbeam_deque::{Injector, Steal};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, RwLock,
    },
    thread, time,
};

const BITS_PER_BYTE: usize = 8;
const MAX_WORKERS: usize = std::mem::size_of::<usize>() * BITS_PER_BYTE;
const IDLE_PARK_TIME: time::Duration = time::Duration::from_millis(10);

/// Which family of edge algorithms a run uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Algo {
    /// Top-down: counters addressed from the root.
    Direct,
    /// Bottom-up: counters addressed through pre-issued ports.
    PortPassing,
}

/// Which representation the top-down family uses, fixed for a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeAlgo {
    /// Fetch-add counter and a concurrent list outset.
    Simple,
    /// SNZI-tree counter; unary edges depart their chosen leaf directly.
    Distributed,
    /// Dynamic-tree counter and outset.
    Dyntree,
}

/// Run-wide parameters.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Edge family.
    pub algo: Algo,
    /// Top-down representation.
    pub edge_algo: EdgeAlgo,
    /// Branching factor of tree-shaped edge sets.
    pub branching_factor: usize,
    /// Depth of the SNZI tree.
    pub nb_levels: usize,
    /// Indices or nodes a loop/reclamation task handles per activation.
    pub communication_delay: usize,
    /// Futures in flight before a pipeline generator throttles.
    pub pipeline_window_capacity: usize,
    /// Futures forced per throttle burst.
    pub pipeline_burst_rate: usize,
}

impl Default for Config {
    fn default() -> Self {
        let pipeline_window_capacity = 4096;
        Self {
            algo: Algo::Direct,
            edge_algo: EdgeAlgo::Dyntree,
            branching_factor: 2,
            nb_levels: 3,
            communication_delay: 100,
            pipeline_window_capacity,
            pipeline_burst_rate: (pipeline_window_capacity / 8).max(1),
        }
    }
}

struct Worker {
    name: String,
    alive: AtomicBool,
}

struct WorkerContext {
    thread: thread::Thread,
}

struct WorkerPool {
    contexts: [Option<WorkerContext>; MAX_WORKERS],
}

pub(crate) struct Frame {
    pub(crate) config: Config,
    injector: Injector<TaskRef>,
    workers: RwLock<WorkerPool>,
    parked_mask: AtomicUsize,
    in_flight: AtomicUsize,
}

impl Frame {
    /// Enqueue a task and wake a parked worker if there is one.
    pub(crate) fn schedule(&self, task: TaskRef) {
        log::trace!("task {:?} is scheduled", task);
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.injector.push(task);
        let mask = self.parked_mask.load(Ordering::Acquire);
        if mask != 0 {
            let index = mask.trailing_zeros() as usize;
            profiling::scope!("unpark");
            let pool = self.workers.read().unwrap();
            if let Some(context) = pool.contexts[index].as_ref() {
                context.thread.unpark();
            }
        }
    }

    /// Enqueue a task the calling thread is about to look for anyway;
    /// no need to wake up anybody.
    pub(crate) fn requeue(&self, task: TaskRef) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.injector.push(task);
    }

    /// Whether any worker is parked, i.e. splitting would pay off.
    pub(crate) fn has_parked(&self) -> bool {
        self.parked_mask.load(Ordering::Acquire) != 0
    }

    fn work_loop(&self, worker: &Worker) {
        profiling::register_thread!();
        let index = {
            let mut pool = self.workers.write().unwrap();
            let index = pool.contexts.iter_mut().position(|c| c.is_none()).unwrap();
            pool.contexts[index] = Some(WorkerContext {
                thread: thread::current(),
            });
            index
        };
        log::info!("thread[{}] = '{}' started", index, worker.name);

        while worker.alive.load(Ordering::Acquire) {
            match self.injector.steal() {
                Steal::Empty => {
                    log::trace!("thread[{}] sleeps", index);
                    let mask = 1 << index;
                    self.parked_mask.fetch_or(mask, Ordering::AcqRel);
                    // A task may have been scheduled while we set the bit.
                    if self.injector.is_empty() {
                        profiling::scope!("park");
                        thread::park();
                    }
                    self.parked_mask.fetch_and(!mask, Ordering::AcqRel);
                }
                Steal::Success(task) => {
                    task::execute(self, task, index);
                    self.in_flight.fetch_sub(1, Ordering::AcqRel);
                }
                Steal::Retry => {}
            }
        }

        log::info!("thread '{}' dies", worker.name);
        self.workers.write().unwrap().contexts[index] = None;
    }
}

/// Main structure for running task graphs.
pub struct Trellis {
    pub(crate) frame: Arc<Frame>,
}

/// Handle object holding a worker thread alive.
pub struct WorkerHandle {
    worker: Arc<Worker>,
    join_handle: Option<thread::JoinHandle<()>>,
}

impl Trellis {
    /// Create a runtime with the default configuration.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Create a runtime with a fixed configuration.
    pub fn with_config(config: Config) -> Self {
        const NO_WORKER: Option<WorkerContext> = None;
        assert!(config.branching_factor >= 2);
        assert!(config.nb_levels >= 1);
        assert!(config.communication_delay >= 1);
        Self {
            frame: Arc::new(Frame {
                config,
                injector: Injector::new(),
                workers: RwLock::new(WorkerPool {
                    contexts: [NO_WORKER; MAX_WORKERS],
                }),
                parked_mask: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
            }),
        }
    }

    /// This run's configuration.
    pub fn config(&self) -> Config {
        self.frame.config
    }

    /// Add a worker thread.
    ///
    /// A runtime can't have more than `MAX_WORKERS` workers enabled at any
    /// time.
    pub fn add_worker(&self, name: &str) -> WorkerHandle {
        let worker = Arc::new(Worker {
            name: name.to_string(),
            alive: AtomicBool::new(true),
        });
        let frame = Arc::clone(&self.frame);
        let worker_clone = Arc::clone(&worker);

        let join_handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || frame.work_loop(&worker_clone))
            .unwrap();

        WorkerHandle {
            worker,
            join_handle: Some(join_handle),
        }
    }

    /// Submit a root task and block until the whole graph has quiesced.
    #[profiling::function]
    pub fn launch<B: Body + 'static>(&self, body: B) {
        let root = TaskRef::new(body);
        edge::prepare(
            root,
            edge::in_ready(),
            edge::outset_default(&self.frame, root),
        );
        self.frame.schedule(root);
        self.wait_idle();
    }

    /// Block until no task is queued, running, or reachable from one that
    /// is.
    #[profiling::function]
    pub fn wait_idle(&self) {
        while self.frame.in_flight.load(Ordering::Acquire) != 0 {
            thread::park_timeout(IDLE_PARK_TIME);
        }
    }
}

impl Default for Trellis {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.worker.alive.store(false, Ordering::Release);
        let handle = self.join_handle.take().unwrap();
        handle.thread().unpark();
        let _ = handle.join();
    }
}
