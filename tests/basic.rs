use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use trellis::{Algo, BlockId, Body, Config, Context, EdgeAlgo, TaskRef, Trellis};

const ENTRY: BlockId = 0;

fn all_configs() -> Vec<Config> {
    let mut configs = Vec::new();
    for edge_algo in [EdgeAlgo::Simple, EdgeAlgo::Distributed, EdgeAlgo::Dyntree] {
        configs.push(Config {
            algo: Algo::Direct,
            edge_algo,
            ..Config::default()
        });
    }
    configs.push(Config {
        algo: Algo::PortPassing,
        ..Config::default()
    });
    configs
}

fn pool(config: Config, workers: usize) -> (Trellis, Vec<trellis::WorkerHandle>) {
    let _ = env_logger::try_init();
    let runtime = Trellis::with_config(config);
    let handles = (0..workers)
        .map(|i| runtime.add_worker(&format!("W{}", i)))
        .collect();
    (runtime, handles)
}

mod bintree {
    use super::*;

    const MID: BlockId = 1;
    const EXIT: BlockId = 2;

    pub struct Rec {
        pub lo: u32,
        pub hi: u32,
        pub mid: u32,
        pub consumer: TaskRef,
        pub leaves: Arc<AtomicUsize>,
        pub interiors: Arc<AtomicUsize>,
    }

    impl Body for Rec {
        fn run(&mut self, block: BlockId, cx: &mut Context) {
            match block {
                ENTRY => match self.hi - self.lo {
                    0 => {}
                    1 => {
                        self.leaves.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {
                        self.interiors.fetch_add(1, Ordering::Relaxed);
                        self.mid = (self.lo + self.hi) / 2;
                        let left = TaskRef::new(Rec {
                            lo: self.lo,
                            hi: self.mid,
                            mid: 0,
                            consumer: self.consumer,
                            leaves: Arc::clone(&self.leaves),
                            interiors: Arc::clone(&self.interiors),
                        });
                        cx.fork(left, self.consumer, MID);
                    }
                },
                MID => {
                    let right = TaskRef::new(Rec {
                        lo: self.mid,
                        hi: self.hi,
                        mid: 0,
                        consumer: self.consumer,
                        leaves: Arc::clone(&self.leaves),
                        interiors: Arc::clone(&self.interiors),
                    });
                    cx.fork(right, self.consumer, EXIT);
                }
                EXIT => {}
                _ => unreachable!(),
            }
        }
    }

    pub struct Root {
        pub n: u32,
        pub leaves: Arc<AtomicUsize>,
        pub interiors: Arc<AtomicUsize>,
    }

    impl Body for Root {
        fn run(&mut self, block: BlockId, cx: &mut Context) {
            match block {
                ENTRY => {
                    let rec = TaskRef::new(Rec {
                        lo: 0,
                        hi: self.n,
                        mid: 0,
                        consumer: cx.me(),
                        leaves: Arc::clone(&self.leaves),
                        interiors: Arc::clone(&self.interiors),
                    });
                    cx.finish(rec, EXIT);
                }
                EXIT => {}
                _ => unreachable!(),
            }
        }
    }
}

#[test]
fn async_bintree() {
    for config in all_configs() {
        let (runtime, _workers) = pool(config, 3);
        let leaves = Arc::new(AtomicUsize::new(0));
        let interiors = Arc::new(AtomicUsize::new(0));
        let n = 1024;
        runtime.launch(bintree::Root {
            n,
            leaves: Arc::clone(&leaves),
            interiors: Arc::clone(&interiors),
        });
        assert_eq!(leaves.load(Ordering::Acquire), n as usize, "{:?}", config);
        assert_eq!(
            interiors.load(Ordering::Acquire),
            n as usize - 1,
            "{:?}",
            config
        );
    }
}

struct ParallelForRoot {
    n: i64,
    array: Arc<Vec<AtomicUsize>>,
}

impl Body for ParallelForRoot {
    fn run(&mut self, block: BlockId, cx: &mut Context) {
        const EXIT: BlockId = 1;
        match block {
            ENTRY => {
                let array = Arc::clone(&self.array);
                cx.parallel_for(
                    0,
                    self.n,
                    move |i| array[i as usize].store(i as usize, Ordering::Relaxed),
                    EXIT,
                );
            }
            EXIT => {}
            _ => unreachable!(),
        }
    }
}

#[test]
fn parallel_for_fills_array() {
    for config in all_configs() {
        let (runtime, _workers) = pool(config, 4);
        let n = 4096;
        let array: Arc<Vec<AtomicUsize>> = Arc::new((0..n).map(|_| AtomicUsize::new(n)).collect());
        runtime.launch(ParallelForRoot {
            n: n as i64,
            array: Arc::clone(&array),
        });
        for (i, slot) in array.iter().enumerate() {
            assert_eq!(slot.load(Ordering::Acquire), i, "{:?}", config);
        }
    }
}

struct Increment {
    value: Arc<AtomicUsize>,
}

impl Body for Increment {
    fn run(&mut self, block: BlockId, _cx: &mut Context) {
        assert_eq!(block, ENTRY);
        self.value.fetch_add(1, Ordering::AcqRel);
    }
}

/// Spawns `n` independent tasks into the enclosing scope, one fork per
/// activation.
struct FanOut {
    i: usize,
    n: usize,
    join: TaskRef,
    value: Arc<AtomicUsize>,
}

impl Body for FanOut {
    fn run(&mut self, block: BlockId, cx: &mut Context) {
        assert_eq!(block, ENTRY);
        if self.i < self.n {
            self.i += 1;
            let child = TaskRef::new(Increment {
                value: Arc::clone(&self.value),
            });
            cx.fork(child, self.join, ENTRY);
        }
    }
}

struct FanOutRoot {
    n: usize,
    value: Arc<AtomicUsize>,
}

impl Body for FanOutRoot {
    fn run(&mut self, block: BlockId, cx: &mut Context) {
        const EXIT: BlockId = 1;
        match block {
            ENTRY => {
                let spawner = TaskRef::new(FanOut {
                    i: 0,
                    n: self.n,
                    join: cx.me(),
                    value: Arc::clone(&self.value),
                });
                cx.finish(spawner, EXIT);
            }
            EXIT => {}
            _ => unreachable!(),
        }
    }
}

#[test]
fn fan_out_joins_all() {
    for config in all_configs() {
        let (runtime, _workers) = pool(config, 2);
        let value = Arc::new(AtomicUsize::new(0));
        runtime.launch(FanOutRoot {
            n: 100,
            value: Arc::clone(&value),
        });
        assert_eq!(value.load(Ordering::Acquire), 100, "{:?}", config);
    }
}

struct Step {
    k: usize,
    value: Arc<AtomicUsize>,
    out_of_order: Arc<AtomicBool>,
}

impl Body for Step {
    fn run(&mut self, block: BlockId, _cx: &mut Context) {
        assert_eq!(block, ENTRY);
        let previous = self.value.swap(self.k, Ordering::AcqRel);
        if previous + 1 != self.k {
            self.out_of_order.store(true, Ordering::Release);
        }
    }
}

/// Runs `n` steps strictly one after another, each under its own `call`.
struct Chain {
    i: usize,
    n: usize,
    value: Arc<AtomicUsize>,
    out_of_order: Arc<AtomicBool>,
}

impl Body for Chain {
    fn run(&mut self, block: BlockId, cx: &mut Context) {
        assert_eq!(block, ENTRY);
        if self.i < self.n {
            self.i += 1;
            let step = TaskRef::new(Step {
                k: self.i,
                value: Arc::clone(&self.value),
                out_of_order: Arc::clone(&self.out_of_order),
            });
            cx.call(step, ENTRY);
        }
    }
}

#[test]
fn call_chain_is_sequential() {
    for config in all_configs() {
        let (runtime, _workers) = pool(config, 2);
        let value = Arc::new(AtomicUsize::new(0));
        let out_of_order = Arc::new(AtomicBool::new(false));
        runtime.launch(Chain {
            i: 0,
            n: 100,
            value: Arc::clone(&value),
            out_of_order: Arc::clone(&out_of_order),
        });
        assert_eq!(value.load(Ordering::Acquire), 100, "{:?}", config);
        assert!(!out_of_order.load(Ordering::Acquire), "{:?}", config);
    }
}

struct Detacher {
    mailbox: Arc<Mutex<Option<TaskRef>>>,
    resumed: Arc<AtomicBool>,
}

impl Body for Detacher {
    fn run(&mut self, block: BlockId, cx: &mut Context) {
        const EXIT: BlockId = 1;
        match block {
            ENTRY => {
                cx.detach(EXIT);
                // Published after the transfer so the resumer's `check`
                // observes the recorded continuation.
                *self.mailbox.lock().unwrap() = Some(cx.me());
            }
            EXIT => {
                self.resumed.store(true, Ordering::Release);
            }
            _ => unreachable!(),
        }
    }
}

/// Polls the mailbox, then resumes the detached task through `check`.
struct Resumer {
    mailbox: Arc<Mutex<Option<TaskRef>>>,
}

impl Body for Resumer {
    fn run(&mut self, block: BlockId, cx: &mut Context) {
        assert_eq!(block, ENTRY);
        let parked = self.mailbox.lock().unwrap().take();
        match parked {
            Some(task) => cx.check(task),
            None => cx.jump_to(ENTRY),
        }
    }
}

/// Forks the detacher and its resumer into the same scope; the scope closes
/// only once the detached task has been resumed and run to completion.
struct DetachPair {
    join: TaskRef,
    mailbox: Arc<Mutex<Option<TaskRef>>>,
    resumed: Arc<AtomicBool>,
}

impl Body for DetachPair {
    fn run(&mut self, block: BlockId, cx: &mut Context) {
        const SPAWN_RESUMER: BlockId = 1;
        const EXIT: BlockId = 2;
        match block {
            ENTRY => {
                let detacher = TaskRef::new(Detacher {
                    mailbox: Arc::clone(&self.mailbox),
                    resumed: Arc::clone(&self.resumed),
                });
                cx.fork(detacher, self.join, SPAWN_RESUMER);
            }
            SPAWN_RESUMER => {
                let resumer = TaskRef::new(Resumer {
                    mailbox: Arc::clone(&self.mailbox),
                });
                cx.fork(resumer, self.join, EXIT);
            }
            EXIT => {}
            _ => unreachable!(),
        }
    }
}

struct DetachRoot {
    mailbox: Arc<Mutex<Option<TaskRef>>>,
    resumed: Arc<AtomicBool>,
}

impl Body for DetachRoot {
    fn run(&mut self, block: BlockId, cx: &mut Context) {
        const EXIT: BlockId = 1;
        match block {
            ENTRY => {
                let pair = TaskRef::new(DetachPair {
                    join: cx.me(),
                    mailbox: Arc::clone(&self.mailbox),
                    resumed: Arc::clone(&self.resumed),
                });
                cx.finish(pair, EXIT);
            }
            EXIT => {}
            _ => unreachable!(),
        }
    }
}

#[test]
fn detach_and_resume() {
    for config in all_configs() {
        let (runtime, _workers) = pool(config, 2);
        let mailbox = Arc::new(Mutex::new(None));
        let resumed = Arc::new(AtomicBool::new(false));
        runtime.launch(DetachRoot {
            mailbox: Arc::clone(&mailbox),
            resumed: Arc::clone(&resumed),
        });
        assert!(resumed.load(Ordering::Acquire), "{:?}", config);
    }
}

