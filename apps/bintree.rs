//! Demo driver: fork a balanced binary tree of tasks and count the nodes.
//!
//! Usage: `bintree [n] [direct|portpassing] [simple|distributed|dyntree]`

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use trellis::{Algo, BlockId, Body, Config, Context, EdgeAlgo, TaskRef, Trellis};

const ENTRY: BlockId = 0;
const MID: BlockId = 1;
const EXIT: BlockId = 2;

struct BintreeRec {
    lo: u32,
    hi: u32,
    mid: u32,
    consumer: TaskRef,
    leaves: Arc<AtomicUsize>,
    interiors: Arc<AtomicUsize>,
}

impl Body for BintreeRec {
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
                    let left = TaskRef::new(BintreeRec {
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
                let right = TaskRef::new(BintreeRec {
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

struct Bintree {
    n: u32,
    leaves: Arc<AtomicUsize>,
    interiors: Arc<AtomicUsize>,
}

impl Body for Bintree {
    fn run(&mut self, block: BlockId, cx: &mut Context) {
        match block {
            ENTRY => {
                let rec = TaskRef::new(BintreeRec {
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

fn main() {
    let mut args = std::env::args().skip(1);
    let n: u32 = args.next().map_or(1 << 16, |s| s.parse().unwrap());
    let mut config = Config::default();
    if let Some(algo) = args.next() {
        config.algo = match algo.as_str() {
            "direct" => Algo::Direct,
            "portpassing" => Algo::PortPassing,
            other => panic!("unknown algo '{}'", other),
        };
    }
    if let Some(edge_algo) = args.next() {
        config.edge_algo = match edge_algo.as_str() {
            "simple" => EdgeAlgo::Simple,
            "distributed" => EdgeAlgo::Distributed,
            "dyntree" => EdgeAlgo::Dyntree,
            other => panic!("unknown edge algorithm '{}'", other),
        };
    }

    let runtime = Trellis::with_config(config);
    let parallelism = std::thread::available_parallelism().map_or(2, |p| p.get());
    let _workers: Vec<_> = (0..parallelism)
        .map(|i| runtime.add_worker(&format!("worker-{}", i)))
        .collect();

    let leaves = Arc::new(AtomicUsize::new(0));
    let interiors = Arc::new(AtomicUsize::new(0));
    let start = std::time::Instant::now();
    runtime.launch(Bintree {
        n,
        leaves: Arc::clone(&leaves),
        interiors: Arc::clone(&interiors),
    });
    println!("exectime {:?}", start.elapsed());
    println!(
        "leaves {} interiors {}",
        leaves.load(Ordering::Acquire),
        interiors.load(Ordering::Acquire)
    );
}
