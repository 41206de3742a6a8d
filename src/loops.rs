//! Loop tasks.
//!
//! The lazy range task walks its interval `communication_delay` indices per
//! activation and lets the pool steal half of what remains. The eager
//! variant recursively forks and gives every index a full task, which is
//! what a loop body that needs to suspend (force a future, open a scope)
//! requires.

use std::sync::Arc;

use crate::task::{Body, BlockId, Context, TaskRef};

const PROCESS: BlockId = 0;
const REPEAT: BlockId = 1;

/// Splittable range task behind [`Context::parallel_for`].
pub(crate) struct RangeBody {
    lo: i64,
    hi: i64,
    join: TaskRef,
    body: Arc<dyn Fn(i64) + Send + Sync>,
}

impl RangeBody {
    pub(crate) fn new<F>(lo: i64, hi: i64, join: TaskRef, body: F) -> Self
    where
        F: Fn(i64) + Send + Sync + 'static,
    {
        Self {
            lo,
            hi,
            join,
            body: Arc::new(body),
        }
    }
}

impl Body for RangeBody {
    fn run(&mut self, block: BlockId, cx: &mut Context) {
        match block {
            PROCESS => {
                let stop = self.hi.min(self.lo + cx.communication_delay() as i64);
                for i in self.lo..stop {
                    (self.body)(i);
                }
                self.lo = stop;
                cx.jump_to(REPEAT);
            }
            REPEAT => {
                if self.lo < self.hi {
                    cx.jump_to(PROCESS);
                }
            }
            _ => unreachable!(),
        }
    }

    fn size(&self) -> usize {
        (self.hi - self.lo).max(0) as usize
    }

    fn split(&mut self, cx: &mut Context) -> Option<TaskRef> {
        let mid = (self.lo + self.hi) / 2;
        if mid <= self.lo {
            return None;
        }
        let sibling = TaskRef::new(RangeBody {
            lo: mid,
            hi: self.hi,
            join: self.join,
            body: Arc::clone(&self.body),
        });
        self.hi = mid;
        cx.adopt_split_sibling(sibling, Some(self.join));
        Some(sibling)
    }
}

const ENTRY: BlockId = 0;
const EXIT: BlockId = 1;

/// Eager parallel for: each index becomes a task produced by a generator,
/// run to completion under the loop's scope.
pub struct EagerFor<G> {
    lo: i64,
    hi: i64,
    gen: Arc<G>,
}

impl<G> EagerFor<G>
where
    G: Fn(i64) -> TaskRef + Send + Sync + 'static,
{
    /// Loop over `lo..hi`, calling `gen(i)`'s task for each index.
    pub fn new(lo: i64, hi: i64, gen: G) -> Self {
        Self {
            lo,
            hi,
            gen: Arc::new(gen),
        }
    }
}

impl<G> Body for EagerFor<G>
where
    G: Fn(i64) -> TaskRef + Send + Sync + 'static,
{
    fn run(&mut self, block: BlockId, cx: &mut Context) {
        match block {
            ENTRY => {
                let rec = TaskRef::new(EagerForRec {
                    lo: self.lo,
                    hi: self.hi,
                    mid: 0,
                    gen: Arc::clone(&self.gen),
                    join: cx.me(),
                });
                cx.finish(rec, EXIT);
            }
            EXIT => {}
            _ => unreachable!(),
        }
    }
}

const REC_ENTRY: BlockId = 0;
const REC_BRANCH2: BlockId = 1;
const REC_EXIT: BlockId = 2;

struct EagerForRec<G> {
    lo: i64,
    hi: i64,
    mid: i64,
    gen: Arc<G>,
    join: TaskRef,
}

impl<G> Body for EagerForRec<G>
where
    G: Fn(i64) -> TaskRef + Send + Sync + 'static,
{
    fn run(&mut self, block: BlockId, cx: &mut Context) {
        match block {
            REC_ENTRY => match self.hi - self.lo {
                0 => {}
                1 => cx.call((self.gen)(self.lo), REC_EXIT),
                _ => {
                    self.mid = (self.lo + self.hi) / 2;
                    let left = TaskRef::new(EagerForRec {
                        lo: self.lo,
                        hi: self.mid,
                        mid: 0,
                        gen: Arc::clone(&self.gen),
                        join: self.join,
                    });
                    cx.fork(left, self.join, REC_BRANCH2);
                }
            },
            REC_BRANCH2 => {
                let right = TaskRef::new(EagerForRec {
                    lo: self.mid,
                    hi: self.hi,
                    mid: 0,
                    gen: Arc::clone(&self.gen),
                    join: self.join,
                });
                cx.fork(right, self.join, REC_EXIT);
            }
            REC_EXIT => {}
            _ => unreachable!(),
        }
    }
}

/// A task that does nothing; handy as a join point and in tests.
pub struct NopBody;

impl Body for NopBody {
    fn run(&mut self, _block: BlockId, _cx: &mut Context) {}
}
