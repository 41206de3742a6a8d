//! The simple outset: a Treiber stack of subscriber cells.
//!
//! Finishing swaps the head for a `finished`-tagged null and drains the
//! captured list, so insertions and the freeze linearize on one word.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::tag;
use crate::task::TaskRef;
use crate::Frame;

const FINISHED: usize = 1;

struct Cell {
    target: TaskRef,
    next: *mut Cell,
}

/// Concurrent list outset paired with the fetch-add incounter.
pub struct SimpleOutset {
    head: AtomicUsize,
}

impl SimpleOutset {
    pub(crate) fn new() -> Self {
        Self {
            head: AtomicUsize::new(0),
        }
    }

    /// Push a subscriber. Fails exactly if the outset has finished.
    pub fn insert(&self, target: TaskRef) -> bool {
        let cell = Box::into_raw(Box::new(Cell {
            target,
            next: std::ptr::null_mut(),
        }));
        loop {
            let head = self.head.load(Ordering::Acquire);
            if tag::tag_of(head) == FINISHED {
                drop(unsafe { Box::from_raw(cell) });
                return false;
            }
            unsafe { &mut *cell }.next = head as *mut Cell;
            if self
                .head
                .compare_exchange(head, cell as usize, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Freeze the stack and decrement every captured subscriber exactly once.
    pub(crate) fn finish(&self, frame: &Frame) {
        let frozen = tag::pack(std::ptr::null_mut::<Cell>(), FINISHED);
        let head = self.head.swap(frozen, Ordering::AcqRel);
        debug_assert_ne!(tag::tag_of(head), FINISHED, "outset finished twice");
        let mut todo = head as *mut Cell;
        while !todo.is_null() {
            let cell = unsafe { Box::from_raw(todo) };
            todo = cell.next;
            crate::edge::decrement_incounter(frame, None, cell.target);
        }
    }
}

impl Drop for SimpleOutset {
    fn drop(&mut self) {
        // An unfinished outset still owns its cells.
        let mut todo = tag::pointer::<Cell>(self.head.load(Ordering::Acquire));
        while !todo.is_null() {
            let cell = unsafe { Box::from_raw(todo) };
            todo = cell.next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{edge, NopBody, TaskRef, Trellis};
    use std::thread;

    #[test]
    fn freeze_rejects_late_inserts() {
        let runtime = Trellis::new();
        let frame = &runtime.frame;
        let outset = SimpleOutset::new();
        let target = TaskRef::new(NopBody);
        edge::prepare(target, edge::in_fetch_add(), edge::out_noop());
        edge::increment_incounter(frame, None, target);
        edge::increment_incounter(frame, None, target);

        assert!(outset.insert(target));
        outset.finish(frame);
        assert!(!outset.insert(target));
        assert_eq!(tag::count_of(target.get().in_word.load(Ordering::Acquire)), 1);
        unsafe { target.destroy() };
    }

    #[test]
    fn concurrent_inserts_drain_exactly_once() {
        const NB_THREADS: usize = 4;
        const PER_THREAD: usize = 256;

        let runtime = Trellis::new();
        let frame = &runtime.frame;
        let outset = SimpleOutset::new();
        // Each target is armed with two pending edges, so one drain
        // decrement is visible in its count without scheduling anything.
        let targets: Vec<Vec<TaskRef>> = (0..NB_THREADS)
            .map(|_| {
                (0..PER_THREAD)
                    .map(|_| {
                        let target = TaskRef::new(NopBody);
                        edge::prepare(target, edge::in_fetch_add(), edge::out_noop());
                        edge::increment_incounter(frame, None, target);
                        edge::increment_incounter(frame, None, target);
                        target
                    })
                    .collect()
            })
            .collect();

        let accepted: Vec<Vec<bool>> = thread::scope(|scope| {
            let handles: Vec<_> = targets
                .iter()
                .map(|mine| {
                    let outset = &outset;
                    scope.spawn(move || mine.iter().map(|t| outset.insert(*t)).collect::<Vec<bool>>())
                })
                .collect();
            // Freeze somewhere in the middle of the insertions.
            thread::yield_now();
            outset.finish(frame);
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for (mine, accepted) in targets.iter().zip(accepted.iter()) {
            for (target, accepted) in mine.iter().zip(accepted.iter()) {
                let count = tag::count_of(target.get().in_word.load(Ordering::Acquire));
                assert_eq!(count, if *accepted { 1 } else { 2 });
                unsafe { target.destroy() };
            }
        }
    }
}
