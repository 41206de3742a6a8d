//! Scalable non-zero indicator.
//!
//! A fixed-shape tree of counters. Writers `arrive` and `depart` on leaves
//! spread across the tree; the zero test is a single read at the root. Each
//! node packs its state into one `AtomicU64`: the low half holds twice the
//! surplus count (so a half-completed arrival is representable as an odd
//! value), the high half a version that grows on every zero crossing,
//! protecting the promotion CAS from ABA.
//!
//! The root carries an annotation slot for one task reference, reachable
//! from any leaf by climbing the parent chain.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

const COUNT_MASK: u64 = u32::MAX as u64;

#[inline]
fn unpack(word: u64) -> (u64, u64) {
    (word & COUNT_MASK, word >> 32)
}

#[inline]
fn pack(count2: u64, version: u64) -> u64 {
    debug_assert!(count2 <= COUNT_MASK);
    (version << 32) | count2
}

/// One counter in the indicator tree.
pub struct SnziNode {
    word: AtomicU64,
    parent: *const SnziNode,
    /// Used only on the root node.
    annotation: AtomicUsize,
}

// Nodes are only reached through shared references into the owning tree's
// slab; the parent pointer is written once at construction and never again.
unsafe impl Send for SnziNode {}
unsafe impl Sync for SnziNode {}

impl SnziNode {
    fn new() -> Self {
        Self {
            word: AtomicU64::new(0),
            parent: std::ptr::null(),
            annotation: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn is_root(&self) -> bool {
        self.parent.is_null()
    }

    fn root(&self) -> &SnziNode {
        let mut current = self;
        while !current.is_root() {
            current = unsafe { &*current.parent };
        }
        current
    }

    /// Read the task reference stored at the root of this node's tree.
    pub fn root_annotation(&self) -> usize {
        self.root().annotation.load(Ordering::Acquire)
    }

    fn root_arrive(&self) {
        self.word.fetch_add(2, Ordering::AcqRel);
    }

    fn root_depart(&self) -> bool {
        let old = self.word.fetch_sub(2, Ordering::AcqRel);
        let (count2, _) = unpack(old);
        debug_assert!(count2 >= 2, "depart without matching arrive");
        count2 == 2
    }

    /// Record one arrival at this leaf.
    pub fn arrive(&self) {
        if self.is_root() {
            self.root_arrive();
            return;
        }
        let parent = unsafe { &*self.parent };
        let mut undo = 0;
        let mut done = false;
        while !done {
            let mut word = self.word.load(Ordering::Acquire);
            let (count2, version) = unpack(word);
            if count2 >= 2
                && self
                    .word
                    .compare_exchange(word, pack(count2 + 2, version), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                done = true;
                continue;
            }
            let mut half_version = version;
            let mut have_half = count2 == 1;
            if count2 == 0 {
                if self
                    .word
                    .compare_exchange(word, pack(1, version + 1), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    // Our arrival is in, but as a half: it does not count at
                    // the parent until promoted below.
                    done = true;
                    have_half = true;
                    half_version = version + 1;
                }
            }
            if have_half {
                parent.arrive();
                word = pack(1, half_version);
                if self
                    .word
                    .compare_exchange(word, pack(2, half_version), Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    // Another promoter won; its parent arrival stands in for
                    // this one.
                    undo += 1;
                }
            }
        }
        for _ in 0..undo {
            // Cannot zero the parent: the winning promotion keeps this node,
            // and therefore one parent arrival, alive.
            let _ = parent.depart();
        }
    }

    /// Record one departure at this leaf.
    ///
    /// Returns true exactly when this call drives the whole tree to zero.
    pub fn depart(&self) -> bool {
        if self.is_root() {
            return self.root_depart();
        }
        loop {
            let word = self.word.load(Ordering::Acquire);
            let (count2, version) = unpack(word);
            debug_assert!(count2 >= 2, "depart without matching arrive");
            if self
                .word
                .compare_exchange(word, pack(count2 - 2, version), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return if count2 == 2 {
                    unsafe { &*self.parent }.depart()
                } else {
                    false
                };
            }
        }
    }
}

/// A complete tree of [`SnziNode`]s with a fixed branching factor and depth.
pub struct SnziTree {
    nodes: Box<[SnziNode]>,
    first_leaf: usize,
}

impl SnziTree {
    /// Build a tree of `nb_levels` levels, each node having
    /// `branching_factor` children.
    pub fn new(branching_factor: usize, nb_levels: usize) -> Self {
        assert!(branching_factor >= 2);
        assert!(nb_levels >= 1);
        let mut total = 0;
        let mut level_size = 1;
        for _ in 0..nb_levels {
            total += level_size;
            level_size *= branching_factor;
        }
        let first_leaf = total - level_size / branching_factor;
        let mut nodes: Box<[SnziNode]> = (0..total).map(|_| SnziNode::new()).collect();
        let root: *const SnziNode = &nodes[0];
        for i in 1..total {
            let parent: *const SnziNode = unsafe { root.add((i - 1) / branching_factor) };
            nodes[i].parent = parent;
        }
        Self { nodes, first_leaf }
    }

    /// Whether any arrival is still outstanding.
    pub fn is_nonzero(&self) -> bool {
        let (count2, _) = unpack(self.nodes[0].word.load(Ordering::Acquire));
        count2 != 0
    }

    /// Store a task reference in the root annotation slot.
    pub fn set_root_annotation(&self, value: usize) {
        self.nodes[0].annotation.store(value, Ordering::Release);
    }

    /// Number of leaves available for arrivals.
    pub fn nb_leaves(&self) -> usize {
        self.nodes.len() - self.first_leaf
    }

    /// The `i`-th leaf.
    pub fn leaf(&self, i: usize) -> &SnziNode {
        &self.nodes[self.first_leaf + i]
    }

    /// The leaf assigned to a source identity.
    ///
    /// Deterministic per identity, so an increment and the departure that
    /// later matches it land on the same leaf. A zero identity picks a leaf
    /// at random.
    pub fn leaf_for(&self, ident: usize) -> &SnziNode {
        let i = if ident == 0 {
            fastrand::usize(0..self.nb_leaves())
        } else {
            mix(ident) % self.nb_leaves()
        };
        self.leaf(i)
    }
}

/// Avalanche an address into a leaf selector.
fn mix(mut x: usize) -> usize {
    x ^= x >> 16;
    x = x.wrapping_mul(0x7feb_352d);
    x ^= x >> 15;
    x = x.wrapping_mul(0x846c_a68b);
    x ^= x >> 16;
    x
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn single_level() {
        let tree = SnziTree::new(2, 1);
        assert_eq!(tree.nb_leaves(), 1);
        assert!(!tree.is_nonzero());
        tree.leaf(0).arrive();
        assert!(tree.is_nonzero());
        assert!(tree.leaf(0).depart());
        assert!(!tree.is_nonzero());
    }

    #[test]
    fn cross_leaf_surplus() {
        let tree = SnziTree::new(2, 3);
        tree.leaf(0).arrive();
        tree.leaf(3).arrive();
        assert!(!tree.leaf(0).depart());
        assert!(tree.is_nonzero());
        assert!(tree.leaf(3).depart());
        assert!(!tree.is_nonzero());
    }

    #[test]
    fn annotation_reachable_from_leaf() {
        let tree = SnziTree::new(3, 2);
        tree.set_root_annotation(0xbeef0);
        assert_eq!(tree.leaf(2).root_annotation(), 0xbeef0);
    }

    #[test]
    fn hammer() {
        let tree = Arc::new(SnziTree::new(2, 4));
        let threads = 8;
        let per_thread = 1 << 12;
        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let tree = Arc::clone(&tree);
                thread::spawn(move || {
                    for i in 0..per_thread {
                        let leaf = tree.leaf((t * per_thread + i) % tree.nb_leaves());
                        leaf.arrive();
                        leaf.depart();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(!tree.is_nonzero());
    }
}
