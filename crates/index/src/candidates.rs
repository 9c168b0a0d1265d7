//! Candidate ordering helpers shared by the index implementations.
//!
//! Distances are finite by construction (embeddings are validated at
//! insertion), so `f32::total_cmp` gives the deterministic total order the
//! search contract requires: ascending distance, ties broken by id.

use lodestone_core::ChunkId;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// A candidate `(distance, id)` ordered ascending by distance, then id.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Neighbor {
    pub distance: f32,
    pub id: ChunkId,
}

impl Neighbor {
    pub fn new(id: ChunkId, distance: f32) -> Self {
        Neighbor { distance, id }
    }
}

impl Eq for Neighbor {}

impl Ord for Neighbor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for Neighbor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Bounded collector keeping the `k` best (smallest) neighbors seen.
///
/// Backed by a max-heap: the root is the current worst of the kept set, so
/// a new candidate replaces it only when strictly better.
pub(crate) struct TopK {
    capacity: usize,
    heap: BinaryHeap<Neighbor>,
}

impl TopK {
    pub fn new(capacity: usize) -> Self {
        TopK {
            capacity,
            heap: BinaryHeap::with_capacity(capacity + 1),
        }
    }

    pub fn push(&mut self, neighbor: Neighbor) {
        if self.capacity == 0 {
            return;
        }
        if self.heap.len() < self.capacity {
            self.heap.push(neighbor);
        } else if neighbor < *self.heap.peek().expect("non-empty at capacity") {
            self.heap.pop();
            self.heap.push(neighbor);
        }
    }

    /// The worst kept neighbor, if the collector is at capacity.
    pub fn worst_at_capacity(&self) -> Option<Neighbor> {
        if self.heap.len() == self.capacity {
            self.heap.peek().copied()
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Drain into ascending `(id, distance)` order.
    pub fn into_sorted(self) -> Vec<(ChunkId, f32)> {
        let mut neighbors = self.heap.into_vec();
        neighbors.sort_unstable();
        neighbors.into_iter().map(|n| (n.id, n.distance)).collect()
    }
}

/// Sort candidates into the contract order and keep the first `k`.
pub(crate) fn sorted_top_k(mut candidates: Vec<Neighbor>, k: usize) -> Vec<(ChunkId, f32)> {
    candidates.sort_unstable();
    candidates.truncate(k);
    candidates.into_iter().map(|n| (n.id, n.distance)).collect()
}
