//! KD-tree index over random projections
//!
//! Vectors are projected into a low dimension through a Gaussian matrix with
//! orthonormalized rows, then organized in a median-split tree: each inner
//! node splits on the axis of maximum variance, ties broken by id. Search is
//! classical best-first k-NN: a bounded max-heap of current best distances
//! (computed in the original space) and a min-heap of tree nodes keyed by the
//! lower-bound distance from the projected query to the node's bounding box.
//!
//! The projection distorts distances, so results are approximate; recall
//! grows with the projection dimension.

use crate::candidates::{Neighbor, TopK};
use crate::VectorIndex;
use lodestone_core::{ChunkId, DistanceMetric, Error, IndexKind, KdTreeParams, Result};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

enum Node {
    Leaf {
        ids: Vec<ChunkId>,
        min: Vec<f32>,
        max: Vec<f32>,
    },
    Inner {
        axis: usize,
        split: f32,
        min: Vec<f32>,
        max: Vec<f32>,
        left: Box<Node>,
        right: Box<Node>,
    },
}

impl Node {
    fn bounds(&self) -> (&[f32], &[f32]) {
        match self {
            Node::Leaf { min, max, .. } => (min, max),
            Node::Inner { min, max, .. } => (min, max),
        }
    }

    fn expand_bounds(&mut self, point: &[f32]) {
        let (min, max) = match self {
            Node::Leaf { min, max, .. } => (min, max),
            Node::Inner { min, max, .. } => (min, max),
        };
        for (i, &v) in point.iter().enumerate() {
            min[i] = min[i].min(v);
            max[i] = max[i].max(v);
        }
    }
}

/// Pending tree node in the best-first traversal, ordered by lower bound.
struct Visit<'a> {
    lower_bound: f32,
    order: u64,
    node: &'a Node,
}

impl PartialEq for Visit<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.lower_bound == other.lower_bound && self.order == other.order
    }
}

impl Eq for Visit<'_> {}

impl Ord for Visit<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap, traversal wants smallest bound.
        other
            .lower_bound
            .total_cmp(&self.lower_bound)
            .then_with(|| other.order.cmp(&self.order))
    }
}

impl PartialOrd for Visit<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Median-split tree over random projections.
pub struct KdTreeIndex {
    dimension: usize,
    metric: DistanceMetric,
    params: KdTreeParams,
    projected_dim: usize,
    /// Orthonormal projection rows, each `dimension` long.
    projection: Vec<Vec<f32>>,
    /// Live vectors in the original space.
    vectors: HashMap<ChunkId, Vec<f32>>,
    /// Projected coordinates for live and tombstoned ids; tombstoned entries
    /// are kept so their leaf slots can be located.
    projected: HashMap<ChunkId, Vec<f32>>,
    tombstones: HashSet<ChunkId>,
    root: Option<Box<Node>>,
}

impl KdTreeIndex {
    /// Create an empty index with a seeded projection matrix.
    pub fn new(dimension: usize, metric: DistanceMetric, params: KdTreeParams) -> Self {
        let projected_dim = params.projected_dim(dimension);
        let projection = gaussian_orthonormal_rows(projected_dim, dimension, params.seed);
        KdTreeIndex {
            dimension,
            metric,
            params,
            projected_dim,
            projection,
            vectors: HashMap::new(),
            projected: HashMap::new(),
            tombstones: HashSet::new(),
            root: None,
        }
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    fn project(&self, vector: &[f32]) -> Vec<f32> {
        self.projection
            .iter()
            .map(|row| lodestone_core::distance::dot(row, vector))
            .collect()
    }

    /// Recursively build a subtree from ids with known projections.
    fn build_node(&self, mut ids: Vec<ChunkId>) -> Box<Node> {
        if ids.len() <= self.params.leaf_size {
            let (min, max) = self.bounds_of(&ids);
            return Box::new(Node::Leaf { ids, min, max });
        }

        let axis = self.max_variance_axis(&ids);
        ids.sort_by(|a, b| {
            let ca = self.projected[a][axis];
            let cb = self.projected[b][axis];
            ca.total_cmp(&cb).then_with(|| a.cmp(b))
        });
        let mid = ids.len() / 2;
        let split = self.projected[&ids[mid]][axis];
        let right_ids = ids.split_off(mid);
        let left = self.build_node(ids);
        let right = self.build_node(right_ids);

        let (lmin, lmax) = left.bounds();
        let (rmin, rmax) = right.bounds();
        let min: Vec<f32> = lmin.iter().zip(rmin).map(|(a, b)| a.min(*b)).collect();
        let max: Vec<f32> = lmax.iter().zip(rmax).map(|(a, b)| a.max(*b)).collect();

        Box::new(Node::Inner {
            axis,
            split,
            min,
            max,
            left,
            right,
        })
    }

    fn bounds_of(&self, ids: &[ChunkId]) -> (Vec<f32>, Vec<f32>) {
        let mut min = vec![f32::INFINITY; self.projected_dim];
        let mut max = vec![f32::NEG_INFINITY; self.projected_dim];
        for id in ids {
            for (i, &v) in self.projected[id].iter().enumerate() {
                min[i] = min[i].min(v);
                max[i] = max[i].max(v);
            }
        }
        (min, max)
    }

    fn max_variance_axis(&self, ids: &[ChunkId]) -> usize {
        let n = ids.len() as f32;
        let mut best_axis = 0;
        let mut best_variance = f32::NEG_INFINITY;
        for axis in 0..self.projected_dim {
            let mean: f32 = ids.iter().map(|id| self.projected[id][axis]).sum::<f32>() / n;
            let variance: f32 = ids
                .iter()
                .map(|id| {
                    let d = self.projected[id][axis] - mean;
                    d * d
                })
                .sum::<f32>()
                / n;
            if variance > best_variance {
                best_variance = variance;
                best_axis = axis;
            }
        }
        best_axis
    }

    fn insert_into_tree(&mut self, id: ChunkId) {
        let coords = self.projected[&id].clone();
        match self.root.take() {
            None => {
                self.root = Some(Box::new(Node::Leaf {
                    ids: vec![id],
                    min: coords.clone(),
                    max: coords,
                }));
            }
            Some(mut root) => {
                self.insert_rec(&mut root, id, &coords);
                self.root = Some(root);
            }
        }
    }

    fn insert_rec(&self, node: &mut Box<Node>, id: ChunkId, coords: &[f32]) {
        node.expand_bounds(coords);
        let overflow_ids = match node.as_mut() {
            Node::Leaf { ids, .. } => {
                ids.push(id);
                if ids.len() > 2 * self.params.leaf_size {
                    Some(std::mem::take(ids))
                } else {
                    None
                }
            }
            Node::Inner {
                axis, split, left, right, ..
            } => {
                if coords[*axis] < *split {
                    self.insert_rec(left, id, coords);
                } else {
                    self.insert_rec(right, id, coords);
                }
                None
            }
        };
        if let Some(ids) = overflow_ids {
            *node = self.build_node(ids);
        }
    }

    /// Remove an id's slot from the tree. Ids with coordinates equal to a
    /// split may live on either side, so equality descends both.
    fn remove_from_tree(node: &mut Node, id: ChunkId, coords: &[f32]) -> bool {
        match node {
            Node::Leaf { ids, .. } => {
                let before = ids.len();
                ids.retain(|&entry| entry != id);
                ids.len() != before
            }
            Node::Inner {
                axis, split, left, right, ..
            } => {
                let c = coords[*axis];
                if c < *split {
                    Self::remove_from_tree(left, id, coords)
                } else if c > *split {
                    Self::remove_from_tree(right, id, coords)
                } else {
                    Self::remove_from_tree(left, id, coords)
                        || Self::remove_from_tree(right, id, coords)
                }
            }
        }
    }

    /// Drop an id from the structure entirely (scrub before re-insert).
    fn detach(&mut self, id: ChunkId) {
        if let Some(coords) = self.projected.remove(&id) {
            if let Some(root) = self.root.as_mut() {
                Self::remove_from_tree(root, id, &coords);
            }
        }
        self.vectors.remove(&id);
        self.tombstones.remove(&id);
    }

    fn min_distance_to_box(point: &[f32], min: &[f32], max: &[f32]) -> f32 {
        let mut sum = 0.0f32;
        for i in 0..point.len() {
            let d = if point[i] < min[i] {
                min[i] - point[i]
            } else if point[i] > max[i] {
                point[i] - max[i]
            } else {
                0.0
            };
            sum += d * d;
        }
        sum.sqrt()
    }
}

impl VectorIndex for KdTreeIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::KdTree
    }

    fn build(&mut self, vectors: Vec<(ChunkId, Vec<f32>)>) -> Result<()> {
        self.clear();
        let mut ids = Vec::with_capacity(vectors.len());
        for (id, vector) in vectors {
            self.check_dimension(&vector)?;
            self.projected.insert(id, self.project(&vector));
            self.vectors.insert(id, vector);
            ids.push(id);
        }
        // Sort for a deterministic tree regardless of input order; the
        // median recursion re-sorts per axis anyway.
        ids.sort();
        if !ids.is_empty() {
            self.root = Some(self.build_node(ids));
        }
        Ok(())
    }

    fn insert(&mut self, id: ChunkId, vector: &[f32]) -> Result<()> {
        self.check_dimension(vector)?;
        if self.projected.contains_key(&id) {
            self.detach(id);
        }
        self.projected.insert(id, self.project(vector));
        self.vectors.insert(id, vector.to_vec());
        self.insert_into_tree(id);
        Ok(())
    }

    fn remove(&mut self, id: ChunkId) -> bool {
        match self.vectors.remove(&id) {
            Some(_) => {
                self.tombstones.insert(id);
                true
            }
            None => false,
        }
    }

    fn search(&self, query: &[f32], k: usize, candidate_hint: usize) -> Result<Vec<(ChunkId, f32)>> {
        self.check_dimension(query)?;
        let Some(root) = self.root.as_deref() else {
            return Ok(Vec::new());
        };
        if self.vectors.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let projected_query = self.project(query);
        let pool = k.max(candidate_hint);
        let mut nearest = TopK::new(pool);
        let mut order = 0u64;
        let mut to_explore: BinaryHeap<Visit> = BinaryHeap::new();
        to_explore.push(Visit {
            lower_bound: 0.0,
            order,
            node: root,
        });

        while let Some(visit) = to_explore.pop() {
            if let Some(worst) = nearest.worst_at_capacity() {
                if visit.lower_bound >= worst.distance {
                    break;
                }
            }
            match visit.node {
                Node::Leaf { ids, .. } => {
                    for id in ids {
                        if self.tombstones.contains(id) {
                            continue;
                        }
                        // Exact distance in the original space.
                        if let Some(vector) = self.vectors.get(id) {
                            nearest.push(Neighbor::new(*id, self.metric.distance(query, vector)));
                        }
                    }
                }
                Node::Inner { left, right, .. } => {
                    for child in [left.as_ref(), right.as_ref()] {
                        let (min, max) = child.bounds();
                        order += 1;
                        to_explore.push(Visit {
                            lower_bound: Self::min_distance_to_box(&projected_query, min, max),
                            order,
                            node: child,
                        });
                    }
                }
            }
        }

        let mut hits = nearest.into_sorted();
        hits.truncate(k);
        Ok(hits)
    }

    fn len(&self) -> usize {
        self.vectors.len()
    }

    fn clear(&mut self) {
        self.vectors.clear();
        self.projected.clear();
        self.tombstones.clear();
        self.root = None;
    }

    fn tombstone_ratio(&self) -> f64 {
        if self.projected.is_empty() {
            0.0
        } else {
            self.tombstones.len() as f64 / self.projected.len() as f64
        }
    }
}

/// Gaussian matrix rows orthonormalized by Gram-Schmidt.
fn gaussian_orthonormal_rows(rows: usize, dimension: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut matrix: Vec<Vec<f32>> = Vec::with_capacity(rows);
    for _ in 0..rows {
        let mut row: Vec<f32> = (0..dimension)
            .map(|_| StandardNormal.sample(&mut rng))
            .collect();
        for prior in &matrix {
            let coeff = lodestone_core::distance::dot(&row, prior);
            for (r, p) in row.iter_mut().zip(prior) {
                *r -= coeff * p;
            }
        }
        let norm = lodestone_core::distance::norm(&row);
        if norm > 0.0 {
            for r in &mut row {
                *r /= norm;
            }
        }
        matrix.push(row);
    }
    matrix
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn id(n: u128) -> ChunkId {
        ChunkId::from_uuid(Uuid::from_u128(n))
    }

    fn random_vectors(count: usize, dimension: usize, seed: u64) -> Vec<(ChunkId, Vec<f32>)> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        (1..=count)
            .map(|n| {
                let v: Vec<f32> = (0..dimension)
                    .map(|_| StandardNormal.sample(&mut rng))
                    .collect();
                (id(n as u128), v)
            })
            .collect()
    }

    #[test]
    fn test_projection_rows_are_orthonormal() {
        let rows = gaussian_orthonormal_rows(8, 32, 42);
        for (i, a) in rows.iter().enumerate() {
            for (j, b) in rows.iter().enumerate() {
                let d = lodestone_core::distance::dot(a, b);
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((d - expected).abs() < 1e-4, "rows {} and {}: {}", i, j, d);
            }
        }
    }

    #[test]
    fn test_exact_when_projection_is_square() {
        // A square orthonormal projection is an isometry, so euclidean
        // best-first search prunes exactly and matches brute force.
        let params = KdTreeParams {
            leaf_size: 4,
            projection_dim: Some(6),
            seed: 42,
        };
        let mut index = KdTreeIndex::new(6, DistanceMetric::Euclidean, params);
        let vectors = random_vectors(80, 6, 17);
        index.build(vectors.clone()).unwrap();

        let query = vec![0.25f32; 6];
        let hits = index.search(&query, 5, 5).unwrap();

        let mut brute: Vec<(ChunkId, f32)> = vectors
            .iter()
            .map(|(cid, v)| (*cid, DistanceMetric::Euclidean.distance(&query, v)))
            .collect();
        brute.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        brute.truncate(5);

        let hit_ids: Vec<ChunkId> = hits.iter().map(|(cid, _)| *cid).collect();
        let brute_ids: Vec<ChunkId> = brute.iter().map(|(cid, _)| *cid).collect();
        assert_eq!(hit_ids, brute_ids);
    }

    #[test]
    fn test_leaf_split_on_insert() {
        let params = KdTreeParams {
            leaf_size: 2,
            projection_dim: Some(2),
            seed: 42,
        };
        let mut index = KdTreeIndex::new(2, DistanceMetric::Euclidean, params);
        for n in 1..=20 {
            index
                .insert(id(n), &[n as f32, (n % 5) as f32])
                .unwrap();
        }
        assert_eq!(index.len(), 20);
        let hits = index.search(&[1.0, 1.0], 3, 3).unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].0, id(1));
    }

    #[test]
    fn test_determinism_across_instances() {
        let vectors = random_vectors(120, 24, 5);
        let mut a = KdTreeIndex::new(24, DistanceMetric::Cosine, KdTreeParams::default());
        let mut b = KdTreeIndex::new(24, DistanceMetric::Cosine, KdTreeParams::default());
        a.build(vectors.clone()).unwrap();
        b.build(vectors).unwrap();

        let mut rng = ChaCha8Rng::seed_from_u64(6);
        for _ in 0..10 {
            let q: Vec<f32> = (0..24).map(|_| StandardNormal.sample(&mut rng)).collect();
            assert_eq!(a.search(&q, 8, 8).unwrap(), b.search(&q, 8, 8).unwrap());
        }
    }

    #[test]
    fn test_tombstones_skipped_and_count_kept() {
        let mut index = KdTreeIndex::new(8, DistanceMetric::Euclidean, KdTreeParams::default());
        index.build(random_vectors(50, 8, 7)).unwrap();
        for n in 1..=20 {
            assert!(index.remove(id(n)));
        }
        assert_eq!(index.len(), 30);
        assert!(index.tombstone_ratio() > 0.3);

        let hits = index.search(&[0.0; 8], 30, 30).unwrap();
        assert_eq!(hits.len(), 30);
        assert!(hits.iter().all(|(h, _)| h.as_uuid().as_u128() > 20));
    }

    #[test]
    fn test_reinsert_tombstoned_id() {
        let mut index = KdTreeIndex::new(2, DistanceMetric::Euclidean, KdTreeParams::default());
        index.insert(id(1), &[1.0, 1.0]).unwrap();
        index.insert(id(2), &[5.0, 5.0]).unwrap();
        index.remove(id(1));
        index.insert(id(1), &[2.0, 2.0]).unwrap();

        let hits = index.search(&[2.0, 2.0], 1, 1).unwrap();
        assert_eq!(hits[0].0, id(1));
        assert_eq!(hits[0].1, 0.0);
        assert_eq!(index.tombstone_ratio(), 0.0);
    }
}
