//! Locality-sensitive hashing index
//!
//! Signatures come from random hyperplanes: bit `j` of table `i` is the side
//! of hyperplane `(i, j)` the vector falls on. Vectors hashing to the same
//! `(table, signature)` bucket are candidate neighbors; search unions the
//! query's buckets across tables, widens through Hamming-1 probes when the
//! pool is short, and reranks candidates by exact distance.
//!
//! Recall versus latency is controlled entirely by the table count, the
//! signature length, and the caller's candidate hint.

use crate::candidates::{sorted_top_k, Neighbor};
use crate::VectorIndex;
use lodestone_core::{ChunkId, DistanceMetric, Error, IndexKind, LshParams, Result};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Extra buckets probed per table when the exact buckets run short.
const MAX_EXPANSION_ROUNDS: usize = 4;

/// Tombstone fraction that triggers bucket compaction on the next mutation.
const COMPACTION_RATIO: f64 = 0.25;

/// Random-hyperplane LSH index.
pub struct LshIndex {
    dimension: usize,
    metric: DistanceMetric,
    params: LshParams,
    /// `tables * signature_bits` unit-norm hyperplanes, row-major by table.
    hyperplanes: Vec<Vec<f32>>,
    /// Per-table buckets: signature -> ids (live and tombstoned).
    tables: Vec<HashMap<u64, Vec<ChunkId>>>,
    /// Live vectors.
    vectors: HashMap<ChunkId, Vec<f32>>,
    /// Tombstoned vectors, retained so their bucket entries can be located.
    dead: HashMap<ChunkId, Vec<f32>>,
}

impl LshIndex {
    /// Create an empty index with hyperplanes drawn from the seed.
    pub fn new(dimension: usize, metric: DistanceMetric, params: LshParams) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(params.seed);
        let count = params.tables * params.signature_bits;
        let mut hyperplanes = Vec::with_capacity(count);
        for _ in 0..count {
            let mut plane: Vec<f32> = (0..dimension)
                .map(|_| StandardNormal.sample(&mut rng))
                .collect();
            let norm = lodestone_core::distance::norm(&plane);
            if norm > 0.0 {
                for v in &mut plane {
                    *v /= norm;
                }
            }
            hyperplanes.push(plane);
        }

        LshIndex {
            dimension,
            metric,
            tables: vec![HashMap::new(); params.tables],
            params,
            hyperplanes,
            vectors: HashMap::new(),
            dead: HashMap::new(),
        }
    }

    fn plane(&self, table: usize, bit: usize) -> &[f32] {
        &self.hyperplanes[table * self.params.signature_bits + bit]
    }

    /// Signed projections of a vector onto one table's hyperplanes.
    fn projections(&self, table: usize, vector: &[f32]) -> Vec<f32> {
        (0..self.params.signature_bits)
            .map(|bit| lodestone_core::distance::dot(vector, self.plane(table, bit)))
            .collect()
    }

    fn signature_from_projections(projections: &[f32]) -> u64 {
        let mut signature = 0u64;
        for (bit, &p) in projections.iter().enumerate() {
            if p > 0.0 {
                signature |= 1 << bit;
            }
        }
        signature
    }

    fn signature(&self, table: usize, vector: &[f32]) -> u64 {
        Self::signature_from_projections(&self.projections(table, vector))
    }

    fn add_to_buckets(&mut self, id: ChunkId, vector: &[f32]) {
        for table in 0..self.params.tables {
            let signature = self.signature(table, vector);
            self.tables[table].entry(signature).or_default().push(id);
        }
    }

    /// Remove an id's entries from every table, locating them by signature.
    fn scrub(&mut self, id: ChunkId, vector: &[f32]) {
        for table in 0..self.params.tables {
            let signature = self.signature(table, vector);
            if let Some(bucket) = self.tables[table].get_mut(&signature) {
                bucket.retain(|&entry| entry != id);
                if bucket.is_empty() {
                    self.tables[table].remove(&signature);
                }
            }
        }
    }

    fn maybe_compact(&mut self) {
        if self.tombstone_ratio() < COMPACTION_RATIO {
            return;
        }
        let dead = std::mem::take(&mut self.dead);
        debug!(tombstones = dead.len(), "compacting LSH buckets");
        for (id, vector) in dead {
            self.scrub(id, &vector);
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

    /// Exact-distance rerank of a candidate set.
    fn rerank(&self, query: &[f32], candidates: &HashSet<ChunkId>, k: usize) -> Vec<(ChunkId, f32)> {
        let neighbors: Vec<Neighbor> = candidates
            .iter()
            .filter_map(|id| {
                self.vectors
                    .get(id)
                    .map(|v| Neighbor::new(*id, self.metric.distance(query, v)))
            })
            .collect();
        sorted_top_k(neighbors, k)
    }

    /// Brute-force pass over all live vectors, used as the final fallback
    /// when bucket probing cannot satisfy the requested count.
    fn scan_all(&self, query: &[f32], k: usize) -> Vec<(ChunkId, f32)> {
        let neighbors: Vec<Neighbor> = self
            .vectors
            .iter()
            .map(|(id, v)| Neighbor::new(*id, self.metric.distance(query, v)))
            .collect();
        sorted_top_k(neighbors, k)
    }
}

impl VectorIndex for LshIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::Lsh
    }

    fn build(&mut self, vectors: Vec<(ChunkId, Vec<f32>)>) -> Result<()> {
        self.clear();
        for (id, vector) in vectors {
            self.insert(id, &vector)?;
        }
        Ok(())
    }

    fn insert(&mut self, id: ChunkId, vector: &[f32]) -> Result<()> {
        self.check_dimension(vector)?;
        if let Some(old) = self.dead.remove(&id) {
            self.scrub(id, &old);
        }
        if let Some(old) = self.vectors.remove(&id) {
            self.scrub(id, &old);
        }
        self.add_to_buckets(id, vector);
        self.vectors.insert(id, vector.to_vec());
        Ok(())
    }

    fn remove(&mut self, id: ChunkId) -> bool {
        match self.vectors.remove(&id) {
            Some(vector) => {
                self.dead.insert(id, vector);
                self.maybe_compact();
                true
            }
            None => false,
        }
    }

    fn search(&self, query: &[f32], k: usize, candidate_hint: usize) -> Result<Vec<(ChunkId, f32)>> {
        self.check_dimension(query)?;
        if self.vectors.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let target = k.max(candidate_hint);

        // Exact buckets across all tables.
        let mut candidates: HashSet<ChunkId> = HashSet::new();
        let per_table: Vec<Vec<f32>> = (0..self.params.tables)
            .map(|table| self.projections(table, query))
            .collect();
        for (table, projections) in per_table.iter().enumerate() {
            let signature = Self::signature_from_projections(projections);
            if let Some(bucket) = self.tables[table].get(&signature) {
                candidates.extend(bucket.iter().copied().filter(|id| !self.dead.contains_key(id)));
            }
        }

        // Hamming-1 expansion: flip the least-confident bits first, one more
        // per table each round, until the pool is wide enough or the budget
        // runs out.
        if candidates.len() < target {
            let bit_order: Vec<Vec<usize>> = per_table
                .iter()
                .map(|projections| {
                    let mut order: Vec<usize> = (0..projections.len()).collect();
                    order.sort_by(|&a, &b| {
                        projections[a]
                            .abs()
                            .total_cmp(&projections[b].abs())
                            .then(a.cmp(&b))
                    });
                    order
                })
                .collect();

            let rounds = MAX_EXPANSION_ROUNDS.min(self.params.signature_bits);
            'expansion: for round in 0..rounds {
                for (table, projections) in per_table.iter().enumerate() {
                    let flipped =
                        Self::signature_from_projections(projections) ^ (1 << bit_order[table][round]);
                    if let Some(bucket) = self.tables[table].get(&flipped) {
                        candidates.extend(bucket.iter().copied().filter(|id| !self.dead.contains_key(id)));
                    }
                    if candidates.len() >= target {
                        break 'expansion;
                    }
                }
            }
        }

        let hits = self.rerank(query, &candidates, k);
        if hits.len() < k && self.vectors.len() > hits.len() {
            return Ok(self.scan_all(query, k));
        }
        Ok(hits)
    }

    fn len(&self) -> usize {
        self.vectors.len()
    }

    fn clear(&mut self) {
        for table in &mut self.tables {
            table.clear();
        }
        self.vectors.clear();
        self.dead.clear();
    }

    fn tombstone_ratio(&self) -> f64 {
        let total = self.vectors.len() + self.dead.len();
        if total == 0 {
            0.0
        } else {
            self.dead.len() as f64 / total as f64
        }
    }
}
