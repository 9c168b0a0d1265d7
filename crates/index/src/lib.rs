//! Approximate nearest-neighbor indexes
//!
//! Three from-scratch index implementations behind one contract:
//! - [`LshIndex`]: random-hyperplane signatures with multi-table bucketing
//! - [`HnswIndex`]: multi-layer proximity graph with greedy descent and beam
//!   search
//! - [`KdTreeIndex`]: median-split tree over random low-dimensional
//!   projections with best-first k-NN
//!
//! Indexes are not internally synchronized; the surrounding INDEX lock
//! mediates all access. Removal tombstones ids: a removed id is never
//! returned from a search, and the owning library schedules a rebuild when
//! the tombstone ratio grows past [`REBUILD_TOMBSTONE_RATIO`].
//!
//! All randomness is drawn from seeded generators, so identical seeds and
//! input order produce identical structures and identical search results.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod candidates;

pub mod hnsw;
pub mod kdtree;
pub mod lsh;

pub use hnsw::HnswIndex;
pub use kdtree::KdTreeIndex;
pub use lsh::LshIndex;

use lodestone_core::{ChunkId, DistanceMetric, IndexKind, IndexParams, Result};

/// Tombstone fraction past which a library schedules an index rebuild.
pub const REBUILD_TOMBSTONE_RATIO: f64 = 0.3;

/// The uniform index contract.
///
/// `search` returns up to `k` `(id, distance)` pairs sorted ascending by
/// distance, ties broken by id. `candidate_hint` widens the internal
/// candidate pool (callers that post-filter pass a hint larger than `k`);
/// it never widens the returned list. Searching an empty index returns an
/// empty list, never an error.
pub trait VectorIndex: Send + Sync {
    /// The algorithm tag.
    fn kind(&self) -> IndexKind;

    /// Bulk-construct from scratch, replacing any existing contents.
    fn build(&mut self, vectors: Vec<(ChunkId, Vec<f32>)>) -> Result<()>;

    /// Insert one vector. Fails with `DimensionMismatch` on a wrong length.
    fn insert(&mut self, id: ChunkId, vector: &[f32]) -> Result<()>;

    /// Tombstone an id. Returns whether the id was present and live.
    fn remove(&mut self, id: ChunkId) -> bool;

    /// k-nearest-neighbor search; see the trait docs for the contract.
    fn search(&self, query: &[f32], k: usize, candidate_hint: usize) -> Result<Vec<(ChunkId, f32)>>;

    /// Number of live (non-tombstoned) vectors.
    fn len(&self) -> usize;

    /// Whether no live vectors are indexed.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove everything, live and tombstoned.
    fn clear(&mut self);

    /// Fraction of structurally-present ids that are tombstoned.
    fn tombstone_ratio(&self) -> f64;
}

/// Construct the index for a parameter block.
///
/// Dispatch is over the closed [`IndexKind`] set; the index state itself is
/// never serialized, it is rebuilt deterministically from vectors.
pub fn build_index(
    params: &IndexParams,
    dimension: usize,
    metric: DistanceMetric,
) -> Box<dyn VectorIndex> {
    match params {
        IndexParams::Lsh(p) => Box::new(LshIndex::new(dimension, metric, p.clone())),
        IndexParams::Hnsw(p) => Box::new(HnswIndex::new(dimension, metric, p.clone())),
        IndexParams::KdTree(p) => Box::new(KdTreeIndex::new(dimension, metric, p.clone())),
    }
}
