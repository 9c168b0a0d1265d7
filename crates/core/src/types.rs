//! Identifiers and entities
//!
//! This module defines the fundamental types used throughout the system:
//! - [`LibraryId`], [`ChunkId`], [`DocumentId`]: 128-bit entity identifiers
//! - [`Library`]: a named collection of chunks sharing one dimension and index
//! - [`Chunk`]: the atomic indexed unit (content + embedding + metadata)
//! - [`IndexParams`]: the closed set of per-index parameter blocks

use crate::distance::DistanceMetric;
use crate::error::{Error, Result};
use crate::metadata::MetadataMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum embedding dimension accepted at library creation.
pub const MAX_DIMENSION: usize = 4096;

/// Maximum length of a library name.
pub const MAX_NAME_LEN: usize = 255;

/// Maximum length of a library description.
pub const MAX_DESCRIPTION_LEN: usize = 1000;

/// Maximum length of a chunk's text content.
pub const MAX_CONTENT_LEN: usize = 10_000;

macro_rules! entity_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(Uuid);

        impl $name {
            /// Create a new random identifier (UUID v4).
            pub fn new() -> Self {
                $name(Uuid::new_v4())
            }

            /// Wrap an existing UUID.
            pub fn from_uuid(uuid: Uuid) -> Self {
                $name(uuid)
            }

            /// The underlying UUID.
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

entity_id! {
    /// Unique identifier for a library.
    LibraryId
}

entity_id! {
    /// Unique identifier for a chunk.
    ChunkId
}

entity_id! {
    /// Identifier grouping chunks into a document.
    ///
    /// Documents have no storage or lifecycle of their own; the identifier
    /// exists so filters can select the chunks of one document.
    DocumentId
}

/// The supported index algorithms.
///
/// The set is closed: index state is serialized and replayed, so dispatch
/// happens over this tag rather than open trait objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexKind {
    /// Locality-sensitive hashing over random hyperplanes.
    Lsh,
    /// Hierarchical navigable small-world graph.
    Hnsw,
    /// KD-tree over random low-dimensional projections.
    KdTree,
}

impl std::fmt::Display for IndexKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            IndexKind::Lsh => "LSH",
            IndexKind::Hnsw => "HNSW",
            IndexKind::KdTree => "KDT",
        };
        write!(f, "{}", name)
    }
}

/// Parameters for the LSH index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LshParams {
    /// Number of hash tables.
    pub tables: usize,
    /// Signature length in bits per table (at most 64).
    pub signature_bits: usize,
    /// Seed for hyperplane generation.
    pub seed: u64,
}

impl Default for LshParams {
    fn default() -> Self {
        LshParams {
            tables: 10,
            signature_bits: 10,
            seed: 42,
        }
    }
}

/// Parameters for the HNSW index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HnswParams {
    /// Maximum neighbors per node on layers above 0. Layer 0 allows `2*m`.
    pub m: usize,
    /// Beam width during construction.
    pub ef_construction: usize,
    /// Beam width during search (widened to `k` when `k` is larger).
    pub ef_search: usize,
    /// Seed for layer assignment.
    pub seed: u64,
}

impl HnswParams {
    /// Degree cap for a given layer.
    pub fn max_degree(&self, layer: usize) -> usize {
        if layer == 0 {
            self.m * 2
        } else {
            self.m
        }
    }

    /// Level multiplier `1 / ln(m)` for geometric layer assignment.
    pub fn level_multiplier(&self) -> f64 {
        1.0 / (self.m as f64).ln()
    }
}

impl Default for HnswParams {
    fn default() -> Self {
        HnswParams {
            m: 16,
            ef_construction: 200,
            ef_search: 64,
            seed: 42,
        }
    }
}

/// Parameters for the KD-tree index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdTreeParams {
    /// Maximum chunk ids stored in a leaf before it splits.
    pub leaf_size: usize,
    /// Target projection dimension. `None` means `min(dimension, 16)`.
    pub projection_dim: Option<usize>,
    /// Seed for the Gaussian projection matrix.
    pub seed: u64,
}

impl KdTreeParams {
    /// Effective projection dimension for a library of dimension `d`.
    pub fn projected_dim(&self, dimension: usize) -> usize {
        self.projection_dim.unwrap_or(16).min(dimension)
    }
}

impl Default for KdTreeParams {
    fn default() -> Self {
        KdTreeParams {
            leaf_size: 40,
            projection_dim: None,
            seed: 42,
        }
    }
}

/// The per-index parameter block, tagged by algorithm.
///
/// Immutable after library creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IndexParams {
    /// LSH parameters.
    Lsh(LshParams),
    /// HNSW parameters.
    Hnsw(HnswParams),
    /// KD-tree parameters.
    KdTree(KdTreeParams),
}

impl IndexParams {
    /// Default parameters for the given algorithm.
    pub fn default_for(kind: IndexKind) -> Self {
        match kind {
            IndexKind::Lsh => IndexParams::Lsh(LshParams::default()),
            IndexKind::Hnsw => IndexParams::Hnsw(HnswParams::default()),
            IndexKind::KdTree => IndexParams::KdTree(KdTreeParams::default()),
        }
    }

    /// The algorithm tag for this parameter block.
    pub fn kind(&self) -> IndexKind {
        match self {
            IndexParams::Lsh(_) => IndexKind::Lsh,
            IndexParams::Hnsw(_) => IndexKind::Hnsw,
            IndexParams::KdTree(_) => IndexKind::KdTree,
        }
    }

    /// Validate parameter ranges.
    pub fn validate(&self) -> Result<()> {
        match self {
            IndexParams::Lsh(p) => {
                if p.tables == 0 {
                    return Err(Error::invalid_argument("LSH requires at least one table"));
                }
                if p.signature_bits == 0 || p.signature_bits > 64 {
                    return Err(Error::invalid_argument(
                        "LSH signature length must be in 1..=64 bits",
                    ));
                }
            }
            IndexParams::Hnsw(p) => {
                if p.m < 2 {
                    return Err(Error::invalid_argument("HNSW M must be at least 2"));
                }
                if p.ef_construction == 0 || p.ef_search == 0 {
                    return Err(Error::invalid_argument(
                        "HNSW beam widths must be positive",
                    ));
                }
            }
            IndexParams::KdTree(p) => {
                if p.leaf_size == 0 {
                    return Err(Error::invalid_argument(
                        "KD-tree leaf size must be positive",
                    ));
                }
                if p.projection_dim == Some(0) {
                    return Err(Error::invalid_argument(
                        "KD-tree projection dimension must be positive",
                    ));
                }
            }
        }
        Ok(())
    }
}

/// A named collection of chunks sharing one dimension and one index.
///
/// The dimension, metric, index kind and parameters are fixed at creation.
/// Name, description and metadata may change afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Library {
    /// Unique identifier.
    pub id: LibraryId,
    /// Display name, unique across the store.
    pub name: String,
    /// Optional free-form description.
    pub description: Option<String>,
    /// Embedding dimension shared by every chunk.
    pub dimension: usize,
    /// Distance metric used for all searches in this library.
    pub metric: DistanceMetric,
    /// Index algorithm parameters, immutable after creation.
    pub params: IndexParams,
    /// Free-form metadata.
    pub metadata: MetadataMap,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Library {
    /// Create a library, validating name, dimension and parameters.
    pub fn new(
        name: impl Into<String>,
        dimension: usize,
        metric: DistanceMetric,
        params: IndexParams,
        metadata: MetadataMap,
    ) -> Result<Self> {
        let name = name.into();
        validate_library_name(&name)?;
        if dimension == 0 || dimension > MAX_DIMENSION {
            return Err(Error::invalid_argument(format!(
                "dimension must be in 1..={}, got {}",
                MAX_DIMENSION, dimension
            )));
        }
        params.validate()?;
        let now = Utc::now();
        Ok(Library {
            id: LibraryId::new(),
            name,
            description: None,
            dimension,
            metric,
            params,
            metadata,
            created_at: now,
            updated_at: now,
        })
    }

    /// The index algorithm tag.
    pub fn index_kind(&self) -> IndexKind {
        self.params.kind()
    }
}

/// A partial update to a library's mutable attributes.
///
/// `None` fields are left unchanged. Dimension, metric and index parameters
/// are immutable and deliberately absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LibraryPatch {
    /// New display name; uniqueness is re-checked on rename.
    pub name: Option<String>,
    /// New description.
    pub description: Option<String>,
    /// Metadata changes.
    pub metadata: crate::metadata::MetadataPatch,
}

impl LibraryPatch {
    /// Whether the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.description.is_none() && self.metadata.is_empty()
    }
}

/// Validate a library name: non-empty, bounded, no path separators.
pub fn validate_library_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid_argument("library name must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::invalid_argument(format!(
            "library name exceeds {} bytes",
            MAX_NAME_LEN
        )));
    }
    if name.contains('/') || name.starts_with('_') {
        return Err(Error::invalid_argument(
            "library name must not contain '/' or start with '_'",
        ));
    }
    Ok(())
}

/// The atomic indexed unit: text content plus its embedding.
///
/// The embedding is immutable once inserted; replacing it means delete and
/// re-insert. Metadata may be patched in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Unique identifier within the library.
    pub id: ChunkId,
    /// Owning library.
    pub library_id: LibraryId,
    /// UTF-8 text content.
    pub content: String,
    /// Embedding vector; length equals the library dimension.
    pub embedding: Vec<f32>,
    /// Optional document grouping.
    pub document_id: Option<DocumentId>,
    /// Position ordinal within the document.
    pub position: u32,
    /// Free-form metadata.
    pub metadata: MetadataMap,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Chunk {
    /// Validate content bounds and embedding shape against a library dimension.
    pub fn validate(&self, dimension: usize) -> Result<()> {
        if self.content.is_empty() {
            return Err(Error::invalid_argument("chunk content must not be empty"));
        }
        if self.content.len() > MAX_CONTENT_LEN {
            return Err(Error::invalid_argument(format!(
                "chunk content exceeds {} bytes",
                MAX_CONTENT_LEN
            )));
        }
        validate_embedding(&self.embedding, dimension)?;
        Ok(())
    }
}

/// Validate an embedding: exact dimension, every entry finite.
pub fn validate_embedding(embedding: &[f32], dimension: usize) -> Result<()> {
    if embedding.len() != dimension {
        return Err(Error::DimensionMismatch {
            expected: dimension,
            actual: embedding.len(),
        });
    }
    if embedding.iter().any(|v| !v.is_finite()) {
        return Err(Error::invalid_argument(
            "embedding entries must be finite (no NaN or infinity)",
        ));
    }
    Ok(())
}
