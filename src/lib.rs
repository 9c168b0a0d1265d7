//! # Lodestone
//!
//! Embedded in-memory vector database with approximate nearest-neighbor
//! search and write-ahead-log durability.
//!
//! Lodestone stores labelled embedding vectors ("chunks") in named
//! collections ("libraries"). Each library fixes a dimension, a distance
//! metric, and one of three index algorithms — LSH, HNSW, or a KD-tree over
//! random projections — at creation. Searches combine the index's candidate
//! set with metadata filters.
//!
//! ## Quick Start
//!
//! ```ignore
//! use lodestone::prelude::*;
//!
//! let db = Database::open(DatabaseOptions::new("./data"))?;
//!
//! let library = db.create_library(
//!     "docs",
//!     384,
//!     DistanceMetric::Cosine,
//!     IndexParams::default_for(IndexKind::Hnsw),
//!     MetadataMap::new(),
//! )?;
//!
//! let chunk_id = db.insert_chunk(library.library.id, NewChunk {
//!     content: "hello world".into(),
//!     embedding: vec![0.1; 384],
//!     ..Default::default()
//! })?;
//!
//! let hits = db.search(library.library.id, &vec![0.1; 384], 10, None, None)?;
//!
//! db.close()?;
//! ```
//!
//! ## Durability
//!
//! Every mutation is appended and fsynced to a write-ahead log before
//! in-memory state changes. A background snapshotter periodically dumps the
//! whole store and truncates the log; recovery at open loads the latest
//! valid snapshot and replays the WAL tail, truncating at the first torn
//! record.
//!
//! ## Concurrency
//!
//! Operations acquire per-resource fair reader/writer locks in a strict
//! hierarchy (`STORE < LIBRARY < DOCUMENT < CHUNK < INDEX`) with deadlines.
//! Searches see a consistent pair of (chunk table, index); writers never
//! starve behind readers.

#![warn(missing_docs)]

mod database;
mod workers;

pub mod prelude;

pub use database::{Database, DatabaseOptions, DatabaseStats, NewChunk, MAX_K};

// Re-export the vocabulary callers need at the command surface.
pub use lodestone_core::{
    Chunk, ChunkId, DistanceMetric, DocumentId, Error, Filter, HnswParams, IndexKind, IndexParams,
    KdTreeParams, Library, LibraryId, LibraryPatch, LshParams, MetadataMap, MetadataPatch,
    MetadataValue, Result,
};
pub use lodestone_executor::{MultiSearchHit, SearchHit};
pub use lodestone_store::{ChunkPage, LibraryInfo, LibraryPage};
