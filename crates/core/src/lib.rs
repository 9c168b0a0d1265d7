//! Core types for lodestone
//!
//! This crate defines the vocabulary shared by every other lodestone crate:
//! - [`types`]: identifiers and the `Library`/`Chunk` entities
//! - [`metadata`]: the metadata value model and patch semantics
//! - [`distance`]: distance metrics and their kernels
//! - [`filter`]: the metadata filter AST evaluated at query time
//! - [`error`]: the canonical error taxonomy surfaced to callers

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod distance;
pub mod error;
pub mod filter;
pub mod metadata;
pub mod types;

pub use distance::DistanceMetric;
pub use error::{Error, Result};
pub use filter::Filter;
pub use metadata::{MetadataMap, MetadataPatch, MetadataValue};
pub use types::{
    Chunk, ChunkId, DocumentId, HnswParams, IndexKind, IndexParams, KdTreeParams, Library,
    LibraryId, LibraryPatch, LshParams,
};
