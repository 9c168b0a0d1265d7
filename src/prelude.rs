//! Convenience re-exports for typical usage.
//!
//! ```ignore
//! use lodestone::prelude::*;
//! ```

pub use crate::{
    Database, DatabaseOptions, DistanceMetric, Error, Filter, IndexKind, IndexParams, LibraryId,
    LibraryPatch, MetadataMap, MetadataPatch, MetadataValue, NewChunk, Result,
};
