//! Snapshot state and read-model types

use lodestone_core::{Chunk, ChunkId, Library};
use serde::{Deserialize, Serialize};

/// Serialized form of the whole store, the snapshot body.
///
/// Libraries and chunks are emitted in id order so identical states produce
/// identical bytes. Indexes are not serialized; they are rebuilt
/// deterministically from the vectors at load time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreState {
    /// All libraries with their chunks, ordered by library id.
    pub libraries: Vec<LibraryState>,
}

/// One library's serialized state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryState {
    /// Library metadata and parameters.
    pub library: Library,
    /// Chunks ordered by id.
    pub chunks: Vec<Chunk>,
}

/// A library plus derived counters, as returned by reads and listings.
#[derive(Debug, Clone)]
pub struct LibraryInfo {
    /// The library.
    pub library: Library,
    /// Number of chunks.
    pub chunk_count: usize,
    /// Number of distinct document ids across chunks.
    pub document_count: usize,
    /// Live vectors in the index.
    pub index_len: usize,
}

/// One page of a library listing, ordered by name.
#[derive(Debug, Clone)]
pub struct LibraryPage {
    /// The libraries on this page.
    pub items: Vec<LibraryInfo>,
    /// Cursor for the next page; `None` when exhausted.
    pub next_cursor: Option<String>,
}

/// One page of a chunk listing, ordered by chunk id.
#[derive(Debug, Clone)]
pub struct ChunkPage {
    /// The chunks on this page.
    pub items: Vec<Chunk>,
    /// Cursor for the next page; `None` when exhausted.
    pub next_cursor: Option<ChunkId>,
}
