//! The library store

use crate::state::{ChunkPage, LibraryInfo, LibraryPage, LibraryState, StoreState};
use lodestone_core::{
    Chunk, ChunkId, Error, Library, LibraryId, LibraryPatch, MetadataPatch, Result,
};
use lodestone_durability::WalOp;
use lodestone_index::{build_index, VectorIndex};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// One library's in-memory state: metadata, chunk table, index.
///
/// The chunk table is the source of truth; the index holds ids and
/// structure. Chunks are keyed in a `BTreeMap` so iteration, pagination and
/// snapshot bytes are deterministic.
pub struct LibraryEntry {
    /// Library metadata and parameters.
    pub library: Library,
    /// Chunks by id.
    pub chunks: BTreeMap<ChunkId, Chunk>,
    /// The library's index; access is mediated by the INDEX lock.
    pub index: Box<dyn VectorIndex>,
}

impl LibraryEntry {
    fn new(library: Library) -> Self {
        let index = build_index(&library.params, library.dimension, library.metric);
        LibraryEntry {
            library,
            chunks: BTreeMap::new(),
            index,
        }
    }

    /// Live `(id, embedding)` pairs in id order, for builds and rebuilds.
    pub fn live_vectors(&self) -> Vec<(ChunkId, Vec<f32>)> {
        self.chunks
            .iter()
            .map(|(id, chunk)| (*id, chunk.embedding.clone()))
            .collect()
    }

    fn info(&self) -> LibraryInfo {
        let documents: HashSet<_> = self
            .chunks
            .values()
            .filter_map(|chunk| chunk.document_id)
            .collect();
        LibraryInfo {
            library: self.library.clone(),
            chunk_count: self.chunks.len(),
            document_count: documents.len(),
            index_len: self.index.len(),
        }
    }
}

enum NameSlot {
    /// Held by an in-flight create or rename, before its WAL record lands.
    Reserved,
    Bound(LibraryId),
}

/// The in-memory store: all libraries, name uniqueness, chunk location.
///
/// Mutations come in two phases: the router validates and reserves under
/// the logical locks, writes the WAL record, then calls the `apply_*`
/// function. Recovery calls the same `apply_*` functions directly.
#[derive(Default)]
pub struct LibraryStore {
    libraries: RwLock<HashMap<LibraryId, Arc<RwLock<LibraryEntry>>>>,
    names: RwLock<HashMap<String, NameSlot>>,
    chunk_locator: RwLock<HashMap<ChunkId, LibraryId>>,
}

impl LibraryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from snapshot state, reconstructing every index from
    /// its vectors.
    pub fn from_state(state: StoreState) -> Result<Self> {
        let store = Self::new();
        for library_state in state.libraries {
            let LibraryState { library, chunks } = library_state;
            let mut entry = LibraryEntry::new(library);
            entry
                .index
                .build(chunks.iter().map(|c| (c.id, c.embedding.clone())).collect())?;
            for chunk in chunks {
                store
                    .chunk_locator
                    .write()
                    .insert(chunk.id, entry.library.id);
                entry.chunks.insert(chunk.id, chunk);
            }
            store
                .names
                .write()
                .insert(entry.library.name.clone(), NameSlot::Bound(entry.library.id));
            store
                .libraries
                .write()
                .insert(entry.library.id, Arc::new(RwLock::new(entry)));
        }
        info!(
            libraries = store.libraries.read().len(),
            "store loaded from snapshot"
        );
        Ok(store)
    }

    /// Serialize the whole store, libraries and chunks in id order.
    ///
    /// The caller holds the STORE read lock (and thereby excludes library
    /// creation/deletion); chunk-level consistency comes from the per-library
    /// read locks the snapshotter takes while serializing.
    pub fn to_state(&self) -> StoreState {
        let entries: Vec<(LibraryId, Arc<RwLock<LibraryEntry>>)> = {
            let libraries = self.libraries.read();
            let mut list: Vec<_> = libraries
                .iter()
                .map(|(id, entry)| (*id, Arc::clone(entry)))
                .collect();
            list.sort_by_key(|(id, _)| *id);
            list
        };

        let mut libraries = Vec::with_capacity(entries.len());
        for (_, entry) in entries {
            let entry = entry.read();
            libraries.push(LibraryState {
                library: entry.library.clone(),
                chunks: entry.chunks.values().cloned().collect(),
            });
        }
        StoreState { libraries }
    }

    // ========================================================================
    // Name reservation
    // ========================================================================

    /// Reserve a name for an in-flight create or rename.
    ///
    /// Called under the STORE write lock; the reservation keeps the name
    /// claimed while the WAL fsync happens outside that lock.
    pub fn reserve_name(&self, name: &str) -> Result<()> {
        let mut names = self.names.write();
        if names.contains_key(name) {
            return Err(Error::AlreadyExists {
                resource: "library",
                name: name.to_string(),
            });
        }
        names.insert(name.to_string(), NameSlot::Reserved);
        Ok(())
    }

    /// Drop a reservation after a failed create or rename.
    pub fn cancel_reservation(&self, name: &str) {
        let mut names = self.names.write();
        if let Some(NameSlot::Reserved) = names.get(name) {
            names.remove(name);
        }
    }

    // ========================================================================
    // Durable mutations (post-WAL apply, also driven by replay)
    // ========================================================================

    /// Materialize a created library, binding its name.
    pub fn apply_create_library(&self, library: Library) -> Result<()> {
        let id = library.id;
        let name = library.name.clone();
        {
            let mut names = self.names.write();
            if let Some(NameSlot::Bound(other)) = names.get(&name) {
                if *other != id {
                    return Err(Error::AlreadyExists {
                        resource: "library",
                        name,
                    });
                }
            }
            names.insert(name, NameSlot::Bound(id));
        }
        let entry = Arc::new(RwLock::new(LibraryEntry::new(library)));
        self.libraries.write().insert(id, entry);
        debug!(library = %id, "library created");
        Ok(())
    }

    /// Apply a library patch; returns the updated library.
    pub fn apply_update_library(
        &self,
        id: LibraryId,
        patch: &LibraryPatch,
        updated_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<Library> {
        let entry = self.resolve(id)?;
        let mut entry = entry.write();

        if let Some(new_name) = &patch.name {
            if *new_name != entry.library.name {
                let mut names = self.names.write();
                if let Some(NameSlot::Bound(other)) = names.get(new_name) {
                    if *other != id {
                        return Err(Error::AlreadyExists {
                            resource: "library",
                            name: new_name.clone(),
                        });
                    }
                }
                names.remove(&entry.library.name);
                names.insert(new_name.clone(), NameSlot::Bound(id));
                entry.library.name = new_name.clone();
            }
        }
        if let Some(description) = &patch.description {
            entry.library.description = Some(description.clone());
        }
        patch.metadata.apply(&mut entry.library.metadata);
        entry.library.updated_at = updated_at;
        Ok(entry.library.clone())
    }

    /// Delete a library, cascading to its chunks and index.
    pub fn apply_delete_library(&self, id: LibraryId) -> Result<()> {
        let entry = {
            let mut libraries = self.libraries.write();
            libraries
                .remove(&id)
                .ok_or_else(|| Error::library_not_found(id))?
        };
        let entry = entry.read();
        self.names.write().remove(&entry.library.name);
        {
            let mut locator = self.chunk_locator.write();
            for chunk_id in entry.chunks.keys() {
                locator.remove(chunk_id);
            }
        }
        info!(library = %id, chunks = entry.chunks.len(), "library deleted");
        Ok(())
    }

    /// Insert one chunk into its library and index.
    pub fn apply_insert_chunk(&self, chunk: Chunk) -> Result<()> {
        let entry = self.resolve(chunk.library_id)?;
        let mut entry = entry.write();
        chunk.validate(entry.library.dimension)?;
        if entry.chunks.contains_key(&chunk.id) {
            return Err(Error::AlreadyExists {
                resource: "chunk",
                name: chunk.id.to_string(),
            });
        }
        entry.index.insert(chunk.id, &chunk.embedding)?;
        self.chunk_locator.write().insert(chunk.id, chunk.library_id);
        entry.chunks.insert(chunk.id, chunk);
        Ok(())
    }

    /// Insert a batch atomically: every chunk is validated against the
    /// library before any is applied.
    pub fn apply_insert_chunk_batch(
        &self,
        library_id: LibraryId,
        chunks: Vec<Chunk>,
    ) -> Result<()> {
        let entry = self.resolve(library_id)?;
        let mut entry = entry.write();

        for (position, chunk) in chunks.iter().enumerate() {
            if chunk.library_id != library_id {
                return Err(Error::invalid_argument(format!(
                    "batch item {} targets a different library",
                    position
                )));
            }
            chunk.validate(entry.library.dimension).map_err(|e| {
                Error::invalid_argument(format!("batch item {}: {}", position, e))
            })?;
            if entry.chunks.contains_key(&chunk.id) {
                return Err(Error::invalid_argument(format!(
                    "batch item {}: chunk id already exists",
                    position
                )));
            }
        }

        let mut locator = self.chunk_locator.write();
        for chunk in chunks {
            entry.index.insert(chunk.id, &chunk.embedding)?;
            locator.insert(chunk.id, library_id);
            entry.chunks.insert(chunk.id, chunk);
        }
        Ok(())
    }

    /// Patch a chunk's metadata; the embedding is immutable.
    pub fn apply_update_chunk_metadata(
        &self,
        chunk_id: ChunkId,
        patch: &MetadataPatch,
        updated_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<Chunk> {
        let library_id = self.locate_chunk(chunk_id)?;
        let entry = self.resolve(library_id)?;
        let mut entry = entry.write();
        let chunk = entry
            .chunks
            .get_mut(&chunk_id)
            .ok_or_else(|| Error::chunk_not_found(chunk_id))?;
        patch.apply(&mut chunk.metadata);
        chunk.updated_at = updated_at;
        Ok(chunk.clone())
    }

    /// Delete a chunk; returns the index's tombstone ratio afterwards so
    /// the caller can schedule a rebuild.
    pub fn apply_delete_chunk(&self, chunk_id: ChunkId) -> Result<f64> {
        let library_id = self.locate_chunk(chunk_id)?;
        let entry = self.resolve(library_id)?;
        let mut entry = entry.write();
        if entry.chunks.remove(&chunk_id).is_none() {
            return Err(Error::chunk_not_found(chunk_id));
        }
        entry.index.remove(chunk_id);
        self.chunk_locator.write().remove(&chunk_id);
        Ok(entry.index.tombstone_ratio())
    }

    /// Replay dispatch: apply one recovered WAL operation.
    pub fn apply_op(&self, op: &WalOp) -> Result<()> {
        match op {
            WalOp::CreateLibrary { library } => self.apply_create_library(library.clone()),
            WalOp::UpdateLibrary {
                library_id,
                patch,
                updated_at,
            } => self
                .apply_update_library(*library_id, patch, *updated_at)
                .map(|_| ()),
            WalOp::DeleteLibrary { library_id } => self.apply_delete_library(*library_id),
            WalOp::InsertChunk { chunk } => self.apply_insert_chunk(chunk.clone()),
            WalOp::InsertChunkBatch { library_id, chunks } => {
                self.apply_insert_chunk_batch(*library_id, chunks.clone())
            }
            WalOp::UpdateChunkMetadata {
                chunk_id,
                patch,
                updated_at,
            } => self
                .apply_update_chunk_metadata(*chunk_id, patch, *updated_at)
                .map(|_| ()),
            WalOp::DeleteChunk { chunk_id } => self.apply_delete_chunk(*chunk_id).map(|_| ()),
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// The entry cell for a library.
    pub fn resolve(&self, id: LibraryId) -> Result<Arc<RwLock<LibraryEntry>>> {
        self.libraries
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::library_not_found(id))
    }

    /// A library with derived counters.
    pub fn get_library(&self, id: LibraryId) -> Result<LibraryInfo> {
        let entry = self.resolve(id)?;
        let entry = entry.read();
        Ok(entry.info())
    }

    /// List libraries ordered by name; the cursor is the last name seen.
    pub fn list_libraries(&self, cursor: Option<&str>, limit: usize) -> LibraryPage {
        let entries: Vec<Arc<RwLock<LibraryEntry>>> =
            self.libraries.read().values().cloned().collect();
        let mut infos: Vec<LibraryInfo> = entries
            .iter()
            .map(|entry| entry.read().info())
            .filter(|info| cursor.map_or(true, |c| info.library.name.as_str() > c))
            .collect();
        infos.sort_by(|a, b| a.library.name.cmp(&b.library.name));

        let has_more = infos.len() > limit;
        infos.truncate(limit);
        let next_cursor = if has_more {
            infos.last().map(|info| info.library.name.clone())
        } else {
            None
        };
        LibraryPage {
            items: infos,
            next_cursor,
        }
    }

    /// The library owning a chunk.
    pub fn locate_chunk(&self, chunk_id: ChunkId) -> Result<LibraryId> {
        self.chunk_locator
            .read()
            .get(&chunk_id)
            .copied()
            .ok_or_else(|| Error::chunk_not_found(chunk_id))
    }

    /// Fetch one chunk.
    pub fn get_chunk(&self, chunk_id: ChunkId) -> Result<Chunk> {
        let library_id = self.locate_chunk(chunk_id)?;
        let entry = self.resolve(library_id)?;
        let entry = entry.read();
        entry
            .chunks
            .get(&chunk_id)
            .cloned()
            .ok_or_else(|| Error::chunk_not_found(chunk_id))
    }

    /// List a library's chunks in id order; cursor is exclusive.
    pub fn list_chunks(
        &self,
        library_id: LibraryId,
        cursor: Option<ChunkId>,
        limit: usize,
    ) -> Result<ChunkPage> {
        let entry = self.resolve(library_id)?;
        let entry = entry.read();
        let mut items: Vec<Chunk> = match cursor {
            Some(after) => entry
                .chunks
                .range((std::ops::Bound::Excluded(after), std::ops::Bound::Unbounded))
                .map(|(_, chunk)| chunk.clone())
                .take(limit + 1)
                .collect(),
            None => entry.chunks.values().cloned().take(limit + 1).collect(),
        };
        let has_more = items.len() > limit;
        items.truncate(limit);
        let next_cursor = if has_more {
            items.last().map(|chunk| chunk.id)
        } else {
            None
        };
        Ok(ChunkPage {
            items,
            next_cursor,
        })
    }

    /// All library ids, unordered.
    pub fn library_ids(&self) -> Vec<LibraryId> {
        self.libraries.read().keys().copied().collect()
    }

    /// Number of libraries.
    pub fn len(&self) -> usize {
        self.libraries.read().len()
    }

    /// Whether the store holds no libraries.
    pub fn is_empty(&self) -> bool {
        self.libraries.read().is_empty()
    }

    // ========================================================================
    // Index rebuild
    // ========================================================================

    /// Construct a fresh index from a library's live vectors.
    ///
    /// Runs without the INDEX lock so searches continue against the old
    /// index; the caller holds the LIBRARY read lock, which keeps the
    /// vector set stable.
    pub fn build_fresh_index(&self, id: LibraryId) -> Result<Box<dyn VectorIndex>> {
        let entry = self.resolve(id)?;
        let (params, dimension, metric, vectors) = {
            let entry = entry.read();
            (
                entry.library.params.clone(),
                entry.library.dimension,
                entry.library.metric,
                entry.live_vectors(),
            )
        };
        let mut fresh = build_index(&params, dimension, metric);
        fresh.build(vectors)?;
        Ok(fresh)
    }

    /// Swap a freshly built index in. The caller holds the INDEX write
    /// lock, so readers observe either the old or the new index, never a
    /// partial one.
    pub fn swap_index(&self, id: LibraryId, fresh: Box<dyn VectorIndex>) -> Result<usize> {
        let entry = self.resolve(id)?;
        let len = fresh.len();
        entry.write().index = fresh;
        info!(library = %id, vectors = len, "index rebuilt");
        Ok(len)
    }

    /// Rebuild a library's index in place: build aside, then swap.
    pub fn rebuild_index(&self, id: LibraryId) -> Result<usize> {
        let fresh = self.build_fresh_index(id)?;
        self.swap_index(id, fresh)
    }
}
