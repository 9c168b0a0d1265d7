//! The database facade and command router
//!
//! [`Database`] wires the store, the lock manager, the durability layer and
//! the background workers together, and exposes the command surface. Every
//! mutating command follows the same protocol:
//!
//! 1. acquire locks in hierarchy order through a [`LockSession`]
//! 2. validate against current state
//! 3. release the STORE guard (it is never held across an fsync)
//! 4. append the operation's WAL record and fsync
//! 5. apply the operation to memory under the still-held narrower locks
//!
//! A WAL write failure poisons the instance: further mutations are
//! rejected, reads continue, and [`Database::is_poisoned`] reports the flag.

use crate::workers::{self, WorkerHandles};
use chrono::Utc;
use lodestone_concurrency::{LockManager, LockSession, ResourceKind};
use lodestone_core::types::validate_library_name;
use lodestone_core::{
    Chunk, ChunkId, DistanceMetric, DocumentId, Error, Filter, IndexParams, Library, LibraryId,
    LibraryPatch, MetadataMap, MetadataPatch, Result,
};
use lodestone_durability::{recover, SnapshotWriter, WalOp, WalWriter, DEFAULT_SEGMENT_MAX_BYTES};
use lodestone_executor::{effective_multiplier, multi_search, search_library, MultiSearchHit, SearchHit};
use lodestone_index::REBUILD_TOMBSTONE_RATIO;
use lodestone_store::{ChunkPage, LibraryInfo, LibraryPage, LibraryStore, StoreState};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Maximum `k` accepted by search commands.
pub const MAX_K: usize = 1000;

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    /// Root data directory; WAL segments and snapshots live beneath it.
    pub data_dir: PathBuf,
    /// WAL segment rotation threshold in bytes.
    pub wal_segment_max_bytes: u64,
    /// Interval between snapshot checks.
    pub snapshot_interval: Duration,
    /// Total WAL bytes that force a snapshot regardless of the interval.
    pub snapshot_wal_bytes: u64,
    /// Snapshots retained after a successful write.
    pub snapshot_retain: usize,
    /// Deadline applied to every command's lock acquisitions.
    pub op_deadline: Duration,
}

impl DatabaseOptions {
    /// Options with defaults rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        DatabaseOptions {
            data_dir: data_dir.into(),
            wal_segment_max_bytes: DEFAULT_SEGMENT_MAX_BYTES,
            snapshot_interval: Duration::from_secs(60),
            snapshot_wal_bytes: 256 * 1024 * 1024,
            snapshot_retain: 5,
            op_deadline: Duration::from_secs(5),
        }
    }

    /// Override the WAL segment rotation threshold.
    pub fn with_wal_segment_max_bytes(mut self, bytes: u64) -> Self {
        self.wal_segment_max_bytes = bytes;
        self
    }

    /// Override the snapshot check interval.
    pub fn with_snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = interval;
        self
    }

    /// Override the WAL-size snapshot trigger.
    pub fn with_snapshot_wal_bytes(mut self, bytes: u64) -> Self {
        self.snapshot_wal_bytes = bytes;
        self
    }

    /// Override the per-command lock deadline.
    pub fn with_op_deadline(mut self, deadline: Duration) -> Self {
        self.op_deadline = deadline;
        self
    }

    fn wal_dir(&self) -> PathBuf {
        self.data_dir.join("wal")
    }

    fn snapshot_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }
}

/// Input for a chunk insertion.
#[derive(Debug, Clone, Default)]
pub struct NewChunk {
    /// UTF-8 text content.
    pub content: String,
    /// Embedding vector; length must equal the library dimension.
    pub embedding: Vec<f32>,
    /// Optional document grouping.
    pub document_id: Option<DocumentId>,
    /// Position ordinal within the document.
    pub position: u32,
    /// Free-form metadata.
    pub metadata: MetadataMap,
}

impl NewChunk {
    fn into_chunk(self, library_id: LibraryId) -> Chunk {
        let now = Utc::now();
        Chunk {
            id: ChunkId::new(),
            library_id,
            content: self.content,
            embedding: self.embedding,
            document_id: self.document_id,
            position: self.position,
            metadata: self.metadata,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Aggregate counters for diagnostics.
#[derive(Debug, Clone)]
pub struct DatabaseStats {
    /// Number of libraries.
    pub library_count: usize,
    /// Total chunks across libraries.
    pub chunk_count: usize,
    /// Highest WAL sequence applied to memory.
    pub last_applied_seq: u64,
    /// Whether a fatal error has poisoned the instance.
    pub poisoned: bool,
}

/// Shared state between the command surface and the background workers.
pub(crate) struct Shared {
    pub(crate) store: LibraryStore,
    pub(crate) locks: LockManager,
    pub(crate) wal: Mutex<WalWriter>,
    pub(crate) snapshots: SnapshotWriter,
    pub(crate) options: DatabaseOptions,
    pub(crate) poisoned: AtomicBool,
    /// Highest sequence whose effect is visible in memory.
    pub(crate) last_applied: AtomicU64,
    /// Sequence covered by the most recent snapshot.
    pub(crate) last_snapshot: AtomicU64,
}

impl Shared {
    pub(crate) fn deadline(&self) -> Instant {
        Instant::now() + self.options.op_deadline
    }

    pub(crate) fn mark_applied(&self, seq: u64) {
        self.last_applied.fetch_max(seq, Ordering::SeqCst);
    }
}

/// The embedded vector database.
///
/// `Database` is the single entry point: open it once, share it across
/// threads, close it last.
pub struct Database {
    shared: Arc<Shared>,
    workers: Mutex<Option<WorkerHandles>>,
}

const STORE_ID: Uuid = Uuid::nil();

impl Database {
    /// Open a database, running crash recovery and starting the background
    /// snapshotter and rebuild workers.
    pub fn open(options: DatabaseOptions) -> Result<Self> {
        let wal_dir = options.wal_dir();
        let snapshot_dir = options.snapshot_dir();

        let recovery = recover::<StoreState>(&wal_dir, &snapshot_dir)?;
        let store = match recovery.snapshot_state {
            Some(state) => LibraryStore::from_state(state)?,
            None => LibraryStore::new(),
        };
        for record in &recovery.records {
            store.apply_op(&record.op).map_err(|e| {
                Error::internal(format!(
                    "replay failed at seq {}: {}",
                    record.seq, e
                ))
            })?;
        }
        let next_seq = recovery.next_seq;
        let wal = WalWriter::open(&wal_dir, options.wal_segment_max_bytes, next_seq)?;
        let snapshots = SnapshotWriter::new(&snapshot_dir, options.snapshot_retain)?;

        let shared = Arc::new(Shared {
            store,
            locks: LockManager::new(),
            wal: Mutex::new(wal),
            snapshots,
            poisoned: AtomicBool::new(false),
            last_applied: AtomicU64::new(next_seq.saturating_sub(1)),
            last_snapshot: AtomicU64::new(recovery.snapshot_seq),
            options,
        });
        let workers = workers::spawn(Arc::clone(&shared));

        info!(
            libraries = shared.store.len(),
            next_seq,
            "database open"
        );
        Ok(Database {
            shared,
            workers: Mutex::new(Some(workers)),
        })
    }

    /// Stop background workers, take a final snapshot, and release files.
    pub fn close(&self) -> Result<()> {
        if let Some(handles) = self.workers.lock().take() {
            handles.shutdown();
        }
        if !self.is_poisoned() && !self.shared.store.is_empty() {
            if let Err(err) = workers::take_snapshot(&self.shared) {
                warn!(%err, "final snapshot failed, WAL retains full history");
            }
        }
        info!("database closed");
        Ok(())
    }

    /// Whether a fatal error has poisoned the instance. Poisoned databases
    /// reject mutations but keep serving reads.
    pub fn is_poisoned(&self) -> bool {
        self.shared.poisoned.load(Ordering::SeqCst)
    }

    /// Aggregate counters.
    pub fn stats(&self) -> Result<DatabaseStats> {
        let mut session = self.session();
        session.read(ResourceKind::Store, STORE_ID)?;
        let mut chunk_count = 0;
        for id in self.shared.store.library_ids() {
            chunk_count += self.shared.store.get_library(id)?.chunk_count;
        }
        Ok(DatabaseStats {
            library_count: self.shared.store.len(),
            chunk_count,
            last_applied_seq: self.shared.last_applied.load(Ordering::SeqCst),
            poisoned: self.is_poisoned(),
        })
    }

    /// Force a snapshot now; returns the covered sequence.
    pub fn snapshot_now(&self) -> Result<u64> {
        workers::take_snapshot(&self.shared)
    }

    // ========================================================================
    // Library commands
    // ========================================================================

    /// Create a library. WAL-logged.
    pub fn create_library(
        &self,
        name: impl Into<String>,
        dimension: usize,
        metric: DistanceMetric,
        params: IndexParams,
        metadata: MetadataMap,
    ) -> Result<LibraryInfo> {
        self.check_poisoned()?;
        let library = Library::new(name, dimension, metric, params, metadata)?;

        // Uniqueness is checked and the name claimed under the STORE write
        // lock; the fsync happens after it is released.
        {
            let mut session = self.session();
            session.write(ResourceKind::Store, STORE_ID)?;
            self.shared.store.reserve_name(&library.name)?;
        }

        let op = WalOp::CreateLibrary {
            library: library.clone(),
        };
        let seq = match self.append(&op) {
            Ok(seq) => seq,
            Err(err) => {
                self.shared.store.cancel_reservation(&library.name);
                return Err(err);
            }
        };

        let name = library.name.clone();
        let id = library.id;
        match self.apply_under_store_write(seq, || self.shared.store.apply_create_library(library))
        {
            Ok(()) => self.shared.store.get_library(id),
            Err(err) => {
                self.shared.store.cancel_reservation(&name);
                Err(err)
            }
        }
    }

    /// Fetch a library with derived counters.
    pub fn get_library(&self, id: LibraryId) -> Result<LibraryInfo> {
        let mut session = self.session();
        session.read(ResourceKind::Store, STORE_ID)?;
        session.read(ResourceKind::Library, id.as_uuid())?;
        self.shared.store.get_library(id)
    }

    /// List libraries ordered by name. The cursor is the previous page's
    /// `next_cursor`.
    pub fn list_libraries(&self, cursor: Option<&str>, limit: usize) -> Result<LibraryPage> {
        if limit == 0 {
            return Err(Error::invalid_argument("limit must be positive"));
        }
        let mut session = self.session();
        session.read(ResourceKind::Store, STORE_ID)?;
        Ok(self.shared.store.list_libraries(cursor, limit))
    }

    /// Rename a library or patch its description and metadata. WAL-logged.
    pub fn update_library(&self, id: LibraryId, patch: LibraryPatch) -> Result<Library> {
        self.check_poisoned()?;
        if patch.is_empty() {
            return Err(Error::invalid_argument("empty library patch"));
        }
        if let Some(name) = &patch.name {
            validate_library_name(name)?;
        }

        let mut session = self.session();
        let mut reserved: Option<String> = None;
        if patch.name.is_some() {
            session.write(ResourceKind::Store, STORE_ID)?;
        } else {
            session.read(ResourceKind::Store, STORE_ID)?;
        }
        session.write(ResourceKind::Library, id.as_uuid())?;

        let current = self.shared.store.get_library(id)?;
        if let Some(new_name) = &patch.name {
            if *new_name != current.library.name {
                self.shared.store.reserve_name(new_name)?;
                reserved = Some(new_name.clone());
            }
        }
        session.release(ResourceKind::Store, STORE_ID);

        let updated_at = Utc::now();
        let op = WalOp::UpdateLibrary {
            library_id: id,
            patch: patch.clone(),
            updated_at,
        };
        let result = self
            .append(&op)
            .and_then(|seq| {
                let library = self.shared.store.apply_update_library(id, &patch, updated_at)?;
                self.shared.mark_applied(seq);
                Ok(library)
            });
        if result.is_err() {
            if let Some(name) = reserved {
                self.shared.store.cancel_reservation(&name);
            }
        }
        result
    }

    /// Delete a library, cascading to its chunks and index. WAL-logged.
    pub fn delete_library(&self, id: LibraryId) -> Result<()> {
        self.check_poisoned()?;
        let mut session = self.session();
        session.write(ResourceKind::Store, STORE_ID)?;
        session.write(ResourceKind::Library, id.as_uuid())?;
        session.write(ResourceKind::Index, id.as_uuid())?;
        self.shared.store.resolve(id)?;
        session.release(ResourceKind::Store, STORE_ID);

        let seq = self.append(&WalOp::DeleteLibrary { library_id: id })?;
        self.shared.store.apply_delete_library(id)?;
        self.shared.mark_applied(seq);
        Ok(())
    }

    /// Rebuild a library's index in place. Readers keep searching the old
    /// index until the swap.
    pub fn rebuild_index(&self, id: LibraryId) -> Result<usize> {
        let mut session = self.session();
        session.read(ResourceKind::Store, STORE_ID)?;
        session.read(ResourceKind::Library, id.as_uuid())?;
        session.release(ResourceKind::Store, STORE_ID);

        let fresh = self.shared.store.build_fresh_index(id)?;
        session.write(ResourceKind::Index, id.as_uuid())?;
        self.shared.store.swap_index(id, fresh)
    }

    // ========================================================================
    // Chunk commands
    // ========================================================================

    /// Insert one chunk. WAL-logged.
    pub fn insert_chunk(&self, library_id: LibraryId, source: NewChunk) -> Result<ChunkId> {
        self.check_poisoned()?;
        let mut session = self.session();
        session.read(ResourceKind::Store, STORE_ID)?;
        session.write(ResourceKind::Library, library_id.as_uuid())?;
        session.write(ResourceKind::Index, library_id.as_uuid())?;
        let dimension = self.shared.store.resolve(library_id)?.read().library.dimension;
        session.release(ResourceKind::Store, STORE_ID);

        let chunk = source.into_chunk(library_id);
        chunk.validate(dimension)?;
        let chunk_id = chunk.id;

        let seq = self.append(&WalOp::InsertChunk {
            chunk: chunk.clone(),
        })?;
        self.shared.store.apply_insert_chunk(chunk)?;
        self.shared.mark_applied(seq);
        Ok(chunk_id)
    }

    /// Insert a batch of chunks atomically: one WAL record, all-or-nothing.
    /// A validation failure names the offending item's position.
    pub fn insert_chunks_bulk(
        &self,
        library_id: LibraryId,
        sources: Vec<NewChunk>,
    ) -> Result<Vec<ChunkId>> {
        self.check_poisoned()?;
        if sources.is_empty() {
            return Err(Error::invalid_argument("empty chunk batch"));
        }
        let mut session = self.session();
        session.read(ResourceKind::Store, STORE_ID)?;
        session.write(ResourceKind::Library, library_id.as_uuid())?;
        session.write(ResourceKind::Index, library_id.as_uuid())?;
        let dimension = self.shared.store.resolve(library_id)?.read().library.dimension;
        session.release(ResourceKind::Store, STORE_ID);

        let chunks: Vec<Chunk> = sources
            .into_iter()
            .map(|source| source.into_chunk(library_id))
            .collect();
        for (position, chunk) in chunks.iter().enumerate() {
            chunk.validate(dimension).map_err(|e| {
                Error::invalid_argument(format!("batch item {}: {}", position, e))
            })?;
        }
        let chunk_ids: Vec<ChunkId> = chunks.iter().map(|c| c.id).collect();

        let seq = self.append(&WalOp::InsertChunkBatch {
            library_id,
            chunks: chunks.clone(),
        })?;
        self.shared.store.apply_insert_chunk_batch(library_id, chunks)?;
        self.shared.mark_applied(seq);
        Ok(chunk_ids)
    }

    /// Fetch one chunk.
    pub fn get_chunk(&self, id: ChunkId) -> Result<Chunk> {
        let mut session = self.session();
        session.read(ResourceKind::Store, STORE_ID)?;
        let library_id = self.shared.store.locate_chunk(id)?;
        session.read(ResourceKind::Library, library_id.as_uuid())?;
        session.read(ResourceKind::Chunk, id.as_uuid())?;
        self.shared.store.get_chunk(id)
    }

    /// List a library's chunks in id order.
    pub fn list_chunks(
        &self,
        library_id: LibraryId,
        cursor: Option<ChunkId>,
        limit: usize,
    ) -> Result<ChunkPage> {
        if limit == 0 {
            return Err(Error::invalid_argument("limit must be positive"));
        }
        let mut session = self.session();
        session.read(ResourceKind::Store, STORE_ID)?;
        session.read(ResourceKind::Library, library_id.as_uuid())?;
        self.shared.store.list_chunks(library_id, cursor, limit)
    }

    /// Patch a chunk's metadata. The embedding is immutable; replacing it
    /// means delete and re-insert. WAL-logged.
    pub fn update_chunk_metadata(&self, id: ChunkId, patch: MetadataPatch) -> Result<Chunk> {
        self.check_poisoned()?;
        if patch.is_empty() {
            return Err(Error::invalid_argument("empty metadata patch"));
        }
        let mut session = self.session();
        session.read(ResourceKind::Store, STORE_ID)?;
        let library_id = self.shared.store.locate_chunk(id)?;
        session.write(ResourceKind::Library, library_id.as_uuid())?;
        session.write(ResourceKind::Chunk, id.as_uuid())?;
        // Re-check under the library lock; a concurrent delete may have won.
        self.shared.store.get_chunk(id)?;
        session.release(ResourceKind::Store, STORE_ID);

        let updated_at = Utc::now();
        let seq = self.append(&WalOp::UpdateChunkMetadata {
            chunk_id: id,
            patch: patch.clone(),
            updated_at,
        })?;
        let chunk = self
            .shared
            .store
            .apply_update_chunk_metadata(id, &patch, updated_at)?;
        self.shared.mark_applied(seq);
        Ok(chunk)
    }

    /// Delete a chunk. WAL-logged. Crossing the tombstone threshold
    /// schedules a background index rebuild.
    pub fn delete_chunk(&self, id: ChunkId) -> Result<()> {
        self.check_poisoned()?;
        let mut session = self.session();
        session.read(ResourceKind::Store, STORE_ID)?;
        let library_id = self.shared.store.locate_chunk(id)?;
        session.write(ResourceKind::Library, library_id.as_uuid())?;
        session.write(ResourceKind::Chunk, id.as_uuid())?;
        session.write(ResourceKind::Index, library_id.as_uuid())?;
        self.shared.store.get_chunk(id)?;
        session.release(ResourceKind::Store, STORE_ID);

        let seq = self.append(&WalOp::DeleteChunk { chunk_id: id })?;
        let ratio = self.shared.store.apply_delete_chunk(id)?;
        self.shared.mark_applied(seq);
        drop(session);

        if ratio > REBUILD_TOMBSTONE_RATIO {
            self.schedule_rebuild(library_id);
        }
        Ok(())
    }

    // ========================================================================
    // Search commands
    // ========================================================================

    /// k-nearest-neighbor search with optional metadata filtering.
    ///
    /// `multiplier` widens the index candidate pool for post-filtering;
    /// when absent it defaults to 4 with a filter and 1 without.
    pub fn search(
        &self,
        library_id: LibraryId,
        query: &[f32],
        k: usize,
        filter: Option<Filter>,
        multiplier: Option<usize>,
    ) -> Result<Vec<SearchHit>> {
        validate_k(k)?;
        let mut session = self.session();
        session.read(ResourceKind::Store, STORE_ID)?;
        session.read(ResourceKind::Library, library_id.as_uuid())?;
        session.read(ResourceKind::Index, library_id.as_uuid())?;
        let entry = self.shared.store.resolve(library_id)?;
        session.release(ResourceKind::Store, STORE_ID);

        let guard = entry.read();
        search_library(
            &guard,
            query,
            k,
            filter.as_ref(),
            effective_multiplier(multiplier, filter.is_some()),
        )
    }

    /// Search several libraries and merge results by distance.
    ///
    /// All libraries must share the query dimension and one distance
    /// metric; otherwise the search fails with `HeterogeneousLibraries`.
    pub fn multi_search(
        &self,
        library_ids: &[LibraryId],
        query: &[f32],
        k: usize,
        filter: Option<Filter>,
    ) -> Result<Vec<MultiSearchHit>> {
        validate_k(k)?;
        if library_ids.is_empty() {
            return Err(Error::invalid_argument("no libraries given"));
        }
        let mut ids: Vec<LibraryId> = library_ids.to_vec();
        ids.sort();
        ids.dedup();

        let mut session = self.session();
        session.read(ResourceKind::Store, STORE_ID)?;
        for id in &ids {
            session.read(ResourceKind::Library, id.as_uuid())?;
        }
        for id in &ids {
            session.read(ResourceKind::Index, id.as_uuid())?;
        }
        let cells: Vec<_> = ids
            .iter()
            .map(|id| self.shared.store.resolve(*id))
            .collect::<Result<_>>()?;
        session.release(ResourceKind::Store, STORE_ID);

        let guards: Vec<_> = cells.iter().map(|cell| cell.read()).collect();
        let entries: Vec<_> = ids
            .iter()
            .zip(guards.iter())
            .map(|(id, guard)| (*id, &**guard))
            .collect();
        let has_filter = filter.is_some();
        multi_search(
            &entries,
            query,
            k,
            filter.as_ref(),
            effective_multiplier(None, has_filter),
        )
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn session(&self) -> LockSession<'_> {
        self.shared.locks.session(self.shared.deadline())
    }

    fn check_poisoned(&self) -> Result<()> {
        if self.is_poisoned() {
            return Err(Error::internal(
                "instance poisoned by an earlier fatal error; mutations are disabled",
            ));
        }
        Ok(())
    }

    /// Append one record and fsync. Failure here is fatal: the instance is
    /// poisoned and the operation aborts with no in-memory effect.
    fn append(&self, op: &WalOp) -> Result<u64> {
        let mut wal = self.shared.wal.lock();
        wal.append(op).map_err(|err| {
            self.shared.poisoned.store(true, Ordering::SeqCst);
            error!(%err, "WAL append failed, poisoning instance");
            Error::internal(format!("WAL append failed: {}", err))
        })
    }

    /// Apply a durable operation under a fresh STORE write lock.
    ///
    /// Used by operations whose record was fsynced after their STORE guard
    /// was released. The record is already durable, so the apply must not
    /// be abandoned on a lock timeout; contention here is bounded (readers
    /// and the snapshotter only).
    fn apply_under_store_write<T>(&self, seq: u64, apply: impl FnOnce() -> Result<T>) -> Result<T> {
        loop {
            let mut session = self.shared.locks.session(self.shared.deadline());
            match session.write(ResourceKind::Store, STORE_ID) {
                Ok(()) => {
                    let result = apply();
                    self.shared.mark_applied(seq);
                    return result;
                }
                Err(lodestone_concurrency::LockError::Timeout) => {
                    warn!(seq, "retrying apply of durable record after lock timeout");
                    continue;
                }
                Err(err) => {
                    self.shared.poisoned.store(true, Ordering::SeqCst);
                    error!(seq, %err, "cannot apply durable record, poisoning instance");
                    return Err(err.into());
                }
            }
        }
    }

    fn schedule_rebuild(&self, library_id: LibraryId) {
        if let Some(handles) = self.workers.lock().as_ref() {
            handles.request_rebuild(library_id);
        }
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Some(handles) = self.workers.lock().take() {
            handles.shutdown();
        }
    }
}

fn validate_k(k: usize) -> Result<()> {
    if k == 0 || k > MAX_K {
        return Err(Error::invalid_argument(format!(
            "k must be in 1..={}, got {}",
            MAX_K, k
        )));
    }
    Ok(())
}
