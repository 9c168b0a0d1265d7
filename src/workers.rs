//! Background workers
//!
//! Two long-running threads with explicit shutdown:
//! - the snapshotter, which periodically serializes a consistent view of the
//!   store, commits it through `CURRENT`, and truncates covered WAL segments
//! - the rebuild worker, which rebuilds indexes whose tombstone ratio
//!   crossed the threshold
//!
//! Shutdown is signalled by dropping the channel senders; both workers treat
//! a disconnected channel as the stop signal.

use crate::database::Shared;
use crossbeam_channel::{tick, unbounded, Receiver, Sender};
use lodestone_concurrency::ResourceKind;
use lodestone_core::{LibraryId, Result};
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub(crate) struct WorkerHandles {
    shutdown_tx: Option<Sender<()>>,
    rebuild_tx: Sender<LibraryId>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerHandles {
    /// Ask the rebuild worker to rebuild a library's index. Requests are
    /// deduplicated on the worker side.
    pub(crate) fn request_rebuild(&self, library_id: LibraryId) {
        let _ = self.rebuild_tx.send(library_id);
    }

    /// Signal both workers and join them.
    pub(crate) fn shutdown(mut self) {
        self.shutdown_tx.take();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("background worker panicked during shutdown");
            }
        }
        info!("background workers stopped");
    }
}

pub(crate) fn spawn(shared: Arc<Shared>) -> WorkerHandles {
    let (shutdown_tx, shutdown_rx) = unbounded::<()>();
    let (rebuild_tx, rebuild_rx) = unbounded::<LibraryId>();

    let snapshot_shared = Arc::clone(&shared);
    let snapshot_shutdown = shutdown_rx.clone();
    let snapshotter = std::thread::Builder::new()
        .name("lodestone-snapshot".into())
        .spawn(move || snapshot_loop(snapshot_shared, snapshot_shutdown))
        .expect("spawn snapshot worker");

    let rebuilder = std::thread::Builder::new()
        .name("lodestone-rebuild".into())
        .spawn(move || rebuild_loop(shared, shutdown_rx, rebuild_rx))
        .expect("spawn rebuild worker");

    WorkerHandles {
        shutdown_tx: Some(shutdown_tx),
        rebuild_tx,
        handles: vec![snapshotter, rebuilder],
    }
}

fn snapshot_loop(shared: Arc<Shared>, shutdown: Receiver<()>) {
    let interval = shared.options.snapshot_interval;
    let ticker = tick(interval.min(std::time::Duration::from_secs(1)));
    let mut last_run = std::time::Instant::now();
    loop {
        crossbeam_channel::select! {
            recv(shutdown) -> _ => return,
            recv(ticker) -> _ => {
                match snapshot_due(&shared, last_run.elapsed() >= interval) {
                    Ok(true) => {
                        if let Err(err) = take_snapshot(&shared) {
                            warn!(%err, "periodic snapshot failed, previous snapshot intact");
                        }
                        last_run = std::time::Instant::now();
                    }
                    Ok(false) => {}
                    Err(err) => warn!(%err, "snapshot trigger check failed"),
                }
            }
        }
    }
}

/// A snapshot is due when new mutations exist and either the interval has
/// elapsed or the WAL has grown past the size trigger.
fn snapshot_due(shared: &Shared, interval_elapsed: bool) -> Result<bool> {
    let last_applied = shared.last_applied.load(Ordering::SeqCst);
    let last_snapshot = shared.last_snapshot.load(Ordering::SeqCst);
    if last_applied <= last_snapshot {
        return Ok(false);
    }
    if interval_elapsed {
        return Ok(true);
    }
    let wal_bytes = shared.wal.lock().total_bytes()?;
    Ok(wal_bytes >= shared.options.snapshot_wal_bytes)
}

/// Serialize a consistent view, write the snapshot, truncate the WAL.
///
/// The view is captured under the STORE read lock plus every LIBRARY read
/// lock, then all file I/O runs after the locks are released. Operations
/// whose WAL record landed but whose apply is still in flight hold their
/// write locks, so the captured state and `last_applied` agree.
pub(crate) fn take_snapshot(shared: &Shared) -> Result<u64> {
    let (state, snapshot_seq) = {
        let mut session = shared.locks.session(shared.deadline());
        session.read(ResourceKind::Store, Uuid::nil())?;
        let mut ids = shared.store.library_ids();
        ids.sort();
        for id in &ids {
            session.read(ResourceKind::Library, id.as_uuid())?;
        }
        (shared.store.to_state(), shared.last_applied.load(Ordering::SeqCst))
    };

    shared.snapshots.write(snapshot_seq, &state)?;
    shared.last_snapshot.store(snapshot_seq, Ordering::SeqCst);
    shared.wal.lock().remove_segments_below(snapshot_seq)?;
    Ok(snapshot_seq)
}

fn rebuild_loop(shared: Arc<Shared>, shutdown: Receiver<()>, requests: Receiver<LibraryId>) {
    // A burst of deletes queues many requests for one library; drain them
    // into a set so each library is rebuilt once per round.
    let mut pending: HashSet<LibraryId> = HashSet::new();
    loop {
        crossbeam_channel::select! {
            recv(shutdown) -> _ => return,
            recv(requests) -> msg => {
                let Ok(library_id) = msg else { return };
                pending.insert(library_id);
                while let Ok(extra) = requests.try_recv() {
                    pending.insert(extra);
                }
                for id in pending.drain() {
                    rebuild_one(&shared, id);
                }
            }
        }
    }
}

fn rebuild_one(shared: &Shared, library_id: LibraryId) {
    let result = (|| -> Result<usize> {
        let mut session = shared.locks.session(shared.deadline());
        session.read(ResourceKind::Library, library_id.as_uuid())?;
        let fresh = shared.store.build_fresh_index(library_id)?;
        session.write(ResourceKind::Index, library_id.as_uuid())?;
        shared.store.swap_index(library_id, fresh)
    })();
    match result {
        Ok(len) => debug!(library = %library_id, vectors = len, "background rebuild complete"),
        // The library may have been deleted since the request was queued.
        Err(err) => debug!(library = %library_id, %err, "background rebuild skipped"),
    }
}
