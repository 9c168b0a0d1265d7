//! Hierarchical lock manager
//!
//! The manager keeps one [`FairRwLock`] per `(resource kind, resource id)`
//! pair, created on demand and garbage-collected when no session references
//! it. Operations acquire locks through a [`LockSession`], which enforces the
//! hierarchy order
//!
//! ```text
//! STORE < LIBRARY < DOCUMENT < CHUNK < INDEX
//! ```
//!
//! and releases everything in reverse order when dropped, including on the
//! error path. Acquiring out of order is a programming error and fails with
//! `LockOrder`; equal kinds are permitted only in ascending id order so the
//! global acquisition order stays a strict total order.

use crate::error::LockError;
use crate::rwlock::{FairRwLock, ReadGuard, WriteGuard};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::trace;
use uuid::Uuid;

/// Resource kinds in strict acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    /// The whole library map.
    Store,
    /// One library's metadata and chunk table.
    Library,
    /// One document grouping.
    Document,
    /// One chunk.
    Chunk,
    /// One library's index.
    Index,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResourceKind::Store => "STORE",
            ResourceKind::Library => "LIBRARY",
            ResourceKind::Document => "DOCUMENT",
            ResourceKind::Chunk => "CHUNK",
            ResourceKind::Index => "INDEX",
        };
        write!(f, "{}", name)
    }
}

/// Lock mode requested through a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Shared.
    Read,
    /// Exclusive.
    Write,
}

/// Cooperative cancellation flag checked at suspension points.
///
/// Cancelling does not interrupt an acquisition already blocking on a
/// deadline; it is observed before the next lock is requested.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create an un-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

struct Slot {
    lock: FairRwLock,
    /// Sessions currently referencing this slot (held or acquiring).
    refs: usize,
}

/// Per-resource lock registry with refcounted garbage collection.
#[derive(Default)]
pub struct LockManager {
    slots: Mutex<HashMap<(ResourceKind, Uuid), Slot>>,
}

impl LockManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a session with the given deadline.
    pub fn session(&self, deadline: Instant) -> LockSession<'_> {
        LockSession {
            manager: self,
            deadline,
            cancel: None,
            held: Vec::new(),
        }
    }

    /// Start a session with a deadline and a cancellation token.
    pub fn session_with_cancel(&self, deadline: Instant, cancel: CancelToken) -> LockSession<'_> {
        LockSession {
            manager: self,
            deadline,
            cancel: Some(cancel),
            held: Vec::new(),
        }
    }

    /// Number of live lock slots (diagnostics and GC tests).
    pub fn slot_count(&self) -> usize {
        self.slots.lock().len()
    }

    fn checkout(&self, kind: ResourceKind, id: Uuid) -> FairRwLock {
        let mut slots = self.slots.lock();
        let slot = slots.entry((kind, id)).or_insert_with(|| {
            trace!(%kind, %id, "creating lock slot");
            Slot {
                lock: FairRwLock::new(),
                refs: 0,
            }
        });
        slot.refs += 1;
        slot.lock.clone()
    }

    fn checkin(&self, kind: ResourceKind, id: Uuid) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(&(kind, id)) {
            slot.refs -= 1;
            if slot.refs == 0 {
                slots.remove(&(kind, id));
                trace!(%kind, %id, "collected lock slot");
            }
        }
    }
}

enum Guard {
    Read(#[allow(dead_code)] ReadGuard),
    Write(#[allow(dead_code)] WriteGuard),
}

struct Held {
    kind: ResourceKind,
    id: Uuid,
    guard: Option<Guard>,
}

/// One operation's lock holdings.
///
/// Locks acquired through a session are released in reverse acquisition
/// order when the session drops, whether the operation succeeded or failed.
pub struct LockSession<'m> {
    manager: &'m LockManager,
    deadline: Instant,
    cancel: Option<CancelToken>,
    held: Vec<Held>,
}

impl LockSession<'_> {
    /// Acquire a shared lock on `(kind, id)`.
    pub fn read(&mut self, kind: ResourceKind, id: Uuid) -> Result<(), LockError> {
        self.acquire(kind, id, LockMode::Read)
    }

    /// Acquire an exclusive lock on `(kind, id)`.
    pub fn write(&mut self, kind: ResourceKind, id: Uuid) -> Result<(), LockError> {
        self.acquire(kind, id, LockMode::Write)
    }

    fn acquire(&mut self, kind: ResourceKind, id: Uuid, mode: LockMode) -> Result<(), LockError> {
        if let Some(cancel) = &self.cancel {
            if cancel.is_cancelled() {
                return Err(LockError::Cancelled);
            }
        }
        if let Some(last) = self.held.last() {
            if kind < last.kind {
                return Err(LockError::Order {
                    reason: format!("{} requested while holding {}", kind, last.kind),
                });
            }
            if kind == last.kind && id <= last.id {
                return Err(LockError::Order {
                    reason: format!("{} ids must be acquired in ascending order", kind),
                });
            }
        }

        let lock = self.manager.checkout(kind, id);
        let guard = match mode {
            LockMode::Read => lock.read(self.deadline).map(Guard::Read),
            LockMode::Write => lock.write(self.deadline).map(Guard::Write),
        };
        match guard {
            Ok(guard) => {
                self.held.push(Held {
                    kind,
                    id,
                    guard: Some(guard),
                });
                Ok(())
            }
            Err(err) => {
                self.manager.checkin(kind, id);
                Err(err)
            }
        }
    }

    /// Release one held lock early, keeping the rest.
    ///
    /// Used to drop the broad STORE guard before a WAL fsync while the
    /// narrower LIBRARY and INDEX guards stay held.
    pub fn release(&mut self, kind: ResourceKind, id: Uuid) {
        if let Some(pos) = self
            .held
            .iter()
            .position(|h| h.kind == kind && h.id == id)
        {
            let mut held = self.held.remove(pos);
            held.guard.take();
            self.manager.checkin(held.kind, held.id);
        }
    }

    /// Kinds currently held, in acquisition order (diagnostics).
    pub fn held_kinds(&self) -> Vec<ResourceKind> {
        self.held.iter().map(|h| h.kind).collect()
    }
}

impl Drop for LockSession<'_> {
    fn drop(&mut self) {
        while let Some(mut held) = self.held.pop() {
            held.guard.take();
            self.manager.checkin(held.kind, held.id);
        }
    }
}
