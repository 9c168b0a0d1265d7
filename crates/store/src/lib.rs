//! In-memory library store
//!
//! The store owns every library: its metadata, its chunk table, and its
//! index. It is the source of truth — indexes hold only ids and structure,
//! never chunk text or metadata.
//!
//! The store is pure in-memory state plus apply-functions for durable
//! operations. The command router writes each operation's WAL record first
//! and calls `apply_*` afterwards, and recovery drives the same functions
//! when replaying, so the two paths cannot diverge.
//!
//! Thread safety: maps sit behind `parking_lot` cells held only for map and
//! index access, never across I/O. The ordering protocol (fairness,
//! deadlines, hierarchy) lives in the lock manager above this crate.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod state;
mod store;

pub use state::{ChunkPage, LibraryInfo, LibraryPage, LibraryState, StoreState};
pub use store::{LibraryEntry, LibraryStore};
