//! Concurrency layer for lodestone
//!
//! This crate implements the locking substrate the store and executor run on:
//! - [`FairRwLock`]: fair multiple-reader/single-writer lock with writer
//!   preference, deadline-aware acquisition, and upgrade detection
//! - [`LockManager`]: per-resource locks keyed by `(kind, id)` with
//!   refcounted garbage collection
//! - [`LockSession`]: hierarchical acquisition (`STORE < LIBRARY < DOCUMENT <
//!   CHUNK < INDEX`), reverse-order release, cancellation checks
//!
//! Locks here are protocol objects: they serialize logical operations and
//! carry fairness and deadlines. Memory safety of the maps they guard is the
//! store's concern.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod manager;
pub mod rwlock;

mod error;

pub use error::LockError;
pub use manager::{CancelToken, LockManager, LockMode, LockSession, ResourceKind};
pub use rwlock::{FairRwLock, ReadGuard, WriteGuard};
