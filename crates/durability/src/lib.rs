//! Durability layer for lodestone
//!
//! Write-ahead log plus periodic snapshots, with deterministic replay:
//! - [`record`]: the binary WAL record format and the operation payloads
//! - [`wal`]: segmented append-only writer (fsync before commit) and the
//!   scanning reader that truncates at the first torn record
//! - [`snapshot`]: snapshot files with a `CURRENT` pointer, written
//!   temp-then-rename so a failed snapshot leaves the previous one intact
//! - [`recovery`]: load the latest valid snapshot, replay the WAL tail
//!
//! An operation is committed only after its record's bytes are fully written
//! and fsynced; only then may in-memory state change.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod record;
pub mod recovery;
pub mod snapshot;
pub mod wal;

mod error;

pub use error::DurabilityError;
pub use record::{WalOp, WalRecord};
pub use recovery::{recover, RecoveryResult};
pub use snapshot::{LoadedSnapshot, SnapshotReader, SnapshotWriter};
pub use wal::{ReplayOutcome, WalReader, WalWriter, DEFAULT_SEGMENT_MAX_BYTES};
