//! Crash recovery
//!
//! On startup: read `CURRENT`, load that snapshot, then replay the WAL tail
//! from the snapshot sequence plus one. Replay stops at the first checksum
//! failure, torn record, or sequence gap; everything after is discarded as a
//! torn write. The recovered state equals the state at the last successfully
//! fsynced record, and the next allocated sequence follows it directly.

use crate::error::DurabilityError;
use crate::record::WalRecord;
use crate::snapshot::SnapshotReader;
use crate::wal::WalReader;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::time::Instant;
use tracing::info;

/// Result of a recovery pass.
pub struct RecoveryResult<T> {
    /// State from the snapshot, `None` on a fresh start.
    pub snapshot_state: Option<T>,
    /// Sequence covered by the snapshot, 0 when none.
    pub snapshot_seq: u64,
    /// WAL records to apply on top of the snapshot, in order.
    pub records: Vec<WalRecord>,
    /// Sequence the next mutation must use.
    pub next_seq: u64,
    /// Whether the WAL tail was cut at a torn write.
    pub wal_truncated: bool,
    /// Wall time spent recovering.
    pub elapsed_micros: u64,
}

impl<T> RecoveryResult<T> {
    /// Human-readable one-line summary for startup logs.
    pub fn summary(&self) -> String {
        format!(
            "recovered snapshot seq {} + {} WAL records (next seq {}, truncated: {}) in {:.2}ms",
            self.snapshot_seq,
            self.records.len(),
            self.next_seq,
            self.wal_truncated,
            self.elapsed_micros as f64 / 1000.0
        )
    }
}

/// Run recovery against a WAL directory and a snapshot directory.
pub fn recover<T: DeserializeOwned>(
    wal_dir: &Path,
    snapshot_dir: &Path,
) -> Result<RecoveryResult<T>, DurabilityError> {
    let start = Instant::now();

    let (snapshot_state, snapshot_seq) = match SnapshotReader::load_current::<T>(snapshot_dir)? {
        Some(loaded) => {
            info!(seq = loaded.seq, "loaded snapshot");
            (Some(loaded.state), loaded.seq)
        }
        None => {
            info!("no snapshot, replaying entire WAL");
            (None, 0)
        }
    };

    let outcome = WalReader::replay(wal_dir, snapshot_seq + 1)?;
    let result = RecoveryResult {
        snapshot_state,
        snapshot_seq,
        records: outcome.records,
        next_seq: outcome.next_seq,
        wal_truncated: outcome.truncated,
        elapsed_micros: start.elapsed().as_micros() as u64,
    };
    info!("{}", result.summary());
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::WalOp;
    use crate::snapshot::SnapshotWriter;
    use crate::wal::{WalWriter, DEFAULT_SEGMENT_MAX_BYTES};
    use lodestone_core::ChunkId;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct State {
        applied: u64,
    }

    fn op(n: u128) -> WalOp {
        WalOp::DeleteChunk {
            chunk_id: ChunkId::from_uuid(uuid::Uuid::from_u128(n)),
        }
    }

    #[test]
    fn test_fresh_start() {
        let wal = TempDir::new().unwrap();
        let snaps = TempDir::new().unwrap();
        let result = recover::<State>(wal.path(), snaps.path()).unwrap();
        assert!(result.snapshot_state.is_none());
        assert_eq!(result.snapshot_seq, 0);
        assert!(result.records.is_empty());
        assert_eq!(result.next_seq, 1);
    }

    #[test]
    fn test_wal_only_replay() {
        let wal_dir = TempDir::new().unwrap();
        let snaps = TempDir::new().unwrap();
        {
            let mut wal = WalWriter::open(wal_dir.path(), DEFAULT_SEGMENT_MAX_BYTES, 1).unwrap();
            for n in 1..=4 {
                wal.append(&op(n)).unwrap();
            }
        }
        let result = recover::<State>(wal_dir.path(), snaps.path()).unwrap();
        assert_eq!(result.records.len(), 4);
        assert_eq!(result.next_seq, 5);
    }

    #[test]
    fn test_snapshot_plus_tail() {
        let wal_dir = TempDir::new().unwrap();
        let snaps = TempDir::new().unwrap();
        {
            let mut wal = WalWriter::open(wal_dir.path(), DEFAULT_SEGMENT_MAX_BYTES, 1).unwrap();
            for n in 1..=10 {
                wal.append(&op(n)).unwrap();
            }
        }
        SnapshotWriter::new(snaps.path(), 5)
            .unwrap()
            .write(6, &State { applied: 6 })
            .unwrap();

        let result = recover::<State>(wal_dir.path(), snaps.path()).unwrap();
        assert_eq!(result.snapshot_state.unwrap().applied, 6);
        assert_eq!(result.snapshot_seq, 6);
        assert_eq!(result.records.len(), 4);
        assert_eq!(result.records[0].seq, 7);
        assert_eq!(result.next_seq, 11);
    }

    #[test]
    fn test_torn_tail_reports_truncation() {
        let wal_dir = TempDir::new().unwrap();
        let snaps = TempDir::new().unwrap();
        {
            let mut wal = WalWriter::open(wal_dir.path(), DEFAULT_SEGMENT_MAX_BYTES, 1).unwrap();
            for n in 1..=3 {
                wal.append(&op(n)).unwrap();
            }
        }
        // Chop bytes off the last record.
        let segment = std::fs::read_dir(wal_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .find(|e| e.path().extension().is_some_and(|x| x == "log"))
            .unwrap()
            .path();
        let len = std::fs::metadata(&segment).unwrap().len();
        std::fs::OpenOptions::new()
            .write(true)
            .open(&segment)
            .unwrap()
            .set_len(len - 3)
            .unwrap();

        let result = recover::<State>(wal_dir.path(), snaps.path()).unwrap();
        assert_eq!(result.records.len(), 2);
        assert_eq!(result.next_seq, 3);
        assert!(result.wal_truncated);
    }
}
