//! Segmented write-ahead log
//!
//! The log is a directory of append-only segment files named
//! `wal-<index>.log`, each starting with an 8-byte magic header followed by
//! records in the [`crate::record`] format. A new segment opens when the
//! current one exceeds the configured size.
//!
//! `append` returns only after the record's bytes are written and fsynced;
//! the caller mutates in-memory state afterwards. The writer itself is not
//! synchronized; the durability coordinator serializes appends behind one
//! mutex, which also makes sequence allocation and file order agree.

use crate::error::DurabilityError;
use crate::record::{now_nanos, WalOp, WalRecord};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Segment file magic, first 8 bytes of every segment.
pub const SEGMENT_MAGIC: &[u8; 8] = b"LODEWAL1";

/// Default segment rotation threshold (64 MiB).
pub const DEFAULT_SEGMENT_MAX_BYTES: u64 = 64 * 1024 * 1024;

fn segment_path(dir: &Path, index: u64) -> PathBuf {
    dir.join(format!("wal-{:08}.log", index))
}

fn parse_segment_index(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let index = name.strip_prefix("wal-")?.strip_suffix(".log")?;
    index.parse().ok()
}

/// Sorted list of `(index, path)` for all segments in a directory.
fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>, DurabilityError> {
    let mut segments = Vec::new();
    if !dir.exists() {
        return Ok(segments);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(index) = parse_segment_index(&path) {
            segments.push((index, path));
        }
    }
    segments.sort();
    Ok(segments)
}

/// Append side of the log.
pub struct WalWriter {
    dir: PathBuf,
    max_segment_bytes: u64,
    file: File,
    segment_index: u64,
    segment_bytes: u64,
    next_seq: u64,
}

impl WalWriter {
    /// Open the log for appending, continuing after the highest existing
    /// segment. `next_seq` comes from recovery (last applied + 1).
    pub fn open(
        dir: impl Into<PathBuf>,
        max_segment_bytes: u64,
        next_seq: u64,
    ) -> Result<Self, DurabilityError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let segments = list_segments(&dir)?;
        let (segment_index, file, segment_bytes) = match segments.last() {
            Some((index, path)) => {
                let mut file = OpenOptions::new().append(true).read(true).open(path)?;
                let len = file.seek(SeekFrom::End(0))?;
                (*index, file, len)
            }
            None => {
                let (file, len) = create_segment(&dir, 1)?;
                (1, file, len)
            }
        };

        info!(
            dir = %dir.display(),
            segment = segment_index,
            next_seq,
            "opened WAL"
        );
        Ok(WalWriter {
            dir,
            max_segment_bytes,
            file,
            segment_index,
            segment_bytes,
            next_seq,
        })
    }

    /// The sequence number the next append will receive.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Total bytes across all segments, for snapshot triggering.
    pub fn total_bytes(&self) -> Result<u64, DurabilityError> {
        let mut total = 0;
        for (_, path) in list_segments(&self.dir)? {
            total += fs::metadata(path)?.len();
        }
        Ok(total)
    }

    /// Append one operation: write, fsync, then advance the sequence.
    ///
    /// The sequence only advances after a successful fsync, so a failed
    /// append leaves no durable record and no gap.
    pub fn append(&mut self, op: &WalOp) -> Result<u64, DurabilityError> {
        let record = WalRecord {
            seq: self.next_seq,
            ts_nanos: now_nanos(),
            op: op.clone(),
        };
        let bytes = record.encode()?;

        if self.segment_bytes + bytes.len() as u64 > self.max_segment_bytes {
            self.rotate()?;
        }

        self.file.write_all(&bytes)?;
        self.file.sync_data()?;

        self.segment_bytes += bytes.len() as u64;
        let seq = self.next_seq;
        self.next_seq += 1;
        Ok(seq)
    }

    fn rotate(&mut self) -> Result<(), DurabilityError> {
        self.file.sync_data()?;
        let next_index = self.segment_index + 1;
        let (file, len) = create_segment(&self.dir, next_index)?;
        debug!(segment = next_index, "rotated WAL segment");
        self.file = file;
        self.segment_index = next_index;
        self.segment_bytes = len;
        Ok(())
    }

    /// Delete segments whose last record sequence is below `snapshot_seq`.
    ///
    /// A segment is removable when the following segment starts at or below
    /// `snapshot_seq`; the active segment is never removed.
    pub fn remove_segments_below(&mut self, snapshot_seq: u64) -> Result<usize, DurabilityError> {
        let segments = list_segments(&self.dir)?;
        let mut first_seqs = Vec::with_capacity(segments.len());
        for (index, path) in &segments {
            first_seqs.push((*index, path.clone(), first_record_seq(path)?));
        }

        let mut removed = 0;
        for window in 0..first_seqs.len().saturating_sub(1) {
            let (index, path, first_seq) = &first_seqs[window];
            if *index == self.segment_index {
                break;
            }
            let next_first = first_seqs[window + 1].2;
            let removable = match (first_seq, next_first) {
                // Empty segment with a successor carries no records.
                (None, _) => true,
                (Some(_), Some(next)) => next <= snapshot_seq,
                (Some(_), None) => false,
            };
            if removable {
                fs::remove_file(path)?;
                removed += 1;
                debug!(segment = index, "removed WAL segment below snapshot");
            } else {
                break;
            }
        }
        if removed > 0 {
            info!(removed, snapshot_seq, "truncated WAL segments");
        }
        Ok(removed)
    }
}

fn create_segment(dir: &Path, index: u64) -> Result<(File, u64), DurabilityError> {
    let path = segment_path(dir, index);
    let mut file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .read(true)
        .open(&path)?;
    file.write_all(SEGMENT_MAGIC)?;
    file.sync_data()?;
    Ok((file, SEGMENT_MAGIC.len() as u64))
}

/// Sequence of the first record in a segment, `None` when it has none.
fn first_record_seq(path: &Path) -> Result<Option<u64>, DurabilityError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut magic = [0u8; 8];
    if reader.read_exact(&mut magic).is_err() || &magic != SEGMENT_MAGIC {
        return Ok(None);
    }
    match WalRecord::decode(&mut reader) {
        Ok(Some(record)) => Ok(Some(record.seq)),
        _ => Ok(None),
    }
}

/// Outcome of a replay scan.
#[derive(Debug)]
pub struct ReplayOutcome {
    /// Records from `from_seq` onward, contiguous, checksum-verified.
    pub records: Vec<WalRecord>,
    /// Sequence the next append must use.
    pub next_seq: u64,
    /// Whether the scan stopped at a torn write, checksum failure or gap.
    pub truncated: bool,
}

/// Read side of the log.
pub struct WalReader;

impl WalReader {
    /// Scan all segments and return records with `seq >= from_seq`.
    ///
    /// Records must be exactly contiguous from `from_seq`; the first
    /// checksum failure, torn record, bad segment header or sequence gap
    /// ends the scan and discards everything after it.
    pub fn replay(dir: &Path, from_seq: u64) -> Result<ReplayOutcome, DurabilityError> {
        let mut records = Vec::new();
        let mut expected = from_seq;
        let mut truncated = false;

        'segments: for (index, path) in list_segments(dir)? {
            let mut reader = BufReader::new(File::open(&path)?);
            let mut magic = [0u8; 8];
            if reader.read_exact(&mut magic).is_err() || &magic != SEGMENT_MAGIC {
                warn!(segment = index, "bad WAL segment header, truncating here");
                truncated = true;
                break;
            }

            loop {
                match WalRecord::decode(&mut reader) {
                    Ok(None) => break,
                    Ok(Some(record)) => {
                        if record.seq < from_seq {
                            // Covered by the snapshot; framing still verified.
                            continue;
                        }
                        if record.seq != expected {
                            warn!(
                                segment = index,
                                found = record.seq,
                                expected,
                                "WAL sequence gap, truncating here"
                            );
                            truncated = true;
                            break 'segments;
                        }
                        expected += 1;
                        records.push(record);
                    }
                    Err(err) => {
                        warn!(segment = index, %err, "torn WAL record, truncating here");
                        truncated = true;
                        break 'segments;
                    }
                }
            }
        }

        Ok(ReplayOutcome {
            records,
            next_seq: expected,
            truncated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodestone_core::ChunkId;
    use tempfile::TempDir;

    fn op(n: u128) -> WalOp {
        WalOp::DeleteChunk {
            chunk_id: ChunkId::from_uuid(uuid::Uuid::from_u128(n)),
        }
    }

    #[test]
    fn test_append_assigns_contiguous_sequences() {
        let dir = TempDir::new().unwrap();
        let mut wal = WalWriter::open(dir.path(), DEFAULT_SEGMENT_MAX_BYTES, 1).unwrap();
        assert_eq!(wal.append(&op(1)).unwrap(), 1);
        assert_eq!(wal.append(&op(2)).unwrap(), 2);
        assert_eq!(wal.append(&op(3)).unwrap(), 3);
        assert_eq!(wal.next_seq(), 4);
    }

    #[test]
    fn test_replay_roundtrip() {
        let dir = TempDir::new().unwrap();
        {
            let mut wal = WalWriter::open(dir.path(), DEFAULT_SEGMENT_MAX_BYTES, 1).unwrap();
            for n in 1..=10 {
                wal.append(&op(n)).unwrap();
            }
        }
        let outcome = WalReader::replay(dir.path(), 1).unwrap();
        assert_eq!(outcome.records.len(), 10);
        assert_eq!(outcome.next_seq, 11);
        assert!(!outcome.truncated);
        assert_eq!(outcome.records[0].seq, 1);
        assert_eq!(outcome.records[9].seq, 10);
    }

    #[test]
    fn test_replay_from_offset_skips_snapshot_prefix() {
        let dir = TempDir::new().unwrap();
        {
            let mut wal = WalWriter::open(dir.path(), DEFAULT_SEGMENT_MAX_BYTES, 1).unwrap();
            for n in 1..=10 {
                wal.append(&op(n)).unwrap();
            }
        }
        let outcome = WalReader::replay(dir.path(), 7).unwrap();
        assert_eq!(outcome.records.len(), 4);
        assert_eq!(outcome.records[0].seq, 7);
        assert_eq!(outcome.next_seq, 11);
    }

    #[test]
    fn test_reopen_continues_sequences() {
        let dir = TempDir::new().unwrap();
        {
            let mut wal = WalWriter::open(dir.path(), DEFAULT_SEGMENT_MAX_BYTES, 1).unwrap();
            wal.append(&op(1)).unwrap();
            wal.append(&op(2)).unwrap();
        }
        {
            let mut wal = WalWriter::open(dir.path(), DEFAULT_SEGMENT_MAX_BYTES, 3).unwrap();
            assert_eq!(wal.append(&op(3)).unwrap(), 3);
        }
        let outcome = WalReader::replay(dir.path(), 1).unwrap();
        assert_eq!(outcome.records.len(), 3);
        assert!(!outcome.truncated);
    }

    #[test]
    fn test_torn_tail_is_discarded() {
        let dir = TempDir::new().unwrap();
        {
            let mut wal = WalWriter::open(dir.path(), DEFAULT_SEGMENT_MAX_BYTES, 1).unwrap();
            for n in 1..=3 {
                wal.append(&op(n)).unwrap();
            }
        }
        // Truncate the tail of the last record, simulating a crash mid-write.
        let (_, path) = list_segments(dir.path()).unwrap().pop().unwrap();
        let len = fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 5).unwrap();

        let outcome = WalReader::replay(dir.path(), 1).unwrap();
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.next_seq, 3);
        assert!(outcome.truncated);
    }

    #[test]
    fn test_corrupt_record_truncates_rest() {
        let dir = TempDir::new().unwrap();
        {
            let mut wal = WalWriter::open(dir.path(), DEFAULT_SEGMENT_MAX_BYTES, 1).unwrap();
            for n in 1..=5 {
                wal.append(&op(n)).unwrap();
            }
        }
        // Flip a byte inside the second record's payload.
        let (_, path) = list_segments(dir.path()).unwrap().pop().unwrap();
        let mut bytes = fs::read(&path).unwrap();
        let first_len = {
            let mut reader = BufReader::new(File::open(&path).unwrap());
            let mut magic = [0u8; 8];
            reader.read_exact(&mut magic).unwrap();
            let start = reader.stream_position().unwrap();
            WalRecord::decode(&mut reader).unwrap().unwrap();
            reader.stream_position().unwrap() - start
        };
        let target = 8 + first_len as usize + crate::record::RECORD_HEADER_LEN + 1;
        bytes[target] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let outcome = WalReader::replay(dir.path(), 1).unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert!(outcome.truncated);
    }

    #[test]
    fn test_segment_rotation() {
        let dir = TempDir::new().unwrap();
        // Tiny segments force rotation every append or two.
        let mut wal = WalWriter::open(dir.path(), 160, 1).unwrap();
        for n in 1..=20 {
            wal.append(&op(n)).unwrap();
        }
        let segments = list_segments(dir.path()).unwrap();
        assert!(segments.len() > 1, "expected rotation, got one segment");

        let outcome = WalReader::replay(dir.path(), 1).unwrap();
        assert_eq!(outcome.records.len(), 20);
        assert!(!outcome.truncated);
    }

    #[test]
    fn test_remove_segments_below_snapshot() {
        let dir = TempDir::new().unwrap();
        let mut wal = WalWriter::open(dir.path(), 160, 1).unwrap();
        for n in 1..=20 {
            wal.append(&op(n)).unwrap();
        }
        let before = list_segments(dir.path()).unwrap().len();
        assert!(before > 2);

        let removed = wal.remove_segments_below(10).unwrap();
        assert!(removed > 0);

        // Everything from sequence 11 on must still replay.
        let outcome = WalReader::replay(dir.path(), 11).unwrap();
        assert_eq!(outcome.records.len(), 10);
        assert_eq!(outcome.next_seq, 21);
        assert!(!outcome.truncated);

        // Appends continue normally after truncation.
        assert_eq!(wal.append(&op(21)).unwrap(), 21);
    }

    #[test]
    fn test_replay_empty_dir() {
        let dir = TempDir::new().unwrap();
        let outcome = WalReader::replay(dir.path(), 1).unwrap();
        assert!(outcome.records.is_empty());
        assert_eq!(outcome.next_seq, 1);
        assert!(!outcome.truncated);
    }
}
