//! Snapshot files and the `CURRENT` pointer
//!
//! A snapshot file is, little-endian:
//!
//! ```text
//! u32 magic "VSNP" | u32 version | u64 snapshot_seq | u64 body_len |
//! body (msgpack of the whole store) | u32 crc32c(body)
//! ```
//!
//! Snapshots are written to a temp file, fsynced, then renamed; the
//! `CURRENT` file (two lines: filename, sequence) is replaced the same way
//! and is the commit point. A failure anywhere before that rename leaves the
//! previous snapshot and the full WAL intact.

use crate::error::DurabilityError;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Snapshot file magic, "VSNP".
pub const SNAPSHOT_MAGIC: u32 = 0x5653_4E50;

/// Snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Snapshots retained after a successful write.
pub const DEFAULT_RETAIN_COUNT: usize = 5;

const CURRENT_FILE: &str = "CURRENT";

fn snapshot_filename(seq: u64) -> String {
    format!("snapshot-{:020}.snap", seq)
}

/// Writes snapshots and maintains the `CURRENT` pointer.
pub struct SnapshotWriter {
    dir: PathBuf,
    retain: usize,
}

impl SnapshotWriter {
    /// Create a writer over a snapshot directory.
    pub fn new(dir: impl Into<PathBuf>, retain: usize) -> Result<Self, DurabilityError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(SnapshotWriter { dir, retain })
    }

    /// Write a snapshot of `state` covering sequences up to `snapshot_seq`,
    /// commit it through `CURRENT`, and prune snapshots past the retention
    /// count.
    pub fn write<T: Serialize>(&self, snapshot_seq: u64, state: &T) -> Result<PathBuf, DurabilityError> {
        let body = rmp_serde::to_vec(state).map_err(|e| DurabilityError::Encode(e.to_string()))?;
        let filename = snapshot_filename(snapshot_seq);
        let final_path = self.dir.join(&filename);
        let temp_path = self.dir.join(format!("{}.tmp", filename));

        {
            let mut file = OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&temp_path)?;
            file.write_u32::<LittleEndian>(SNAPSHOT_MAGIC)?;
            file.write_u32::<LittleEndian>(SNAPSHOT_VERSION)?;
            file.write_u64::<LittleEndian>(snapshot_seq)?;
            file.write_u64::<LittleEndian>(body.len() as u64)?;
            file.write_all(&body)?;
            file.write_u32::<LittleEndian>(crc32c::crc32c(&body))?;
            file.sync_all()?;
        }
        fs::rename(&temp_path, &final_path)?;

        self.commit_current(&filename, snapshot_seq)?;
        info!(
            seq = snapshot_seq,
            bytes = body.len(),
            file = %final_path.display(),
            "snapshot written"
        );

        self.prune_old(snapshot_seq)?;
        Ok(final_path)
    }

    /// Atomically replace `CURRENT` with `<filename>\n<seq>\n`.
    fn commit_current(&self, filename: &str, seq: u64) -> Result<(), DurabilityError> {
        let temp = self.dir.join("CURRENT.tmp");
        {
            let mut file = OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&temp)?;
            writeln!(file, "{}", filename)?;
            writeln!(file, "{}", seq)?;
            file.sync_all()?;
        }
        fs::rename(&temp, self.dir.join(CURRENT_FILE))?;
        Ok(())
    }

    /// Delete snapshots older than the newest `retain`, never the current.
    fn prune_old(&self, current_seq: u64) -> Result<(), DurabilityError> {
        let mut snapshots: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension().is_some_and(|ext| ext == "snap")
                    && p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n != snapshot_filename(current_seq))
            })
            .collect();
        snapshots.sort();
        if snapshots.len() + 1 <= self.retain {
            return Ok(());
        }
        let excess = snapshots.len() + 1 - self.retain;
        for path in snapshots.into_iter().take(excess) {
            debug!(file = %path.display(), "pruning old snapshot");
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// Loaded snapshot: covered sequence and deserialized state.
pub struct LoadedSnapshot<T> {
    /// Largest WAL sequence whose effect the snapshot captures.
    pub seq: u64,
    /// The deserialized store state.
    pub state: T,
}

/// Reads the snapshot named by `CURRENT`.
pub struct SnapshotReader;

impl SnapshotReader {
    /// Load the current snapshot, if any.
    ///
    /// Returns `Ok(None)` when no `CURRENT` pointer exists (fresh database).
    /// A pointer naming a missing or invalid snapshot is an error: silently
    /// starting empty would resurrect deleted data once the WAL was
    /// truncated.
    pub fn load_current<T: DeserializeOwned>(
        dir: &Path,
    ) -> Result<Option<LoadedSnapshot<T>>, DurabilityError> {
        let current_path = dir.join(CURRENT_FILE);
        if !current_path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&current_path)?;
        let mut lines = content.lines();
        let filename = lines
            .next()
            .ok_or_else(|| DurabilityError::CurrentCorrupt {
                reason: "missing snapshot filename".into(),
            })?
            .to_string();
        let seq: u64 = lines
            .next()
            .and_then(|line| line.parse().ok())
            .ok_or_else(|| DurabilityError::CurrentCorrupt {
                reason: "missing or invalid snapshot sequence".into(),
            })?;

        let state = Self::load_file(&dir.join(&filename), seq)?;
        Ok(Some(LoadedSnapshot { seq, state }))
    }

    fn load_file<T: DeserializeOwned>(path: &Path, expected_seq: u64) -> Result<T, DurabilityError> {
        let corrupt = |reason: String| DurabilityError::SnapshotCorrupt { reason };

        let mut reader = BufReader::new(File::open(path).map_err(|e| {
            warn!(file = %path.display(), %e, "snapshot named by CURRENT is unreadable");
            DurabilityError::SnapshotCorrupt {
                reason: format!("cannot open {}: {}", path.display(), e),
            }
        })?);

        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != SNAPSHOT_MAGIC {
            return Err(corrupt(format!("bad magic {:#010x}", magic)));
        }
        let version = reader.read_u32::<LittleEndian>()?;
        if version != SNAPSHOT_VERSION {
            return Err(corrupt(format!("unsupported version {}", version)));
        }
        let seq = reader.read_u64::<LittleEndian>()?;
        if seq != expected_seq {
            return Err(corrupt(format!(
                "sequence {} does not match CURRENT ({})",
                seq, expected_seq
            )));
        }
        let body_len = reader.read_u64::<LittleEndian>()? as usize;
        let mut body = vec![0u8; body_len];
        reader
            .read_exact(&mut body)
            .map_err(|_| corrupt("truncated body".into()))?;
        let stored_crc = reader
            .read_u32::<LittleEndian>()
            .map_err(|_| corrupt("truncated checksum".into()))?;
        if crc32c::crc32c(&body) != stored_crc {
            return Err(corrupt("body checksum mismatch".into()));
        }

        rmp_serde::from_slice(&body).map_err(|e| corrupt(format!("body decode: {}", e)))
    }
}
