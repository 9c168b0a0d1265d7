//! WAL record format
//!
//! On disk a record is, little-endian throughout:
//!
//! ```text
//! u64 seq | u64 ts_nanos | u16 op_kind | u32 payload_len | payload | u32 crc32c(payload)
//! ```
//!
//! The payload is the msgpack encoding of a [`WalOp`]. A record is valid iff
//! its CRC matches and its length fits within the segment; anything else is
//! treated as a torn write and truncates the log at that point.
//!
//! Every mutating operation carries the timestamps it assigned, so replay
//! reproduces state byte-for-byte.

use crate::error::DurabilityError;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, Utc};
use lodestone_core::{Chunk, ChunkId, Library, LibraryId, LibraryPatch, MetadataPatch};
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Fixed part of a record preceding the payload.
pub const RECORD_HEADER_LEN: usize = 8 + 8 + 2 + 4;

/// A durable mutating operation.
///
/// Op kinds are frozen wire codes; new operations append, existing codes
/// never change meaning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalOp {
    /// Library creation with its full initial state.
    CreateLibrary {
        /// The created library.
        library: Library,
    },
    /// Library rename / description / metadata update.
    UpdateLibrary {
        /// Target library.
        library_id: LibraryId,
        /// The applied patch.
        patch: LibraryPatch,
        /// Timestamp assigned to `updated_at`.
        updated_at: DateTime<Utc>,
    },
    /// Library deletion, cascading to chunks and index.
    DeleteLibrary {
        /// Target library.
        library_id: LibraryId,
    },
    /// Single chunk insertion.
    InsertChunk {
        /// The inserted chunk.
        chunk: Chunk,
    },
    /// Atomic batch insertion; one record for the whole batch.
    InsertChunkBatch {
        /// Owning library.
        library_id: LibraryId,
        /// The inserted chunks, in order.
        chunks: Vec<Chunk>,
    },
    /// Metadata-only chunk update.
    UpdateChunkMetadata {
        /// Target chunk.
        chunk_id: ChunkId,
        /// The applied patch.
        patch: MetadataPatch,
        /// Timestamp assigned to `updated_at`.
        updated_at: DateTime<Utc>,
    },
    /// Chunk deletion.
    DeleteChunk {
        /// Target chunk.
        chunk_id: ChunkId,
    },
}

impl WalOp {
    /// The wire code for this operation.
    pub fn kind_code(&self) -> u16 {
        match self {
            WalOp::CreateLibrary { .. } => 1,
            WalOp::UpdateLibrary { .. } => 2,
            WalOp::DeleteLibrary { .. } => 3,
            WalOp::InsertChunk { .. } => 4,
            WalOp::InsertChunkBatch { .. } => 5,
            WalOp::UpdateChunkMetadata { .. } => 6,
            WalOp::DeleteChunk { .. } => 7,
        }
    }

    /// The library this operation touches, when directly addressed.
    pub fn library_id(&self) -> Option<LibraryId> {
        match self {
            WalOp::CreateLibrary { library } => Some(library.id),
            WalOp::UpdateLibrary { library_id, .. } => Some(*library_id),
            WalOp::DeleteLibrary { library_id } => Some(*library_id),
            WalOp::InsertChunk { chunk } => Some(chunk.library_id),
            WalOp::InsertChunkBatch { library_id, .. } => Some(*library_id),
            WalOp::UpdateChunkMetadata { .. } | WalOp::DeleteChunk { .. } => None,
        }
    }
}

/// One WAL record: sequence number, timestamp, and operation.
#[derive(Debug, Clone, PartialEq)]
pub struct WalRecord {
    /// Monotonically increasing sequence number, global across libraries.
    pub seq: u64,
    /// Nanoseconds since the Unix epoch at append time.
    pub ts_nanos: u64,
    /// The operation.
    pub op: WalOp,
}

impl WalRecord {
    /// Encode into the on-disk byte layout.
    pub fn encode(&self) -> Result<Vec<u8>, DurabilityError> {
        let payload =
            rmp_serde::to_vec(&self.op).map_err(|e| DurabilityError::Encode(e.to_string()))?;
        let mut buf = Vec::with_capacity(RECORD_HEADER_LEN + payload.len() + 4);
        buf.write_u64::<LittleEndian>(self.seq)?;
        buf.write_u64::<LittleEndian>(self.ts_nanos)?;
        buf.write_u16::<LittleEndian>(self.op.kind_code())?;
        buf.write_u32::<LittleEndian>(payload.len() as u32)?;
        buf.extend_from_slice(&payload);
        buf.write_u32::<LittleEndian>(crc32c::crc32c(&payload))?;
        Ok(buf)
    }

    /// Decode one record from a reader positioned at a record boundary.
    ///
    /// Returns `Ok(None)` at a clean end of input (zero header bytes).
    /// Any short read, CRC mismatch, kind mismatch or payload decode failure
    /// is reported as `Decode`; the caller treats it as a torn write.
    pub fn decode<R: Read>(reader: &mut R) -> Result<Option<WalRecord>, DurabilityError> {
        let mut header = [0u8; RECORD_HEADER_LEN];
        match read_exact_or_eof(reader, &mut header)? {
            ReadOutcome::Eof => return Ok(None),
            ReadOutcome::Short => {
                return Err(DurabilityError::Decode("truncated record header".into()))
            }
            ReadOutcome::Full => {}
        }

        let mut cursor = &header[..];
        let seq = cursor.read_u64::<LittleEndian>()?;
        let ts_nanos = cursor.read_u64::<LittleEndian>()?;
        let kind = cursor.read_u16::<LittleEndian>()?;
        let payload_len = cursor.read_u32::<LittleEndian>()? as usize;

        let mut payload = vec![0u8; payload_len];
        reader
            .read_exact(&mut payload)
            .map_err(|_| DurabilityError::Decode("truncated record payload".into()))?;
        let stored_crc = reader
            .read_u32::<LittleEndian>()
            .map_err(|_| DurabilityError::Decode("truncated record checksum".into()))?;

        if crc32c::crc32c(&payload) != stored_crc {
            return Err(DurabilityError::Decode(format!(
                "checksum mismatch at seq {}",
                seq
            )));
        }
        let op: WalOp = rmp_serde::from_slice(&payload)
            .map_err(|e| DurabilityError::Decode(format!("payload at seq {}: {}", seq, e)))?;
        if op.kind_code() != kind {
            return Err(DurabilityError::Decode(format!(
                "op kind {} does not match payload at seq {}",
                kind, seq
            )));
        }

        Ok(Some(WalRecord { seq, ts_nanos, op }))
    }
}

enum ReadOutcome {
    Full,
    Short,
    Eof,
}

fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<ReadOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            return Ok(if filled == 0 {
                ReadOutcome::Eof
            } else {
                ReadOutcome::Short
            });
        }
        filled += n;
    }
    Ok(ReadOutcome::Full)
}

/// Nanoseconds since the Unix epoch.
pub fn now_nanos() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
