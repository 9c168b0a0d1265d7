//! Durability errors

use lodestone_core::Error;
use thiserror::Error as ThisError;

/// Errors raised by the WAL, snapshot and recovery layers.
///
/// I/O and encoding failures on the write path are fatal to the instance;
/// the command router performs that classification.
#[derive(Debug, ThisError)]
pub enum DurabilityError {
    /// Underlying file I/O failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A payload could not be serialized.
    #[error("encode error: {0}")]
    Encode(String),

    /// A payload could not be deserialized.
    #[error("decode error: {0}")]
    Decode(String),

    /// A snapshot file failed validation.
    #[error("snapshot corrupt: {reason}")]
    SnapshotCorrupt {
        /// What failed.
        reason: String,
    },

    /// The `CURRENT` pointer file is unreadable or inconsistent.
    #[error("CURRENT pointer corrupt: {reason}")]
    CurrentCorrupt {
        /// What failed.
        reason: String,
    },
}

impl From<DurabilityError> for Error {
    fn from(err: DurabilityError) -> Self {
        Error::internal(err.to_string())
    }
}
