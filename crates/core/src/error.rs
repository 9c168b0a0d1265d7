//! Canonical error taxonomy
//!
//! Every error surfaced to callers maps to one of the canonical codes below.
//! The codes are frozen; internal layers may carry richer errors but the
//! command surface translates them here.
//!
//! | Code | Kind | Retry |
//! |------|------|-------|
//! | NotFound | validation | no |
//! | AlreadyExists | conflict | no |
//! | DimensionMismatch | validation | no |
//! | InvalidArgument | validation | no |
//! | Conflict | conflict | no |
//! | LockTimeout | resource | yes |
//! | LockOrder | programming error | no |
//! | LockUpgrade | programming error | no |
//! | HeterogeneousLibraries | validation | no |
//! | Cancelled | resource | yes |
//! | Internal | fatal or bug | no |

use thiserror::Error;

/// Result alias using the canonical error.
pub type Result<T> = std::result::Result<T, Error>;

/// The canonical lodestone error.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The named entity does not exist.
    #[error("{resource} not found: {id}")]
    NotFound {
        /// Entity kind ("library", "chunk", ...).
        resource: &'static str,
        /// Identifier that failed to resolve.
        id: String,
    },

    /// An entity with the same unique key already exists.
    #[error("{resource} already exists: {name}")]
    AlreadyExists {
        /// Entity kind.
        resource: &'static str,
        /// The clashing key.
        name: String,
    },

    /// A vector's length does not match the library dimension.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Library dimension.
        expected: usize,
        /// Offending vector length.
        actual: usize,
    },

    /// Input failed validation.
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong.
        reason: String,
    },

    /// The operation conflicts with concurrent or existing state.
    #[error("conflict: {reason}")]
    Conflict {
        /// What clashed.
        reason: String,
    },

    /// A lock could not be acquired before the deadline.
    #[error("lock acquisition timed out")]
    LockTimeout,

    /// Locks were requested outside the hierarchy order.
    #[error("lock order violation: {reason}")]
    LockOrder {
        /// The violated ordering.
        reason: String,
    },

    /// A task tried to re-acquire a lock it already holds.
    #[error("lock upgrade is not supported")]
    LockUpgrade,

    /// Multi-library search over incompatible libraries.
    #[error("heterogeneous libraries: {reason}")]
    HeterogeneousLibraries {
        /// The mismatching property.
        reason: String,
    },

    /// The operation was cancelled before completion.
    #[error("operation cancelled")]
    Cancelled,

    /// A bug, I/O failure, or corrupted state.
    #[error("internal error: {reason}")]
    Internal {
        /// Diagnostic detail.
        reason: String,
    },
}

impl Error {
    /// The canonical code string for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "NotFound",
            Error::AlreadyExists { .. } => "AlreadyExists",
            Error::DimensionMismatch { .. } => "DimensionMismatch",
            Error::InvalidArgument { .. } => "InvalidArgument",
            Error::Conflict { .. } => "Conflict",
            Error::LockTimeout => "LockTimeout",
            Error::LockOrder { .. } => "LockOrder",
            Error::LockUpgrade => "LockUpgrade",
            Error::HeterogeneousLibraries { .. } => "HeterogeneousLibraries",
            Error::Cancelled => "Cancelled",
            Error::Internal { .. } => "Internal",
        }
    }

    /// Whether a caller may safely retry the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::LockTimeout | Error::Cancelled)
    }

    /// Construct an `InvalidArgument` error.
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Error::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Construct an `Internal` error.
    pub fn internal(reason: impl Into<String>) -> Self {
        Error::Internal {
            reason: reason.into(),
        }
    }

    /// `NotFound` for a library id.
    pub fn library_not_found(id: impl ToString) -> Self {
        Error::NotFound {
            resource: "library",
            id: id.to_string(),
        }
    }

    /// `NotFound` for a chunk id.
    pub fn chunk_not_found(id: impl ToString) -> Self {
        Error::NotFound {
            resource: "chunk",
            id: id.to_string(),
        }
    }
}
