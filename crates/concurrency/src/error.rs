//! Lock errors

use lodestone_core::Error;
use thiserror::Error as ThisError;

/// Errors raised by the locking layer.
#[derive(Debug, Clone, ThisError)]
pub enum LockError {
    /// The deadline passed before the lock was granted.
    #[error("lock acquisition timed out")]
    Timeout,

    /// The calling thread already holds this lock.
    ///
    /// Upgrading read to write while held, and any re-entrant acquisition,
    /// are rejected rather than deadlocking.
    #[error("lock upgrade is not supported")]
    Upgrade,

    /// Locks were requested outside the hierarchy order.
    #[error("lock order violation: {reason}")]
    Order {
        /// The violated ordering.
        reason: String,
    },

    /// The operation's cancel token fired before acquisition.
    #[error("operation cancelled")]
    Cancelled,
}

impl From<LockError> for Error {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Timeout => Error::LockTimeout,
            LockError::Upgrade => Error::LockUpgrade,
            LockError::Order { reason } => Error::LockOrder { reason },
            LockError::Cancelled => Error::Cancelled,
        }
    }
}
