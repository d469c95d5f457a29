//! Error types for the lease subsystem.

use crate::types::LeaseKey;

/// All errors that can occur while claiming, checking or persisting leases.
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    /// The lease is held by another holder and has not expired.
    #[error("lease claim denied: {0} is held by another holder")]
    ClaimDenied(LeaseKey),

    /// Extend or revoke attempted by an entity that is not the current holder.
    #[error("invalid holder {holder:?} for lease {key}")]
    InvalidHolder {
        /// The lease that was addressed.
        key: LeaseKey,
        /// The holder named by the caller.
        holder: String,
    },

    /// A token check found the lease not held by the token's holder.
    #[error("lease {key} not held by {holder:?}")]
    NotHeld {
        /// The lease that was checked.
        key: LeaseKey,
        /// The holder the token was bound to.
        holder: String,
    },

    /// A namespace, lease name, holder or duration failed validation.
    #[error("not valid: {0}")]
    NotValid(String),

    /// The requested model or lease does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Lease management is unavailable for the requested model.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// The manager could not reach the store for longer than its staleness window.
    #[error("lease manager degraded: {0}")]
    Degraded(String),

    /// The manager has shut down.
    #[error("lease manager stopped")]
    Stopped,

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// A concurrent writer changed the rows read by a transaction.
    #[error("transaction conflict on {0}")]
    Conflict(String),

    /// The backing store failed.
    #[error("store error: {0}")]
    Store(String),

    /// A stored row could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// A lower-level I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl LeaseError {
    /// Returns true for transient failures that are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LeaseError::Conflict(_) | LeaseError::Store(_))
    }
}

impl From<bincode::Error> for LeaseError {
    fn from(e: bincode::Error) -> Self {
        LeaseError::Codec(e.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LeaseError>;
