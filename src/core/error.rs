//! Error types for the meta KV engine.
//!
//! Client-facing validation errors are returned locally without a proposal.
//! Errors discovered at apply time travel back through the per-command
//! outcome to the proposing leader. Only `Internal` is treated as fatal.

use thiserror::Error;

/// Error conditions of the coordinator KV engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KvError {
    /// Empty key, oversize key/value, mismatched lease, missing required field.
    #[error("invalid argument: {0}")]
    BadArgument(String),

    /// Key unknown where one is required.
    #[error("key not found")]
    KeyNotFound,

    /// Lease id unknown.
    #[error("lease {lease_id} not found")]
    LeaseNotFound { lease_id: i64 },

    /// Lease deadline passed before the operation reached apply.
    #[error("lease {lease_id} expired")]
    LeaseExpired { lease_id: i64 },

    /// Read requested a revision below the compaction floor.
    #[error("revision {revision} has been compacted; compaction floor is {floor}")]
    Compacted { revision: i64, floor: i64 },

    /// The revision counter would leave the 63-bit range.
    #[error("revision space exhausted")]
    RevisionExhausted,

    /// Replication layer rejected the proposal (no leader, timeout).
    #[error("replication unavailable: {0}")]
    Unavailable(String),

    /// Persistence failure during apply; surfaces through replica health.
    #[error("internal error: {0}")]
    Internal(String),
}

impl KvError {
    /// Build a `BadArgument` from anything displayable.
    pub fn bad_argument(message: impl Into<String>) -> Self {
        Self::BadArgument(message.into())
    }

    /// Build an `Internal` from anything displayable.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether a client may retry the operation as-is.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// Whether the error aborts the replica rather than the request.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Internal(_))
    }
}

/// Result type using `KvError`.
pub type KvResult<T> = Result<T, KvError>;
