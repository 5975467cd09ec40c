use std::path::PathBuf;

use thiserror::Error;

/// Errors from transactional directory operations.
#[derive(Debug, Error)]
pub enum TxError {
    /// The path does not exist in the state visible to the caller.
    #[error("path not found: {}", .0.display())]
    NotFound(PathBuf),

    /// A transaction committed after our snapshot touched the same path.
    #[error("commit conflict on {}: modified by a concurrent transaction", path.display())]
    CommitConflict { path: PathBuf },

    /// A mutating operation was attempted outside a transaction.
    #[error("no active transaction")]
    NoActiveTransaction,

    /// The handle does not name a live frame of this session, or names an
    /// outer frame while a nested one is still open.
    #[error("invalid transaction handle: {0}")]
    InvalidHandle(String),

    #[error("invalid path {}: {reason}", path.display())]
    InvalidPath { path: PathBuf, reason: &'static str },

    /// A commit was journaled but could not be applied. The journal stays
    /// behind and the commit is finished by the first later operation that
    /// manages to apply it; until then every operation fails.
    #[error("commit {seq} is journaled but not applied: {reason}")]
    Incomplete { seq: u64, reason: String },

    /// The content a snapshot should see was dropped, which happens only if
    /// its pin file was removed from under it.
    #[error("{} is no longer available at snapshot {snapshot}", path.display())]
    SnapshotExpired { path: PathBuf, snapshot: u64 },

    /// The commit journal or version log could not be written or decoded.
    #[error("journal error: {0}")]
    Journal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for transactional directory operations.
pub type TxResult<T> = Result<T, TxError>;
