use std::path::PathBuf;

use objfs_txdir::TxError;
use objfs_types::{EntryId, TypeError};

/// Errors from file store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No object file exists for the id in the visible state.
    #[error("entry not found: {0}")]
    NotFound(EntryId),

    /// The codec failed to encode or decode an entry.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A concurrent transaction committed a change to the same path first.
    /// Retry the transaction.
    #[error("commit conflict on {}", path.display())]
    CommitConflict { path: PathBuf },

    /// The root set disagrees with the object files, e.g. a root marker
    /// whose object file is missing.
    #[error("consistency error for {id}: {reason}")]
    Consistency { id: EntryId, reason: String },

    /// An object file decoded to something other than the entry it is
    /// named after.
    #[error("corrupt object {}: {reason}", path.display())]
    CorruptObject { path: PathBuf, reason: String },

    /// A mutating operation was attempted outside a transaction.
    #[error("no active transaction")]
    NoActiveTransaction,

    #[error(transparent)]
    InvalidId(#[from] TypeError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The store directory does not exist and creation was not requested.
    #[error("store directory does not exist: {}", .0.display())]
    MissingStore(PathBuf),

    /// Any other transactional directory failure.
    #[error("transaction error: {0}")]
    Transaction(TxError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TxError> for StoreError {
    fn from(e: TxError) -> Self {
        match e {
            TxError::CommitConflict { path } => Self::CommitConflict { path },
            TxError::NoActiveTransaction => Self::NoActiveTransaction,
            TxError::Io(e) => Self::Io(e),
            other => Self::Transaction(other),
        }
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
