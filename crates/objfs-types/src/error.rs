use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid entry id {id}: {reason}")]
    InvalidId { id: String, reason: &'static str },
}
