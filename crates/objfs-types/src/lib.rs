//! Foundation types for objfs.
//!
//! The store crate builds on these types; the transactional directory does not
//! need them.
//!
//! # Key Types
//!
//! - [`EntryId`]: opaque, caller-assigned entry identifier (also the file name)
//! - [`Record`]: what the store needs to know about a persisted entry
//! - [`Entry`]: general-purpose record with an opaque byte payload

pub mod entry;
pub mod error;
pub mod id;

pub use entry::{Entry, Record};
pub use error::TypeError;
pub use id::{EntryId, MAX_ID_LEN};
