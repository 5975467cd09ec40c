//! Transactional directory for objfs.
//!
//! A [`TxDirectory`] turns a plain directory tree into a store of files with
//! snapshot-isolated, nestable transactions. Callers work through a
//! [`Session`]:
//!
//! ```no_run
//! use std::io::Write;
//! use objfs_txdir::{TxConfig, TxDirectory};
//!
//! # fn main() -> objfs_txdir::TxResult<()> {
//! let dir = TxDirectory::open("/tmp/objfs", TxConfig::default())?;
//! let mut session = dir.session();
//! let tx = session.begin()?;
//! let mut w = session.open_for_write("all/abc")?;
//! w.write_all(b"hello")?;
//! w.finish()?;
//! session.commit(tx)?;
//! # Ok(())
//! # }
//! ```
//!
//! # Guarantees
//!
//! 1. Staged writes are invisible outside the session until the top-level
//!    commit; a nested commit only hands changes to its parent.
//! 2. Rolling back a frame discards it and every frame nested in it.
//! 3. A transaction reads the committed state as of its first `begin`, plus
//!    its own staged changes.
//! 4. Write-write conflicts are detected at commit (first committer wins)
//!    and reported as [`TxError::CommitConflict`], never merged.
//! 5. A commit is journaled before it touches the tree; an interrupted
//!    commit is finished before the directory is used again.
//!
//! All of this holds across handles: every [`TxDirectory`] opened on the
//! same root, in one process or several, shares one lock file and one
//! commit log under `<root>/.txn/`.
//!
//! # Layout
//!
//! ```text
//! <root>/...                 committed files
//! <root>/.txn/               locks, journal, commit log, staging areas
//! ```

pub mod config;
pub mod directory;
pub mod error;
pub mod journal;
pub mod list;
mod lock;
pub mod path;
pub mod session;
mod state;
mod versions;

pub use config::{SyncMode, TxConfig};
pub use directory::{TxDirectory, TxReader};
pub use error::{TxError, TxResult};
pub use journal::RecoveryReport;
pub use list::FileList;
pub use path::STAGING_DIR;
pub use session::{Session, TxHandle, TxWriter};
