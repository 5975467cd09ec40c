//! Per-object file storage for objfs.
//!
//! Each entry lives in exactly one file named after its id. A parallel tree
//! of empty marker files records which entries are roots. Both trees may be
//! sharded through a hex trie to bound directory fan-out. All reads and
//! writes go through an [`objfs_txdir`] session, so they are transactional,
//! nestable and snapshot-isolated.
//!
//! ```no_run
//! use objfs_store::{FileStore, ObjectStore, RootSet, StoreConfig, Transactional};
//! use objfs_types::Entry;
//!
//! # fn main() -> objfs_store::StoreResult<()> {
//! let store = FileStore::<Entry>::open(StoreConfig::new("/tmp/objfs").with_trie(3, 2))?;
//! let mut session = store.session();
//! session.transaction(|s| s.insert(&[Entry::root("cafe01", b"payload".to_vec())]))?;
//!
//! for root in session.root_entries()? {
//!     println!("{}", root?.id);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Sessions expose their capabilities through four role traits:
//! [`Transactional`], [`ObjectStore`], [`RootSet`] and [`BulkScan`].

pub mod codec;
pub mod config;
pub mod error;
pub mod path;
pub mod roots;
pub mod scan;
pub mod store;
pub mod traits;

pub use codec::{BincodeCodec, Codec, CodecKind, JsonCodec};
pub use config::{StoreConfig, TrieConfig};
pub use error::{StoreError, StoreResult};
pub use path::PathMapper;
pub use roots::RootScan;
pub use scan::{ClearReport, ConsistencyReport, EntryScan, IdScan};
pub use store::{FileStore, StoreSession};
pub use traits::{BulkScan, ObjectStore, RootSet, Transactional};

pub use objfs_txdir::{SyncMode, TxHandle};
