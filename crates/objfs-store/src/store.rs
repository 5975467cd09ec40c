use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use objfs_txdir::{Session, TxDirectory, TxError, TxHandle, TxReader, TxResult};
use objfs_types::{EntryId, Record};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::codec::Codec;
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::path::PathMapper;
use crate::traits::{ObjectStore, Transactional};

/// A per-object file store rooted at a directory.
///
/// ```text
/// <base_dir>/all/[<seg>/...]<id>    object files, one per entry
/// <base_dir>/root/[<seg>/...]<id>   empty root markers
/// <base_dir>/.txn/                  transaction staging area
/// ```
///
/// The handle is cheap to clone. All work happens through a
/// [`StoreSession`]. Sessions are isolated from each other and detect
/// conflicting commits, whether they come from one store handle or from
/// separate handles, in separate processes, on the same directory.
pub struct FileStore<E> {
    dir: TxDirectory,
    mapper: PathMapper,
    codec: Arc<dyn Codec<E>>,
    config: StoreConfig,
}

impl<E> FileStore<E>
where
    E: Record + Serialize + DeserializeOwned + 'static,
{
    /// Open a store with the codec named in `config`.
    pub fn open(config: StoreConfig) -> StoreResult<Self> {
        let codec = config.codec.codec();
        Self::with_codec(config, codec)
    }
}

impl<E: Record> FileStore<E> {
    /// Open a store with a caller-supplied codec.
    pub fn with_codec(config: StoreConfig, codec: Arc<dyn Codec<E>>) -> StoreResult<Self> {
        config.validate()?;
        if !config.create_if_missing && !config.base_dir.is_dir() {
            return Err(StoreError::MissingStore(config.base_dir.clone()));
        }

        let dir = TxDirectory::open(&config.base_dir, config.tx_config())?;
        let mapper = PathMapper::from_config(&config);
        // Both trees exist even when empty; clear() never removes them.
        fs::create_dir_all(dir.root().join(mapper.object_dir()))?;
        fs::create_dir_all(dir.root().join(mapper.root_dir()))?;

        info!(
            base_dir = %config.base_dir.display(),
            trie = config.trie.enabled,
            codec = codec.name(),
            "opened file store"
        );
        Ok(Self {
            dir,
            mapper,
            codec,
            config,
        })
    }

    /// Start a new session.
    pub fn session(&self) -> StoreSession<E> {
        StoreSession {
            tx: self.dir.session(),
            mapper: self.mapper.clone(),
            codec: Arc::clone(&self.codec),
            chunk_size: self.config.scan_chunk_size,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn mapper(&self) -> &PathMapper {
        &self.mapper
    }

    /// The transactional directory underneath the store.
    pub fn directory(&self) -> &TxDirectory {
        &self.dir
    }
}

impl<E> Clone for FileStore<E> {
    fn clone(&self) -> Self {
        Self {
            dir: self.dir.clone(),
            mapper: self.mapper.clone(),
            codec: Arc::clone(&self.codec),
            config: self.config.clone(),
        }
    }
}

impl<E> fmt::Debug for FileStore<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileStore")
            .field("base_dir", &self.config.base_dir)
            .field("codec", &self.codec.name())
            .field("trie", &self.config.trie)
            .finish()
    }
}

/// One logical session over a [`FileStore`].
///
/// Reads outside a transaction see the latest committed state. Mutations
/// (`insert`, `delete`, `clear`) require an open transaction and fail with
/// [`StoreError::NoActiveTransaction`] otherwise.
pub struct StoreSession<E> {
    pub(crate) tx: Session,
    pub(crate) mapper: PathMapper,
    pub(crate) codec: Arc<dyn Codec<E>>,
    pub(crate) chunk_size: usize,
}

impl<E: Record> StoreSession<E> {
    /// The transaction session underneath.
    pub fn tx(&self) -> &Session {
        &self.tx
    }

    pub fn mapper(&self) -> &PathMapper {
        &self.mapper
    }

    /// Decode the object file at `path`, checking that it holds the entry
    /// its file name says.
    pub(crate) fn read_object(&self, path: &Path, expected: &EntryId) -> StoreResult<E> {
        self.decode_object(path, expected, self.tx.open_for_read(path))
    }

    /// Like [`read_object`](Self::read_object) for a file the caller has
    /// already opened, e.g. through a scan's listing.
    pub(crate) fn decode_object(
        &self,
        path: &Path,
        expected: &EntryId,
        opened: TxResult<TxReader>,
    ) -> StoreResult<E> {
        let mut reader = match opened {
            Ok(reader) => reader,
            Err(TxError::NotFound(_)) => return Err(StoreError::NotFound(expected.clone())),
            Err(e) => return Err(e.into()),
        };
        let entry = self.codec.decode(&mut reader)?;
        if entry.id() != expected {
            return Err(StoreError::CorruptObject {
                path: path.to_path_buf(),
                reason: format!("file holds entry {}", entry.id()),
            });
        }
        Ok(entry)
    }

    pub(crate) fn require_transaction(&self) -> StoreResult<()> {
        if self.tx.in_transaction() {
            Ok(())
        } else {
            Err(StoreError::NoActiveTransaction)
        }
    }

    /// Run `f` in a child frame so that a failure part-way leaves the
    /// enclosing transaction as it was.
    pub(crate) fn atomically<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let handle = self.tx.begin()?;
        match f(self) {
            Ok(value) => {
                self.tx.commit(handle)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = self.tx.rollback(handle) {
                    warn!(error = %rollback_err, "failed to roll back partial batch");
                }
                Err(e)
            }
        }
    }

    fn stage_entry(&mut self, entry: &E) -> StoreResult<()> {
        let id = entry.id();
        let path = self.mapper.object_path(id);
        let mut writer = self.tx.open_for_write(&path)?;
        // On error the writer is dropped unfinished and its temp file deleted.
        self.codec.encode(&mut writer, entry)?;
        writer.finish()?;

        let marker = self.mapper.root_path(id);
        if entry.is_root() {
            self.tx.open_for_write(&marker)?.finish()?;
        } else if self.tx.exists(&marker)? {
            self.tx.remove(&marker)?;
        }
        debug!(id = %id, root = entry.is_root(), "staged entry");
        Ok(())
    }
}

impl<E: Record> Transactional for StoreSession<E> {
    fn begin(&mut self) -> StoreResult<TxHandle> {
        Ok(self.tx.begin()?)
    }

    fn commit(&mut self, handle: TxHandle) -> StoreResult<()> {
        Ok(self.tx.commit(handle)?)
    }

    fn rollback(&mut self, handle: TxHandle) -> StoreResult<()> {
        Ok(self.tx.rollback(handle)?)
    }

    fn in_transaction(&self) -> bool {
        self.tx.in_transaction()
    }
}

impl<E: Record> ObjectStore<E> for StoreSession<E> {
    fn get_one(&self, id: &EntryId) -> StoreResult<E> {
        // An unusable id can never have been stored.
        if id.validate().is_err() {
            return Err(StoreError::NotFound(id.clone()));
        }
        self.read_object(&self.mapper.object_path(id), id)
    }

    fn insert(&mut self, entries: &[E]) -> StoreResult<()> {
        self.require_transaction()?;
        for entry in entries {
            entry.id().validate()?;
        }
        self.atomically(|s| entries.iter().try_for_each(|e| s.stage_entry(e)))?;
        debug!(count = entries.len(), "inserted entries");
        Ok(())
    }

    fn delete(&mut self, ids: &[EntryId]) -> StoreResult<()> {
        self.require_transaction()?;
        for id in ids.iter().filter(|id| id.validate().is_ok()) {
            self.tx.remove(self.mapper.object_path(id))?;
            self.tx.remove(self.mapper.root_path(id))?;
        }
        debug!(count = ids.len(), "deleted entries");
        Ok(())
    }

    fn exists(&self, ids: &[EntryId]) -> StoreResult<Vec<bool>> {
        ids.iter()
            .map(|id| {
                if id.validate().is_err() {
                    return Ok(false);
                }
                Ok(self.tx.exists(self.mapper.object_path(id))?)
            })
            .collect()
    }
}

impl<E> fmt::Debug for StoreSession<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreSession")
            .field("tx", &self.tx)
            .field("codec", &self.codec.name())
            .finish()
    }
}
