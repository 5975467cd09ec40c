use std::path::{Path, PathBuf};

use objfs_types::EntryId;

use crate::config::{StoreConfig, TrieConfig};

/// Maps entry ids to object and root-marker paths.
///
/// Paths are relative to the store's base directory. With the trie enabled,
/// the hex form of the id is cut into `levels` segments of `nybbles`
/// characters each, which become nested directory names. The file name is
/// always the full id, so changing the trie shape moves files between
/// directories but never renames them.
///
/// Ids shorter than `levels * nybbles` hex characters get shorter (or fewer)
/// segments; nothing is padded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathMapper {
    object_dir: PathBuf,
    root_dir: PathBuf,
    trie: TrieConfig,
}

impl PathMapper {
    pub fn new(object_dir: impl Into<PathBuf>, root_dir: impl Into<PathBuf>, trie: TrieConfig) -> Self {
        Self {
            object_dir: object_dir.into(),
            root_dir: root_dir.into(),
            trie,
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(&config.object_dir, &config.root_dir, config.trie)
    }

    pub fn object_dir(&self) -> &Path {
        &self.object_dir
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn object_path(&self, id: &EntryId) -> PathBuf {
        self.place(&self.object_dir, id)
    }

    pub fn root_path(&self, id: &EntryId) -> PathBuf {
        self.place(&self.root_dir, id)
    }

    /// Trie directory segments for `id`; empty when the trie is disabled.
    pub fn shard_dirs(&self, id: &EntryId) -> Vec<String> {
        if !self.trie.enabled || self.trie.nybbles == 0 {
            return Vec::new();
        }
        let hex = id.to_hex();
        hex.as_bytes()
            .chunks(self.trie.nybbles)
            .take(self.trie.levels)
            // Hex output is ASCII, so every chunk is valid UTF-8.
            .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
            .collect()
    }

    /// Recover the id from an object or marker path.
    pub fn id_of(path: &Path) -> Option<EntryId> {
        let name = path.file_name()?.to_str()?;
        let id = EntryId::from(name);
        id.validate().ok()?;
        Some(id)
    }

    fn place(&self, base: &Path, id: &EntryId) -> PathBuf {
        let mut path = base.to_path_buf();
        for segment in self.shard_dirs(id) {
            path.push(segment);
        }
        path.push(file_name(id));
        path
    }
}

fn file_name(id: &EntryId) -> String {
    String::from_utf8_lossy(id.as_bytes()).into_owned()
}
