use std::fs;
use std::path::{Path, PathBuf};

use objfs_txdir::{SyncMode, TxConfig, STAGING_DIR};
use serde::{Deserialize, Serialize};

use crate::codec::CodecKind;
use crate::error::{StoreError, StoreResult};

/// Hex-trie sharding of object and marker files.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrieConfig {
    pub enabled: bool,
    /// Hex characters per directory level.
    pub nybbles: usize,
    /// Number of directory levels.
    pub levels: usize,
}

impl Default for TrieConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            nybbles: 3,
            levels: 2,
        }
    }
}

/// Configuration for a [`FileStore`](crate::FileStore).
///
/// Every field has a default, so a TOML file only needs the keys it
/// changes:
///
/// ```toml
/// base_dir = "/var/lib/objfs"
///
/// [trie]
/// enabled = true
/// nybbles = 2
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the whole store.
    pub base_dir: PathBuf,
    /// Create `base_dir` when it does not exist.
    pub create_if_missing: bool,
    pub trie: TrieConfig,
    /// Subdirectory for object files.
    pub object_dir: String,
    /// Subdirectory for root markers.
    pub root_dir: String,
    /// Entries decoded per chunk by bulk scans.
    pub scan_chunk_size: usize,
    /// Serialization format for object files.
    pub codec: CodecKind,
    pub sync_mode: SyncMode,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("."),
            create_if_missing: true,
            trie: TrieConfig::default(),
            object_dir: "all".to_string(),
            root_dir: "root".to_string(),
            scan_chunk_size: 256,
            codec: CodecKind::default(),
            sync_mode: SyncMode::default(),
        }
    }
}

impl StoreConfig {
    /// Default configuration rooted at `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Default::default()
        }
    }

    /// Same configuration with trie sharding enabled.
    pub fn with_trie(mut self, nybbles: usize, levels: usize) -> Self {
        self.trie = TrieConfig {
            enabled: true,
            nybbles,
            levels,
        };
        self
    }

    pub fn from_toml_str(s: &str) -> StoreResult<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| StoreError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.trie.enabled && self.trie.nybbles == 0 {
            return Err(StoreError::InvalidConfig(
                "trie.nybbles must be at least 1".into(),
            ));
        }
        if self.scan_chunk_size == 0 {
            return Err(StoreError::InvalidConfig(
                "scan_chunk_size must be at least 1".into(),
            ));
        }
        for name in [&self.object_dir, &self.root_dir] {
            check_dir_name(name)?;
        }
        if self.object_dir == self.root_dir {
            return Err(StoreError::InvalidConfig(format!(
                "object_dir and root_dir are both {:?}",
                self.object_dir
            )));
        }
        Ok(())
    }

    pub(crate) fn tx_config(&self) -> TxConfig {
        TxConfig {
            create_if_missing: self.create_if_missing,
            sync_mode: self.sync_mode,
        }
    }
}

fn check_dir_name(name: &str) -> StoreResult<()> {
    let bad = name.is_empty()
        || name == STAGING_DIR
        || name.starts_with('.')
        || name.contains(['/', '\\', '\0']);
    if bad {
        return Err(StoreError::InvalidConfig(format!(
            "{name:?} is not a usable subdirectory name"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let c = StoreConfig::default();
        assert!(c.create_if_missing);
        assert!(!c.trie.enabled);
        assert_eq!(c.trie.nybbles, 3);
        assert_eq!(c.trie.levels, 2);
        assert_eq!(c.object_dir, "all");
        assert_eq!(c.root_dir, "root");
        assert_eq!(c.scan_chunk_size, 256);
        assert_eq!(c.codec, CodecKind::Bincode);
        assert_eq!(c.sync_mode, SyncMode::OsDefault);
        c.validate().unwrap();
    }

    #[test]
    fn toml_overrides_only_given_keys() {
        let c = StoreConfig::from_toml_str(
            r#"
            base_dir = "/data/objfs"
            codec = "json"
            sync_mode = "every_write"

            [trie]
            enabled = true
            nybbles = 2
            "#,
        )
        .unwrap();
        assert_eq!(c.base_dir, PathBuf::from("/data/objfs"));
        assert_eq!(c.codec, CodecKind::Json);
        assert_eq!(c.sync_mode, SyncMode::EveryWrite);
        assert!(c.trie.enabled);
        assert_eq!(c.trie.nybbles, 2);
        assert_eq!(c.trie.levels, 2);
        assert_eq!(c.object_dir, "all");
    }

    #[test]
    fn load_reads_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("objfs.toml");
        fs::write(&path, "object_dir = \"objects\"\nscan_chunk_size = 8\n").unwrap();
        let c = StoreConfig::load(&path).unwrap();
        assert_eq!(c.object_dir, "objects");
        assert_eq!(c.scan_chunk_size, 8);
    }

    #[test]
    fn malformed_toml_is_invalid_config() {
        assert!(matches!(
            StoreConfig::from_toml_str("trie = 3"),
            Err(StoreError::InvalidConfig(_))
        ));
    }

    #[test]
    fn validate_rejects_bad_values() {
        let base = StoreConfig::new("/tmp/x");
        let cases = [
            StoreConfig { scan_chunk_size: 0, ..base.clone() },
            base.clone().with_trie(0, 2),
            StoreConfig { root_dir: "all".into(), ..base.clone() },
            StoreConfig { object_dir: "".into(), ..base.clone() },
            StoreConfig { object_dir: "a/b".into(), ..base.clone() },
            StoreConfig { root_dir: ".txn".into(), ..base.clone() },
        ];
        for c in cases {
            assert!(
                matches!(c.validate(), Err(StoreError::InvalidConfig(_))),
                "{c:?} accepted"
            );
        }
    }

    #[test]
    fn zero_nybbles_is_fine_when_trie_disabled() {
        let mut c = StoreConfig::default();
        c.trie.nybbles = 0;
        c.validate().unwrap();
    }
}
