use serde::{Deserialize, Serialize};

/// Flush/sync strategy for staged files and commit journals.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// `fsync` every staged file and journal (safest, highest latency).
    EveryWrite,
    /// Rely on OS page-cache buffering (fastest, least durable).
    OsDefault,
}

impl Default for SyncMode {
    fn default() -> Self {
        Self::OsDefault
    }
}

/// Configuration for a [`TxDirectory`](crate::TxDirectory).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TxConfig {
    /// Create the root directory when it does not exist.
    pub create_if_missing: bool,
    /// Sync strategy.
    pub sync_mode: SyncMode,
}

impl Default for TxConfig {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            sync_mode: SyncMode::default(),
        }
    }
}

impl TxConfig {
    pub(crate) fn sync_every_write(&self) -> bool {
        matches!(self.sync_mode, SyncMode::EveryWrite)
    }
}
