use std::path::{Component, Path, PathBuf};

use crate::error::{TxError, TxResult};

/// Hidden directory under the root holding staging areas and commit
/// bookkeeping.
pub const STAGING_DIR: &str = ".txn";

/// Locations under the staging area.
///
/// ```text
/// .txn/lock                      directory lock (shared: read, exclusive: commit)
/// .txn/journal                   redo record of the commit in flight
/// .txn/versions                  commit log shared by every handle
/// .txn/pins/<seq>-<id>           one locked file per pinned snapshot
/// .txn/retained/<seq>/<path>     content superseded by commit <seq>
/// .txn/sessions/<id>/            staged temp files of one session
/// .txn/sessions/<id>.lock        held while that session is alive
/// ```
#[derive(Clone, Debug)]
pub(crate) struct Layout {
    root: PathBuf,
    txn: PathBuf,
}

impl Layout {
    pub fn new(root: PathBuf) -> Self {
        let txn = root.join(STAGING_DIR);
        Self { root, txn }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn lock_file(&self) -> PathBuf {
        self.txn.join("lock")
    }

    pub fn journal(&self) -> PathBuf {
        self.txn.join("journal")
    }

    pub fn version_log(&self) -> PathBuf {
        self.txn.join("versions")
    }

    pub fn pins(&self) -> PathBuf {
        self.txn.join("pins")
    }

    pub fn retained(&self) -> PathBuf {
        self.txn.join("retained")
    }

    pub fn sessions(&self) -> PathBuf {
        self.txn.join("sessions")
    }

    /// Where commit `seq` parks the previous content of `rel`.
    pub fn retained_file(&self, seq: u64, rel: &Path) -> PathBuf {
        self.retained().join(seq.to_string()).join(rel)
    }

    /// Lock file marking the staging directory `dir` as owned.
    pub fn owner_lock(dir: &Path) -> PathBuf {
        dir.with_extension("lock")
    }
}

/// Normalize a caller-supplied path to a clean relative path.
///
/// Absolute paths, `..` components and anything under the staging area are
/// rejected. An empty result names the root itself.
pub(crate) fn relative(path: &Path) -> TxResult<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir => return Err(invalid(path, "parent components are not allowed")),
            Component::RootDir | Component::Prefix(_) => {
                return Err(invalid(path, "absolute paths are not allowed"))
            }
        }
    }
    if out.starts_with(STAGING_DIR) {
        return Err(invalid(path, "the staging area is reserved"));
    }
    Ok(out)
}

/// Like [`relative`], but the path must name a file (non-empty).
pub(crate) fn file(path: &Path) -> TxResult<PathBuf> {
    let out = relative(path)?;
    if out.as_os_str().is_empty() {
        return Err(invalid(path, "empty file path"));
    }
    Ok(out)
}

fn invalid(path: &Path, reason: &'static str) -> TxError {
    TxError::InvalidPath {
        path: path.to_path_buf(),
        reason,
    }
}
