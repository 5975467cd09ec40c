//! Advisory file locks shared by every handle on a directory, in this
//! process or another.
//!
//! Locks are taken per open file, so two handles opened on the same
//! directory contend with each other even inside one process.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::warn;

/// The directory lock: shared for reads, exclusive for commits and
/// recovery.
///
/// A handle only takes it while holding its own commit-state mutex, so one
/// open file is never locked from two threads at once.
#[derive(Debug)]
pub(crate) struct DirLock {
    file: File,
}

impl DirLock {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self { file })
    }

    pub fn shared(&self) -> io::Result<LockGuard<'_>> {
        FileExt::lock_shared(&self.file)?;
        Ok(LockGuard { file: &self.file })
    }

    pub fn exclusive(&self) -> io::Result<LockGuard<'_>> {
        FileExt::lock_exclusive(&self.file)?;
        Ok(LockGuard { file: &self.file })
    }
}

/// Releases the directory lock on drop.
pub(crate) struct LockGuard<'a> {
    file: &'a File,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(self.file) {
            warn!(error = %e, "failed to release directory lock");
        }
    }
}

/// A lock file held for as long as its owner lives. Others tell a live
/// owner from a dead one with [`is_held`]. The file is removed on drop.
#[derive(Debug)]
pub(crate) struct OwnerLock {
    path: PathBuf,
    file: File,
}

impl OwnerLock {
    pub fn acquire(path: PathBuf) -> io::Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        FileExt::try_lock_exclusive(&file)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for OwnerLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove lock file");
            }
        }
        let _ = FileExt::unlock(&self.file);
    }
}

/// `true` if a live [`OwnerLock`] holds `path`. A missing file has no owner.
pub(crate) fn is_held(path: &Path) -> io::Result<bool> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    match FileExt::try_lock_exclusive(&file) {
        Ok(()) => {
            FileExt::unlock(&file)?;
            Ok(false)
        }
        Err(e) if is_contended(&e) => Ok(true),
        Err(e) => Err(e),
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_lock_is_visible_until_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("owner.lock");
        assert!(!is_held(&path).unwrap());

        let owner = OwnerLock::acquire(path.clone()).unwrap();
        assert!(is_held(owner.path()).unwrap());

        drop(owner);
        assert!(!path.exists());
        assert!(!is_held(&path).unwrap());
    }

    #[test]
    fn abandoned_lock_file_is_not_held() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("stale.lock");
        std::fs::write(&path, b"").unwrap();
        assert!(!is_held(&path).unwrap());
    }

    #[test]
    fn directory_lock_is_exclusive_across_opens() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("lock");
        let first = DirLock::open(&path).unwrap();
        let second = DirLock::open(&path).unwrap();

        let guard = first.exclusive().unwrap();
        assert!(FileExt::try_lock_shared(&second.file).is_err());
        drop(guard);

        let _a = first.shared().unwrap();
        let _b = second.shared().unwrap();
    }
}
