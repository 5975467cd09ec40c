use std::path::{Path, PathBuf};
use std::vec;

use crate::directory::{Snapshot, TxReader};
use crate::error::TxResult;
use crate::session::Session;

/// One entry of a directory listing.
enum Child {
    File(PathBuf),
    Dir(PathBuf),
}

impl Child {
    fn path(&self) -> &Path {
        match self {
            Self::File(path) | Self::Dir(path) => path,
        }
    }
}

/// Lazy, depth-first enumeration of the files under a directory.
///
/// Each directory's entries are visited in name order, so paths come out in
/// ascending order. Only the directories along the current walk are held
/// in memory. Each directory is read against a single committed state and
/// corrected to the session's snapshot and staged changes. Outside a
/// transaction the listing pins its own snapshot for as long as it lives.
///
/// Yields paths relative to the directory root.
pub struct FileList<'s> {
    session: &'s Session,
    pin: Option<Snapshot>,
    start: Option<PathBuf>,
    after: Option<PathBuf>,
    stack: Vec<vec::IntoIter<Child>>,
}

impl<'s> FileList<'s> {
    pub(crate) fn new(
        session: &'s Session,
        dir: PathBuf,
        pin: Option<Snapshot>,
        after: Option<PathBuf>,
    ) -> Self {
        Self {
            session,
            pin,
            start: Some(dir),
            after,
            stack: Vec::new(),
        }
    }

    fn snapshot(&self) -> Option<u64> {
        self.pin
            .as_ref()
            .map(Snapshot::seq)
            .or_else(|| self.session.snapshot_seq())
    }

    /// Open a file against the same state this listing reads, so that a
    /// listed file stays readable even if a later commit removes it.
    pub fn open_for_read(&self, path: impl AsRef<Path>) -> TxResult<TxReader> {
        self.session.open_at(path.as_ref(), self.snapshot())
    }

    pub fn exists(&self, path: impl AsRef<Path>) -> TxResult<bool> {
        self.session.exists_at(path.as_ref(), self.snapshot())
    }

    /// `false` for entries wholly at or before the resume point.
    fn wanted(&self, child: &Child) -> bool {
        let Some(after) = &self.after else {
            return true;
        };
        match child {
            Child::File(path) => path > after,
            Child::Dir(path) => path > after || after.starts_with(path),
        }
    }

    fn load(&mut self, dir: &Path) -> TxResult<()> {
        let mut listing = self
            .session
            .directory()
            .read_dir_at(dir, self.snapshot())?;
        self.session
            .overlay_dir(dir, &mut listing.files, &mut listing.dirs);

        let mut children: Vec<Child> = listing
            .files
            .into_iter()
            .map(Child::File)
            .chain(listing.dirs.into_iter().map(Child::Dir))
            .filter(|child| self.wanted(child))
            .collect();
        children.sort_by(|a, b| a.path().cmp(b.path()));
        self.stack.push(children.into_iter());
        Ok(())
    }
}

impl Iterator for FileList<'_> {
    type Item = TxResult<PathBuf>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(dir) = self.start.take() {
            if let Err(e) = self.load(&dir) {
                return Some(Err(e));
            }
        }
        loop {
            match self.stack.last_mut()?.next() {
                Some(Child::File(path)) => return Some(Ok(path)),
                Some(Child::Dir(dir)) => {
                    if let Err(e) = self.load(&dir) {
                        return Some(Err(e));
                    }
                }
                None => {
                    self.stack.pop();
                }
            }
        }
    }
}
