use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use tempfile::{NamedTempFile, TempPath};
use tracing::debug;
use uuid::Uuid;

use crate::directory::{Snapshot, StagingArea, TxDirectory, TxReader};
use crate::error::{TxError, TxResult};
use crate::list::FileList;
use crate::path;

/// Identifies one (possibly nested) transaction scope of a session.
///
/// Handles are consumed by [`Session::commit`] and [`Session::rollback`].
#[derive(PartialEq, Eq)]
pub struct TxHandle {
    session: Uuid,
    depth: usize,
}

impl TxHandle {
    /// Nesting depth; 0 for a top-level transaction.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_nested(&self) -> bool {
        self.depth > 0
    }
}

impl fmt::Debug for TxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxHandle({}#{})", self.session.simple(), self.depth)
    }
}

/// A change staged by a transaction frame.
pub(crate) enum Pending {
    /// Content waiting in the staging area. Dropping it deletes the file.
    Write(TempPath),
    Delete,
}

#[derive(Default)]
struct Frame {
    overlay: BTreeMap<PathBuf, Pending>,
}

/// A logical session: a stack of nested transaction frames over one
/// snapshot of a [`TxDirectory`].
///
/// Reads see, in order, the innermost-to-outermost staged changes and then
/// the committed state as of the snapshot pinned by the outermost `begin`.
/// Reads outside a transaction see the latest committed state. Mutations
/// outside a transaction fail with [`TxError::NoActiveTransaction`].
pub struct Session {
    dir: TxDirectory,
    id: Uuid,
    frames: Vec<Frame>,
    snapshot: Option<Snapshot>,
    staging: Option<StagingArea>,
}

impl Session {
    pub(crate) fn new(dir: TxDirectory) -> Self {
        Self {
            dir,
            id: Uuid::now_v7(),
            frames: Vec::new(),
            snapshot: None,
            staging: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn directory(&self) -> &TxDirectory {
        &self.dir
    }

    pub fn in_transaction(&self) -> bool {
        !self.frames.is_empty()
    }

    /// Number of open frames (0 outside a transaction).
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Snapshot sequence number of the active transaction, if any.
    pub fn snapshot_seq(&self) -> Option<u64> {
        self.snapshot.as_ref().map(Snapshot::seq)
    }

    // ---------------------------------------------------------------
    // Transaction control
    // ---------------------------------------------------------------

    /// Begin a transaction, nested inside the current one if any.
    pub fn begin(&mut self) -> TxResult<TxHandle> {
        if self.frames.is_empty() {
            self.snapshot = Some(self.dir.pin()?);
        }
        self.frames.push(Frame::default());
        let handle = TxHandle {
            session: self.id,
            depth: self.frames.len() - 1,
        };
        debug!(session = %self.id, depth = handle.depth, snapshot = ?self.snapshot_seq(), "begin");
        Ok(handle)
    }

    /// Commit the innermost transaction.
    ///
    /// A nested commit hands its changes to the parent frame. A top-level
    /// commit publishes them, or fails with [`TxError::CommitConflict`] if a
    /// concurrent commit touched one of the same paths after our snapshot;
    /// the transaction is discarded in that case. A commit that fails with
    /// [`TxError::Incomplete`] is still finished later from its journal.
    pub fn commit(&mut self, handle: TxHandle) -> TxResult<()> {
        self.check_handle(&handle)?;
        if handle.depth + 1 != self.frames.len() {
            return Err(TxError::InvalidHandle(format!(
                "{handle:?} is not the innermost transaction"
            )));
        }

        let frame = self.frames.pop().unwrap_or_default();
        if let Some(parent) = self.frames.last_mut() {
            parent.overlay.extend(frame.overlay);
            debug!(session = %self.id, depth = handle.depth, "nested commit");
            return Ok(());
        }

        let Some(snapshot) = self.snapshot.take() else {
            return Ok(());
        };
        if frame.overlay.is_empty() {
            return Ok(());
        }
        let result = self.dir.commit(&snapshot, frame.overlay);
        if matches!(result, Err(TxError::Incomplete { .. })) {
            // The journal still needs our staged files; stage anew from here.
            if let Some(staging) = self.staging.take() {
                staging.abandon();
            }
        }
        drop(snapshot);
        result.map(|_| ())
    }

    /// Roll back the transaction named by `handle` together with every
    /// transaction nested inside it.
    pub fn rollback(&mut self, handle: TxHandle) -> TxResult<()> {
        self.check_handle(&handle)?;
        self.frames.truncate(handle.depth);
        if self.frames.is_empty() {
            self.snapshot = None;
        }
        debug!(session = %self.id, depth = handle.depth, "rollback");
        Ok(())
    }

    fn check_handle(&self, handle: &TxHandle) -> TxResult<()> {
        if handle.session != self.id {
            return Err(TxError::InvalidHandle(format!(
                "{handle:?} belongs to another session"
            )));
        }
        if handle.depth >= self.frames.len() {
            return Err(TxError::InvalidHandle(format!("{handle:?} is no longer active")));
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------

    fn staged(&self, rel: &Path) -> Option<&Pending> {
        self.frames.iter().rev().find_map(|f| f.overlay.get(rel))
    }

    /// Open a file for reading. Fails with [`TxError::NotFound`] if it does
    /// not exist in the visible state.
    pub fn open_for_read(&self, path: impl AsRef<Path>) -> TxResult<TxReader> {
        self.open_at(path.as_ref(), self.snapshot_seq())
    }

    /// Staged content first, then the committed state as of `snapshot`.
    pub(crate) fn open_at(&self, path: &Path, snapshot: Option<u64>) -> TxResult<TxReader> {
        let rel = path::file(path)?;
        match self.staged(&rel) {
            Some(Pending::Write(staged)) => Ok(TxReader::file(File::open(staged)?)),
            Some(Pending::Delete) => Err(TxError::NotFound(rel)),
            None => self.dir.read_at(&rel, snapshot),
        }
    }

    pub fn exists(&self, path: impl AsRef<Path>) -> TxResult<bool> {
        self.exists_at(path.as_ref(), self.snapshot_seq())
    }

    pub(crate) fn exists_at(&self, path: &Path, snapshot: Option<u64>) -> TxResult<bool> {
        let rel = path::file(path)?;
        match self.staged(&rel) {
            Some(Pending::Write(_)) => Ok(true),
            Some(Pending::Delete) => Ok(false),
            None => self.dir.exists_at(&rel, snapshot),
        }
    }

    /// Lazily enumerate the files under `dir`, recursively, as visible to
    /// this session. Paths come in ascending order.
    pub fn list_files(&self, dir: impl AsRef<Path>) -> TxResult<FileList<'_>> {
        self.file_list(dir.as_ref(), None)
    }

    /// Like [`list_files`](Self::list_files), but only yields paths that
    /// sort after `after`. Passing the last path seen resumes a listing
    /// without walking what came before it again.
    pub fn list_files_after(
        &self,
        dir: impl AsRef<Path>,
        after: impl AsRef<Path>,
    ) -> TxResult<FileList<'_>> {
        let after = path::relative(after.as_ref())?;
        self.file_list(dir.as_ref(), Some(after))
    }

    fn file_list(&self, dir: &Path, after: Option<PathBuf>) -> TxResult<FileList<'_>> {
        let rel = path::relative(dir)?;
        let pin = match self.snapshot {
            Some(_) => None,
            None => Some(self.dir.pin()?),
        };
        Ok(FileList::new(self, rel, pin, after))
    }

    /// Apply the staged changes of every frame, outermost first, to one
    /// directory listing. Only the staged paths under `dir` are visited.
    pub(crate) fn overlay_dir(
        &self,
        dir: &Path,
        files: &mut BTreeSet<PathBuf>,
        dirs: &mut BTreeSet<PathBuf>,
    ) {
        for frame in &self.frames {
            let under = frame
                .overlay
                .range(dir.to_path_buf()..)
                .take_while(|(path, _)| path.starts_with(dir));
            for (path, pending) in under {
                let Ok(rest) = path.strip_prefix(dir) else {
                    continue;
                };
                let mut parts = rest.components();
                let Some(first) = parts.next() else {
                    continue;
                };
                let nested = parts.next().is_some();
                match (pending, nested) {
                    (Pending::Write(_), true) => {
                        dirs.insert(dir.join(first));
                    }
                    (Pending::Write(_), false) => {
                        files.insert(path.clone());
                    }
                    (Pending::Delete, false) => {
                        files.remove(path);
                    }
                    (Pending::Delete, true) => {}
                }
            }
        }
    }

    // ---------------------------------------------------------------
    // Writes
    // ---------------------------------------------------------------

    /// Open a file for writing in the current transaction.
    ///
    /// Content goes to a temp file in the staging area. It becomes visible
    /// to this session when [`TxWriter::finish`] is called and to everyone
    /// else when the top-level transaction commits. Dropping the writer
    /// without finishing discards it.
    pub fn open_for_write(&mut self, path: impl AsRef<Path>) -> TxResult<TxWriter<'_>> {
        let rel = path::file(path.as_ref())?;
        if !self.in_transaction() {
            return Err(TxError::NoActiveTransaction);
        }
        let file = NamedTempFile::new_in(self.ensure_staging()?)?;
        Ok(TxWriter {
            session: self,
            path: rel,
            inner: BufWriter::new(file),
        })
    }

    /// Delete a file in the current transaction. Absent files are fine.
    pub fn remove(&mut self, path: impl AsRef<Path>) -> TxResult<()> {
        let rel = path::file(path.as_ref())?;
        if !self.in_transaction() {
            return Err(TxError::NoActiveTransaction);
        }
        self.stage(rel, Pending::Delete);
        Ok(())
    }

    fn stage(&mut self, rel: PathBuf, pending: Pending) {
        if let Some(frame) = self.frames.last_mut() {
            frame.overlay.insert(rel, pending);
        }
    }

    fn ensure_staging(&mut self) -> TxResult<PathBuf> {
        if let Some(staging) = &self.staging {
            return Ok(staging.path().to_path_buf());
        }
        let staging = self.dir.create_staging()?;
        let dir = staging.path().to_path_buf();
        self.staging = Some(staging);
        Ok(dir)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("depth", &self.frames.len())
            .field("snapshot", &self.snapshot_seq())
            .finish()
    }
}

/// Write stream for one file of a transaction.
pub struct TxWriter<'s> {
    session: &'s mut Session,
    path: PathBuf,
    inner: BufWriter<NamedTempFile>,
}

impl TxWriter<'_> {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Close the stream and stage the file in the current frame.
    pub fn finish(self) -> TxResult<()> {
        let TxWriter {
            session,
            path,
            inner,
        } = self;
        let file = inner.into_inner().map_err(|e| TxError::Io(e.into_error()))?;
        if session.dir.config().sync_every_write() {
            file.as_file().sync_all()?;
        }
        debug!(session = %session.id, path = %path.display(), "staged write");
        session.stage(path, Pending::Write(file.into_temp_path()));
        Ok(())
    }
}

impl Write for TxWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;
    use crate::config::{SyncMode, TxConfig};

    fn open(tmp: &tempfile::TempDir) -> TxDirectory {
        TxDirectory::open(tmp.path(), TxConfig::default()).unwrap()
    }

    fn write(session: &mut Session, path: &str, data: &[u8]) {
        let mut w = session.open_for_write(path).unwrap();
        w.write_all(data).unwrap();
        w.finish().unwrap();
    }

    fn read(session: &Session, path: &str) -> Option<Vec<u8>> {
        match session.open_for_read(path) {
            Ok(mut r) => {
                let mut buf = Vec::new();
                r.read_to_end(&mut buf).unwrap();
                Some(buf)
            }
            Err(TxError::NotFound(_)) => None,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    // -----------------------------------------------------------------------
    // Visibility
    // -----------------------------------------------------------------------

    #[test]
    fn own_writes_are_visible_before_commit() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = open(&tmp);
        let mut s = dir.session();
        let tx = s.begin().unwrap();
        write(&mut s, "a/b/c", b"data");
        assert_eq!(read(&s, "a/b/c").as_deref(), Some(&b"data"[..]));
        assert!(s.exists("a/b/c").unwrap());
        assert!(!tmp.path().join("a/b/c").exists());
        s.commit(tx).unwrap();
        assert_eq!(std::fs::read(tmp.path().join("a/b/c")).unwrap(), b"data");
    }

    #[test]
    fn uncommitted_writes_are_invisible_to_other_sessions() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = open(&tmp);
        let mut writer = dir.session();
        let other = dir.session();

        let tx = writer.begin().unwrap();
        write(&mut writer, "f", b"1");
        assert_eq!(read(&other, "f"), None);
        assert!(!other.exists("f").unwrap());

        writer.commit(tx).unwrap();
        assert_eq!(read(&other, "f").as_deref(), Some(&b"1"[..]));
    }

    #[test]
    fn rollback_discards_writes_and_deletes() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = open(&tmp);
        let mut s = dir.session();
        let tx = s.begin().unwrap();
        write(&mut s, "keep", b"k");
        s.commit(tx).unwrap();

        let tx = s.begin().unwrap();
        write(&mut s, "new", b"n");
        s.remove("keep").unwrap();
        assert!(!s.exists("keep").unwrap());
        s.rollback(tx).unwrap();

        assert!(s.exists("keep").unwrap());
        assert!(!s.exists("new").unwrap());
        assert!(!tmp.path().join("new").exists());
    }

    #[test]
    fn remove_of_missing_path_is_ok() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = open(&tmp);
        let mut s = dir.session();
        let tx = s.begin().unwrap();
        s.remove("never/existed").unwrap();
        s.commit(tx).unwrap();
        assert!(!s.exists("never/existed").unwrap());
    }

    #[test]
    fn dropped_writer_stages_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = open(&tmp);
        let mut s = dir.session();
        let tx = s.begin().unwrap();
        {
            let mut w = s.open_for_write("half").unwrap();
            w.write_all(b"partial").unwrap();
        }
        assert!(!s.exists("half").unwrap());
        s.commit(tx).unwrap();
        assert!(!tmp.path().join("half").exists());
    }

    #[test]
    fn mutations_require_a_transaction() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = open(&tmp);
        let mut s = dir.session();
        assert!(matches!(s.open_for_write("x"), Err(TxError::NoActiveTransaction)));
        assert!(matches!(s.remove("x"), Err(TxError::NoActiveTransaction)));
    }

    #[test]
    fn invalid_paths_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = open(&tmp);
        let mut s = dir.session();
        let _tx = s.begin().unwrap();
        assert!(matches!(s.open_for_write("../escape"), Err(TxError::InvalidPath { .. })));
        assert!(matches!(s.open_for_read("/abs"), Err(TxError::InvalidPath { .. })));
        assert!(matches!(s.remove(".txn/x"), Err(TxError::InvalidPath { .. })));
    }

    // -----------------------------------------------------------------------
    // Nesting
    // -----------------------------------------------------------------------

    #[test]
    fn nested_commit_is_undone_by_parent_rollback() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = open(&tmp);
        let mut s = dir.session();
        let outer = s.begin().unwrap();
        let inner = s.begin().unwrap();
        assert!(inner.is_nested());
        write(&mut s, "nested", b"n");
        s.commit(inner).unwrap();
        assert!(s.exists("nested").unwrap());

        s.rollback(outer).unwrap();
        assert!(!s.exists("nested").unwrap());
        assert!(!s.in_transaction());
    }

    #[test]
    fn nested_rollback_keeps_parent_changes() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = open(&tmp);
        let mut s = dir.session();
        let outer = s.begin().unwrap();
        write(&mut s, "parent", b"p");
        let inner = s.begin().unwrap();
        write(&mut s, "parent", b"overwritten");
        write(&mut s, "child", b"c");
        s.rollback(inner).unwrap();
        s.commit(outer).unwrap();

        assert_eq!(read(&s, "parent").as_deref(), Some(&b"p"[..]));
        assert!(!s.exists("child").unwrap());
    }

    #[test]
    fn nested_delete_overrides_parent_write() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = open(&tmp);
        let mut s = dir.session();
        let outer = s.begin().unwrap();
        write(&mut s, "x", b"1");
        let inner = s.begin().unwrap();
        s.remove("x").unwrap();
        s.commit(inner).unwrap();
        s.commit(outer).unwrap();
        assert!(!tmp.path().join("x").exists());
    }

    #[test]
    fn committing_an_outer_handle_with_open_child_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = open(&tmp);
        let mut s = dir.session();
        let outer = s.begin().unwrap();
        let _inner = s.begin().unwrap();
        assert!(matches!(s.commit(outer), Err(TxError::InvalidHandle(_))));
    }

    #[test]
    fn rollback_of_outer_discards_open_children() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = open(&tmp);
        let mut s = dir.session();
        let outer = s.begin().unwrap();
        let inner = s.begin().unwrap();
        write(&mut s, "x", b"1");
        s.rollback(outer).unwrap();
        assert_eq!(s.depth(), 0);
        assert!(matches!(s.commit(inner), Err(TxError::InvalidHandle(_))));
    }

    #[test]
    fn handles_are_bound_to_their_session() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = open(&tmp);
        let mut a = dir.session();
        let mut b = dir.session();
        let tx_a = a.begin().unwrap();
        let _tx_b = b.begin().unwrap();
        assert!(matches!(b.commit(tx_a), Err(TxError::InvalidHandle(_))));
    }

    // -----------------------------------------------------------------------
    // Isolation and conflicts
    // -----------------------------------------------------------------------

    #[test]
    fn transaction_reads_its_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = open(&tmp);
        let mut writer = dir.session();
        let tx = writer.begin().unwrap();
        write(&mut writer, "f", b"v1");
        writer.commit(tx).unwrap();

        let mut reader = dir.session();
        let rtx = reader.begin().unwrap();
        assert_eq!(read(&reader, "f").as_deref(), Some(&b"v1"[..]));

        let tx = writer.begin().unwrap();
        write(&mut writer, "f", b"v2");
        write(&mut writer, "g", b"new");
        writer.commit(tx).unwrap();

        assert_eq!(read(&reader, "f").as_deref(), Some(&b"v1"[..]));
        assert!(!reader.exists("g").unwrap());
        reader.rollback(rtx).unwrap();

        assert_eq!(read(&reader, "f").as_deref(), Some(&b"v2"[..]));
        assert!(reader.exists("g").unwrap());
    }

    #[test]
    fn first_committer_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = open(&tmp);
        let mut a = dir.session();
        let mut b = dir.session();

        let tx_a = a.begin().unwrap();
        let tx_b = b.begin().unwrap();
        write(&mut a, "shared", b"a");
        write(&mut b, "shared", b"b");
        write(&mut b, "only-b", b"b");

        a.commit(tx_a).unwrap();
        match b.commit(tx_b) {
            Err(TxError::CommitConflict { path }) => assert_eq!(path, PathBuf::from("shared")),
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(read(&a, "shared").as_deref(), Some(&b"a"[..]));
        assert!(!a.exists("only-b").unwrap());
        assert!(!b.in_transaction());
    }

    #[test]
    fn disjoint_writers_both_commit() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = open(&tmp);
        let mut a = dir.session();
        let mut b = dir.session();
        let tx_a = a.begin().unwrap();
        let tx_b = b.begin().unwrap();
        write(&mut a, "x", b"a");
        write(&mut b, "y", b"b");
        a.commit(tx_a).unwrap();
        b.commit(tx_b).unwrap();
        assert_eq!(dir.last_committed(), 2);
    }

    #[test]
    fn snapshots_are_released() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = open(&tmp);
        let mut s = dir.session();
        let tx = s.begin().unwrap();
        assert_eq!(dir.active_snapshots(), 1);
        write(&mut s, "f", b"1");
        s.commit(tx).unwrap();
        assert_eq!(dir.active_snapshots(), 0);

        let tx = s.begin().unwrap();
        s.rollback(tx).unwrap();
        assert_eq!(dir.active_snapshots(), 0);
    }

    #[test]
    fn sync_every_write_mode_commits() {
        let tmp = tempfile::tempdir().unwrap();
        let config = TxConfig {
            sync_mode: SyncMode::EveryWrite,
            ..TxConfig::default()
        };
        let dir = TxDirectory::open(tmp.path(), config).unwrap();
        let mut s = dir.session();
        let tx = s.begin().unwrap();
        write(&mut s, "durable", b"d");
        s.commit(tx).unwrap();
        assert_eq!(read(&s, "durable").as_deref(), Some(&b"d"[..]));
    }

    #[test]
    fn dropping_session_cleans_staging_area() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = open(&tmp);
        {
            let mut s = dir.session();
            let _tx = s.begin().unwrap();
            write(&mut s, "f", b"1");
        }
        let leftovers: Vec<_> = std::fs::read_dir(tmp.path().join(".txn/sessions"))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
        assert_eq!(dir.active_snapshots(), 0);
    }
}
