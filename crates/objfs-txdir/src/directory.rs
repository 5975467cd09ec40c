use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::TxConfig;
use crate::error::{TxError, TxResult};
use crate::journal::{self, JournalOp, JournalRecord, RecoveryReport};
use crate::lock::{self, DirLock, LockGuard, OwnerLock};
use crate::path::{Layout, STAGING_DIR};
use crate::session::{Pending, Session};
use crate::state::CommitState;
use crate::versions::{Prior, VersionLog};

/// Compact the version log once it outgrows this many bytes and no
/// snapshot needs its history.
const COMPACT_AFTER: u64 = 64 * 1024;

pub(crate) struct Shared {
    layout: Layout,
    config: TxConfig,
    recovered: RecoveryReport,
    dir_lock: DirLock,
    state: Mutex<CommitState>,
}

/// The directory lock plus a commit state caught up with the log.
///
/// Fields drop in order: the file lock is released before the mutex, so no
/// other thread of this handle relocks the file while it is still held.
struct Entered<'a> {
    _lock: LockGuard<'a>,
    state: MutexGuard<'a, CommitState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, CommitState> {
        self.state.lock().expect("commit state poisoned")
    }

    /// Take the directory lock and catch up with commits made through other
    /// handles. A commit left journaled by a failed or crashed committer is
    /// finished first, under the exclusive lock.
    fn enter(&self, exclusive: bool) -> TxResult<Entered<'_>> {
        let mut state = self.lock();
        let mut guard = if exclusive {
            self.dir_lock.exclusive()?
        } else {
            self.dir_lock.shared()?
        };
        if !exclusive && self.layout.journal().exists() {
            drop(guard);
            guard = self.dir_lock.exclusive()?;
        }
        self.finish_interrupted(&mut state)?;
        state.catch_up()?;
        Ok(Entered {
            _lock: guard,
            state,
        })
    }

    /// Finish the commit named by the journal, if there is one. Caller holds
    /// the exclusive lock. Returns `true` if a commit was replayed.
    fn finish_interrupted(&self, state: &mut CommitState) -> TxResult<bool> {
        let path = self.layout.journal();
        if !path.exists() {
            return Ok(false);
        }
        let Some(record) = journal::read(&path)? else {
            journal::remove_if_present(&path)?;
            return Ok(false);
        };

        state.catch_up()?;
        // Logged means fully applied; only the journal removal was lost.
        if state.seq >= record.seq {
            journal::remove_if_present(&path)?;
            return Ok(false);
        }

        journal::replay(&self.layout, &record)?;
        let versions = record.version_record();
        state
            .log_mut()
            .append(&versions, self.config.sync_every_write())?;
        state.record_commit(versions);
        journal::remove_if_present(&path)?;
        info!(seq = record.seq, ops = record.ops.len(), "finished interrupted commit");
        Ok(true)
    }

    /// Crash recovery at open: finish a journaled commit, then drop the
    /// staging areas and pins of sessions that no longer exist.
    fn recover(&self) -> TxResult<RecoveryReport> {
        let mut state = self.lock();
        let _guard = self.dir_lock.exclusive()?;
        let mut report = RecoveryReport::default();
        if self.finish_interrupted(&mut state)? {
            report.replayed += 1;
        }
        state.catch_up()?;
        report.discarded = self.sweep_sessions()?;
        let pins = self.live_pins()?;
        self.tidy(&mut state, &pins)?;
        Ok(report)
    }

    /// Remove staging areas whose owner is gone. Caller holds the exclusive
    /// lock and has finished any journal that could refer to them.
    fn sweep_sessions(&self) -> TxResult<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(self.layout.sessions())? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                if lock::is_held(&Layout::owner_lock(&path))? {
                    continue;
                }
                fs::remove_dir_all(&path)?;
                debug!(dir = %path.display(), "discarded abandoned staging area");
                removed += 1;
            } else if !lock::is_held(&path)? {
                journal::remove_if_present(&path)?;
            }
        }
        Ok(removed)
    }

    /// Snapshots pinned by any handle, as `(seq, pin file)`. Pin files left
    /// by dead processes are removed. Caller holds the exclusive lock.
    fn live_pins(&self) -> TxResult<Vec<(u64, PathBuf)>> {
        let mut pins = Vec::new();
        for entry in fs::read_dir(self.layout.pins())? {
            let path = entry?.path();
            let seq = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.split_once('-'))
                .and_then(|(seq, _)| seq.parse::<u64>().ok());
            match seq {
                Some(seq) if lock::is_held(&path)? => pins.push((seq, path)),
                _ => journal::remove_if_present(&path)?,
            }
        }
        Ok(pins)
    }

    /// Drop retained content that no pinned snapshot can read, and compact
    /// the log once no snapshot needs its history.
    fn tidy(&self, state: &mut CommitState, pins: &[(u64, PathBuf)]) -> TxResult<()> {
        let oldest = pins.iter().map(|(seq, _)| *seq).min();
        for entry in fs::read_dir(self.layout.retained())? {
            let path = entry?.path();
            let superseded_at = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.parse::<u64>().ok());
            // Content superseded by commit c is read by snapshots before c.
            let needed = matches!((superseded_at, oldest), (Some(c), Some(o)) if c > o);
            if !needed {
                remove_any(&path)?;
            }
        }

        if pins.is_empty() && state.log_mut().len() > COMPACT_AFTER {
            let seq = state.seq;
            state
                .log_mut()
                .compact(seq, self.config.sync_every_write())?;
            state.reset_versions();
        }
        Ok(())
    }

    /// Where `rel` lives as `snapshot` sees it. `None` if it is absent.
    fn visible_path(
        &self,
        state: &CommitState,
        rel: &Path,
        snapshot: Option<u64>,
    ) -> TxResult<Option<PathBuf>> {
        let Some((seq, version)) =
            snapshot.and_then(|seq| state.version_at(rel, seq).map(|v| (seq, v)))
        else {
            return Ok(Some(self.layout.root().join(rel)));
        };
        match version.prior {
            Prior::Absent => Ok(None),
            Prior::Retained => Ok(Some(self.layout.retained_file(version.seq, rel))),
            Prior::Dropped => Err(TxError::SnapshotExpired {
                path: rel.to_path_buf(),
                snapshot: seq,
            }),
        }
    }

    /// Turn staged changes into a journal record. The staged files pass to
    /// the journal: from here on only a replay moves them.
    fn journal_record(
        &self,
        seq: u64,
        ops: BTreeMap<PathBuf, Pending>,
        retain: bool,
    ) -> TxResult<JournalRecord> {
        let mut out = Vec::with_capacity(ops.len());
        for (target, pending) in ops {
            let prior = if !is_file(&self.layout.root().join(&target))? {
                Prior::Absent
            } else if retain {
                Prior::Retained
            } else {
                Prior::Dropped
            };
            out.push(match pending {
                Pending::Write(staged) => {
                    let staged = staged.keep().map_err(|e| TxError::Io(e.error))?;
                    JournalOp::Write {
                        staged: relative_to(self.layout.root(), staged),
                        target,
                        prior,
                    }
                }
                Pending::Delete => JournalOp::Delete { target, prior },
            });
        }
        Ok(JournalRecord { seq, ops: out })
    }
}

/// A directory tree with transactional, snapshot-isolated file operations.
///
/// Committed state is the live file tree under `root`. Uncommitted writes are
/// staged under `root/.txn/sessions/` and moved into place on commit, after
/// a redo journal has been written. Commits from every handle on the same
/// directory, in this process or another, are serialized by a lock file and
/// recorded in a shared log, so isolation and conflict detection hold
/// across handles. Cloning the handle is cheap.
#[derive(Clone)]
pub struct TxDirectory {
    shared: Arc<Shared>,
}

impl TxDirectory {
    /// Open (or create) a transactional directory, finishing any commit
    /// that was interrupted by a crash.
    pub fn open(root: impl AsRef<Path>, config: TxConfig) -> TxResult<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            if !config.create_if_missing {
                return Err(TxError::NotFound(root));
            }
            fs::create_dir_all(&root)?;
        }

        let layout = Layout::new(root);
        for dir in [layout.pins(), layout.retained(), layout.sessions()] {
            fs::create_dir_all(dir)?;
        }
        let dir_lock = DirLock::open(&layout.lock_file())?;
        let state = CommitState::new(VersionLog::new(layout.version_log()));
        let mut shared = Shared {
            layout,
            config,
            recovered: RecoveryReport::default(),
            dir_lock,
            state: Mutex::new(state),
        };

        let report = shared.recover()?;
        if report != RecoveryReport::default() {
            info!(
                root = %shared.layout.root().display(),
                replayed = report.replayed,
                discarded = report.discarded,
                "recovered staging area"
            );
        }
        shared.recovered = report;

        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    /// Start a new logical session.
    pub fn session(&self) -> Session {
        Session::new(self.clone())
    }

    pub fn root(&self) -> &Path {
        self.shared.layout.root()
    }

    pub fn config(&self) -> &TxConfig {
        &self.shared.config
    }

    /// What crash recovery did when this handle was opened.
    pub fn recovery(&self) -> RecoveryReport {
        self.shared.recovered
    }

    /// Sequence number of the last commit this handle has seen, its own or
    /// another handle's.
    pub fn last_committed(&self) -> u64 {
        self.shared.lock().seq
    }

    /// Number of snapshots currently pinned by this handle's transactions
    /// and scans.
    pub fn active_snapshots(&self) -> usize {
        self.shared.lock().pinned()
    }

    pub(crate) fn pin(&self) -> TxResult<Snapshot> {
        let mut entered = self.shared.enter(false)?;
        let seq = entered.state.pin();
        let name = format!("{seq:020}-{}", Uuid::now_v7().simple());
        match OwnerLock::acquire(self.shared.layout.pins().join(name)) {
            Ok(owner) => Ok(Snapshot {
                shared: Arc::clone(&self.shared),
                seq,
                owner,
            }),
            Err(e) => {
                entered.state.unpin(seq);
                Err(e.into())
            }
        }
    }

    /// Create a staging directory owned by the caller for as long as the
    /// returned value lives.
    pub(crate) fn create_staging(&self) -> TxResult<StagingArea> {
        // Held so that a concurrent open cannot sweep it half made.
        let _entered = self.shared.enter(false)?;
        let dir = self
            .shared
            .layout
            .sessions()
            .join(Uuid::now_v7().simple().to_string());
        let owner = OwnerLock::acquire(Layout::owner_lock(&dir))?;
        fs::create_dir(&dir)?;
        Ok(StagingArea {
            dir,
            keep: false,
            _owner: owner,
        })
    }

    /// Open `rel` as seen by `snapshot` (`None` = latest committed state).
    pub(crate) fn read_at(&self, rel: &Path, snapshot: Option<u64>) -> TxResult<TxReader> {
        let entered = self.shared.enter(false)?;
        let Some(path) = self.shared.visible_path(&entered.state, rel, snapshot)? else {
            return Err(TxError::NotFound(rel.to_path_buf()));
        };

        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(TxError::NotFound(rel.to_path_buf()))
            }
            Err(e) => return Err(e.into()),
        };
        if !file.metadata()?.is_file() {
            return Err(TxError::NotFound(rel.to_path_buf()));
        }
        Ok(TxReader::file(file))
    }

    pub(crate) fn exists_at(&self, rel: &Path, snapshot: Option<u64>) -> TxResult<bool> {
        let entered = self.shared.enter(false)?;
        match self.shared.visible_path(&entered.state, rel, snapshot)? {
            Some(path) => is_file(&path),
            None => Ok(false),
        }
    }

    /// Read one directory as seen by `snapshot`.
    ///
    /// The directory is read under the directory lock, so the listing
    /// matches a single committed state; paths touched since `snapshot` are
    /// then corrected from the commit history.
    pub(crate) fn read_dir_at(&self, rel_dir: &Path, snapshot: Option<u64>) -> TxResult<DirListing> {
        let mut listing = DirListing::default();
        let entered = self.shared.enter(false)?;

        match fs::read_dir(self.root().join(rel_dir)) {
            Ok(entries) => {
                for entry in entries {
                    let entry = entry?;
                    let name = entry.file_name();
                    if rel_dir.as_os_str().is_empty() && name == STAGING_DIR {
                        continue;
                    }
                    let file_type = entry.file_type()?;
                    if file_type.is_dir() {
                        listing.dirs.insert(rel_dir.join(name));
                    } else if file_type.is_file() {
                        listing.files.insert(rel_dir.join(name));
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(seq) = snapshot {
            for (path, version) in entered.state.touched_in(rel_dir, seq) {
                match version.prior {
                    Prior::Absent => {
                        listing.files.remove(path);
                    }
                    Prior::Retained => {
                        listing.files.insert(path.clone());
                    }
                    Prior::Dropped => {}
                }
            }
        }

        Ok(listing)
    }

    /// Publish a top-level transaction.
    ///
    /// Runs under the exclusive directory lock: conflict check against every
    /// handle's commits, journal, apply, log. Content replaced while another
    /// snapshot is pinned anywhere is parked under `retained/` instead of
    /// being dropped.
    ///
    /// A failed apply is retried from the journal at once. If that fails too
    /// the journal stays behind and [`TxError::Incomplete`] is returned;
    /// every later operation on the directory tries to finish the commit
    /// before doing anything else.
    pub(crate) fn commit(
        &self,
        snapshot: &Snapshot,
        ops: BTreeMap<PathBuf, Pending>,
    ) -> TxResult<u64> {
        let shared = &*self.shared;
        let mut entered = shared.enter(true)?;
        let state = &mut *entered.state;
        if ops.is_empty() {
            return Ok(state.seq);
        }

        if let Some(path) = ops.keys().find(|path| state.conflicts(path, snapshot.seq)) {
            debug!(path = %path.display(), snapshot = snapshot.seq, "commit conflict");
            return Err(TxError::CommitConflict { path: path.clone() });
        }

        let others: Vec<(u64, PathBuf)> = shared
            .live_pins()?
            .into_iter()
            .filter(|(_, path)| path != snapshot.pin_path())
            .collect();
        let seq = state.seq + 1;
        let sync = shared.config.sync_every_write();
        let record = shared.journal_record(seq, ops, !others.is_empty())?;
        let journal_path = shared.layout.journal();
        if let Err(e) = journal::write(&journal_path, &record, sync) {
            let _ = journal::remove_if_present(&journal_path);
            return Err(e);
        }

        if let Err(first) = journal::replay(&shared.layout, &record) {
            warn!(seq, error = %first, "apply failed, retrying from the journal");
            if let Err(e) = journal::replay(&shared.layout, &record) {
                warn!(seq, error = %e, "commit left journaled for recovery");
                return Err(TxError::Incomplete {
                    seq,
                    reason: e.to_string(),
                });
            }
        }

        let versions = record.version_record();
        if let Err(e) = state.log_mut().append(&versions, sync) {
            return Err(TxError::Incomplete {
                seq,
                reason: e.to_string(),
            });
        }
        state.record_commit(versions);

        if let Err(e) = journal::remove_if_present(&journal_path) {
            warn!(seq, error = %e, "failed to remove finished journal");
        }
        if let Err(e) = shared.tidy(state, &others) {
            warn!(seq, error = %e, "failed to collect retained content");
        }
        debug!(seq, paths = record.ops.len(), "transaction committed");
        Ok(seq)
    }
}

impl std::fmt::Debug for TxDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxDirectory")
            .field("root", &self.root())
            .field("last_committed", &self.last_committed())
            .finish()
    }
}

/// A pinned snapshot, registered under `.txn/pins/` so that committers in
/// every handle keep what it can read. Unpins on drop.
pub(crate) struct Snapshot {
    shared: Arc<Shared>,
    seq: u64,
    owner: OwnerLock,
}

impl Snapshot {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    fn pin_path(&self) -> &Path {
        self.owner.path()
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.unpin(self.seq);
        }
    }
}

/// A session's private staging directory.
pub(crate) struct StagingArea {
    dir: PathBuf,
    keep: bool,
    _owner: OwnerLock,
}

impl StagingArea {
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Give up ownership but leave the files for a pending journal. The
    /// next open sweeps the directory once that journal is finished.
    pub fn abandon(mut self) {
        self.keep = true;
    }
}

impl Drop for StagingArea {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(dir = %self.dir.display(), error = %e, "failed to remove staging directory");
            }
        }
    }
}

/// Files and subdirectories directly under one directory.
#[derive(Debug, Default)]
pub(crate) struct DirListing {
    pub files: BTreeSet<PathBuf>,
    pub dirs: BTreeSet<PathBuf>,
}

/// Read stream over a file as visible to a transaction.
pub struct TxReader {
    inner: BufReader<File>,
}

impl TxReader {
    pub(crate) fn file(file: File) -> Self {
        Self {
            inner: BufReader::new(file),
        }
    }
}

impl Read for TxReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

fn is_file(path: &Path) -> TxResult<bool> {
    match fs::metadata(path) {
        Ok(meta) => Ok(meta.is_file()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn remove_any(path: &Path) -> io::Result<()> {
    if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        journal::remove_if_present(path)
    }
}

fn relative_to(root: &Path, path: PathBuf) -> PathBuf {
    match path.strip_prefix(root) {
        Ok(rel) => rel.to_path_buf(),
        Err(_) => path,
    }
}
