use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::TxResult;
use crate::versions::{Prior, VersionLog, VersionRecord};

/// One commit's effect on a path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Version {
    pub seq: u64,
    pub prior: Prior,
}

/// A handle's view of the commit history, behind its state mutex.
///
/// Commits apply to the live tree in place. Snapshot isolation comes from
/// `versions`: for a path touched after a pinned snapshot, the first such
/// version says where that snapshot's content went. Versions are only kept
/// while a local snapshot is pinned; the log on disk is the shared record.
#[derive(Debug)]
pub(crate) struct CommitState {
    /// Sequence number of the last commit read from the log.
    pub seq: u64,
    log: VersionLog,
    /// Commits after the oldest local snapshot, per path, ascending.
    versions: BTreeMap<PathBuf, Vec<Version>>,
    /// Local pinned snapshot sequence numbers with their pin counts.
    snapshots: BTreeMap<u64, usize>,
}

impl CommitState {
    pub fn new(log: VersionLog) -> Self {
        Self {
            seq: 0,
            log,
            versions: BTreeMap::new(),
            snapshots: BTreeMap::new(),
        }
    }

    pub fn log_mut(&mut self) -> &mut VersionLog {
        &mut self.log
    }

    /// Fold in commits other handles appended to the log. Caller holds the
    /// directory lock.
    pub fn catch_up(&mut self) -> TxResult<()> {
        let delta = self.log.read_new()?;
        if delta.reset {
            self.versions.clear();
        }
        for record in delta.records {
            self.record_commit(record);
        }
        Ok(())
    }

    /// Pin the current committed state and return its sequence number.
    pub fn pin(&mut self) -> u64 {
        *self.snapshots.entry(self.seq).or_insert(0) += 1;
        self.seq
    }

    pub fn unpin(&mut self, seq: u64) {
        if let Some(count) = self.snapshots.get_mut(&seq) {
            *count -= 1;
            if *count == 0 {
                self.snapshots.remove(&seq);
            }
        }
        self.collect_garbage();
    }

    pub fn pinned(&self) -> usize {
        self.snapshots.values().sum()
    }

    /// `true` if a commit after `snapshot` touched `path`.
    pub fn conflicts(&self, path: &Path, snapshot: u64) -> bool {
        self.versions
            .get(path)
            .and_then(|list| list.last())
            .is_some_and(|v| v.seq > snapshot)
    }

    /// The first commit after `snapshot` that touched `path`. `None` means
    /// the live file is what `snapshot` sees.
    pub fn version_at(&self, path: &Path, snapshot: u64) -> Option<Version> {
        self.versions
            .get(path)?
            .iter()
            .find(|v| v.seq > snapshot)
            .copied()
    }

    /// Direct children of `dir` touched after `snapshot`, with the version
    /// that snapshot sees.
    pub fn touched_in<'a>(
        &'a self,
        dir: &'a Path,
        snapshot: u64,
    ) -> impl Iterator<Item = (&'a PathBuf, Version)> + 'a {
        self.versions
            .range(dir.to_path_buf()..)
            .take_while(move |(path, _)| path.starts_with(dir))
            .filter(move |(path, _)| path.parent() == Some(dir))
            .filter_map(move |(path, list)| {
                list.iter()
                    .find(|v| v.seq > snapshot)
                    .map(|v| (path, *v))
            })
    }

    pub fn record_commit(&mut self, record: VersionRecord) {
        self.seq = self.seq.max(record.seq);
        if self.snapshots.is_empty() {
            return;
        }
        for (path, prior) in record.paths {
            self.versions.entry(path).or_default().push(Version {
                seq: record.seq,
                prior,
            });
        }
        self.collect_garbage();
    }

    /// Forget history after the log was compacted.
    pub fn reset_versions(&mut self) {
        self.versions.clear();
    }

    /// Drop versions no local snapshot can observe.
    fn collect_garbage(&mut self) {
        match self.snapshots.keys().next().copied() {
            None => self.versions.clear(),
            Some(oldest) => self.versions.retain(|_, list| {
                list.retain(|v| v.seq > oldest);
                !list.is_empty()
            }),
        }
    }
}
