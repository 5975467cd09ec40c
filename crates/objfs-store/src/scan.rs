use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use objfs_txdir::FileList;
use objfs_types::{EntryId, Record};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::path::PathMapper;
use crate::store::StoreSession;
use crate::traits::BulkScan;

/// Lazy sequence of entry ids, read from file names under one tree.
pub struct IdScan<'s> {
    files: FileList<'s>,
}

impl<'s> IdScan<'s> {
    pub(crate) fn new(files: FileList<'s>) -> Self {
        Self { files }
    }
}

impl Iterator for IdScan<'_> {
    type Item = StoreResult<EntryId>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(match self.files.next()? {
            Ok(path) => entry_id(&path),
            Err(e) => Err(e.into()),
        })
    }
}

pub(crate) fn entry_id(path: &Path) -> StoreResult<EntryId> {
    PathMapper::id_of(path).ok_or_else(|| StoreError::CorruptObject {
        path: path.to_path_buf(),
        reason: "file name is not a valid entry id".into(),
    })
}

/// Lazy sequence of decoded entries, produced one chunk at a time.
pub struct EntryScan<'s, E> {
    session: &'s StoreSession<E>,
    files: FileList<'s>,
    chunk: VecDeque<StoreResult<E>>,
    exhausted: bool,
}

impl<E: Record> EntryScan<'_, E> {
    fn fill(&mut self) {
        while self.chunk.len() < self.session.chunk_size {
            let Some(next) = self.files.next() else {
                self.exhausted = true;
                break;
            };
            let item = next.map_err(StoreError::from).and_then(|path| {
                let id = entry_id(&path)?;
                let opened = self.files.open_for_read(&path);
                self.session.decode_object(&path, &id, opened)
            });
            self.chunk.push_back(item);
        }
    }
}

impl<E: Record> Iterator for EntryScan<'_, E> {
    type Item = StoreResult<E>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.chunk.is_empty() && !self.exhausted {
            self.fill();
        }
        self.chunk.pop_front()
    }
}

/// Counts of files removed by [`BulkScan::clear`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClearReport {
    pub objects: usize,
    pub root_markers: usize,
}

/// Result of [`StoreSession::check`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConsistencyReport {
    pub objects: usize,
    pub root_markers: usize,
    /// Root markers whose object file is missing.
    pub dangling_markers: Vec<EntryId>,
    /// Objects whose stored root flag disagrees with marker presence.
    pub root_flag_mismatches: Vec<EntryId>,
    /// Object files that failed to decode, with the reason.
    pub unreadable: Vec<(PathBuf, String)>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.dangling_markers.is_empty()
            && self.root_flag_mismatches.is_empty()
            && self.unreadable.is_empty()
    }
}

impl<E: Record> BulkScan<E> for StoreSession<E> {
    fn all_ids(&self) -> StoreResult<IdScan<'_>> {
        Ok(IdScan::new(self.tx.list_files(self.mapper.object_dir())?))
    }

    fn all_entries(&self) -> StoreResult<EntryScan<'_, E>> {
        Ok(EntryScan {
            session: self,
            files: self.tx.list_files(self.mapper.object_dir())?,
            chunk: VecDeque::with_capacity(self.chunk_size),
            exhausted: false,
        })
    }

    fn clear(&mut self) -> StoreResult<ClearReport> {
        self.require_transaction()?;
        let report = self.atomically(|s| {
            let objects = s.remove_tree(s.mapper.object_dir().to_path_buf())?;
            let root_markers = s.remove_tree(s.mapper.root_dir().to_path_buf())?;
            Ok(ClearReport {
                objects,
                root_markers,
            })
        })?;
        debug!(objects = report.objects, root_markers = report.root_markers, "cleared store");
        Ok(report)
    }
}

impl<E: Record> StoreSession<E> {
    /// Stage removal of every file under `dir`, one chunk at a time, in a
    /// single pass: each chunk resumes the listing after the last path of
    /// the one before.
    fn remove_tree(&mut self, dir: PathBuf) -> StoreResult<usize> {
        let mut removed = 0;
        let mut last: Option<PathBuf> = None;
        loop {
            let files = match &last {
                None => self.tx.list_files(&dir)?,
                Some(after) => self.tx.list_files_after(&dir, after)?,
            };
            let batch = files
                .take(self.chunk_size)
                .collect::<Result<Vec<_>, _>>()?;
            let Some(tail) = batch.last().cloned() else {
                return Ok(removed);
            };
            removed += batch.len();
            for path in batch {
                self.tx.remove(path)?;
            }
            last = Some(tail);
        }
    }

    /// Walk both trees and report how far they disagree.
    ///
    /// Decode failures and dangling markers are collected rather than
    /// returned as errors; only I/O and transaction failures abort the check.
    pub fn check(&self) -> StoreResult<ConsistencyReport> {
        let mut report = ConsistencyReport::default();

        let mut objects = self.tx.list_files(self.mapper.object_dir())?;
        while let Some(path) = objects.next() {
            let path = path?;
            report.objects += 1;
            let decoded = entry_id(&path).and_then(|id| {
                let opened = objects.open_for_read(&path);
                self.decode_object(&path, &id, opened)
            });
            match decoded {
                Ok(entry) => {
                    let marker = self.mapper.root_path(entry.id());
                    if entry.is_root() != objects.exists(&marker)? {
                        report.root_flag_mismatches.push(entry.id().clone());
                    }
                }
                Err(e @ (StoreError::Serialization(_) | StoreError::CorruptObject { .. })) => {
                    report.unreadable.push((path, e.to_string()));
                }
                Err(e) => return Err(e),
            }
        }

        let mut markers = self.tx.list_files(self.mapper.root_dir())?;
        while let Some(path) = markers.next() {
            let id = entry_id(&path?)?;
            report.root_markers += 1;
            if !markers.exists(self.mapper.object_path(&id))? {
                report.dangling_markers.push(id);
            }
        }

        debug!(
            objects = report.objects,
            root_markers = report.root_markers,
            consistent = report.is_consistent(),
            "consistency check"
        );
        Ok(report)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashSet;
    use std::fs;
    use std::io::Write;

    use objfs_types::Entry;
    use rand::RngCore;

    use super::*;
    use crate::config::StoreConfig;
    use crate::store::FileStore;
    use crate::traits::{ObjectStore, RootSet, Transactional};

    /// Every visible entry, sorted by id.
    pub(crate) fn sorted_entries(s: &StoreSession<Entry>) -> Vec<Entry> {
        let mut entries = s
            .all_entries()
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    fn open_with(tmp: &tempfile::TempDir, config: StoreConfig) -> FileStore<Entry> {
        FileStore::open(StoreConfig {
            base_dir: tmp.path().to_path_buf(),
            ..config
        })
        .unwrap()
    }

    fn random_id(rng: &mut impl RngCore) -> EntryId {
        let mut bytes = [0u8; 16];
        rng.fill_bytes(&mut bytes);
        EntryId::from_hex_bytes(&bytes)
    }

    fn subdirs(dir: &std::path::Path) -> Vec<PathBuf> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.is_dir())
            .collect()
    }

    #[test]
    fn empty_store_scans_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_with(&tmp, StoreConfig::default());
        let s = store.session();
        assert_eq!(s.all_entries().unwrap().count(), 0);
        assert_eq!(s.all_ids().unwrap().count(), 0);
    }

    #[test]
    fn thousand_random_entries_in_trie() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_with(
            &tmp,
            StoreConfig {
                scan_chunk_size: 64,
                ..StoreConfig::default().with_trie(2, 2)
            },
        );
        let mut s = store.session();
        let mut rng = rand::thread_rng();
        let entries: Vec<Entry> = (0..1000u32)
            .map(|i| Entry::new(random_id(&mut rng), i.to_le_bytes().to_vec()).with_root(i % 10 == 0))
            .collect();
        s.transaction(|s| s.insert(&entries)).unwrap();

        let scanned: Vec<Entry> = s.all_entries().unwrap().collect::<Result<_, _>>().unwrap();
        assert_eq!(scanned.len(), 1000);
        let ids: Vec<EntryId> = entries.iter().map(|e| e.id.clone()).collect();
        assert!(s.exists(&ids).unwrap().into_iter().all(|b| b));

        let scanned_ids: HashSet<EntryId> = s.all_ids().unwrap().map(Result::unwrap).collect();
        assert_eq!(scanned_ids, ids.iter().cloned().collect());

        let level1 = subdirs(&tmp.path().join("all"));
        assert!(level1.len() <= 256);
        for dir in &level1 {
            assert!(subdirs(dir).len() <= 256);
        }
        assert_eq!(s.root_entries().unwrap().count(), 100);
    }

    #[test]
    fn clear_empties_both_trees_but_keeps_them() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_with(
            &tmp,
            StoreConfig {
                scan_chunk_size: 3,
                ..StoreConfig::default().with_trie(3, 2)
            },
        );
        let mut s = store.session();
        let entries: Vec<Entry> = (0..10)
            .map(|i| Entry::new(format!("e{i:02}"), Vec::new()).with_root(i < 4))
            .collect();
        s.transaction(|s| s.insert(&entries)).unwrap();

        let report = s.transaction(|s| s.clear()).unwrap();
        assert_eq!(
            report,
            ClearReport {
                objects: 10,
                root_markers: 4,
            }
        );
        assert_eq!(s.all_entries().unwrap().count(), 0);
        assert_eq!(s.root_entries().unwrap().count(), 0);
        assert!(tmp.path().join("all").is_dir());
        assert!(tmp.path().join("root").is_dir());
    }

    #[test]
    fn clear_walks_a_large_trie_once() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_with(
            &tmp,
            StoreConfig {
                scan_chunk_size: 7,
                ..StoreConfig::default().with_trie(2, 2)
            },
        );
        let mut s = store.session();
        let mut rng = rand::thread_rng();
        let entries: Vec<Entry> = (0..600u32)
            .map(|i| Entry::new(random_id(&mut rng), Vec::new()).with_root(i % 3 == 0))
            .collect();

        let tx = s.begin().unwrap();
        s.insert(&entries).unwrap();
        // Staged entries are listed from the overlay before anything is on disk.
        assert_eq!(s.all_ids().unwrap().count(), 600);
        s.commit(tx).unwrap();

        let report = s.transaction(|s| s.clear()).unwrap();
        assert_eq!(
            report,
            ClearReport {
                objects: 600,
                root_markers: 200,
            }
        );
        assert_eq!(s.all_ids().unwrap().count(), 0);
        assert_eq!(s.root_ids().unwrap().count(), 0);
    }

    #[test]
    fn clear_of_empty_store_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_with(&tmp, StoreConfig::default());
        let mut s = store.session();
        assert_eq!(s.transaction(|s| s.clear()).unwrap(), ClearReport::default());
    }

    #[test]
    fn clear_rolls_back_with_its_transaction() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_with(&tmp, StoreConfig::default());
        let mut s = store.session();
        s.transaction(|s| s.insert(&[Entry::root("keep", Vec::new())]))
            .unwrap();

        let tx = s.begin().unwrap();
        s.clear().unwrap();
        assert_eq!(s.all_entries().unwrap().count(), 0);
        s.rollback(tx).unwrap();
        assert_eq!(sorted_entries(&s), vec![Entry::root("keep", Vec::new())]);
    }

    #[test]
    fn scan_sees_own_uncommitted_writes() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_with(&tmp, StoreConfig::default().with_trie(2, 1));
        let mut s = store.session();
        let other = store.session();
        let tx = s.begin().unwrap();
        s.insert(&[Entry::new("fresh", Vec::new())]).unwrap();
        assert_eq!(sorted_entries(&s).len(), 1);
        assert!(sorted_entries(&other).is_empty());
        s.rollback(tx).unwrap();
    }

    #[test]
    fn abandoned_scan_releases_its_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_with(&tmp, StoreConfig::default());
        let mut s = store.session();
        let entries: Vec<Entry> = (0..5).map(|i| Entry::new(format!("n{i}"), Vec::new())).collect();
        s.transaction(|s| s.insert(&entries)).unwrap();
        {
            let mut scan = s.all_entries().unwrap();
            assert!(scan.next().is_some());
            assert_eq!(store.directory().active_snapshots(), 1);
        }
        assert_eq!(store.directory().active_snapshots(), 0);
    }

    #[test]
    fn foreign_file_names_are_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_with(&tmp, StoreConfig::default());
        let mut s = store.session();
        let tx = s.begin().unwrap();
        s.tx.open_for_write("all/.stray").unwrap().finish().unwrap();
        s.commit(tx).unwrap();

        let ids: Vec<_> = s.all_ids().unwrap().collect();
        assert_eq!(ids.len(), 1);
        assert!(matches!(ids[0], Err(StoreError::CorruptObject { .. })));
    }

    #[test]
    fn check_reports_inconsistencies() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_with(&tmp, StoreConfig::default());
        let mut s = store.session();
        s.transaction(|s| {
            s.insert(&[
                Entry::root("fine", Vec::new()),
                Entry::root("unmarked", Vec::new()),
            ])
        })
        .unwrap();
        assert!(s.check().unwrap().is_consistent());

        let tx = s.begin().unwrap();
        s.tx.remove("root/unmarked").unwrap();
        s.tx.open_for_write("root/dangling").unwrap().finish().unwrap();
        let mut w = s.tx.open_for_write("all/garbled").unwrap();
        w.write_all(b"\xff\xff").unwrap();
        w.finish().unwrap();
        s.commit(tx).unwrap();

        let report = s.check().unwrap();
        assert!(!report.is_consistent());
        assert_eq!(report.objects, 3);
        assert_eq!(report.root_markers, 2);
        assert_eq!(report.dangling_markers, vec![EntryId::from("dangling")]);
        assert_eq!(report.root_flag_mismatches, vec![EntryId::from("unmarked")]);
        assert_eq!(report.unreadable.len(), 1);
        assert_eq!(report.unreadable[0].0, PathBuf::from("all/garbled"));
    }
}
