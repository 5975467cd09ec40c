use std::collections::VecDeque;

use objfs_txdir::FileList;
use objfs_types::{EntryId, Record};

use crate::error::{StoreError, StoreResult};
use crate::scan::{entry_id, IdScan};
use crate::store::StoreSession;
use crate::traits::RootSet;

/// Lazy sequence of root entries.
///
/// Walks the marker tree and loads the object behind each marker from the
/// same snapshot. A marker whose object is missing yields
/// [`StoreError::Consistency`] for that id; the scan continues after it.
pub struct RootScan<'s, E> {
    session: &'s StoreSession<E>,
    markers: FileList<'s>,
    chunk: VecDeque<StoreResult<E>>,
    exhausted: bool,
}

impl<E: Record> RootScan<'_, E> {
    fn fill(&mut self) {
        while self.chunk.len() < self.session.chunk_size {
            let Some(next) = self.markers.next() else {
                self.exhausted = true;
                break;
            };
            let item = next
                .map_err(StoreError::from)
                .and_then(|marker| entry_id(&marker))
                .and_then(|id| self.load(id));
            self.chunk.push_back(item);
        }
    }

    fn load(&self, id: EntryId) -> StoreResult<E> {
        let path = self.session.mapper.object_path(&id);
        let opened = self.markers.open_for_read(&path);
        match self.session.decode_object(&path, &id, opened) {
            Err(StoreError::NotFound(_)) => Err(StoreError::Consistency {
                id,
                reason: "root marker has no object file".into(),
            }),
            other => other,
        }
    }
}

impl<E: Record> Iterator for RootScan<'_, E> {
    type Item = StoreResult<E>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.chunk.is_empty() && !self.exhausted {
            self.fill();
        }
        self.chunk.pop_front()
    }
}

impl<E: Record> RootSet<E> for StoreSession<E> {
    fn root_ids(&self) -> StoreResult<IdScan<'_>> {
        Ok(IdScan::new(self.tx.list_files(self.mapper.root_dir())?))
    }

    fn root_entries(&self) -> StoreResult<RootScan<'_, E>> {
        Ok(RootScan {
            session: self,
            markers: self.tx.list_files(self.mapper.root_dir())?,
            chunk: VecDeque::with_capacity(self.chunk_size),
            exhausted: false,
        })
    }

    fn is_root(&self, id: &EntryId) -> StoreResult<bool> {
        if id.validate().is_err() {
            return Ok(false);
        }
        Ok(self.tx.exists(self.mapper.root_path(id))?)
    }
}
