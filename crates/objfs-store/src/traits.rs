use objfs_txdir::TxHandle;
use objfs_types::{EntryId, Record};
use tracing::warn;

use crate::error::StoreResult;
use crate::roots::RootScan;
use crate::scan::{ClearReport, EntryScan, IdScan};

/// Transaction control over a store session.
///
/// Transactions nest: `begin` inside an open transaction opens a child
/// whose commit only hands its changes to the parent.
pub trait Transactional {
    fn begin(&mut self) -> StoreResult<TxHandle>;

    /// Commit the innermost transaction. A top-level commit fails with
    /// [`StoreError::CommitConflict`](crate::StoreError::CommitConflict) if a
    /// concurrent commit changed the same files; the caller may retry.
    fn commit(&mut self, handle: TxHandle) -> StoreResult<()>;

    /// Discard `handle` and every transaction nested in it.
    fn rollback(&mut self, handle: TxHandle) -> StoreResult<()>;

    fn in_transaction(&self) -> bool;

    /// Run `f` in a (possibly nested) transaction: commit on `Ok`, roll
    /// back on `Err`.
    fn transaction<T, F>(&mut self, f: F) -> StoreResult<T>
    where
        Self: Sized,
        F: FnOnce(&mut Self) -> StoreResult<T>,
    {
        let handle = self.begin()?;
        match f(self) {
            Ok(value) => {
                self.commit(handle)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = self.rollback(handle) {
                    warn!(error = %rollback_err, "rollback after failed transaction body");
                }
                Err(e)
            }
        }
    }
}

/// Id-addressed entry storage.
///
/// Invariants every implementation keeps:
/// - An entry exists iff its object file exists; the object file is the
///   source of truth.
/// - `insert` overwrites in full and resolves the root marker in the same
///   transaction as the object write.
/// - Deleting an absent id succeeds.
/// - Mutations require an open transaction; reads work with or without one.
pub trait ObjectStore<E: Record> {
    /// Read one entry. Fails with
    /// [`StoreError::NotFound`](crate::StoreError::NotFound) if absent.
    fn get_one(&self, id: &EntryId) -> StoreResult<E>;

    /// Read several entries, one result per id in input order.
    ///
    /// Default implementation calls `get_one()` for each id.
    fn get(&self, ids: &[EntryId]) -> Vec<StoreResult<E>> {
        ids.iter().map(|id| self.get_one(id)).collect()
    }

    /// Write entries and their root markers. The batch is all-or-nothing
    /// within the current transaction.
    fn insert(&mut self, entries: &[E]) -> StoreResult<()>;

    /// Remove entries and their root markers.
    fn delete(&mut self, ids: &[EntryId]) -> StoreResult<()>;

    /// Remove the given entries by id.
    fn delete_entries(&mut self, entries: &[E]) -> StoreResult<()> {
        let ids: Vec<EntryId> = entries.iter().map(|e| e.id().clone()).collect();
        self.delete(&ids)
    }

    /// One flag per id in input order.
    fn exists(&self, ids: &[EntryId]) -> StoreResult<Vec<bool>>;
}

/// The set of entries flagged as roots.
pub trait RootSet<E: Record> {
    /// Ids of all root markers.
    fn root_ids(&self) -> StoreResult<IdScan<'_>>;

    /// Every root entry. A marker without an object surfaces as
    /// [`StoreError::Consistency`](crate::StoreError::Consistency).
    fn root_entries(&self) -> StoreResult<RootScan<'_, E>>;

    fn is_root(&self, id: &EntryId) -> StoreResult<bool>;
}

/// Whole-store enumeration.
///
/// Scans are lazy and finite. Their order follows directory enumeration and
/// must not be relied on. Abandoning a scan early releases everything it
/// holds.
pub trait BulkScan<E: Record> {
    fn all_ids(&self) -> StoreResult<IdScan<'_>>;

    fn all_entries(&self) -> StoreResult<EntryScan<'_, E>>;

    /// Remove every object and root marker in the current transaction. The
    /// object and root directories stay in place.
    fn clear(&mut self) -> StoreResult<ClearReport>;
}
