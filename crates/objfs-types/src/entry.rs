use serde::{Deserialize, Serialize};

use crate::id::EntryId;

/// Anything the file store can persist.
///
/// The store only needs to know an entry's id (which fixes its file name)
/// and whether it belongs to the root set. Everything else is the payload,
/// which only the configured codec understands.
pub trait Record {
    /// The entry's unique id.
    fn id(&self) -> &EntryId;

    /// `true` if the entry is a graph root.
    fn is_root(&self) -> bool;
}

/// General-purpose entry: id, root flag and an opaque byte payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: EntryId,
    pub root: bool,
    pub payload: Vec<u8>,
}

impl Entry {
    /// A non-root entry.
    pub fn new(id: impl Into<EntryId>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            root: false,
            payload: payload.into(),
        }
    }

    /// A root entry.
    pub fn root(id: impl Into<EntryId>, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(id, payload).with_root(true)
    }

    pub fn with_root(mut self, root: bool) -> Self {
        self.root = root;
        self
    }
}

impl Record for Entry {
    fn id(&self) -> &EntryId {
        &self.id
    }

    fn is_root(&self) -> bool {
        self.root
    }
}
