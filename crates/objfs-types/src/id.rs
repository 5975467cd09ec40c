use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Longest id accepted, in bytes. Matches the common filename limit.
pub const MAX_ID_LEN: usize = 255;

/// Caller-assigned identifier of a stored entry.
///
/// An `EntryId` is an opaque byte string. It doubles as the file name of the
/// entry's object file and root marker, so it must be a filesystem-safe name
/// (see [`EntryId::validate`]). Hex-encoded content hashes are the typical
/// choice.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(Vec<u8>);

impl EntryId {
    /// Wrap raw bytes without validation.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Wrap a string and check that it is usable as a file name.
    pub fn parse(s: &str) -> Result<Self, TypeError> {
        let id = Self(s.as_bytes().to_vec());
        id.validate()?;
        Ok(id)
    }

    /// Id made of the hex encoding of `bytes`. Always filesystem-safe.
    pub fn from_hex_bytes(bytes: &[u8]) -> Self {
        Self(hex::encode(bytes).into_bytes())
    }

    /// The raw id bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The id as a file name. Only meaningful for validated ids.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    /// Hex encoding of the raw id bytes. Drives trie sharding.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Short hex representation (first 4 bytes).
    pub fn short_hex(&self) -> String {
        let end = self.0.len().min(4);
        hex::encode(&self.0[..end])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Check that the id can be used verbatim as a file name.
    ///
    /// Rejected: empty ids, ids longer than [`MAX_ID_LEN`], non-UTF-8 ids,
    /// ids containing a path separator or NUL, and ids starting with `.`
    /// (which also covers `.` and `..`).
    pub fn validate(&self) -> Result<(), TypeError> {
        let reason = if self.0.is_empty() {
            Some("empty id")
        } else if self.0.len() > MAX_ID_LEN {
            Some("id longer than 255 bytes")
        } else if std::str::from_utf8(&self.0).is_err() {
            Some("id is not valid UTF-8")
        } else if self.0.iter().any(|b| matches!(b, b'/' | b'\\' | 0)) {
            Some("id contains a path separator or NUL")
        } else if self.0[0] == b'.' {
            Some("id starts with '.'")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(TypeError::InvalidId {
                id: self.to_string(),
                reason,
            }),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryId({})", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl From<&str> for EntryId {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<String> for EntryId {
    fn from(s: String) -> Self {
        Self(s.into_bytes())
    }
}

impl AsRef<[u8]> for EntryId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
