//! Commit journal: the redo record written before a commit touches the tree.
//!
//! Commits are serialized by the directory lock, so there is at most one
//! journal, at `.txn/journal`. Its framing is shared with the version log:
//! ```text
//! [4 bytes: payload length (little-endian u32)]
//! [4 bytes: CRC32 of payload (little-endian u32)]
//! [N bytes: payload (bincode-serialized JournalRecord)]
//! ```
//!
//! A record that is short, fails the CRC check, or does not decode is a torn
//! write: the commit never reached its apply phase and is discarded.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{TxError, TxResult};
use crate::path::Layout;
use crate::versions::{Prior, VersionRecord};

/// Frame header size: 4 bytes length + 4 bytes CRC.
const HEADER_SIZE: usize = 8;

/// A single file operation of a commit. Paths are relative to the root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum JournalOp {
    /// Move a staged file over `target`.
    Write {
        staged: PathBuf,
        target: PathBuf,
        prior: Prior,
    },
    /// Remove `target` if present.
    Delete { target: PathBuf, prior: Prior },
}

impl JournalOp {
    fn target(&self) -> &Path {
        match self {
            Self::Write { target, .. } | Self::Delete { target, .. } => target,
        }
    }

    fn prior(&self) -> Prior {
        match self {
            Self::Write { prior, .. } | Self::Delete { prior, .. } => *prior,
        }
    }
}

/// Everything needed to redo one top-level commit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct JournalRecord {
    pub seq: u64,
    pub ops: Vec<JournalOp>,
}

impl JournalRecord {
    pub fn version_record(&self) -> VersionRecord {
        VersionRecord {
            seq: self.seq,
            paths: self
                .ops
                .iter()
                .map(|op| (op.target().to_path_buf(), op.prior()))
                .collect(),
        }
    }
}

/// Outcome of crash recovery at open time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Interrupted commits that were finished from their journal.
    pub replayed: usize,
    /// Staging areas of sessions that ended without committing.
    pub discarded: usize,
}

/// Length- and CRC-prefixed bincode encoding of `value`.
pub(crate) fn frame<T: Serialize>(value: &T) -> TxResult<Vec<u8>> {
    let payload = bincode::serialize(value).map_err(|e| TxError::Journal(e.to_string()))?;
    let length = u32::try_from(payload.len())
        .map_err(|_| TxError::Journal(format!("record of {} bytes is too large", payload.len())))?;

    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&length.to_le_bytes());
    out.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// The payload of the first intact frame in `bytes`, and the number of
/// bytes it occupies. `None` if the frame is short or fails its CRC.
pub(crate) fn unframe(bytes: &[u8]) -> Option<(&[u8], usize)> {
    if bytes.len() < HEADER_SIZE {
        return None;
    }
    let length = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let expected_crc = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    let payload = bytes.get(HEADER_SIZE..HEADER_SIZE + length)?;
    if crc32fast::hash(payload) != expected_crc {
        return None;
    }
    Some((payload, HEADER_SIZE + length))
}

pub(crate) fn write(path: &Path, record: &JournalRecord, sync: bool) -> TxResult<()> {
    let bytes = frame(record)?;
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(&bytes)?;
    writer.flush()?;
    if sync {
        writer.get_ref().sync_all()?;
    }

    debug!(seq = record.seq, ops = record.ops.len(), "journal written");
    Ok(())
}

/// Read a journal. `Ok(None)` if it is missing or torn.
pub(crate) fn read(path: &Path) -> TxResult<Option<JournalRecord>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let payload = match unframe(&bytes) {
        Some((payload, used)) if used == bytes.len() => payload,
        _ => {
            warn!(path = %path.display(), len = bytes.len(), "torn journal");
            return Ok(None);
        }
    };

    match bincode::deserialize::<JournalRecord>(payload) {
        Ok(record) => Ok(Some(record)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to decode journal");
            Ok(None)
        }
    }
}

/// Apply a journaled commit to the tree.
///
/// This is both the normal apply path and crash recovery, so every step is
/// idempotent: a staged file that is already gone was moved by an earlier
/// attempt, old content already parked under `retained/` is not parked
/// again, and deletes ignore absent targets.
pub(crate) fn replay(layout: &Layout, record: &JournalRecord) -> TxResult<()> {
    for op in &record.ops {
        let target = layout.root().join(op.target());
        match op {
            JournalOp::Write { staged, .. } => {
                let staged = layout.root().join(staged);
                if !staged.exists() {
                    continue;
                }
                if op.prior() == Prior::Retained {
                    park(layout, record.seq, op.target(), &target)?;
                }
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::rename(&staged, &target)?;
            }
            JournalOp::Delete { .. } => {
                if op.prior() == Prior::Retained {
                    park(layout, record.seq, op.target(), &target)?;
                }
                remove_if_present(&target)?;
            }
        }
    }
    Ok(())
}

/// Move the live file at `target` aside for snapshots older than `seq`,
/// unless an earlier attempt already did.
fn park(layout: &Layout, seq: u64, rel: &Path, target: &Path) -> TxResult<()> {
    let kept = layout.retained_file(seq, rel);
    if kept.exists() || !target.is_file() {
        return Ok(());
    }
    if let Some(parent) = kept.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(target, &kept)?;
    Ok(())
}

pub(crate) fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
