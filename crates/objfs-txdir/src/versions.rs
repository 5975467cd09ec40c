//! Commit log shared by every handle on a directory.
//!
//! Each top-level commit appends one record naming the paths it touched, so
//! a handle can see commits made through other handles before it checks for
//! conflicts or serves a snapshot read.
//!
//! On-disk format:
//! ```text
//! [8 bytes: magic "OBJFSVL1"]
//! [8 bytes: generation (little-endian u64)]
//! repeated:
//!   [4 bytes: payload length (little-endian u32)]
//!   [4 bytes: CRC32 of payload (little-endian u32)]
//!   [N bytes: payload (bincode-serialized VersionRecord)]
//! ```
//!
//! A torn trailing record is ignored and overwritten by the next append.
//! Compaction rewrites the log as one checkpoint under a new generation,
//! which tells other handles to start reading from the top again.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{TxError, TxResult};
use crate::journal;

const MAGIC: &[u8; 8] = b"OBJFSVL1";
const HEADER_LEN: u64 = 16;

/// What a commit did with the content it replaced or removed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum Prior {
    /// The path held no file.
    Absent,
    /// The old file was moved under `.txn/retained/<seq>/` for older
    /// snapshots.
    Retained,
    /// No snapshot could still see the old file, so it was dropped.
    Dropped,
}

/// Paths touched by one commit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct VersionRecord {
    pub seq: u64,
    pub paths: Vec<(PathBuf, Prior)>,
}

/// Records appended since the previous read.
#[derive(Debug, Default)]
pub(crate) struct LogDelta {
    /// The log was compacted: everything known from before is stale.
    pub reset: bool,
    pub records: Vec<VersionRecord>,
}

/// Read/append cursor over the log. Every call must happen under the
/// directory lock: shared for [`read_new`](Self::read_new), exclusive for
/// the rest.
#[derive(Debug)]
pub(crate) struct VersionLog {
    path: PathBuf,
    generation: Option<u64>,
    offset: u64,
}

impl VersionLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            generation: None,
            offset: HEADER_LEN,
        }
    }

    /// Bytes of intact log read so far.
    pub fn len(&self) -> u64 {
        self.offset
    }

    pub fn read_new(&mut self) -> TxResult<LogDelta> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(LogDelta::default()),
            Err(e) => return Err(e.into()),
        };
        let mut header = [0u8; HEADER_LEN as usize];
        match file.read_exact(&mut header) {
            Ok(()) => {}
            // Crashed while creating the log; the next append rewrites it.
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(LogDelta::default()),
            Err(e) => return Err(e.into()),
        }
        if &header[..8] != MAGIC {
            return Err(TxError::Journal(format!(
                "{} is not a version log",
                self.path.display()
            )));
        }

        let generation = u64::from_le_bytes(header[8..].try_into().unwrap_or_default());
        let mut delta = LogDelta::default();
        if self.generation != Some(generation) {
            delta.reset = self.generation.is_some();
            self.generation = Some(generation);
            self.offset = HEADER_LEN;
        }

        file.seek(SeekFrom::Start(self.offset))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let mut pos = 0;
        while let Some((payload, used)) = journal::unframe(&bytes[pos..]) {
            let record = bincode::deserialize::<VersionRecord>(payload)
                .map_err(|e| TxError::Journal(format!("undecodable version record: {e}")))?;
            delta.records.push(record);
            pos += used;
        }
        self.offset += pos as u64;
        Ok(delta)
    }

    /// Append after the last intact record. Call [`read_new`](Self::read_new)
    /// first so that the cursor is at the end.
    pub fn append(&mut self, record: &VersionRecord, sync: bool) -> TxResult<()> {
        let frame = journal::frame(record)?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;

        if self.generation.is_none() {
            file.set_len(0)?;
            file.write_all(&header(0))?;
            self.generation = Some(0);
            self.offset = HEADER_LEN;
        }
        file.set_len(self.offset)?;
        file.seek(SeekFrom::Start(self.offset))?;
        file.write_all(&frame)?;
        if sync {
            file.sync_data()?;
        }
        self.offset += frame.len() as u64;
        Ok(())
    }

    /// Replace the log with a single checkpoint at `seq`. Only valid while
    /// no snapshot older than `seq` is pinned anywhere.
    pub fn compact(&mut self, seq: u64, sync: bool) -> TxResult<()> {
        let generation = self.generation.map_or(0, |g| g.wrapping_add(1));
        let mut bytes = header(generation).to_vec();
        bytes.extend(journal::frame(&VersionRecord {
            seq,
            paths: Vec::new(),
        })?);

        let tmp = self.path.with_extension("compact");
        write_file(&tmp, &bytes, sync)?;
        fs::rename(&tmp, &self.path)?;

        debug!(seq, generation, dropped = self.offset, "compacted version log");
        self.generation = Some(generation);
        self.offset = bytes.len() as u64;
        Ok(())
    }
}

fn header(generation: u64) -> [u8; HEADER_LEN as usize] {
    let mut out = [0u8; HEADER_LEN as usize];
    out[..8].copy_from_slice(MAGIC);
    out[8..].copy_from_slice(&generation.to_le_bytes());
    out
}

fn write_file(path: &Path, bytes: &[u8], sync: bool) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    if sync {
        file.sync_all()?;
    }
    Ok(())
}
