//! Journal and checkpoints for crash recovery.
//!
//! Every metadata change (staging a generation, committing a batch,
//! discarding a staged generation, relocating a chunk during compaction) is
//! appended to the journal before it becomes visible. On open, the engine
//! loads the latest checkpoint and replays the journal entries after it.
//!
//! Journal file layout: magic, version, base sequence, then entries framed
//! as `len | payload | crc32`. A torn tail left by a crash is truncated on
//! open.

use crate::error::{EngineError, Result};
use crate::types::{ChunkId, GroupId, RawMeta, Tag, Timestamp};
use parking_lot::{Mutex, MutexGuard};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for the journal file.
const JOURNAL_MAGIC: &[u8; 4] = b"JNL\0";

/// Current journal format version.
const JOURNAL_VERSION: u8 = 1;

/// Magic + version + base sequence.
const JOURNAL_HEADER_SIZE: u64 = 4 + 1 + 8;

/// Magic bytes for the checkpoint file.
const CHECKPOINT_MAGIC: &[u8; 4] = b"CKP\0";

/// Current checkpoint format version.
const CHECKPOINT_VERSION: u8 = 1;

/// Upper bound for one framed payload.
const MAX_FRAME_LEN: usize = 1 << 30;

/// A single journal entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Unique, increasing sequence number.
    pub seq: u64,
    /// Time the entry was appended.
    pub timestamp: Timestamp,
    pub operation: JournalOp,
}

/// One chunk of a committed batch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitEntry {
    pub id: ChunkId,
    pub stage_seq: u64,
    pub chain_ver: u32,
    pub timestamp: Timestamp,
}

/// Operations recorded in the journal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum JournalOp {
    /// A generation was staged. Written before its data.
    Stage {
        id: ChunkId,
        meta: RawMeta,
        tag: Option<Tag>,
        base_ver: u32,
    },
    /// Staged generations were published.
    Commit { entries: Vec<CommitEntry> },
    /// A staged generation was dropped.
    Discard { id: ChunkId, stage_seq: u64 },
    /// A committed generation was copied to a new slot.
    Relocate {
        id: ChunkId,
        group: GroupId,
        pos: u64,
        chunk_ver: u32,
    },
}

struct JournalState {
    writer: BufWriter<File>,
    next_seq: u64,
    /// Entries appended since the journal was last cleared.
    pending: u64,
    /// File length up to the end of the last complete entry.
    len: u64,
    /// A failed append could not be rolled back; the tail is unknown.
    poisoned: bool,
    /// Bytes of the next frame to write before failing.
    #[cfg(test)]
    fail_after: Option<usize>,
}

/// Append-only metadata journal.
pub struct Journal {
    path: PathBuf,
    state: Mutex<JournalState>,
}

/// Exclusive access to the journal.
///
/// Commits, discards, relocations and checkpoints validate and mutate
/// engine state while holding the guard, so their journal order matches the
/// order in which they took effect.
pub struct JournalGuard<'a> {
    path: &'a Path,
    state: MutexGuard<'a, JournalState>,
}

impl Journal {
    /// Open or create the journal, returning the entries it holds.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Vec<JournalEntry>)> {
        let path = path.as_ref().to_path_buf();

        let (base_seq, entries, len) = if path.exists() {
            let file = OpenOptions::new().read(true).write(true).open(&path)?;
            let mut reader = BufReader::new(&file);
            let base_seq = read_header(&mut reader)?;

            let mut entries = Vec::new();
            let mut valid_len = JOURNAL_HEADER_SIZE;
            while let Ok((entry, frame_len)) = read_frame::<JournalEntry>(&mut reader) {
                valid_len += frame_len;
                entries.push(entry);
            }
            drop(reader);

            if file.metadata()?.len() > valid_len {
                tracing::warn!(
                    path = %path.display(),
                    valid_len,
                    "truncating torn journal tail"
                );
                file.set_len(valid_len)?;
            }
            // Replayed entries may only have reached the page cache.
            file.sync_all()?;
            (base_seq, entries, valid_len)
        } else {
            write_fresh(&path, 1)?;
            (1, Vec::new(), JOURNAL_HEADER_SIZE)
        };

        let next_seq = entries
            .iter()
            .map(|e| e.seq + 1)
            .max()
            .unwrap_or(base_seq)
            .max(base_seq);
        let writer = BufWriter::new(OpenOptions::new().append(true).open(&path)?);

        let journal = Self {
            path,
            state: Mutex::new(JournalState {
                writer,
                next_seq,
                pending: entries.len() as u64,
                len,
                poisoned: false,
                #[cfg(test)]
                fail_after: None,
            }),
        };
        Ok((journal, entries))
    }

    pub fn lock(&self) -> JournalGuard<'_> {
        JournalGuard {
            path: &self.path,
            state: self.state.lock(),
        }
    }

    /// Append one operation, returning its sequence number.
    pub fn append(&self, operation: JournalOp, sync: bool) -> Result<u64> {
        self.lock().append(operation, sync)
    }

    /// Make every appended entry durable, then run `then` before any other
    /// entry can be appended.
    pub fn sync_then(&self, then: impl FnOnce()) -> Result<()> {
        let mut guard = self.lock();
        guard.sync()?;
        then();
        Ok(())
    }

    /// Entries appended since the last clear.
    pub fn pending(&self) -> u64 {
        self.state.lock().pending
    }

    /// Make the next append fail after writing `keep` bytes of its frame.
    #[cfg(test)]
    pub(crate) fn fail_next_append(&self, keep: usize) {
        self.state.lock().fail_after = Some(keep);
    }
}

impl JournalGuard<'_> {
    /// Append one operation, returning its sequence number.
    ///
    /// On failure the journal is cut back to its last complete entry and the
    /// sequence number is not consumed.
    pub fn append(&mut self, operation: JournalOp, sync: bool) -> Result<u64> {
        if self.state.poisoned {
            return Err(EngineError::Corruption(
                "Journal tail is unknown after a failed append".into(),
            ));
        }

        let seq = self.state.next_seq;
        let entry = JournalEntry {
            seq,
            timestamp: Timestamp::now(),
            operation,
        };
        let frame = encode_frame(&entry)?;

        if let Err(err) = self.write(&frame, sync) {
            tracing::warn!(seq, error = %err, "journal append failed, rolling back");
            if let Err(rollback) = self.rollback() {
                tracing::error!(seq, error = %rollback, "journal rollback failed");
                self.state.poisoned = true;
            }
            return Err(err);
        }

        self.state.len += frame.len() as u64;
        self.state.next_seq += 1;
        self.state.pending += 1;
        Ok(seq)
    }

    fn write(&mut self, frame: &[u8], sync: bool) -> Result<()> {
        let state = &mut *self.state;
        let writer = &mut state.writer;

        #[cfg(test)]
        if let Some(keep) = state.fail_after.take() {
            writer.write_all(&frame[..keep.min(frame.len())])?;
            writer.flush()?;
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "injected failure").into());
        }

        writer.write_all(frame)?;
        writer.flush()?;
        if sync {
            writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Drop buffered bytes and cut the file back to the last complete entry.
    fn rollback(&mut self) -> Result<()> {
        OpenOptions::new()
            .write(true)
            .open(self.path)?
            .set_len(self.state.len)?;
        let fresh = BufWriter::new(OpenOptions::new().append(true).open(self.path)?);
        let (_, _unwritten) = std::mem::replace(&mut self.state.writer, fresh).into_parts();
        Ok(())
    }

    /// Make every appended entry durable.
    pub fn sync(&mut self) -> Result<()> {
        self.state.writer.flush()?;
        self.state.writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Sequence number of the last appended entry, 0 if none.
    pub fn last_seq(&self) -> u64 {
        self.state.next_seq - 1
    }

    /// Drop every entry. Sequence numbers keep increasing across clears.
    pub fn clear(&mut self) -> Result<()> {
        self.state.writer.flush()?;
        write_fresh(self.path, self.state.next_seq)?;
        self.state.writer = BufWriter::new(OpenOptions::new().append(true).open(self.path)?);
        self.state.pending = 0;
        self.state.len = JOURNAL_HEADER_SIZE;
        self.state.poisoned = false;
        Ok(())
    }
}

fn write_fresh(path: &Path, base_seq: u64) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(JOURNAL_MAGIC)?;
    file.write_all(&[JOURNAL_VERSION])?;
    file.write_all(&base_seq.to_le_bytes())?;
    file.sync_all()?;
    Ok(())
}

fn read_header(reader: &mut impl Read) -> Result<u64> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != JOURNAL_MAGIC {
        return Err(EngineError::InvalidFormat("Invalid journal magic".into()));
    }

    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    if version[0] != JOURNAL_VERSION {
        return Err(EngineError::InvalidFormat(format!(
            "Unsupported journal version: {}",
            version[0]
        )));
    }

    let mut base_seq = [0u8; 8];
    reader.read_exact(&mut base_seq)?;
    Ok(u64::from_le_bytes(base_seq))
}

fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let encoded = rmp_serde::to_vec(value)?;

    let mut frame = Vec::with_capacity(encoded.len() + 8);
    frame.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
    frame.extend_from_slice(&encoded);
    frame.extend_from_slice(&crc32fast::hash(&encoded).to_le_bytes());
    Ok(frame)
}

fn write_frame<T: Serialize>(writer: &mut impl Write, value: &T) -> Result<()> {
    writer.write_all(&encode_frame(value)?)?;
    Ok(())
}

/// Read one frame, returning the value and the number of bytes consumed.
fn read_frame<T: DeserializeOwned>(reader: &mut impl Read) -> Result<(T, u64)> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_FRAME_LEN {
        return Err(EngineError::Corruption("Frame too large".into()));
    }

    let mut encoded = vec![0u8; len];
    reader.read_exact(&mut encoded)?;

    let mut checksum_bytes = [0u8; 4];
    reader.read_exact(&mut checksum_bytes)?;
    let stored_checksum = u32::from_le_bytes(checksum_bytes);

    let computed_checksum = crc32fast::hash(&encoded);
    if stored_checksum != computed_checksum {
        return Err(EngineError::Corruption("Frame checksum mismatch".into()));
    }

    let value = rmp_serde::from_slice(&encoded)?;
    Ok((value, 4 + len as u64 + 4))
}

/// A committed chunk as stored in a checkpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckpointChunk {
    pub id: ChunkId,
    pub meta: RawMeta,
    pub tag: Option<Tag>,
}

/// An uncommitted generation as stored in a checkpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckpointStaged {
    pub id: ChunkId,
    pub meta: RawMeta,
    pub tag: Option<Tag>,
    pub chain_ver: u32,
    pub stage_seq: u64,
    pub base_ver: u32,
}

/// Snapshot of the index and ledger.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Last journal sequence reflected in the snapshot.
    pub last_seq: u64,
    pub committed: Vec<CheckpointChunk>,
    pub uncommitted: Vec<CheckpointStaged>,
}

impl Checkpoint {
    /// Write atomically: to a temporary file first, then renamed over `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let tmp_path = path.with_extension("tmp");

        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            writer.write_all(CHECKPOINT_MAGIC)?;
            writer.write_all(&[CHECKPOINT_VERSION])?;
            write_frame(&mut writer, self)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        fs::rename(&tmp_path, path)?;
        if let Some(dir) = path.parent() {
            File::open(dir)?.sync_all()?;
        }
        Ok(())
    }

    /// Load the checkpoint at `path`, or `None` if there is none yet.
    pub fn load(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(None);
        }

        let mut reader = BufReader::new(File::open(path)?);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != CHECKPOINT_MAGIC {
            return Err(EngineError::InvalidFormat("Invalid checkpoint magic".into()));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != CHECKPOINT_VERSION {
            return Err(EngineError::InvalidFormat(format!(
                "Unsupported checkpoint version: {}",
                version[0]
            )));
        }

        let (checkpoint, _) = read_frame(&mut reader)?;
        Ok(Some(checkpoint))
    }
}
