//! Generations and read handles.

use crate::checksum;
use crate::error::{EngineError, Result};
use crate::groups::SlotRef;
use crate::types::{ChunkId, FdAndOffset, GroupId, RawMeta, Tag, Timestamp};
use std::sync::Arc;

/// One immutable version of a chunk.
///
/// The generation owns a reference to the slot holding its bytes, so the
/// bytes stay readable for as long as any `Arc<Generation>` is alive.
#[derive(Debug)]
pub struct Generation {
    meta: RawMeta,
    tag: Option<Tag>,
    slot: Option<SlotRef>,
}

impl Generation {
    /// Build a generation; `meta.group` and `meta.pos` are taken from `slot`.
    pub fn new(mut meta: RawMeta, tag: Option<Tag>, slot: Option<SlotRef>) -> Self {
        match &slot {
            Some(slot) => {
                meta.group = slot.group_id();
                meta.pos = slot.pos();
            }
            None => {
                meta.group = GroupId::NONE;
                meta.pos = 0;
            }
        }
        Self { meta, tag, slot }
    }

    pub fn meta(&self) -> &RawMeta {
        &self.meta
    }

    pub fn tag(&self) -> Option<Tag> {
        self.tag
    }

    pub fn slot(&self) -> Option<&SlotRef> {
        self.slot.as_ref()
    }

    pub fn is_removed(&self) -> bool {
        self.meta.removed
    }

    /// Same generation with a different commit timestamp and chain version.
    pub(crate) fn republish(&self, chain_ver: u32, timestamp: Timestamp) -> Self {
        let mut meta = self.meta;
        meta.chain_ver = chain_ver;
        meta.timestamp = timestamp;
        Self {
            meta,
            tag: self.tag,
            slot: self.slot.clone(),
        }
    }

    /// Read up to `len` bytes from `offset`, clipped to the generation length.
    pub fn read(&self, offset: u32, len: u32) -> Result<Vec<u8>> {
        if offset >= self.meta.len {
            return Ok(Vec::new());
        }
        let len = len.min(self.meta.len - offset);
        let mut buf = vec![0u8; len as usize];
        if let Some(slot) = &self.slot {
            slot.read_at(offset, &mut buf)?;
        }
        Ok(buf)
    }

    pub fn read_all(&self) -> Result<Vec<u8>> {
        self.read(0, self.meta.len)
    }

    /// Whether the slot holds bytes matching the stored checksum.
    pub(crate) fn is_intact(&self) -> Result<bool> {
        Ok(checksum::checksum(&self.read_all()?) == self.meta.checksum)
    }
}

impl Drop for Generation {
    fn drop(&mut self) {
        // Until the record replacing this generation is durable, a crash may
        // bring it back, so its bytes must stay as they are.
        if let Some(slot) = &self.slot {
            slot.guard(self.meta.len);
        }
    }
}

/// Read handle to a committed generation of a chunk.
///
/// The handle pins the generation: its bytes remain valid after newer
/// generations are committed, until the handle is dropped.
#[derive(Clone, Debug)]
pub struct Chunk {
    id: ChunkId,
    generation: Arc<Generation>,
    uncommitted: bool,
}

impl Chunk {
    pub(crate) fn new(id: ChunkId, generation: Arc<Generation>, uncommitted: bool) -> Self {
        Self {
            id,
            generation,
            uncommitted,
        }
    }

    pub fn id(&self) -> &ChunkId {
        &self.id
    }

    pub fn raw_meta(&self) -> &RawMeta {
        self.generation.meta()
    }

    pub fn tag(&self) -> Option<Tag> {
        self.generation.tag()
    }

    /// Whether a staged generation for this id was pending at lookup time.
    pub fn uncommitted(&self) -> bool {
        self.uncommitted
    }

    /// Location of the bytes, for callers doing their own I/O. `None` for
    /// chunks without data.
    pub fn fd_and_offset(&self) -> Option<FdAndOffset> {
        self.generation.slot().map(SlotRef::fd_and_offset)
    }

    pub fn read(&self, offset: u32, len: u32) -> Result<Vec<u8>> {
        self.generation.read(offset, len)
    }

    /// Read the whole content and check it against the stored checksum.
    pub fn read_verified(&self) -> Result<Vec<u8>> {
        let data = self.generation.read_all()?;
        let actual = checksum::checksum(&data);
        let expected = self.raw_meta().checksum;
        if actual != expected {
            return Err(EngineError::Corruption(format!(
                "Chunk {} checksum mismatch: stored {:08x}, computed {:08x}",
                self.id, expected, actual
            )));
        }
        Ok(data)
    }

    pub(crate) fn generation(&self) -> &Arc<Generation> {
        &self.generation
    }
}
