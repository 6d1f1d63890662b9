//! Group file: a preallocated backing file divided into equal slots.

use crate::error::{EngineError, Result};
use crate::types::GroupId;
use fs2::FileExt as _;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// Magic bytes for group files.
const GROUP_MAGIC: &[u8; 4] = b"GRP\0";

/// Current group format version.
const GROUP_VERSION: u8 = 1;

/// Size of the header region; slots start right after it.
pub const GROUP_HEADER_SIZE: u64 = 4096;

/// Encoded header bytes actually used within the header region.
const HEADER_USED: usize = 4 + 1 + 4 + 4 + 4 + 1 + 4;

/// Extension of group file names.
pub const GROUP_EXTENSION: &str = "grp";

/// Layout parameters of a group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GroupLayout {
    pub id: GroupId,
    pub slot_size: u32,
    pub slot_count: u32,
    pub ultra: bool,
}

impl GroupLayout {
    pub fn capacity(&self) -> u64 {
        self.slot_size as u64 * self.slot_count as u64
    }

    pub fn file_len(&self) -> u64 {
        GROUP_HEADER_SIZE + self.capacity()
    }

    /// Byte offset of a slot within the file.
    pub fn slot_offset(&self, slot: u32) -> u64 {
        GROUP_HEADER_SIZE + slot as u64 * self.slot_size as u64
    }

    /// Slot index for a byte offset produced by [`slot_offset`](Self::slot_offset).
    pub fn slot_at(&self, pos: u64) -> Option<u32> {
        let rel = pos.checked_sub(GROUP_HEADER_SIZE)?;
        if rel % self.slot_size as u64 != 0 {
            return None;
        }
        let slot = rel / self.slot_size as u64;
        (slot < self.slot_count as u64).then_some(slot as u32)
    }

    fn encode(&self) -> [u8; HEADER_USED] {
        let mut buf = [0u8; HEADER_USED];
        buf[0..4].copy_from_slice(GROUP_MAGIC);
        buf[4] = GROUP_VERSION;
        buf[5..9].copy_from_slice(&self.id.0.to_le_bytes());
        buf[9..13].copy_from_slice(&self.slot_size.to_le_bytes());
        buf[13..17].copy_from_slice(&self.slot_count.to_le_bytes());
        buf[17] = self.ultra as u8;
        let checksum = crc32fast::hash(&buf[..18]);
        buf[18..22].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8; HEADER_USED]) -> Result<Self> {
        if &buf[0..4] != GROUP_MAGIC {
            return Err(EngineError::InvalidFormat("Invalid group magic".into()));
        }
        if buf[4] != GROUP_VERSION {
            return Err(EngineError::InvalidFormat(format!(
                "Unsupported group version: {}",
                buf[4]
            )));
        }
        let le32 = |range: std::ops::Range<usize>| {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&buf[range]);
            u32::from_le_bytes(bytes)
        };
        let stored_checksum = le32(18..22);
        let computed_checksum = crc32fast::hash(&buf[..18]);
        if stored_checksum != computed_checksum {
            return Err(EngineError::Corruption("Group header checksum mismatch".into()));
        }
        Ok(Self {
            id: GroupId(le32(5..9)),
            slot_size: le32(9..13),
            slot_count: le32(13..17),
            ultra: buf[17] != 0,
        })
    }
}

/// An open group file.
pub struct GroupFile {
    path: PathBuf,
    file: File,
    layout: GroupLayout,
}

impl GroupFile {
    /// Path of the file for a group id inside `dir`.
    pub fn path_for(dir: &Path, id: GroupId) -> PathBuf {
        dir.join(format!("{}.{}", id, GROUP_EXTENSION))
    }

    /// Create a new group file, reserving its full size on disk when
    /// `preallocate` is set.
    pub fn create(dir: &Path, layout: GroupLayout, preallocate: bool) -> Result<Self> {
        let path = Self::path_for(dir, layout.id);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        if preallocate {
            file.allocate(layout.file_len())?;
        } else {
            file.set_len(layout.file_len())?;
        }

        file.write_all(&layout.encode())?;
        file.sync_all()?;

        Ok(Self { path, file, layout })
    }

    /// Open an existing group file and verify its header.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut header = [0u8; HEADER_USED];
        file.read_exact(&mut header)?;
        let layout = GroupLayout::decode(&header)?;

        let len = file.metadata()?.len();
        if len < layout.file_len() {
            return Err(EngineError::Corruption(format!(
                "Group {} is truncated: {} < {} bytes",
                layout.id,
                len,
                layout.file_len()
            )));
        }

        Ok(Self { path, file, layout })
    }

    pub fn layout(&self) -> &GroupLayout {
        &self.layout
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn raw_fd(&self) -> i32 {
        self.file.as_raw_fd()
    }

    /// Read `buf.len()` bytes from `offset` within a slot.
    pub fn read_at(&self, slot: u32, offset: u32, buf: &mut [u8]) -> Result<()> {
        self.check_bounds(offset, buf.len())?;
        self.file
            .read_exact_at(buf, self.layout.slot_offset(slot) + offset as u64)?;
        Ok(())
    }

    /// Write `data` at `offset` within a slot.
    pub fn write_at(&self, slot: u32, offset: u32, data: &[u8]) -> Result<()> {
        self.check_bounds(offset, data.len())?;
        self.file
            .write_all_at(data, self.layout.slot_offset(slot) + offset as u64)?;
        Ok(())
    }

    pub fn sync_data(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Delete the file from disk.
    pub fn remove(&self) -> Result<()> {
        fs::remove_file(&self.path)?;
        Ok(())
    }

    fn check_bounds(&self, offset: u32, len: usize) -> Result<()> {
        if offset as u64 + len as u64 > self.layout.slot_size as u64 {
            return Err(EngineError::InvalidArgument(format!(
                "Range {}+{} exceeds slot size {}",
                offset, len, self.layout.slot_size
            )));
        }
        Ok(())
    }
}
