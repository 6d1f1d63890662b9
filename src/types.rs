//! Core types for the chunk engine.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::borrow::Borrow;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifier of a chunk: an opaque byte string ordered lexicographically.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct ChunkId(pub Vec<u8>);

impl ChunkId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        ChunkId(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn starts_with(&self, prefix: &[u8]) -> bool {
        self.0.starts_with(prefix)
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl From<&[u8]> for ChunkId {
    fn from(bytes: &[u8]) -> Self {
        ChunkId(bytes.to_vec())
    }
}

impl From<Vec<u8>> for ChunkId {
    fn from(bytes: Vec<u8>) -> Self {
        ChunkId(bytes)
    }
}

impl From<&str> for ChunkId {
    fn from(s: &str) -> Self {
        ChunkId(s.as_bytes().to_vec())
    }
}

impl AsRef<[u8]> for ChunkId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Borrow<[u8]> for ChunkId {
    fn borrow(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkId({})", self.to_hex())
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Smallest byte string strictly greater than every string starting with
/// `prefix`, or `None` when no such bound exists (empty or all `0xff`).
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last != u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

/// Identifier of a group file.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct GroupId(pub u32);

impl GroupId {
    /// Placeholder for generations that own no bytes on disk.
    pub const NONE: GroupId = GroupId(0);

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

impl fmt::Debug for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupId({})", self.0)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08}", self.0)
    }
}

/// Length of a tag in bytes.
pub const TAG_LEN: usize = 32;

/// Fixed-size fingerprint attached to a committed generation and used as a
/// compare-and-swap precondition.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag(pub [u8; TAG_LEN]);

impl Tag {
    /// SHA-256 fingerprint of some content.
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Tag(hasher.finalize().into())
    }

    /// Build a tag from a caller-supplied slice, which must be exactly
    /// [`TAG_LEN`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; TAG_LEN] = bytes.try_into().ok()?;
        Some(Tag(arr))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag({}...)", &self.to_hex()[..8])
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as u64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Identity of the client request that produced a generation.
///
/// A retried request carries the same identity, which lets the engine
/// recognise it and answer without applying the update twice. A zero
/// `request_id` means "no identity".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct RequestIdentity {
    pub request_id: u64,
    pub client_low: u64,
    pub client_high: u64,
}

impl RequestIdentity {
    pub fn new(request_id: u64, client_low: u64, client_high: u64) -> Self {
        Self {
            request_id,
            client_low,
            client_high,
        }
    }

    pub fn is_set(&self) -> bool {
        self.request_id != 0
    }
}

/// Metadata of one chunk generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RawMeta {
    /// Byte offset of the generation's slot within its group file.
    pub pos: u64,
    /// Group holding the bytes, [`GroupId::NONE`] when there are none.
    pub group: GroupId,
    pub chain_ver: u32,
    pub chunk_ver: u32,
    pub len: u32,
    pub checksum: u32,
    /// Commit time (staging time while uncommitted).
    pub timestamp: Timestamp,
    /// Request that produced this generation.
    pub identity: RequestIdentity,
    /// Tombstone marker written by a remove.
    pub removed: bool,
}

impl RawMeta {
    pub fn has_data(&self) -> bool {
        !self.group.is_none()
    }
}

/// Raw file descriptor and byte offset of a generation's data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FdAndOffset {
    pub fd: i32,
    pub offset: u64,
}

/// Space accounting, either for the whole engine or for an id prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawUsedSize {
    /// Bytes of chunk content (engine-wide: bytes of occupied slots).
    pub allocated_size: u64,
    /// Bytes of slots reserved for that content (engine-wide: group capacity).
    pub reserved_size: u64,
    /// Number of occupied positions.
    pub position_count: u64,
    /// Generations referencing those positions, superseded ones included.
    pub position_rc: u64,
}
