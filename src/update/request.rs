//! Request and reply types of the update/commit protocol.

use super::writing::WritingChunk;
use crate::checksum;
use crate::error::ErrorCode;
use crate::types::{RawMeta, RequestIdentity, Tag};
use serde::{Deserialize, Serialize};

/// What an update does to a chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateKind {
    /// Write `data` at `offset`, growing the chunk if needed.
    Write,
    /// Set the chunk length to `length`, zero-filling when growing.
    Truncate,
    /// Replace the chunk with a tombstone.
    Remove,
}

/// One update request.
///
/// Built with [`write`](Self::write), [`truncate`](Self::truncate) or
/// [`remove`](Self::remove), then refined with the `with_*` methods:
///
/// ```ignore
/// let req = UpdateReq::write(0, b"hello")
///     .with_chain_ver(3)
///     .with_desired_tag(Tag::of(b"hello"));
/// ```
#[derive(Clone, Debug)]
pub struct UpdateReq<'a> {
    pub kind: UpdateKind,
    /// Explicit new `chunk_ver`, or 0 for "current + 1".
    pub update_ver: u32,
    pub chain_ver: u32,
    /// CRC-32 of `data`.
    pub checksum: u32,
    /// Write: length of `data`. Truncate: the new chunk length.
    pub length: u32,
    pub offset: u32,
    pub data: &'a [u8],
    pub identity: RequestIdentity,
    pub expected_tag: Option<Tag>,
    pub desired_tag: Option<Tag>,
    /// Fail with `AlreadyExists` if the chunk is live.
    pub create_new: bool,
    /// Do not trust `checksum`; compute it from `data`.
    pub without_checksum: bool,
    /// Replica catching up: `update_ver` may skip versions.
    pub is_syncing: bool,
}

impl<'a> UpdateReq<'a> {
    fn new(kind: UpdateKind) -> Self {
        Self {
            kind,
            update_ver: 0,
            chain_ver: 0,
            checksum: 0,
            length: 0,
            offset: 0,
            data: &[],
            identity: RequestIdentity::default(),
            expected_tag: None,
            desired_tag: None,
            create_new: false,
            without_checksum: false,
            is_syncing: false,
        }
    }

    /// Write `data` at `offset`, with the checksum of `data` filled in.
    pub fn write(offset: u32, data: &'a [u8]) -> Self {
        Self {
            offset,
            data,
            length: data.len() as u32,
            checksum: checksum::checksum(data),
            ..Self::new(UpdateKind::Write)
        }
    }

    pub fn truncate(length: u32) -> Self {
        Self {
            length,
            ..Self::new(UpdateKind::Truncate)
        }
    }

    pub fn remove() -> Self {
        Self::new(UpdateKind::Remove)
    }

    pub fn with_update_ver(mut self, update_ver: u32) -> Self {
        self.update_ver = update_ver;
        self
    }

    pub fn with_chain_ver(mut self, chain_ver: u32) -> Self {
        self.chain_ver = chain_ver;
        self
    }

    pub fn with_checksum(mut self, checksum: u32) -> Self {
        self.checksum = checksum;
        self
    }

    pub fn with_identity(mut self, identity: RequestIdentity) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_expected_tag(mut self, tag: Tag) -> Self {
        self.expected_tag = Some(tag);
        self
    }

    pub fn with_desired_tag(mut self, tag: Tag) -> Self {
        self.desired_tag = Some(tag);
        self
    }

    pub fn create_new(mut self) -> Self {
        self.create_new = true;
        self
    }

    pub fn without_checksum(mut self) -> Self {
        self.without_checksum = true;
        self
    }

    pub fn syncing(mut self) -> Self {
        self.is_syncing = true;
        self
    }
}

/// Result fields of an update.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// The chunk did not exist (remove of a missing chunk).
    pub non_existent: bool,
    pub error: Option<ErrorCode>,
    /// `chunk_ver` of the staged generation, or of the current one when
    /// nothing was staged.
    pub commit_ver: u32,
    pub chain_ver: u32,
    pub checksum: u32,
}

impl UpdateOutcome {
    pub(crate) fn of(meta: &RawMeta) -> Self {
        Self {
            non_existent: false,
            error: None,
            commit_ver: meta.chunk_ver,
            chain_ver: meta.chain_ver,
            checksum: meta.checksum,
        }
    }

    pub(crate) fn rejected(code: ErrorCode, current: Option<&RawMeta>) -> Self {
        let mut outcome = current.map(Self::of).unwrap_or_default();
        outcome.non_existent = current.map_or(true, |m| m.removed);
        outcome.error = Some(code);
        outcome
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Reply to [`Engine::update`](crate::Engine::update).
#[derive(Debug)]
pub enum UpdateReply {
    /// A generation was staged (or the request was recognised as a no-op);
    /// commit or drop the handle.
    Staged(WritingChunk),
    /// A precondition failed; nothing changed.
    Rejected(UpdateOutcome),
}

impl UpdateReply {
    pub fn outcome(&self) -> UpdateOutcome {
        match self {
            UpdateReply::Staged(chunk) => chunk.outcome(),
            UpdateReply::Rejected(outcome) => *outcome,
        }
    }

    pub fn error(&self) -> Option<ErrorCode> {
        self.outcome().error
    }

    pub fn is_staged(&self) -> bool {
        matches!(self, UpdateReply::Staged(_))
    }

    pub fn into_staged(self) -> Option<WritingChunk> {
        match self {
            UpdateReply::Staged(chunk) => Some(chunk),
            UpdateReply::Rejected(_) => None,
        }
    }
}

/// Reply to a commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommitReply {
    /// Every chunk was published; metadata in request order.
    Committed(Vec<RawMeta>),
    /// The chunk at `index` failed validation; nothing was published and
    /// every chunk of the batch was aborted.
    Rejected { index: usize, code: ErrorCode },
}

impl CommitReply {
    pub fn is_committed(&self) -> bool {
        matches!(self, CommitReply::Committed(_))
    }

    pub fn metas(&self) -> &[RawMeta] {
        match self {
            CommitReply::Committed(metas) => metas,
            CommitReply::Rejected { .. } => &[],
        }
    }

    pub fn error(&self) -> Option<ErrorCode> {
        match self {
            CommitReply::Committed(_) => None,
            CommitReply::Rejected { code, .. } => Some(*code),
        }
    }
}
