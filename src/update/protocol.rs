//! Update validation, staging and commit.

use super::request::{CommitReply, UpdateKind, UpdateOutcome, UpdateReply, UpdateReq};
use super::writing::WritingChunk;
use crate::checksum;
use crate::engine::EngineShared;
use crate::error::{EngineError, ErrorCode, Result};
use crate::index::Generation;
use crate::ledger::UncommittedEntry;
use crate::types::{ChunkId, GroupId, RawMeta, Timestamp};
use crate::wal::{CommitEntry, JournalOp};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

fn reject(id: &ChunkId, code: ErrorCode, current: Option<&Generation>) -> Result<UpdateReply> {
    tracing::debug!(chunk = %id, code = %code, "update rejected");
    Ok(UpdateReply::Rejected(UpdateOutcome::rejected(
        code,
        current.map(Generation::meta),
    )))
}

/// Validate `req` against the current state of `id` and stage a new
/// generation.
pub(crate) fn update(
    shared: &Arc<EngineShared>,
    id: &ChunkId,
    req: &UpdateReq<'_>,
) -> Result<UpdateReply> {
    if id.len() < shared.config.id_prefix_len {
        return Err(EngineError::InvalidArgument(format!(
            "Chunk id {} is shorter than the {} byte prefix",
            id, shared.config.id_prefix_len
        )));
    }

    // A retried request finds its own generation already in place.
    let current = shared.index.current(id);
    if let Some(generation) = &current {
        if req.identity.is_set() && generation.meta().identity == req.identity {
            return Ok(UpdateReply::Staged(WritingChunk::noop(
                id.clone(),
                Some(Arc::clone(generation)),
                Arc::downgrade(shared),
            )));
        }
    }

    let Some((reservation, orphan)) = shared.ledger.reserve(id) else {
        return reject(id, ErrorCode::VersionConflict, current.as_deref());
    };

    if let Some(orphan) = &orphan {
        if req.identity.is_set()
            && orphan.generation.meta().identity == req.identity
            && is_intact(id, orphan)
            && shared.ledger.attach(id, orphan.stage_seq)
        {
            tracing::debug!(chunk = %id, stage_seq = orphan.stage_seq, "adopted orphaned stage");
            return Ok(UpdateReply::Staged(WritingChunk::staged(
                id.clone(),
                Arc::clone(&orphan.generation),
                shared.index.current(id),
                orphan.stage_seq,
                orphan.base_ver,
                orphan.chain_ver,
                Arc::downgrade(shared),
            )));
        }
    }

    // Re-read under the reservation: a commit may have landed meanwhile.
    let current = shared.index.current(id);
    let live = current.as_deref().filter(|g| !g.is_removed());

    if req.create_new && live.is_some() {
        return reject(id, ErrorCode::AlreadyExists, current.as_deref());
    }

    if let Some(expected) = req.expected_tag {
        match live {
            None => return reject(id, ErrorCode::NotFound, current.as_deref()),
            Some(g) if g.tag() != Some(expected) => {
                return reject(id, ErrorCode::TagMismatch, current.as_deref())
            }
            Some(_) => {}
        }
    }

    let cur_meta = current.as_deref().map(|g| *g.meta());
    if let Some(meta) = &cur_meta {
        if req.chain_ver < meta.chain_ver {
            return reject(id, ErrorCode::VersionConflict, current.as_deref());
        }
    }

    let base_ver = cur_meta.map_or(0, |m| m.chunk_ver);
    let chunk_ver = if req.update_ver == 0 {
        base_ver + 1
    } else if req.update_ver <= base_ver || (req.update_ver > base_ver + 1 && !req.is_syncing) {
        return reject(id, ErrorCode::VersionConflict, current.as_deref());
    } else {
        req.update_ver
    };

    check_request(shared, req)?;
    if req.kind == UpdateKind::Write
        && !req.without_checksum
        && checksum::checksum(req.data) != req.checksum
    {
        return reject(id, ErrorCode::ChecksumMismatch, current.as_deref());
    }

    // The request replaces whatever was left staged for the id.
    if let Some(orphan) = orphan {
        shared.discard(id, orphan.stage_seq)?;
    }

    if req.kind == UpdateKind::Remove && live.is_none() {
        return Ok(UpdateReply::Staged(WritingChunk::noop(
            id.clone(),
            None,
            Arc::downgrade(shared),
        )));
    }

    let policy = shared.write_policy();
    let plan = policy.plan(live, req)?;
    let meta = RawMeta {
        pos: 0,
        group: GroupId::NONE,
        chain_ver: req.chain_ver,
        chunk_ver,
        len: plan.len,
        checksum: plan.checksum,
        timestamp: Timestamp::now(),
        identity: req.identity,
        removed: req.kind == UpdateKind::Remove,
    };
    let tag = match req.kind {
        UpdateKind::Remove => None,
        _ => req.desired_tag,
    };
    let generation = Arc::new(Generation::new(meta, tag, plan.slot));

    let stage_seq = {
        let mut journal = shared.journal.lock();
        let stage_seq = journal.append(
            JournalOp::Stage {
                id: id.clone(),
                meta: *generation.meta(),
                tag,
                base_ver,
            },
            shared.config.sync_staging,
        )?;
        if shared.config.sync_staging {
            shared.groups.release_pending();
        }
        shared.ledger.insert(
            id.clone(),
            UncommittedEntry {
                generation: Arc::clone(&generation),
                chain_ver: req.chain_ver,
                stage_seq,
                base_ver,
                attached: true,
            },
        );
        stage_seq
    };

    let writing = WritingChunk::staged(
        id.clone(),
        generation,
        current,
        stage_seq,
        base_ver,
        req.chain_ver,
        Arc::downgrade(shared),
    );

    let slot = writing.generation().and_then(|g| g.slot());
    if let (Some(slot), Some(pending)) = (slot, &plan.pending) {
        if let Err(e) = policy.execute(slot, pending) {
            tracing::warn!(chunk = %id, error = %e, "data write failed");
            drop(writing);
            return Ok(UpdateReply::Rejected(UpdateOutcome::rejected(
                ErrorCode::IoError,
                cur_meta.as_ref(),
            )));
        }
    }

    drop(reservation);
    Ok(UpdateReply::Staged(writing))
}

/// Whether an orphan's data reached its slot intact.
fn is_intact(id: &ChunkId, orphan: &UncommittedEntry) -> bool {
    match orphan.generation.is_intact() {
        Ok(true) => true,
        Ok(false) => {
            tracing::warn!(chunk = %id, stage_seq = orphan.stage_seq, "orphaned stage is torn");
            false
        }
        Err(e) => {
            tracing::warn!(
                chunk = %id,
                stage_seq = orphan.stage_seq,
                error = %e,
                "orphaned stage unreadable"
            );
            false
        }
    }
}

/// Structural checks on request fields.
fn check_request(shared: &EngineShared, req: &UpdateReq<'_>) -> Result<()> {
    let max = shared.config.allocator.max_chunk_size as u64;
    match req.kind {
        UpdateKind::Write => {
            if req.data.len() as u64 != req.length as u64 {
                return Err(EngineError::InvalidArgument(format!(
                    "Write length {} does not match {} data bytes",
                    req.length,
                    req.data.len()
                )));
            }
            if req.offset as u64 + req.length as u64 > max {
                return Err(EngineError::InvalidArgument(format!(
                    "Write end {} exceeds max chunk size {}",
                    req.offset as u64 + req.length as u64,
                    max
                )));
            }
        }
        UpdateKind::Truncate => {
            if req.length as u64 > max {
                return Err(EngineError::InvalidArgument(format!(
                    "Truncate length {} exceeds max chunk size {}",
                    req.length, max
                )));
            }
        }
        UpdateKind::Remove => {}
    }
    Ok(())
}

/// Publish a batch of staged chunks atomically.
pub(crate) fn commit_batch(
    shared: &Arc<EngineShared>,
    mut chunks: Vec<WritingChunk>,
    sync: bool,
) -> Result<CommitReply> {
    let engine = Arc::downgrade(shared);
    if let Some(foreign) = chunks.iter().position(|c| !c.engine().ptr_eq(&engine)) {
        return Err(EngineError::InvalidArgument(format!(
            "Writing chunk {} belongs to another engine",
            chunks[foreign].id()
        )));
    }

    if sync {
        let mut groups = BTreeMap::new();
        for slot in chunks
            .iter()
            .filter_map(|c| c.generation().and_then(|g| g.slot()))
        {
            groups.entry(slot.group_id()).or_insert_with(|| Arc::clone(slot.group()));
        }
        for group in groups.values() {
            group.file().sync_data()?;
        }
    }

    let mut journal = shared.journal.lock();

    let mut seen = HashSet::new();
    let mut staged = Vec::new();
    for (index, chunk) in chunks.iter().enumerate() {
        let Some(stage_seq) = chunk.stage_seq() else {
            continue;
        };
        let code = if !seen.insert(chunk.id().clone()) {
            Some(ErrorCode::AlreadyCommitted)
        } else {
            match shared.ledger.get(chunk.id(), stage_seq) {
                None => Some(ErrorCode::NotFound),
                Some(entry) => {
                    let current = shared.index.current(chunk.id());
                    let cur_meta = current.as_deref().map(Generation::meta);
                    if cur_meta.map_or(0, |m| m.chunk_ver) != chunk.base_ver() {
                        Some(ErrorCode::VersionConflict)
                    } else if cur_meta.map_or(false, |m| entry.chain_ver < m.chain_ver) {
                        Some(ErrorCode::VersionConflict)
                    } else {
                        staged.push((index, stage_seq, entry));
                        None
                    }
                }
            }
        };
        if let Some(code) = code {
            drop(journal);
            tracing::debug!(chunk = %chunk.id(), index, code = %code, "commit rejected");
            return Ok(CommitReply::Rejected { index, code });
        }
    }

    let timestamp = Timestamp::now();
    if !staged.is_empty() {
        let entries = staged
            .iter()
            .map(|(index, stage_seq, entry)| CommitEntry {
                id: chunks[*index].id().clone(),
                stage_seq: *stage_seq,
                chain_ver: entry.chain_ver,
                timestamp,
            })
            .collect();
        journal.append(JournalOp::Commit { entries }, sync)?;
        if sync {
            shared.groups.release_pending();
        }
    }

    let mut metas: Vec<RawMeta> = chunks.iter().map(WritingChunk::raw_meta).collect();
    let mut published = Vec::with_capacity(staged.len());
    for (index, stage_seq, entry) in &staged {
        let id = chunks[*index].id().clone();
        shared.ledger.remove(&id, *stage_seq);
        let generation = Arc::new(entry.generation.republish(entry.chain_ver, timestamp));
        metas[*index] = *generation.meta();
        published.push((id, generation));
    }
    let superseded = shared.index.publish(published);

    for chunk in &mut chunks {
        chunk.finish();
    }
    drop(journal);
    drop(superseded);
    drop(staged);

    Ok(CommitReply::Committed(metas))
}

/// Commit an orphaned ledger entry on behalf of a coordinator.
pub(crate) fn commit_orphan(
    shared: &Arc<EngineShared>,
    id: &ChunkId,
    sync: bool,
) -> Result<CommitReply> {
    let Some(entry) = shared.ledger.claim(id) else {
        let code = if shared.ledger.contains(id) {
            ErrorCode::VersionConflict
        } else {
            ErrorCode::NotFound
        };
        return Ok(CommitReply::Rejected { index: 0, code });
    };

    match entry.generation.is_intact() {
        Ok(true) => {}
        Ok(false) => {
            tracing::warn!(chunk = %id, stage_seq = entry.stage_seq, "discarding torn orphan");
            shared.discard(id, entry.stage_seq)?;
            return Ok(CommitReply::Rejected {
                index: 0,
                code: ErrorCode::ChecksumMismatch,
            });
        }
        Err(e) => {
            shared.ledger.detach(id, entry.stage_seq);
            return Err(e);
        }
    }

    let chunk = WritingChunk::staged(
        id.clone(),
        Arc::clone(&entry.generation),
        shared.index.current(id),
        entry.stage_seq,
        entry.base_ver,
        entry.chain_ver,
        Arc::downgrade(shared),
    );
    commit_batch(shared, vec![chunk], sync)
}
