//! Crash recovery.
//!
//! On open, the index and ledger are rebuilt from the last checkpoint plus
//! the journal entries after it; slot reference counts follow from the
//! generations that survive. Staged generations without a commit or discard
//! come back as orphans, which a coordinator lists, commits or discards with
//! the operations below.

use crate::engine::Engine;
use crate::error::Result;
use crate::groups::{GroupAllocator, SlotRef};
use crate::index::{ChunkIndex, Generation};
use crate::ledger::{UncommittedEntry, UncommittedLedger};
use crate::query::{RawChunkEntry, RawChunks};
use crate::types::{ChunkId, RawMeta};
use crate::update::{self, CommitReply};
use crate::wal::{Checkpoint, JournalEntry, JournalOp};
use std::collections::BTreeMap;
use std::sync::Arc;

fn attach(groups: &GroupAllocator, meta: &RawMeta) -> Result<Option<SlotRef>> {
    if !meta.has_data() {
        return Ok(None);
    }
    groups.attach(meta.group, meta.pos).map(Some)
}

/// Rebuild the index and ledger from a checkpoint and the journal.
pub(crate) fn rebuild(
    groups: &GroupAllocator,
    checkpoint: Option<Checkpoint>,
    entries: Vec<JournalEntry>,
) -> Result<(ChunkIndex, UncommittedLedger)> {
    let mut committed: BTreeMap<ChunkId, Arc<Generation>> = BTreeMap::new();
    let mut staged: BTreeMap<ChunkId, UncommittedEntry> = BTreeMap::new();

    let last_seq = checkpoint.as_ref().map_or(0, |c| c.last_seq);
    if let Some(checkpoint) = checkpoint {
        for chunk in checkpoint.committed {
            let slot = attach(groups, &chunk.meta)?;
            let generation = Generation::new(chunk.meta, chunk.tag, slot);
            committed.insert(chunk.id, Arc::new(generation));
        }
        for entry in checkpoint.uncommitted {
            let slot = attach(groups, &entry.meta)?;
            let generation = Generation::new(entry.meta, entry.tag, slot);
            staged.insert(
                entry.id,
                UncommittedEntry {
                    generation: Arc::new(generation),
                    chain_ver: entry.chain_ver,
                    stage_seq: entry.stage_seq,
                    base_ver: entry.base_ver,
                    attached: false,
                },
            );
        }
    }

    for entry in entries.into_iter().filter(|e| e.seq > last_seq) {
        match entry.operation {
            JournalOp::Stage {
                id,
                meta,
                tag,
                base_ver,
            } => {
                let slot = attach(groups, &meta)?;
                staged.insert(
                    id,
                    UncommittedEntry {
                        generation: Arc::new(Generation::new(meta, tag, slot)),
                        chain_ver: meta.chain_ver,
                        stage_seq: entry.seq,
                        base_ver,
                        attached: false,
                    },
                );
            }
            JournalOp::Commit { entries } => {
                for commit in entries {
                    match staged.remove(&commit.id) {
                        Some(stage) if stage.stage_seq == commit.stage_seq => {
                            let generation =
                                stage.generation.republish(commit.chain_ver, commit.timestamp);
                            committed.insert(commit.id, Arc::new(generation));
                        }
                        other => {
                            tracing::warn!(
                                chunk = %commit.id,
                                stage_seq = commit.stage_seq,
                                "journal commits an unknown stage"
                            );
                            if let Some(stage) = other {
                                staged.insert(commit.id, stage);
                            }
                        }
                    }
                }
            }
            JournalOp::Discard { id, stage_seq } => {
                if staged.get(&id).is_some_and(|e| e.stage_seq == stage_seq) {
                    staged.remove(&id);
                }
            }
            JournalOp::Relocate {
                id,
                group,
                pos,
                chunk_ver,
            } => {
                let relocated = match committed.get(&id) {
                    Some(current) if current.meta().chunk_ver == chunk_ver => {
                        let slot = groups.attach(group, pos)?;
                        Some(Generation::new(*current.meta(), current.tag(), Some(slot)))
                    }
                    _ => None,
                };
                if let Some(generation) = relocated {
                    committed.insert(id, Arc::new(generation));
                }
            }
        }
    }

    Ok((
        ChunkIndex::from_entries(committed),
        UncommittedLedger::from_entries(staged),
    ))
}

impl Engine {
    fn to_uncommitted(rows: Vec<(ChunkId, UncommittedEntry)>) -> RawChunks {
        rows.into_iter()
            .map(|(id, entry)| RawChunkEntry {
                meta: entry.meta(),
                tag: entry.generation.tag(),
                uncommitted: true,
                id,
            })
            .collect()
    }

    /// Staged generations under `prefix`, without changing anything.
    pub fn query_uncommitted(&self, prefix: &[u8]) -> Result<RawChunks> {
        let (begin, end) = self.prefix_range(prefix)?;
        let rows = self.shared.ledger.range(&begin, end.as_deref());
        Ok(Self::to_uncommitted(rows))
    }

    /// Discard the staged generations under `prefix` whose chain version is
    /// older than `chain_ver`. Returns the discarded entries.
    pub fn handle_uncommitted(&self, prefix: &[u8], chain_ver: u32) -> Result<RawChunks> {
        let (begin, end) = self.prefix_range(prefix)?;
        let candidates = self.shared.ledger.range(&begin, end.as_deref());

        let mut discarded = Vec::new();
        for (id, entry) in candidates {
            if entry.chain_ver >= chain_ver {
                continue;
            }
            if let Some(entry) = self.shared.discard(&id, entry.stage_seq)? {
                tracing::debug!(chunk = %id, stage_seq = entry.stage_seq, "discarded stale stage");
                discarded.push((id, entry));
            }
        }
        Ok(Self::to_uncommitted(discarded))
    }

    pub fn query_uncommitted_raw_chunks(&self, prefix: &[u8]) -> Result<RawChunks> {
        self.query_uncommitted(prefix)
    }

    pub fn handle_uncommitted_raw_chunks(
        &self,
        prefix: &[u8],
        chain_ver: u32,
    ) -> Result<RawChunks> {
        self.handle_uncommitted(prefix, chain_ver)
    }

    /// Publish the orphaned staged generation of `id`.
    pub fn commit_uncommitted(&self, id: &ChunkId, sync: bool) -> Result<CommitReply> {
        update::commit_orphan(&self.shared, id, sync)
    }

    /// Drop the orphaned staged generation of `id`. Returns whether there
    /// was one.
    pub fn discard_uncommitted(&self, id: &ChunkId) -> Result<bool> {
        let Some(entry) = self.shared.ledger.claim(id) else {
            return Ok(false);
        };
        Ok(self.shared.discard(id, entry.stage_seq)?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::error::ErrorCode;
    use crate::groups::AllocatorConfig;
    use crate::update::UpdateReq;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> EngineConfig {
        EngineConfig {
            path: dir.path().to_path_buf(),
            id_prefix_len: 1,
            allocator: AllocatorConfig {
                min_slot_size: 4096,
                max_normal_slot_size: 8192,
                max_chunk_size: 65536,
                slots_per_group: 8,
                slots_per_ultra_group: 2,
                preallocate: false,
            },
            ..Default::default()
        }
    }

    fn stage(engine: &Engine, id: &str, data: &[u8], chain_ver: u32) {
        let req = UpdateReq::write(0, data).with_chain_ver(chain_ver);
        let chunk = engine
            .update(&ChunkId::from(id), &req)
            .unwrap()
            .into_staged()
            .unwrap();
        // Leave the stage behind as an orphan.
        std::mem::forget(chunk);
    }

    #[test]
    fn test_replay_after_crash() {
        let dir = TempDir::new().unwrap();
        {
            let engine = Engine::open(config(&dir)).unwrap();
            let reply = engine
                .update(&ChunkId::from("a1"), &UpdateReq::write(0, b"committed"))
                .unwrap();
            engine.commit(reply.into_staged().unwrap(), true).unwrap();
            stage(&engine, "a2", b"pending", 1);
        }

        let engine = Engine::open(config(&dir)).unwrap();
        let chunk = engine.get(&ChunkId::from("a1")).unwrap().unwrap();
        assert_eq!(chunk.read_verified().unwrap(), b"committed");
        assert!(engine.get(&ChunkId::from("a2")).unwrap().is_none());

        let pending = engine.query_uncommitted(b"a").unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending.chunk_id(0), Some(&ChunkId::from("a2")));
        assert!(pending.chunk_uncommitted(0));
    }

    #[test]
    fn test_replay_restores_slot_usage() {
        let dir = TempDir::new().unwrap();
        let before = {
            let engine = Engine::open(config(&dir)).unwrap();
            for id in ["a1", "a2"] {
                let reply = engine.update(&ChunkId::from(id), &UpdateReq::write(0, b"x")).unwrap();
                engine.commit(reply.into_staged().unwrap(), false).unwrap();
            }
            // Superseded generation frees its slot.
            let reply = engine.update(&ChunkId::from("a1"), &UpdateReq::write(0, b"y")).unwrap();
            engine.commit(reply.into_staged().unwrap(), false).unwrap();
            engine.raw_used_size()
        };

        let engine = Engine::open(config(&dir)).unwrap();
        assert_eq!(engine.raw_used_size(), before);
        assert_eq!(before.position_count, 2);
    }

    #[test]
    fn test_checkpoint_then_journal() {
        let dir = TempDir::new().unwrap();
        {
            let engine = Engine::open(config(&dir)).unwrap();
            let reply = engine.update(&ChunkId::from("a1"), &UpdateReq::write(0, b"one")).unwrap();
            engine.commit(reply.into_staged().unwrap(), false).unwrap();
            engine.checkpoint().unwrap();
            let reply = engine
                .update(&ChunkId::from("a1"), &UpdateReq::write(3, b"two"))
                .unwrap();
            engine.commit(reply.into_staged().unwrap(), false).unwrap();
        }

        let engine = Engine::open(config(&dir)).unwrap();
        let chunk = engine.get(&ChunkId::from("a1")).unwrap().unwrap();
        assert_eq!(chunk.read_verified().unwrap(), b"onetwo");
        assert_eq!(chunk.raw_meta().chunk_ver, 2);
    }

    #[test]
    fn test_handle_uncommitted_discards_stale_chains() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(config(&dir)).unwrap();
        stage(&engine, "a1", b"old", 1);
        stage(&engine, "a2", b"new", 3);

        let discarded = engine.handle_uncommitted(b"a", 2).unwrap();
        assert_eq!(discarded.ids(), vec![ChunkId::from("a1")]);

        let remaining = engine.query_uncommitted(b"a").unwrap();
        assert_eq!(remaining.ids(), vec![ChunkId::from("a2")]);
    }

    #[test]
    fn test_commit_and_discard_uncommitted() {
        let dir = TempDir::new().unwrap();
        {
            let engine = Engine::open(config(&dir)).unwrap();
            stage(&engine, "a1", b"keep", 1);
            stage(&engine, "a2", b"drop", 1);
        }

        let engine = Engine::open(config(&dir)).unwrap();
        let reply = engine.commit_uncommitted(&ChunkId::from("a1"), true).unwrap();
        assert!(reply.is_committed());
        let chunk = engine.get(&ChunkId::from("a1")).unwrap().unwrap();
        assert_eq!(chunk.read_verified().unwrap(), b"keep");

        assert!(engine.discard_uncommitted(&ChunkId::from("a2")).unwrap());
        assert!(!engine.discard_uncommitted(&ChunkId::from("a2")).unwrap());
        assert!(engine.query_uncommitted(b"a").unwrap().is_empty());

        let missing = engine.commit_uncommitted(&ChunkId::from("a3"), false).unwrap();
        assert_eq!(missing.error(), Some(ErrorCode::NotFound));
    }

    #[test]
    fn test_retry_adopts_orphan() {
        let dir = TempDir::new().unwrap();
        let identity = crate::types::RequestIdentity::new(9, 1, 1);
        {
            let engine = Engine::open(config(&dir)).unwrap();
            let req = UpdateReq::write(0, b"retry").with_identity(identity);
            let chunk = engine
                .update(&ChunkId::from("a1"), &req)
                .unwrap()
                .into_staged()
                .unwrap();
            std::mem::forget(chunk);
        }

        let engine = Engine::open(config(&dir)).unwrap();
        let req = UpdateReq::write(0, b"retry").with_identity(identity);
        let chunk = engine
            .update(&ChunkId::from("a1"), &req)
            .unwrap()
            .into_staged()
            .unwrap();
        assert!(chunk.uncommitted());
        assert!(engine.commit(chunk, false).unwrap().is_committed());

        let chunk = engine.get(&ChunkId::from("a1")).unwrap().unwrap();
        assert_eq!(chunk.read_verified().unwrap(), b"retry");
        assert_eq!(chunk.raw_meta().chunk_ver, 1);
    }
}
