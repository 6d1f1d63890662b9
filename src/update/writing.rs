//! Handle to a staged generation.

use super::request::UpdateOutcome;
use crate::engine::EngineShared;
use crate::index::{Chunk, Generation};
use crate::types::{ChunkId, RawMeta, Tag};
use std::fmt;
use std::sync::{Arc, Weak};

/// A staged, not yet committed generation.
///
/// Exclusive to the caller that staged it. Committing consumes it; dropping
/// it aborts the update and releases the staged generation.
pub struct WritingChunk {
    id: ChunkId,
    /// Staged generation, or the current one for a no-op.
    generation: Option<Arc<Generation>>,
    /// Committed generation the update was based on.
    base: Option<Arc<Generation>>,
    /// Journal sequence of the stage; `None` for a no-op that publishes
    /// nothing.
    stage_seq: Option<u64>,
    base_ver: u32,
    chain_ver: u32,
    outcome: UpdateOutcome,
    engine: Weak<EngineShared>,
    finished: bool,
}

impl WritingChunk {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn staged(
        id: ChunkId,
        generation: Arc<Generation>,
        base: Option<Arc<Generation>>,
        stage_seq: u64,
        base_ver: u32,
        chain_ver: u32,
        engine: Weak<EngineShared>,
    ) -> Self {
        let mut outcome = UpdateOutcome::of(generation.meta());
        outcome.chain_ver = chain_ver;
        Self {
            id,
            generation: Some(generation),
            base,
            stage_seq: Some(stage_seq),
            base_ver,
            chain_ver,
            outcome,
            engine,
            finished: false,
        }
    }

    /// A request that needs no new generation: a replayed request or the
    /// removal of a missing chunk.
    pub(crate) fn noop(
        id: ChunkId,
        current: Option<Arc<Generation>>,
        engine: Weak<EngineShared>,
    ) -> Self {
        let outcome = match &current {
            Some(generation) => UpdateOutcome::of(generation.meta()),
            None => UpdateOutcome {
                non_existent: true,
                ..Default::default()
            },
        };
        let chain_ver = outcome.chain_ver;
        Self {
            id,
            base_ver: current.as_ref().map_or(0, |g| g.meta().chunk_ver),
            generation: current.clone(),
            base: current,
            stage_seq: None,
            chain_ver,
            outcome,
            engine,
            finished: false,
        }
    }

    pub fn id(&self) -> &ChunkId {
        &self.id
    }

    /// Metadata of the staged generation.
    pub fn raw_meta(&self) -> RawMeta {
        match &self.generation {
            Some(generation) => {
                let mut meta = *generation.meta();
                meta.chain_ver = self.chain_ver;
                meta
            }
            None => RawMeta {
                chain_ver: self.chain_ver,
                removed: true,
                ..Default::default()
            },
        }
    }

    pub fn tag(&self) -> Option<Tag> {
        self.generation.as_ref().and_then(|g| g.tag())
    }

    /// Whether the handle holds a staged generation awaiting commit.
    pub fn uncommitted(&self) -> bool {
        self.stage_seq.is_some()
    }

    /// The committed chunk this update was based on.
    pub fn raw_chunk(&self) -> Option<Chunk> {
        self.base
            .as_ref()
            .filter(|g| !g.is_removed())
            .map(|g| Chunk::new(self.id.clone(), Arc::clone(g), self.uncommitted()))
    }

    pub fn outcome(&self) -> UpdateOutcome {
        self.outcome
    }

    /// Publish the generation under a newer chain version.
    pub fn set_chain_ver(&mut self, chain_ver: u32) {
        self.chain_ver = chain_ver;
        self.outcome.chain_ver = chain_ver;
        if let (Some(stage_seq), Some(engine)) = (self.stage_seq, self.engine.upgrade()) {
            engine.ledger.set_chain_ver(&self.id, stage_seq, chain_ver);
        }
    }

    pub(crate) fn stage_seq(&self) -> Option<u64> {
        self.stage_seq
    }

    pub(crate) fn base_ver(&self) -> u32 {
        self.base_ver
    }

    pub(crate) fn chain_ver(&self) -> u32 {
        self.chain_ver
    }

    pub(crate) fn generation(&self) -> Option<&Arc<Generation>> {
        self.generation.as_ref()
    }

    pub(crate) fn engine(&self) -> &Weak<EngineShared> {
        &self.engine
    }

    /// The update took effect; dropping the handle no longer aborts it.
    pub(crate) fn finish(&mut self) {
        self.finished = true;
    }
}

impl Drop for WritingChunk {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let Some(stage_seq) = self.stage_seq else {
            return;
        };
        // A dead engine leaves the entry for recovery.
        if let Some(engine) = self.engine.upgrade() {
            engine.abort_staged(&self.id, stage_seq);
        }
    }
}

impl fmt::Debug for WritingChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WritingChunk")
            .field("id", &self.id)
            .field("stage_seq", &self.stage_seq)
            .field("chain_ver", &self.chain_ver)
            .field("outcome", &self.outcome)
            .finish()
    }
}
