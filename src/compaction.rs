//! Group compaction.
//!
//! Sparse groups are marked retiring, their committed generations are copied
//! into fresh slots elsewhere and each move is journaled as a `Relocate`
//! record. A retiring group is deleted once no generation references it, and
//! only after a checkpoint, so no journal record still names it.

use crate::engine::{Engine, EngineShared};
use crate::error::Result;
use crate::groups::Group;
use crate::index::Generation;
use crate::metrics::EngineMetrics;
use crate::types::ChunkId;
use crate::wal::JournalOp;
use std::sync::Arc;

impl EngineShared {
    /// Evacuate sparse groups. Returns the number of groups deleted.
    pub(crate) fn compact_groups(&self, max_reserved: u64) -> Result<usize> {
        let _compacting = self.compaction.lock();

        let planned = self.groups.plan_compaction(max_reserved);
        if !planned.is_empty() {
            tracing::info!(groups = planned.len(), "planned group compaction");
        }

        let retiring: Vec<Arc<Group>> = self
            .groups
            .groups()
            .into_iter()
            .filter(|g| g.is_retiring())
            .collect();
        if retiring.is_empty() {
            return Ok(0);
        }

        let mut moved = 0;
        'groups: for group in &retiring {
            for (id, generation) in self.index.in_group(group.id()) {
                if self.groups.is_quitting() {
                    break 'groups;
                }
                if generation.is_removed() || generation.slot().is_none() {
                    continue;
                }
                if self.relocate(&id, &generation)? {
                    moved += 1;
                }
            }
        }

        if moved > 0 || retiring.iter().any(|g| g.used_slots() == 0) {
            self.checkpoint()?;
        }
        let removed = self.groups.remove_empty_retiring()?;
        tracing::info!(moved, removed, "finished group compaction");
        Ok(removed)
    }

    /// Copy one committed generation into a new slot and swap it in, unless
    /// a commit replaced it meanwhile.
    fn relocate(&self, id: &ChunkId, generation: &Arc<Generation>) -> Result<bool> {
        let data = generation.read_all()?;
        let slot = self
            .groups
            .allocate_with(generation.meta().len, || self.settle())?;
        {
            let _timer =
                EngineMetrics::timer(&self.metrics.pwrite_times, &self.metrics.pwrite_latency);
            slot.write_at(0, &data)?;
        }
        slot.group().file().sync_data()?;

        let relocated = Arc::new(Generation::new(
            *generation.meta(),
            generation.tag(),
            Some(slot),
        ));

        let mut journal = self.journal.lock();
        let still_current = self
            .index
            .current(id)
            .is_some_and(|current| Arc::ptr_eq(&current, generation));
        if !still_current {
            return Ok(false);
        }

        journal.append(
            JournalOp::Relocate {
                id: id.clone(),
                group: relocated.meta().group,
                pos: relocated.meta().pos,
                chunk_ver: relocated.meta().chunk_ver,
            },
            false,
        )?;
        let old = self.index.replace_if_current(id, generation, relocated);
        drop(journal);
        drop(old);

        tracing::debug!(chunk = %id, from = %generation.meta().group, "relocated chunk");
        Ok(true)
    }
}

impl Engine {
    /// Move committed chunks out of sparse groups and delete the groups
    /// left empty. Returns the number of groups deleted.
    ///
    /// Groups whose free space is at most `max_reserved` bytes are left
    /// alone.
    pub fn compact_groups(&self, max_reserved: u64) -> Result<usize> {
        self.shared.compact_groups(max_reserved)
    }
}
