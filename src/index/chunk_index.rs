//! Ordered map from chunk id to its committed generation.

use super::generation::Generation;
use crate::types::{ChunkId, GroupId, Timestamp};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

/// Committed generations keyed by chunk id.
///
/// Removed chunks stay in the map as tombstones so their version history
/// survives re-creation. Lookups and scans skip them.
#[derive(Default)]
pub struct ChunkIndex {
    entries: RwLock<BTreeMap<ChunkId, Arc<Generation>>>,
}

impl ChunkIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a list of generations.
    pub fn from_entries(entries: impl IntoIterator<Item = (ChunkId, Arc<Generation>)>) -> Self {
        Self {
            entries: RwLock::new(entries.into_iter().collect()),
        }
    }

    /// Current generation, tombstones included.
    pub fn current(&self, id: &ChunkId) -> Option<Arc<Generation>> {
        self.entries.read().get(id).cloned()
    }

    /// Current live generation.
    pub fn get(&self, id: &ChunkId) -> Option<Arc<Generation>> {
        self.current(id).filter(|g| !g.is_removed())
    }

    /// Live generations of several ids from one snapshot.
    pub fn get_batch(&self, ids: &[ChunkId]) -> Vec<Option<Arc<Generation>>> {
        let entries = self.entries.read();
        ids.iter()
            .map(|id| entries.get(id).filter(|g| !g.is_removed()).cloned())
            .collect()
    }

    /// Install new generations under one write lock. Returns the superseded
    /// ones so the caller can drop them outside the lock.
    pub fn publish(
        &self,
        updates: impl IntoIterator<Item = (ChunkId, Arc<Generation>)>,
    ) -> Vec<Arc<Generation>> {
        let mut entries = self.entries.write();
        updates
            .into_iter()
            .filter_map(|(id, generation)| entries.insert(id, generation))
            .collect()
    }

    /// Swap `id` to `new` only if it still points at `expected`.
    pub fn replace_if_current(
        &self,
        id: &ChunkId,
        expected: &Arc<Generation>,
        new: Arc<Generation>,
    ) -> Option<Arc<Generation>> {
        let mut entries = self.entries.write();
        match entries.get_mut(id) {
            Some(current) if Arc::ptr_eq(current, expected) => {
                Some(std::mem::replace(current, new))
            }
            _ => None,
        }
    }

    /// Live generations with `begin <= id < end`, in id order. `None` for
    /// `end` means unbounded; `max_count == 0` means unlimited.
    pub fn range(
        &self,
        begin: &[u8],
        end: Option<&[u8]>,
        max_count: usize,
    ) -> Vec<(ChunkId, Arc<Generation>)> {
        self.scan(begin, end, max_count, |_| true)
    }

    /// Like [`range`](Self::range), keeping only generations accepted by `filter`.
    pub fn scan(
        &self,
        begin: &[u8],
        end: Option<&[u8]>,
        max_count: usize,
        mut filter: impl FnMut(&Generation) -> bool,
    ) -> Vec<(ChunkId, Arc<Generation>)> {
        let limit = if max_count == 0 { usize::MAX } else { max_count };
        let upper = match end {
            Some(end) => Bound::Excluded(end),
            None => Bound::Unbounded,
        };
        if let Some(end) = end {
            if begin >= end {
                return Vec::new();
            }
        }

        let entries = self.entries.read();
        entries
            .range::<[u8], _>((Bound::Included(begin), upper))
            .filter(|(_, g)| !g.is_removed() && filter(g))
            .take(limit)
            .map(|(id, g)| (id.clone(), Arc::clone(g)))
            .collect()
    }

    /// Every entry, tombstones included.
    pub fn snapshot(&self) -> Vec<(ChunkId, Arc<Generation>)> {
        self.entries
            .read()
            .iter()
            .map(|(id, g)| (id.clone(), Arc::clone(g)))
            .collect()
    }

    /// Drop tombstones committed at or before `cutoff`, except for ids
    /// `keep` selects. Returns the number dropped.
    pub fn prune_tombstones(&self, cutoff: Timestamp, keep: impl Fn(&ChunkId) -> bool) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|id, g| !g.is_removed() || g.meta().timestamp > cutoff || keep(id));
        before - entries.len()
    }

    /// Generations whose bytes live in `group`.
    pub fn in_group(&self, group: GroupId) -> Vec<(ChunkId, Arc<Generation>)> {
        self.entries
            .read()
            .iter()
            .filter(|(_, g)| g.meta().group == group)
            .map(|(id, g)| (id.clone(), Arc::clone(g)))
            .collect()
    }

    /// Number of live chunks.
    pub fn len(&self) -> usize {
        self.entries.read().values().filter(|g| !g.is_removed()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
