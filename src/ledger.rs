//! Uncommitted ledger.
//!
//! Tracks generations that were staged by `update` but not yet committed or
//! aborted. An entry is *attached* while a live `WritingChunk` owns it, and
//! an *orphan* once that handle is gone without a decision (after a crash,
//! every entry recovered from the journal is an orphan).

use crate::index::Generation;
use crate::types::{ChunkId, RawMeta};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;
use std::sync::Arc;

/// One staged generation.
#[derive(Clone, Debug)]
pub struct UncommittedEntry {
    pub generation: Arc<Generation>,
    /// Chain version the generation was staged under. May be raised by the
    /// owner before commit.
    pub chain_ver: u32,
    /// Journal sequence of the `Stage` record.
    pub stage_seq: u64,
    /// Committed `chunk_ver` the update was based on, 0 when there was none.
    pub base_ver: u32,
    pub attached: bool,
}

impl UncommittedEntry {
    pub fn meta(&self) -> RawMeta {
        let mut meta = *self.generation.meta();
        meta.chain_ver = self.chain_ver;
        meta
    }
}

#[derive(Default)]
struct LedgerState {
    entries: BTreeMap<ChunkId, UncommittedEntry>,
    /// Ids with an update in flight.
    reserved: HashSet<ChunkId>,
}

/// Staged generations keyed by chunk id, at most one per id.
#[derive(Default)]
pub struct UncommittedLedger {
    state: Mutex<LedgerState>,
}

/// Exclusive right to stage a generation for one id. Released on drop.
pub struct Reservation<'a> {
    ledger: &'a UncommittedLedger,
    id: ChunkId,
}

impl Reservation<'_> {
    pub fn id(&self) -> &ChunkId {
        &self.id
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.ledger.state.lock().reserved.remove(&self.id);
    }
}

impl UncommittedLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from recovered entries; all of them start as orphans.
    pub fn from_entries(entries: impl IntoIterator<Item = (ChunkId, UncommittedEntry)>) -> Self {
        let entries = entries
            .into_iter()
            .map(|(id, mut entry)| {
                entry.attached = false;
                (id, entry)
            })
            .collect();
        Self {
            state: Mutex::new(LedgerState {
                entries,
                reserved: HashSet::new(),
            }),
        }
    }

    /// Reserve `id` for staging.
    ///
    /// Returns `None` when the id is busy: another update holds a
    /// reservation, or an attached entry exists. Otherwise returns the
    /// reservation plus the orphaned entry for the id, if any.
    pub fn reserve(&self, id: &ChunkId) -> Option<(Reservation<'_>, Option<UncommittedEntry>)> {
        let mut state = self.state.lock();
        if state.reserved.contains(id) {
            return None;
        }
        let orphan = match state.entries.get(id) {
            Some(entry) if entry.attached => return None,
            Some(entry) => Some(entry.clone()),
            None => None,
        };
        state.reserved.insert(id.clone());
        let reservation = Reservation {
            ledger: self,
            id: id.clone(),
        };
        Some((reservation, orphan))
    }

    /// Record a freshly staged generation. The caller holds the reservation.
    pub fn insert(&self, id: ChunkId, entry: UncommittedEntry) -> Option<UncommittedEntry> {
        self.state.lock().entries.insert(id, entry)
    }

    /// Attach to the orphan staged under `stage_seq`.
    pub fn attach(&self, id: &ChunkId, stage_seq: u64) -> bool {
        match self.state.lock().entries.get_mut(id) {
            Some(entry) if entry.stage_seq == stage_seq => {
                entry.attached = true;
                true
            }
            _ => false,
        }
    }

    /// Claim an orphan for a coordinator-driven commit. Fails when the id is
    /// reserved or the entry is attached.
    pub fn claim(&self, id: &ChunkId) -> Option<UncommittedEntry> {
        let mut state = self.state.lock();
        if state.reserved.contains(id) {
            return None;
        }
        let entry = state.entries.get_mut(id)?;
        if entry.attached {
            return None;
        }
        entry.attached = true;
        Some(entry.clone())
    }

    /// Entry for `id` if it is still the one staged under `stage_seq`.
    pub fn get(&self, id: &ChunkId, stage_seq: u64) -> Option<UncommittedEntry> {
        self.state
            .lock()
            .entries
            .get(id)
            .filter(|e| e.stage_seq == stage_seq)
            .cloned()
    }

    /// Entry for `id`, whichever stage it belongs to.
    pub fn entry(&self, id: &ChunkId) -> Option<UncommittedEntry> {
        self.state.lock().entries.get(id).cloned()
    }

    /// Raise the chain version of an entry.
    pub fn set_chain_ver(&self, id: &ChunkId, stage_seq: u64, chain_ver: u32) -> bool {
        match self.state.lock().entries.get_mut(id) {
            Some(entry) if entry.stage_seq == stage_seq => {
                entry.chain_ver = chain_ver;
                true
            }
            _ => false,
        }
    }

    /// Remove the entry for `id` if it was staged under `stage_seq`.
    pub fn remove(&self, id: &ChunkId, stage_seq: u64) -> Option<UncommittedEntry> {
        let mut state = self.state.lock();
        match state.entries.get(id) {
            Some(entry) if entry.stage_seq == stage_seq => state.entries.remove(id),
            _ => None,
        }
    }

    /// Hand a claimed entry back as an orphan.
    pub fn detach(&self, id: &ChunkId, stage_seq: u64) -> bool {
        match self.state.lock().entries.get_mut(id) {
            Some(entry) if entry.stage_seq == stage_seq => {
                entry.attached = false;
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, id: &ChunkId) -> bool {
        self.state.lock().entries.contains_key(id)
    }

    /// Whether `id` has a staged entry or an update in progress.
    pub fn is_busy(&self, id: &ChunkId) -> bool {
        let state = self.state.lock();
        state.entries.contains_key(id) || state.reserved.contains(id)
    }

    /// Entries with `begin <= id < end`, in id order.
    pub fn range(&self, begin: &[u8], end: Option<&[u8]>) -> Vec<(ChunkId, UncommittedEntry)> {
        if let Some(end) = end {
            if begin >= end {
                return Vec::new();
            }
        }
        let upper = match end {
            Some(end) => Bound::Excluded(end),
            None => Bound::Unbounded,
        };
        self.state
            .lock()
            .entries
            .range::<[u8], _>((Bound::Included(begin), upper))
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect()
    }

    pub fn snapshot(&self) -> Vec<(ChunkId, UncommittedEntry)> {
        self.range(&[], None)
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
