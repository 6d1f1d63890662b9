//! Slot allocation over a pool of group files.

use super::file::{GroupFile, GroupLayout, GROUP_EXTENSION};
use crate::error::{EngineError, Result};
use crate::metrics::EngineMetrics;
use crate::types::{FdAndOffset, GroupId, RawUsedSize};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Allocator configuration. All sizes must be powers of two.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AllocatorConfig {
    /// Smallest slot size.
    pub min_slot_size: u32,

    /// Largest slot size served by normal groups; bigger slots live in
    /// ultra groups.
    pub max_normal_slot_size: u32,

    /// Largest chunk the engine accepts.
    pub max_chunk_size: u32,

    /// Slots per normal group.
    pub slots_per_group: u32,

    /// Slots per ultra group.
    pub slots_per_ultra_group: u32,

    /// Reserve disk blocks for new group files instead of creating them sparse.
    pub preallocate: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            min_slot_size: 64 * 1024,
            max_normal_slot_size: 1024 * 1024,
            max_chunk_size: 64 * 1024 * 1024,
            slots_per_group: 256,
            slots_per_ultra_group: 16,
            preallocate: false,
        }
    }
}

impl AllocatorConfig {
    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("min_slot_size", self.min_slot_size),
            ("max_normal_slot_size", self.max_normal_slot_size),
            ("max_chunk_size", self.max_chunk_size),
        ] {
            if !value.is_power_of_two() {
                return Err(EngineError::InvalidArgument(format!(
                    "{} must be a power of two, got {}",
                    name, value
                )));
            }
        }
        if self.min_slot_size > self.max_normal_slot_size
            || self.max_normal_slot_size > self.max_chunk_size
        {
            return Err(EngineError::InvalidArgument(
                "slot sizes must satisfy min <= max_normal <= max_chunk".into(),
            ));
        }
        if self.slots_per_group == 0 || self.slots_per_ultra_group == 0 {
            return Err(EngineError::InvalidArgument(
                "groups need at least one slot".into(),
            ));
        }
        Ok(())
    }

    /// Slot size serving a chunk of `len` bytes.
    pub fn slot_size_for(&self, len: u32) -> Result<u32> {
        if len > self.max_chunk_size {
            return Err(EngineError::InvalidArgument(format!(
                "Chunk length {} exceeds max chunk size {}",
                len, self.max_chunk_size
            )));
        }
        Ok(len.max(self.min_slot_size).next_power_of_two())
    }

    pub fn is_ultra(&self, slot_size: u32) -> bool {
        slot_size > self.max_normal_slot_size
    }

    /// All slot sizes of one kind, smallest first.
    pub fn classes(&self, ultra: bool) -> Vec<u32> {
        let mut classes = Vec::new();
        let mut size = self.min_slot_size;
        while size <= self.max_chunk_size {
            if self.is_ultra(size) == ultra {
                classes.push(size);
            }
            match size.checked_mul(2) {
                Some(next) => size = next,
                None => break,
            }
        }
        classes
    }
}

#[derive(Debug)]
struct SlotState {
    /// Generations referencing each slot.
    refs: Vec<u32>,
    free: BTreeSet<u32>,
    /// Unreferenced slots not reusable until the journal records that
    /// released them are durable.
    pending: BTreeSet<u32>,
    /// Per slot, the longest dropped generation whose replacement may not
    /// be durable yet. Bytes below it must not change in place.
    guarded: BTreeMap<u32, u32>,
}

/// One group file plus its slot bookkeeping.
pub struct Group {
    file: GroupFile,
    state: Mutex<SlotState>,
    retiring: AtomicBool,
}

impl Group {
    fn new(file: GroupFile) -> Self {
        let count = file.layout().slot_count;
        Self {
            file,
            state: Mutex::new(SlotState {
                refs: vec![0; count as usize],
                free: (0..count).collect(),
                pending: BTreeSet::new(),
                guarded: BTreeMap::new(),
            }),
            retiring: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> GroupId {
        self.file.layout().id
    }

    pub fn layout(&self) -> &GroupLayout {
        self.file.layout()
    }

    pub fn file(&self) -> &GroupFile {
        &self.file
    }

    /// Slots no generation references, including those awaiting a journal
    /// sync before reuse.
    pub fn free_slots(&self) -> u32 {
        let state = self.state.lock();
        (state.free.len() + state.pending.len()) as u32
    }

    /// Slots that can be handed out right now.
    fn available_slots(&self) -> u32 {
        self.state.lock().free.len() as u32
    }

    fn has_pending(&self) -> bool {
        !self.state.lock().pending.is_empty()
    }

    /// Whether every slot is free and none awaits a journal sync.
    fn is_vacant(&self) -> bool {
        self.state.lock().free.len() as u32 == self.layout().slot_count
    }

    pub fn used_slots(&self) -> u32 {
        self.layout().slot_count - self.free_slots()
    }

    /// Sum of reference counts over all slots.
    pub fn total_refs(&self) -> u64 {
        self.state.lock().refs.iter().map(|&r| r as u64).sum()
    }

    pub fn is_retiring(&self) -> bool {
        self.retiring.load(Ordering::Acquire)
    }

    fn take_free(&self) -> Option<u32> {
        let mut state = self.state.lock();
        let slot = state.free.pop_first()?;
        state.refs[slot as usize] = 1;
        Some(slot)
    }

    fn retain(&self, slot: u32) {
        let mut state = self.state.lock();
        if state.refs[slot as usize] == 0 {
            state.free.remove(&slot);
            state.pending.remove(&slot);
        }
        state.refs[slot as usize] += 1;
    }

    fn release(&self, slot: u32) {
        let mut state = self.state.lock();
        let refs = &mut state.refs[slot as usize];
        debug_assert!(*refs > 0, "slot released more often than retained");
        *refs = refs.saturating_sub(1);
        if *refs == 0 {
            state.pending.insert(slot);
        }
    }

    fn guard(&self, slot: u32, len: u32) {
        let mut state = self.state.lock();
        let guarded = state.guarded.entry(slot).or_insert(0);
        *guarded = (*guarded).max(len);
    }

    /// Make pending slots reusable and drop all guards.
    fn settle(&self) {
        let mut state = self.state.lock();
        let pending = std::mem::take(&mut state.pending);
        state.free.extend(pending);
        state.guarded.clear();
    }

    fn ref_count(&self, slot: u32) -> u32 {
        self.state.lock().refs[slot as usize]
    }

    fn can_extend(&self, slot: u32, from: u32) -> bool {
        let state = self.state.lock();
        state.refs[slot as usize] == 1
            && state.guarded.get(&slot).map_or(true, |&guarded| guarded <= from)
    }
}

/// A counted reference to one slot.
///
/// Every generation whose bytes live in a slot holds one `SlotRef`. When the
/// last reference is dropped the slot becomes pending; it is handed out again
/// only after [`GroupAllocator::release_pending`], once the journal records
/// that superseded its generations are durable.
pub struct SlotRef {
    group: Arc<Group>,
    slot: u32,
}

impl SlotRef {
    pub fn group(&self) -> &Arc<Group> {
        &self.group
    }

    pub fn group_id(&self) -> GroupId {
        self.group.id()
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// Byte offset of the slot within the group file.
    pub fn pos(&self) -> u64 {
        self.group.layout().slot_offset(self.slot)
    }

    pub fn slot_size(&self) -> u32 {
        self.group.layout().slot_size
    }

    /// Generations currently sharing this slot.
    pub fn ref_count(&self) -> u32 {
        self.group.ref_count(self.slot)
    }

    /// Whether this reference is the only one to the slot.
    pub fn is_exclusive(&self) -> bool {
        self.ref_count() == 1
    }

    /// Whether bytes from `from` on may be written in place: the reference
    /// is exclusive and no dropped generation not yet superseded durably
    /// extends past `from`.
    pub fn can_extend(&self, from: u32) -> bool {
        self.group.can_extend(self.slot, from)
    }

    /// Record that a generation of `len` bytes in this slot was dropped.
    pub(crate) fn guard(&self, len: u32) {
        self.group.guard(self.slot, len);
    }

    pub fn read_at(&self, offset: u32, buf: &mut [u8]) -> Result<()> {
        self.group.file().read_at(self.slot, offset, buf)
    }

    pub fn write_at(&self, offset: u32, data: &[u8]) -> Result<()> {
        self.group.file().write_at(self.slot, offset, data)
    }

    pub fn fd_and_offset(&self) -> FdAndOffset {
        FdAndOffset {
            fd: self.group.file().raw_fd(),
            offset: self.pos(),
        }
    }
}

impl Clone for SlotRef {
    fn clone(&self) -> Self {
        self.group.retain(self.slot);
        Self {
            group: Arc::clone(&self.group),
            slot: self.slot,
        }
    }
}

impl Drop for SlotRef {
    fn drop(&mut self) {
        self.group.release(self.slot);
    }
}

impl std::fmt::Debug for SlotRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SlotRef({}:{})", self.group_id(), self.slot)
    }
}

/// Hands out slots from group files and maintains the pool of groups.
pub struct GroupAllocator {
    dir: PathBuf,
    config: AllocatorConfig,
    groups: RwLock<BTreeMap<GroupId, Arc<Group>>>,
    next_id: AtomicU32,
    allow_to_allocate: AtomicBool,
    quit: AtomicBool,
    create_lock: Mutex<()>,
    metrics: Arc<EngineMetrics>,
}

impl GroupAllocator {
    /// Open every group file in `dir`, creating the directory if needed.
    pub fn open(
        dir: impl AsRef<Path>,
        config: AllocatorConfig,
        metrics: Arc<EngineMetrics>,
    ) -> Result<Self> {
        config.validate()?;
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut groups = BTreeMap::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(GROUP_EXTENSION) {
                continue;
            }
            let file = GroupFile::open(&path)?;
            let id = file.layout().id;
            if id.is_none() || groups.contains_key(&id) {
                return Err(EngineError::Corruption(format!(
                    "Duplicate or invalid group id {} in {}",
                    id,
                    path.display()
                )));
            }
            groups.insert(id, Arc::new(Group::new(file)));
        }

        let next_id = groups.keys().next_back().map(|id| id.0 + 1).unwrap_or(1);
        tracing::info!(groups = groups.len(), dir = %dir.display(), "opened group allocator");

        Ok(Self {
            dir,
            config,
            groups: RwLock::new(groups),
            next_id: AtomicU32::new(next_id),
            allow_to_allocate: AtomicBool::new(true),
            quit: AtomicBool::new(false),
            create_lock: Mutex::new(()),
            metrics,
        })
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub fn set_allow_to_allocate(&self, allow: bool) {
        self.allow_to_allocate.store(allow, Ordering::Release);
    }

    pub fn allow_to_allocate(&self) -> bool {
        self.allow_to_allocate.load(Ordering::Acquire)
    }

    /// Ask long-running allocator loops to stop at the next step.
    pub fn speed_up_quit(&self) {
        self.quit.store(true, Ordering::Release);
    }

    pub fn is_quitting(&self) -> bool {
        self.quit.load(Ordering::Acquire)
    }

    pub fn group(&self, id: GroupId) -> Option<Arc<Group>> {
        self.groups.read().get(&id).cloned()
    }

    pub fn groups(&self) -> Vec<Arc<Group>> {
        self.groups.read().values().cloned().collect()
    }

    /// Allocate a slot able to hold `len` bytes without reusing pending
    /// slots.
    pub fn allocate(&self, len: u32) -> Result<SlotRef> {
        self.allocate_with(len, || Ok(()))
    }

    /// Allocate a slot able to hold `len` bytes. When the class only has
    /// pending slots left, `settle` runs first; it must make the journal
    /// durable and call [`release_pending`](Self::release_pending).
    pub fn allocate_with(
        &self,
        len: u32,
        settle: impl FnOnce() -> Result<()>,
    ) -> Result<SlotRef> {
        let _timer =
            EngineMetrics::timer(&self.metrics.allocate_times, &self.metrics.allocate_latency);
        let slot_size = self.config.slot_size_for(len)?;

        if let Some(slot) = self.try_take(slot_size) {
            return Ok(slot);
        }
        if self.has_pending(slot_size) {
            settle()?;
        }

        loop {
            if let Some(slot) = self.try_take(slot_size) {
                return Ok(slot);
            }
            if !self.allow_to_allocate() {
                return Err(EngineError::NoSpace(slot_size as u64));
            }
            self.create_group(slot_size)?;
        }
    }

    /// Hand slots released since the last journal sync back to the free
    /// sets. The caller holds the journal lock and has synced it.
    pub fn release_pending(&self) {
        for group in self.groups() {
            group.settle();
        }
    }

    fn has_pending(&self, slot_size: u32) -> bool {
        self.groups
            .read()
            .values()
            .filter(|g| g.layout().slot_size == slot_size && !g.is_retiring())
            .any(|g| g.has_pending())
    }

    /// Take a reference on a slot named by `(group, pos)`, used when
    /// rebuilding state from the journal.
    pub fn attach(&self, group: GroupId, pos: u64) -> Result<SlotRef> {
        let group = self.group(group).ok_or_else(|| {
            EngineError::Corruption(format!("Generation refers to missing group {}", group))
        })?;
        let slot = group.layout().slot_at(pos).ok_or_else(|| {
            EngineError::Corruption(format!(
                "Position {} is not a slot boundary in group {}",
                pos,
                group.id()
            ))
        })?;
        group.retain(slot);
        Ok(SlotRef { group, slot })
    }

    /// Keep between `min_remain` and `max_remain` groups with free slots in
    /// every normal size class. Returns the number of groups created.
    pub fn allocate_groups(
        &self,
        min_remain: usize,
        max_remain: usize,
        batch_size: usize,
    ) -> Result<usize> {
        self.fill_pool(false, min_remain, max_remain, batch_size)
    }

    /// Same as [`allocate_groups`](Self::allocate_groups) for ultra classes.
    pub fn allocate_ultra_groups(
        &self,
        min_remain: usize,
        max_remain: usize,
        batch_size: usize,
    ) -> Result<usize> {
        self.fill_pool(true, min_remain, max_remain, batch_size)
    }

    fn fill_pool(
        &self,
        ultra: bool,
        min_remain: usize,
        max_remain: usize,
        batch_size: usize,
    ) -> Result<usize> {
        let mut created = 0;
        for slot_size in self.config.classes(ultra) {
            let mut remain = self.remain_groups(slot_size);
            if remain >= min_remain {
                continue;
            }
            while remain < max_remain.max(min_remain) && created < batch_size {
                if self.is_quitting() || !self.allow_to_allocate() {
                    return Ok(created);
                }
                self.create_group(slot_size)?;
                remain += 1;
                created += 1;
            }
        }
        Ok(created)
    }

    /// Number of usable groups of a class that still have a free slot.
    pub fn remain_groups(&self, slot_size: u32) -> usize {
        self.groups
            .read()
            .values()
            .filter(|g| g.layout().slot_size == slot_size && !g.is_retiring())
            .filter(|g| g.free_slots() > 0)
            .count()
    }

    /// Mark groups for evacuation.
    ///
    /// Per slot size, the fullest groups that can absorb the live slots of the
    /// others are kept; every other partially used group whose free space
    /// exceeds `max_reserved` is marked retiring and returned.
    pub fn plan_compaction(&self, max_reserved: u64) -> Vec<Arc<Group>> {
        let mut by_size: BTreeMap<u32, Vec<Arc<Group>>> = BTreeMap::new();
        for group in self.groups() {
            if !group.is_retiring() {
                by_size.entry(group.layout().slot_size).or_default().push(group);
            }
        }

        let mut victims = Vec::new();
        for (_, mut groups) in by_size {
            groups.retain(|g| g.used_slots() > 0);
            groups.sort_by_key(|g| std::cmp::Reverse(g.used_slots()));

            let mut spare = 0u64;
            let mut split = groups.len();
            for (i, group) in groups.iter().enumerate() {
                let rest: u64 = groups[i..].iter().map(|g| g.used_slots() as u64).sum();
                if spare >= rest {
                    split = i;
                    break;
                }
                spare += group.free_slots() as u64;
            }

            for group in groups.drain(split..) {
                let free_bytes = group.free_slots() as u64 * group.layout().slot_size as u64;
                if free_bytes > max_reserved {
                    group.retiring.store(true, Ordering::Release);
                    victims.push(group);
                }
            }
        }
        victims
    }

    /// Delete retiring groups whose slots are all free. Returns how many
    /// were removed.
    pub fn remove_empty_retiring(&self) -> Result<usize> {
        let mut groups = self.groups.write();
        let empty: Vec<GroupId> = groups
            .values()
            .filter(|g| g.is_retiring() && g.is_vacant())
            .map(|g| g.id())
            .collect();

        for id in &empty {
            if let Some(group) = groups.remove(id) {
                group.file().remove()?;
                tracing::info!(group = %id, "removed compacted group");
            }
        }
        Ok(empty.len())
    }

    /// Engine-wide space accounting.
    pub fn raw_used_size(&self) -> RawUsedSize {
        let mut used = RawUsedSize::default();
        for group in self.groups() {
            let slot_size = group.layout().slot_size as u64;
            let used_slots = group.used_slots() as u64;
            used.allocated_size += used_slots * slot_size;
            used.reserved_size += group.layout().capacity();
            used.position_count += used_slots;
            used.position_rc += group.total_refs();
        }
        used
    }

    fn try_take(&self, slot_size: u32) -> Option<SlotRef> {
        let mut candidates: Vec<Arc<Group>> = self
            .groups
            .read()
            .values()
            .filter(|g| g.layout().slot_size == slot_size && !g.is_retiring())
            .cloned()
            .collect();
        // Fill the fullest group first so sparse groups drain and can be compacted.
        candidates.sort_by_key(|g| g.available_slots());

        candidates.into_iter().find_map(|group| {
            let slot = group.take_free()?;
            Some(SlotRef { group, slot })
        })
    }

    fn create_group(&self, slot_size: u32) -> Result<Arc<Group>> {
        let _lock = self.create_lock.lock();

        let id = GroupId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let ultra = self.config.is_ultra(slot_size);
        let layout = GroupLayout {
            id,
            slot_size,
            slot_count: if ultra {
                self.config.slots_per_ultra_group
            } else {
                self.config.slots_per_group
            },
            ultra,
        };

        let file = GroupFile::create(&self.dir, layout, self.config.preallocate)?;
        let group = Arc::new(Group::new(file));
        self.groups.write().insert(id, Arc::clone(&group));

        tracing::info!(group = %id, slot_size, ultra, "created group");
        Ok(group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn small_config() -> AllocatorConfig {
        AllocatorConfig {
            min_slot_size: 4096,
            max_normal_slot_size: 8192,
            max_chunk_size: 32768,
            slots_per_group: 4,
            slots_per_ultra_group: 2,
            preallocate: false,
        }
    }

    fn allocator(dir: &TempDir) -> GroupAllocator {
        GroupAllocator::open(dir.path(), small_config(), Arc::new(EngineMetrics::new())).unwrap()
    }

    #[test]
    fn test_classes() {
        let config = small_config();
        assert_eq!(config.classes(false), vec![4096, 8192]);
        assert_eq!(config.classes(true), vec![16384, 32768]);
        assert_eq!(config.slot_size_for(0).unwrap(), 4096);
        assert_eq!(config.slot_size_for(4097).unwrap(), 8192);
        assert!(config.slot_size_for(32769).is_err());
    }

    #[test]
    fn test_allocate_creates_group_on_demand() {
        let dir = TempDir::new().unwrap();
        let alloc = allocator(&dir);

        let slot = alloc.allocate(100).unwrap();
        assert_eq!(slot.slot_size(), 4096);
        assert!(slot.is_exclusive());
        assert_eq!(alloc.groups().len(), 1);
    }

    #[test]
    fn test_slot_freed_when_last_ref_dropped() {
        let dir = TempDir::new().unwrap();
        let alloc = allocator(&dir);

        let slot = alloc.allocate(100).unwrap();
        let group = Arc::clone(slot.group());
        let shared = slot.clone();
        assert_eq!(slot.ref_count(), 2);
        assert_eq!(group.used_slots(), 1);

        drop(slot);
        assert_eq!(group.used_slots(), 1);
        drop(shared);
        assert_eq!(group.used_slots(), 0);
        assert_eq!(group.free_slots(), 4);
    }

    #[test]
    fn test_released_slot_waits_for_settle() {
        let dir = TempDir::new().unwrap();
        let alloc = allocator(&dir);

        let first = alloc.allocate(100).unwrap();
        let released = first.slot();
        drop(first);

        // Pending slots are not handed out by a plain allocation.
        let second = alloc.allocate(100).unwrap();
        assert_ne!(second.slot(), released);

        alloc.release_pending();
        let third = alloc.allocate(100).unwrap();
        assert_eq!(third.slot(), released);
    }

    #[test]
    fn test_allocate_settles_before_growing() {
        let dir = TempDir::new().unwrap();
        let alloc = allocator(&dir);

        let mut slots: Vec<SlotRef> = (0..4).map(|_| alloc.allocate(10).unwrap()).collect();
        slots.pop();
        alloc.set_allow_to_allocate(false);

        let mut settled = false;
        let slot = alloc
            .allocate_with(10, || {
                settled = true;
                alloc.release_pending();
                Ok(())
            })
            .unwrap();
        assert!(settled);
        assert_eq!(slot.slot(), 3);
        assert_eq!(alloc.groups().len(), 1);
    }

    #[test]
    fn test_guard_blocks_in_place_extension() {
        let dir = TempDir::new().unwrap();
        let alloc = allocator(&dir);

        let slot = alloc.allocate(100).unwrap();
        assert!(slot.can_extend(0));

        let shorter = slot.clone();
        assert!(!shorter.can_extend(3));
        slot.guard(8);
        drop(slot);
        assert!(!shorter.can_extend(3));
        assert!(shorter.can_extend(8));

        alloc.release_pending();
        assert!(shorter.can_extend(3));
    }

    #[test]
    fn test_allocation_disallowed() {
        let dir = TempDir::new().unwrap();
        let alloc = allocator(&dir);
        alloc.set_allow_to_allocate(false);

        assert!(matches!(alloc.allocate(10), Err(EngineError::NoSpace(4096))));
        assert_eq!(alloc.allocate_groups(1, 2, 10).unwrap(), 0);
    }

    #[test]
    fn test_allocate_groups_fills_pool() {
        let dir = TempDir::new().unwrap();
        let alloc = allocator(&dir);

        let created = alloc.allocate_groups(1, 2, 10).unwrap();
        assert_eq!(created, 4);
        assert_eq!(alloc.remain_groups(4096), 2);
        assert_eq!(alloc.remain_groups(8192), 2);

        // Already above the low watermark.
        assert_eq!(alloc.allocate_groups(1, 2, 10).unwrap(), 0);

        let created = alloc.allocate_ultra_groups(1, 1, 1).unwrap();
        assert_eq!(created, 1);
    }

    #[test]
    fn test_allocate_groups_respects_quit() {
        let dir = TempDir::new().unwrap();
        let alloc = allocator(&dir);
        alloc.speed_up_quit();
        assert_eq!(alloc.allocate_groups(1, 2, 10).unwrap(), 0);
    }

    #[test]
    fn test_reopen_and_attach() {
        let dir = TempDir::new().unwrap();
        let (group_id, pos) = {
            let alloc = allocator(&dir);
            let slot = alloc.allocate(100).unwrap();
            slot.write_at(0, b"persist").unwrap();
            (slot.group_id(), slot.pos())
        };

        let alloc = allocator(&dir);
        let slot = alloc.attach(group_id, pos).unwrap();
        let mut buf = [0u8; 7];
        slot.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"persist");

        // The attached slot is no longer handed out.
        let other = alloc.allocate(100).unwrap();
        assert_ne!(other.slot(), slot.slot());

        assert!(matches!(
            alloc.attach(GroupId(99), pos),
            Err(EngineError::Corruption(_))
        ));
    }

    #[test]
    fn test_plan_compaction_keeps_fullest() {
        let dir = TempDir::new().unwrap();
        let alloc = allocator(&dir);

        // Fill one group, then put a single slot into a second group.
        let mut slots: Vec<SlotRef> = (0..5).map(|_| alloc.allocate(10).unwrap()).collect();
        assert_eq!(alloc.groups().len(), 2);
        // Free two slots in the first group so it can absorb the straggler.
        slots.drain(0..2);

        let victims = alloc.plan_compaction(0);
        assert_eq!(victims.len(), 1);
        assert_eq!(victims[0].used_slots(), 1);
        assert!(victims[0].is_retiring());

        // Retiring groups are skipped by allocation.
        let fresh = alloc.allocate(10).unwrap();
        assert_ne!(fresh.group_id(), victims[0].id());

        drop(slots);
        // Released slots still await a journal sync.
        assert_eq!(alloc.remove_empty_retiring().unwrap(), 0);
        alloc.release_pending();
        assert_eq!(alloc.remove_empty_retiring().unwrap(), 1);
        assert!(alloc.group(victims[0].id()).is_none());
    }

    #[test]
    fn test_raw_used_size() {
        let dir = TempDir::new().unwrap();
        let alloc = allocator(&dir);
        let slot = alloc.allocate(10).unwrap();
        let _shared = slot.clone();

        let used = alloc.raw_used_size();
        assert_eq!(used.allocated_size, 4096);
        assert_eq!(used.reserved_size, 4 * 4096);
        assert_eq!(used.position_count, 1);
        assert_eq!(used.position_rc, 2);
    }
}
