//! Main Engine struct tying all components together.

use crate::background::{BackgroundConfig, BackgroundWorker};
use crate::error::{EngineError, Result};
use crate::groups::{AllocatorConfig, GroupAllocator};
use crate::index::{Chunk, ChunkIndex};
use crate::ledger::{UncommittedEntry, UncommittedLedger};
use crate::metrics::{EngineMetrics, Metrics};
use crate::recovery;
use crate::types::{ChunkId, RawUsedSize, Timestamp};
use crate::update::{self, CommitReply, UpdateReply, UpdateReq, WritePolicy, WritingChunk};
use crate::wal::{Checkpoint, CheckpointChunk, CheckpointStaged, Journal, JournalOp};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Magic bytes for the engine manifest.
const ENGINE_MAGIC: &[u8; 4] = b"CKE\0";

/// Current engine format version.
const ENGINE_VERSION: u8 = 1;

const MANIFEST_FILE: &str = "MANIFEST";
const LOCK_FILE: &str = "LOCK";
const GROUPS_DIR: &str = "groups";
const JOURNAL_FILE: &str = "journal.wal";
const CHECKPOINT_FILE: &str = "checkpoint.bin";

/// Engine configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding the engine files.
    pub path: PathBuf,

    /// Whether to create the engine if it doesn't exist.
    pub create_if_missing: bool,

    /// Length of the id prefix used to shard chunks. Updates of shorter ids
    /// and queries with longer prefixes are rejected.
    pub id_prefix_len: usize,

    pub allocator: AllocatorConfig,

    /// fsync `Stage` journal records before the data write.
    pub sync_staging: bool,

    /// Journal entries after which [`Engine::checkpoint_if_needed`] writes a
    /// checkpoint.
    pub checkpoint_threshold: u64,

    /// How long tombstones keep their version history. Older ones are
    /// dropped at the next checkpoint; `None` keeps them forever.
    pub tombstone_retention: Option<Duration>,

    /// Maintenance thread settings; `None` runs no thread.
    pub background: Option<BackgroundConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./chunks"),
            create_if_missing: true,
            id_prefix_len: 0,
            allocator: AllocatorConfig::default(),
            sync_staging: false,
            checkpoint_threshold: 16 * 1024,
            tombstone_retention: Some(Duration::from_secs(7 * 24 * 3600)),
            background: None,
        }
    }
}

/// State shared between the engine handle, writing chunks and the
/// background worker.
pub(crate) struct EngineShared {
    pub(crate) config: EngineConfig,

    /// Lock file for exclusive access.
    _lock_file: File,

    pub(crate) groups: GroupAllocator,
    pub(crate) index: ChunkIndex,
    pub(crate) ledger: UncommittedLedger,
    pub(crate) journal: Journal,
    pub(crate) metrics: Arc<EngineMetrics>,

    /// Serializes compaction passes.
    pub(crate) compaction: Mutex<()>,
}

impl EngineShared {
    pub(crate) fn write_policy(&self) -> WritePolicy<'_> {
        WritePolicy {
            allocator: &self.groups,
            metrics: &self.metrics,
            journal: &self.journal,
        }
    }

    /// Sync the journal and make the slots its records released reusable.
    pub(crate) fn settle(&self) -> Result<()> {
        self.journal.sync_then(|| self.groups.release_pending())
    }

    /// Drop the staged generation `stage_seq` of `id`, if it is still in
    /// the ledger. Returns the removed entry.
    pub(crate) fn discard(
        &self,
        id: &ChunkId,
        stage_seq: u64,
    ) -> Result<Option<UncommittedEntry>> {
        let mut journal = self.journal.lock();
        let Some(entry) = self.ledger.remove(id, stage_seq) else {
            return Ok(None);
        };
        journal.append(
            JournalOp::Discard {
                id: id.clone(),
                stage_seq,
            },
            false,
        )?;
        Ok(Some(entry))
    }

    /// Best-effort abort used when a writing chunk is dropped.
    pub(crate) fn abort_staged(&self, id: &ChunkId, stage_seq: u64) {
        if let Err(e) = self.discard(id, stage_seq) {
            tracing::warn!(chunk = %id, stage_seq, error = %e, "failed to journal discard");
        }
    }

    /// Snapshot the index and ledger and truncate the journal.
    pub(crate) fn checkpoint(&self) -> Result<()> {
        let mut journal = self.journal.lock();

        if let Some(retention) = self.config.tombstone_retention {
            let age = u64::try_from(retention.as_micros()).unwrap_or(u64::MAX);
            let cutoff = Timestamp(Timestamp::now().0.saturating_sub(age));
            let pruned = self
                .index
                .prune_tombstones(cutoff, |id| self.ledger.is_busy(id));
            if pruned > 0 {
                tracing::debug!(pruned, "pruned expired tombstones");
            }
        }

        let committed = self
            .index
            .snapshot()
            .into_iter()
            .map(|(id, generation)| CheckpointChunk {
                id,
                meta: *generation.meta(),
                tag: generation.tag(),
            })
            .collect::<Vec<_>>();
        let uncommitted = self
            .ledger
            .snapshot()
            .into_iter()
            .map(|(id, entry)| CheckpointStaged {
                id,
                meta: *entry.generation.meta(),
                tag: entry.generation.tag(),
                chain_ver: entry.chain_ver,
                stage_seq: entry.stage_seq,
                base_ver: entry.base_ver,
            })
            .collect::<Vec<_>>();

        let checkpoint = Checkpoint {
            last_seq: journal.last_seq(),
            committed,
            uncommitted,
        };
        checkpoint.save(self.config.path.join(CHECKPOINT_FILE))?;
        journal.clear()?;
        self.groups.release_pending();

        tracing::info!(
            last_seq = checkpoint.last_seq,
            committed = checkpoint.committed.len(),
            uncommitted = checkpoint.uncommitted.len(),
            "wrote checkpoint"
        );
        Ok(())
    }

    /// Checkpoint once the journal has grown past the configured threshold.
    pub(crate) fn checkpoint_if_needed(&self) -> Result<bool> {
        if self.journal.pending() < self.config.checkpoint_threshold {
            return Ok(false);
        }
        self.checkpoint()?;
        Ok(true)
    }
}

/// The chunk engine.
///
/// Provides a unified interface for:
/// - Reading committed chunks and scanning id ranges
/// - Staging and committing updates
/// - Recovering uncommitted updates after a crash
/// - Maintaining and compacting the group pool
///
/// Dropping the engine without [`release`](Self::release) behaves like a
/// crash: the next open replays the journal.
pub struct Engine {
    pub(crate) shared: Arc<EngineShared>,
    pub(crate) background: Mutex<Option<BackgroundWorker>>,
}

impl Engine {
    /// Open the engine in `path`, creating it when `create_if_missing`.
    pub fn create(
        path: impl AsRef<Path>,
        create_if_missing: bool,
        id_prefix_len: usize,
    ) -> Result<Self> {
        Self::open(EngineConfig {
            path: path.as_ref().to_path_buf(),
            create_if_missing,
            id_prefix_len,
            ..Default::default()
        })
    }

    /// Open an existing engine or create a new one.
    pub fn open(config: EngineConfig) -> Result<Self> {
        if config.path.join(MANIFEST_FILE).exists() {
            Self::verify_manifest(&config.path)?;
        } else if config.create_if_missing {
            fs::create_dir_all(&config.path)?;
            Self::write_manifest(&config.path)?;
        } else {
            return Err(EngineError::NotInitialized(config.path.display().to_string()));
        }

        // Acquire lock
        let lock_file = Self::acquire_lock(&config.path)?;

        let metrics = Arc::new(EngineMetrics::new());
        let groups = GroupAllocator::open(
            config.path.join(GROUPS_DIR),
            config.allocator.clone(),
            Arc::clone(&metrics),
        )?;

        let checkpoint = Checkpoint::load(config.path.join(CHECKPOINT_FILE))?;
        let (journal, entries) = Journal::open(config.path.join(JOURNAL_FILE))?;
        let replayed = entries.len();
        let (index, ledger) = recovery::rebuild(&groups, checkpoint, entries)?;
        // Journal::open synced everything it replayed.
        groups.release_pending();

        tracing::info!(
            path = %config.path.display(),
            chunks = index.len(),
            uncommitted = ledger.len(),
            replayed,
            "opened chunk engine"
        );

        let background = config.background.clone();
        let shared = Arc::new(EngineShared {
            config,
            _lock_file: lock_file,
            groups,
            index,
            ledger,
            journal,
            metrics,
            compaction: Mutex::new(()),
        });

        let worker = background.map(|config| BackgroundWorker::start(&shared, config));

        Ok(Self {
            shared,
            background: Mutex::new(worker),
        })
    }

    /// Stop background work, write a checkpoint and close the engine.
    pub fn release(self) -> Result<()> {
        self.stop_background();
        self.shared.checkpoint()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn path(&self) -> &Path {
        &self.shared.config.path
    }

    // --- Reads ---

    /// Committed chunk for `id`.
    pub fn get(&self, id: &ChunkId) -> Result<Option<Chunk>> {
        Ok(self
            .shared
            .index
            .get(id)
            .map(|g| Chunk::new(id.clone(), g, self.shared.ledger.contains(id))))
    }

    /// Committed chunks for several ids, from one consistent snapshot.
    pub fn get_batch(&self, ids: &[ChunkId]) -> Result<Vec<Option<Chunk>>> {
        let generations = self.shared.index.get_batch(ids);
        Ok(ids
            .iter()
            .zip(generations)
            .map(|(id, g)| g.map(|g| Chunk::new(id.clone(), g, self.shared.ledger.contains(id))))
            .collect())
    }

    pub fn get_raw_chunk(&self, id: &ChunkId) -> Result<Option<Chunk>> {
        self.get(id)
    }

    pub fn get_raw_chunks(&self, ids: &[ChunkId]) -> Result<Vec<Option<Chunk>>> {
        self.get_batch(ids)
    }

    /// Release a read handle. Equivalent to dropping it.
    pub fn release_raw_chunk(&self, chunk: Chunk) {
        drop(chunk);
    }

    // --- Updates ---

    /// Stage an update of `id`.
    pub fn update(&self, id: &ChunkId, req: &UpdateReq<'_>) -> Result<UpdateReply> {
        update::update(&self.shared, id, req)
    }

    /// Publish one staged chunk.
    pub fn commit(&self, chunk: WritingChunk, sync: bool) -> Result<CommitReply> {
        self.commit_batch(vec![chunk], sync)
    }

    /// Publish staged chunks atomically: all of them or none.
    pub fn commit_batch(&self, chunks: Vec<WritingChunk>, sync: bool) -> Result<CommitReply> {
        update::commit_batch(&self.shared, chunks, sync)
    }

    pub fn update_raw_chunk(&self, id: &ChunkId, req: &UpdateReq<'_>) -> Result<UpdateReply> {
        self.update(id, req)
    }

    /// Abort a staged update. Equivalent to dropping it.
    pub fn release_writing_chunk(&self, chunk: WritingChunk) {
        drop(chunk);
    }

    pub fn commit_raw_chunk(&self, chunk: WritingChunk, sync: bool) -> Result<CommitReply> {
        self.commit(chunk, sync)
    }

    pub fn commit_raw_chunks(&self, chunks: Vec<WritingChunk>, sync: bool) -> Result<CommitReply> {
        self.commit_batch(chunks, sync)
    }

    // --- Allocator ---

    /// Top up normal-size groups. Returns the number of groups created.
    pub fn allocate_groups(
        &self,
        min_remain: usize,
        max_remain: usize,
        batch_size: usize,
    ) -> Result<usize> {
        self.shared
            .groups
            .allocate_groups(min_remain, max_remain, batch_size)
    }

    /// Top up ultra-size groups. Returns the number of groups created.
    pub fn allocate_ultra_groups(
        &self,
        min_remain: usize,
        max_remain: usize,
        batch_size: usize,
    ) -> Result<usize> {
        self.shared
            .groups
            .allocate_ultra_groups(min_remain, max_remain, batch_size)
    }

    pub fn set_allow_to_allocate(&self, allow: bool) {
        self.shared.groups.set_allow_to_allocate(allow);
    }

    /// Engine-wide space accounting.
    pub fn raw_used_size(&self) -> RawUsedSize {
        self.shared.groups.raw_used_size()
    }

    // --- Maintenance ---

    pub fn get_metrics(&self) -> Metrics {
        self.shared.metrics.snapshot()
    }

    /// Emit the current metrics as one `tracing` event.
    pub fn log_metrics(&self) {
        self.get_metrics().log();
    }

    /// Snapshot the index and ledger and truncate the journal.
    pub fn checkpoint(&self) -> Result<()> {
        self.shared.checkpoint()
    }

    /// Checkpoint if the journal is past `checkpoint_threshold`.
    pub fn checkpoint_if_needed(&self) -> Result<bool> {
        self.shared.checkpoint_if_needed()
    }

    /// Make long-running loops stop early and wake the background worker.
    pub fn speed_up_quit(&self) {
        self.shared.groups.speed_up_quit();
        if let Some(worker) = self.background.lock().as_ref() {
            worker.wake();
        }
    }

    fn stop_background(&self) {
        if let Some(worker) = self.background.lock().take() {
            worker.stop();
        }
    }

    fn write_manifest(path: &Path) -> Result<()> {
        use std::io::Write;

        let mut file = File::create(path.join(MANIFEST_FILE))?;
        file.write_all(ENGINE_MAGIC)?;
        file.write_all(&[ENGINE_VERSION])?;
        file.sync_all()?;

        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        use std::io::Read;

        let mut file = File::open(path.join(MANIFEST_FILE))?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != ENGINE_MAGIC {
            return Err(EngineError::InvalidFormat("Invalid engine magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != ENGINE_VERSION {
            return Err(EngineError::InvalidFormat(format!(
                "Unsupported engine version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join(LOCK_FILE))?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| EngineError::Locked)?;

        Ok(lock_file)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop_background();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Tag;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> EngineConfig {
        EngineConfig {
            path: dir.path().join("engine"),
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

    fn put(engine: &Engine, id: &str, data: &[u8]) -> CommitReply {
        let reply = engine.update(&ChunkId::from(id), &UpdateReq::write(0, data)).unwrap();
        engine.commit(reply.into_staged().unwrap(), false).unwrap()
    }

    #[test]
    fn test_open_creates_layout() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let engine = Engine::open(config.clone()).unwrap();

        assert!(config.path.join(MANIFEST_FILE).exists());
        assert!(config.path.join(LOCK_FILE).exists());
        assert!(config.path.join(JOURNAL_FILE).exists());
        assert!(config.path.join(GROUPS_DIR).is_dir());
        assert_eq!(engine.path(), config.path.as_path());
    }

    #[test]
    fn test_missing_engine_not_created() {
        let dir = TempDir::new().unwrap();
        let result = Engine::create(dir.path().join("absent"), false, 0);
        assert!(matches!(result, Err(EngineError::NotInitialized(_))));
    }

    #[test]
    fn test_second_open_is_locked() {
        let dir = TempDir::new().unwrap();
        let _engine = Engine::open(test_config(&dir)).unwrap();
        assert!(matches!(
            Engine::open(test_config(&dir)),
            Err(EngineError::Locked)
        ));
    }

    #[test]
    fn test_invalid_manifest() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        fs::create_dir_all(&config.path).unwrap();
        fs::write(config.path.join(MANIFEST_FILE), b"XXXX\x01").unwrap();

        assert!(matches!(
            Engine::open(config),
            Err(EngineError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_release_then_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let engine = Engine::open(test_config(&dir)).unwrap();
            assert!(put(&engine, "a", b"alpha").is_committed());
            engine.release().unwrap();
        }

        let engine = Engine::open(test_config(&dir)).unwrap();
        let chunk = engine.get(&ChunkId::from("a")).unwrap().unwrap();
        assert_eq!(chunk.read_verified().unwrap(), b"alpha");
        assert_eq!(engine.shared.journal.pending(), 0);
    }

    #[test]
    fn test_checkpoint_if_needed() {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig {
            checkpoint_threshold: 2,
            ..test_config(&dir)
        };
        let engine = Engine::open(config).unwrap();

        assert!(!engine.checkpoint_if_needed().unwrap());
        // Stage + commit: two journal entries.
        put(&engine, "a", b"x");
        assert!(engine.checkpoint_if_needed().unwrap());
        assert_eq!(engine.shared.journal.pending(), 0);
    }

    #[test]
    fn test_checkpoint_prunes_expired_tombstones() {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig {
            tombstone_retention: Some(Duration::ZERO),
            ..test_config(&dir)
        };
        let engine = Engine::open(config.clone()).unwrap();
        let remove = |id: &str| {
            let reply = engine.update(&ChunkId::from(id), &UpdateReq::remove()).unwrap();
            assert!(engine.commit(reply.into_staged().unwrap(), false).unwrap().is_committed());
        };

        put(&engine, "gone", b"x");
        remove("gone");
        put(&engine, "busy", b"y");
        remove("busy");
        let pending = engine
            .update(&ChunkId::from("busy"), &UpdateReq::write(0, b"again"))
            .unwrap()
            .into_staged()
            .unwrap();

        engine.checkpoint().unwrap();
        assert!(engine.shared.index.current(&ChunkId::from("gone")).is_none());
        assert_eq!(
            engine.shared.index.current(&ChunkId::from("busy")).unwrap().meta().chunk_ver,
            2
        );

        // The staged update still commits against the kept tombstone.
        let reply = engine.commit(pending, false).unwrap();
        assert_eq!(reply.metas()[0].chunk_ver, 3);

        // A pruned id starts over.
        assert_eq!(put(&engine, "gone", b"new").metas()[0].chunk_ver, 1);
        drop(engine);

        let engine = Engine::open(config).unwrap();
        assert_eq!(
            engine.get(&ChunkId::from("gone")).unwrap().unwrap().raw_meta().chunk_ver,
            1
        );
    }

    #[test]
    fn test_default_retention_keeps_recent_tombstones() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(test_config(&dir)).unwrap();
        put(&engine, "a", b"x");
        let reply = engine.update(&ChunkId::from("a"), &UpdateReq::remove()).unwrap();
        engine.commit(reply.into_staged().unwrap(), false).unwrap();

        engine.checkpoint().unwrap();
        assert!(engine.shared.index.current(&ChunkId::from("a")).unwrap().is_removed());
    }

    #[test]
    fn test_get_batch_and_tags() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(test_config(&dir)).unwrap();

        let tag = Tag::of(b"one");
        let req = UpdateReq::write(0, b"one").with_desired_tag(tag);
        let reply = engine.update(&ChunkId::from("1"), &req).unwrap();
        engine.commit(reply.into_staged().unwrap(), true).unwrap();

        let chunks = engine
            .get_batch(&[ChunkId::from("1"), ChunkId::from("2")])
            .unwrap();
        assert_eq!(chunks[0].as_ref().unwrap().tag(), Some(tag));
        assert!(chunks[1].is_none());
    }
}
