//! Range, prefix and timestamp queries.

use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::index::Generation;
use crate::types::{prefix_successor, ChunkId, RawMeta, RawUsedSize, Tag, Timestamp};
use crate::update::{UpdateReply, UpdateReq};
use std::sync::Arc;

/// One row of a query result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawChunkEntry {
    pub id: ChunkId,
    pub meta: RawMeta,
    pub tag: Option<Tag>,
    pub uncommitted: bool,
}

/// Owned, read-only result of a query, in id order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawChunks {
    entries: Vec<RawChunkEntry>,
}

impl RawChunks {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, pos: usize) -> Option<&RawChunkEntry> {
        self.entries.get(pos)
    }

    pub fn chunk_id(&self, pos: usize) -> Option<&ChunkId> {
        self.get(pos).map(|e| &e.id)
    }

    pub fn chunk_meta(&self, pos: usize) -> Option<&RawMeta> {
        self.get(pos).map(|e| &e.meta)
    }

    pub fn chunk_tag(&self, pos: usize) -> Option<Tag> {
        self.get(pos).and_then(|e| e.tag)
    }

    pub fn chunk_uncommitted(&self, pos: usize) -> bool {
        self.get(pos).map_or(false, |e| e.uncommitted)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RawChunkEntry> {
        self.entries.iter()
    }

    pub fn ids(&self) -> Vec<ChunkId> {
        self.entries.iter().map(|e| e.id.clone()).collect()
    }
}

impl FromIterator<RawChunkEntry> for RawChunks {
    fn from_iter<I: IntoIterator<Item = RawChunkEntry>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for RawChunks {
    type Item = RawChunkEntry;
    type IntoIter = std::vec::IntoIter<RawChunkEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a RawChunks {
    type Item = &'a RawChunkEntry;
    type IntoIter = std::slice::Iter<'a, RawChunkEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl Engine {
    /// Id range `[begin, successor(prefix))` of a prefix.
    pub(crate) fn prefix_range(&self, prefix: &[u8]) -> Result<(Vec<u8>, Option<Vec<u8>>)> {
        let max = self.shared.config.id_prefix_len;
        if prefix.len() > max {
            return Err(EngineError::InvalidArgument(format!(
                "Prefix of {} bytes is longer than the {} byte id prefix",
                prefix.len(),
                max
            )));
        }
        Ok((prefix.to_vec(), prefix_successor(prefix)))
    }

    fn to_raw_chunks(&self, rows: Vec<(ChunkId, Arc<Generation>)>) -> RawChunks {
        rows.into_iter()
            .map(|(id, generation)| RawChunkEntry {
                uncommitted: self.shared.ledger.contains(&id),
                id,
                meta: *generation.meta(),
                tag: generation.tag(),
            })
            .collect()
    }

    /// Committed chunks with `begin <= id < end`. An empty `end` means no
    /// upper bound; `max_count == 0` means no limit.
    pub fn query_raw_chunks(
        &self,
        begin: &[u8],
        end: &[u8],
        max_count: usize,
    ) -> Result<RawChunks> {
        let end = (!end.is_empty()).then_some(end);
        let rows = self.shared.index.range(begin, end, max_count);
        Ok(self.to_raw_chunks(rows))
    }

    /// Every committed chunk whose id starts with `prefix`.
    pub fn query_all_raw_chunks(&self, prefix: &[u8]) -> Result<RawChunks> {
        let (begin, end) = self.prefix_range(prefix)?;
        let rows = self.shared.index.range(&begin, end.as_deref(), 0);
        Ok(self.to_raw_chunks(rows))
    }

    /// Committed chunks under `prefix` with `begin <= timestamp < end`.
    pub fn query_raw_chunks_by_timestamp(
        &self,
        prefix: &[u8],
        begin: Timestamp,
        end: Timestamp,
        max_count: usize,
    ) -> Result<RawChunks> {
        let (first, last) = self.prefix_range(prefix)?;
        let rows = self.shared.index.scan(&first, last.as_deref(), max_count, |g| {
            let ts = g.meta().timestamp;
            begin <= ts && ts < end
        });
        Ok(self.to_raw_chunks(rows))
    }

    /// Remove the committed chunks with `begin <= id < end`, each through its
    /// own update and commit. Returns the number removed.
    pub fn raw_batch_remove(
        &self,
        begin: &[u8],
        end: &[u8],
        max_count: usize,
    ) -> Result<u64> {
        let end = (!end.is_empty()).then_some(end);
        let rows = self.shared.index.range(begin, end, max_count);

        let mut removed = 0;
        for (id, generation) in rows {
            let req = UpdateReq::remove().with_chain_ver(generation.meta().chain_ver);
            let chunk = match self.update(&id, &req)? {
                UpdateReply::Staged(chunk) if chunk.uncommitted() => chunk,
                reply => {
                    let outcome = reply.outcome();
                    tracing::debug!(chunk = %id, ?outcome, "batch remove skipped");
                    continue;
                }
            };
            if self.commit(chunk, false)?.is_committed() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Space used by the committed chunks under `prefix`.
    pub fn query_raw_used_size(&self, prefix: &[u8]) -> Result<RawUsedSize> {
        let (begin, end) = self.prefix_range(prefix)?;
        let rows = self.shared.index.range(&begin, end.as_deref(), 0);

        let mut used = RawUsedSize::default();
        for (_, generation) in rows {
            used.allocated_size += generation.meta().len as u64;
            if let Some(slot) = generation.slot() {
                used.reserved_size += slot.slot_size() as u64;
                used.position_count += 1;
                used.position_rc += slot.ref_count() as u64;
            }
        }
        Ok(used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::groups::AllocatorConfig;
    use tempfile::TempDir;

    fn test_engine(dir: &TempDir) -> Engine {
        Engine::open(EngineConfig {
            path: dir.path().to_path_buf(),
            id_prefix_len: 2,
            allocator: AllocatorConfig {
                min_slot_size: 4096,
                max_normal_slot_size: 8192,
                max_chunk_size: 65536,
                slots_per_group: 16,
                slots_per_ultra_group: 2,
                preallocate: false,
            },
            ..Default::default()
        })
        .unwrap()
    }

    fn put(engine: &Engine, id: &str, data: &[u8]) {
        let reply = engine.update(&ChunkId::from(id), &UpdateReq::write(0, data)).unwrap();
        let reply = engine.commit(reply.into_staged().unwrap(), false).unwrap();
        assert!(reply.is_committed());
    }

    fn id_strings(chunks: &RawChunks) -> Vec<String> {
        chunks
            .iter()
            .map(|e| String::from_utf8(e.id.0.clone()).unwrap())
            .collect()
    }

    #[test]
    fn test_query_range() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);
        for id in ["aa1", "aa2", "ab1", "ba1"] {
            put(&engine, id, id.as_bytes());
        }

        let all = engine.query_raw_chunks(b"", b"", 0).unwrap();
        assert_eq!(id_strings(&all), vec!["aa1", "aa2", "ab1", "ba1"]);

        let some = engine.query_raw_chunks(b"aa2", b"ba", 0).unwrap();
        assert_eq!(id_strings(&some), vec!["aa2", "ab1"]);

        let limited = engine.query_raw_chunks(b"", b"", 2).unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited.chunk_id(1), Some(&ChunkId::from("aa2")));
        assert!(!limited.chunk_uncommitted(0));
        assert!(limited.chunk_id(2).is_none());
    }

    #[test]
    fn test_query_prefix() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);
        for id in ["aa1", "aa2", "ab1"] {
            put(&engine, id, b"x");
        }

        assert_eq!(engine.query_all_raw_chunks(b"aa").unwrap().len(), 2);
        assert_eq!(engine.query_all_raw_chunks(b"a").unwrap().len(), 3);
        assert!(matches!(
            engine.query_all_raw_chunks(b"aa1"),
            Err(EngineError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_uncommitted_flag() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);
        put(&engine, "aa1", b"v1");

        let pending = engine
            .update(&ChunkId::from("aa1"), &UpdateReq::write(2, b"v2"))
            .unwrap()
            .into_staged()
            .unwrap();

        let chunks = engine.query_all_raw_chunks(b"aa").unwrap();
        assert!(chunks.chunk_uncommitted(0));
        assert_eq!(chunks.chunk_meta(0).unwrap().len, 2);

        drop(pending);
        assert!(!engine.query_all_raw_chunks(b"aa").unwrap().chunk_uncommitted(0));
    }

    #[test]
    fn test_query_by_timestamp() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);
        put(&engine, "aa1", b"x");
        let middle = engine.get(&ChunkId::from("aa1")).unwrap().unwrap().raw_meta().timestamp;
        std::thread::sleep(std::time::Duration::from_millis(2));
        put(&engine, "aa2", b"y");

        let early = engine
            .query_raw_chunks_by_timestamp(b"aa", Timestamp(0), Timestamp(middle.0 + 1), 0)
            .unwrap();
        assert_eq!(id_strings(&early), vec!["aa1"]);

        let late = engine
            .query_raw_chunks_by_timestamp(b"", Timestamp(middle.0 + 1), Timestamp(u64::MAX), 0)
            .unwrap();
        assert_eq!(id_strings(&late), vec!["aa2"]);
    }

    #[test]
    fn test_raw_batch_remove() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);
        for id in ["aa1", "aa2", "ab1"] {
            put(&engine, id, b"x");
        }

        assert_eq!(engine.raw_batch_remove(b"aa", b"ab", 0).unwrap(), 2);
        assert_eq!(id_strings(&engine.query_raw_chunks(b"", b"", 0).unwrap()), vec!["ab1"]);
        assert_eq!(engine.raw_batch_remove(b"aa", b"ab", 0).unwrap(), 0);
    }

    #[test]
    fn test_query_raw_used_size() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);
        put(&engine, "aa1", &[1u8; 100]);
        put(&engine, "aa2", &[2u8; 5000]);
        put(&engine, "bb1", &[3u8; 10]);

        let used = engine.query_raw_used_size(b"aa").unwrap();
        assert_eq!(used.allocated_size, 5100);
        assert_eq!(used.reserved_size, 4096 + 8192);
        assert_eq!(used.position_count, 2);
        assert_eq!(used.position_rc, 2);
    }
}
