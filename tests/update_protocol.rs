//! Update/commit protocol tests.

use chunk_engine::{
    checksum, ChunkId, CommitReply, Engine, EngineConfig, ErrorCode, RequestIdentity, Tag,
    UpdateReply, UpdateReq,
};
use tempfile::TempDir;

fn test_engine(dir: &TempDir) -> Engine {
    Engine::open(EngineConfig {
        path: dir.path().join("engine"),
        ..Default::default()
    })
    .unwrap()
}

fn commit(engine: &Engine, reply: UpdateReply) -> CommitReply {
    let chunk = reply.into_staged().expect("update was rejected");
    engine.commit(chunk, true).unwrap()
}

fn content(engine: &Engine, id: &ChunkId) -> Vec<u8> {
    engine.get(id).unwrap().unwrap().read_verified().unwrap()
}

// --- Basic Lifecycle ---

#[test]
fn test_write_append_overwrite() {
    let dir = TempDir::new().unwrap();
    let engine = test_engine(&dir);
    let id = ChunkId::from("chunk");

    let reply = commit(&engine, engine.update(&id, &UpdateReq::write(0, b"hello")).unwrap());
    assert_eq!(reply.metas()[0].chunk_ver, 1);

    commit(&engine, engine.update(&id, &UpdateReq::write(5, b" world")).unwrap());
    assert_eq!(content(&engine, &id), b"hello world");

    commit(&engine, engine.update(&id, &UpdateReq::write(0, b"HELLO")).unwrap());
    assert_eq!(content(&engine, &id), b"HELLO world");

    let chunk = engine.get(&id).unwrap().unwrap();
    assert_eq!(chunk.raw_meta().chunk_ver, 3);
    assert_eq!(chunk.raw_meta().checksum, checksum::checksum(b"HELLO world"));
}

#[test]
fn test_write_past_end_fills_zeros() {
    let dir = TempDir::new().unwrap();
    let engine = test_engine(&dir);
    let id = ChunkId::from("sparse");

    commit(&engine, engine.update(&id, &UpdateReq::write(4, b"tail")).unwrap());
    assert_eq!(content(&engine, &id), b"\0\0\0\0tail");
}

#[test]
fn test_truncate_shorten_and_extend() {
    let dir = TempDir::new().unwrap();
    let engine = test_engine(&dir);
    let id = ChunkId::from("trunc");

    commit(&engine, engine.update(&id, &UpdateReq::write(0, b"abcdefgh")).unwrap());
    commit(&engine, engine.update(&id, &UpdateReq::truncate(3)).unwrap());
    assert_eq!(content(&engine, &id), b"abc");

    commit(&engine, engine.update(&id, &UpdateReq::truncate(6)).unwrap());
    assert_eq!(content(&engine, &id), b"abc\0\0\0");

    let meta = *engine.get(&id).unwrap().unwrap().raw_meta();
    assert_eq!(meta.len, 6);
    assert_eq!(meta.chunk_ver, 3);
}

#[test]
fn test_remove_then_recreate() {
    let dir = TempDir::new().unwrap();
    let engine = test_engine(&dir);
    let id = ChunkId::from("gone");

    commit(&engine, engine.update(&id, &UpdateReq::write(0, b"data")).unwrap());
    commit(&engine, engine.update(&id, &UpdateReq::remove()).unwrap());
    assert!(engine.get(&id).unwrap().is_none());

    // Versions continue from the tombstone.
    let reply = commit(&engine, engine.update(&id, &UpdateReq::write(0, b"new")).unwrap());
    assert_eq!(reply.metas()[0].chunk_ver, 3);
    assert_eq!(content(&engine, &id), b"new");
}

#[test]
fn test_remove_missing_is_noop() {
    let dir = TempDir::new().unwrap();
    let engine = test_engine(&dir);

    let reply = engine.update(&ChunkId::from("never"), &UpdateReq::remove()).unwrap();
    assert!(reply.outcome().non_existent);
    let chunk = reply.into_staged().unwrap();
    assert!(!chunk.uncommitted());
    assert!(engine.commit(chunk, false).unwrap().is_committed());
}

#[test]
fn test_dropped_update_is_aborted() {
    let dir = TempDir::new().unwrap();
    let engine = test_engine(&dir);
    let id = ChunkId::from("abort");

    commit(&engine, engine.update(&id, &UpdateReq::write(0, b"keep")).unwrap());
    let pending = engine.update(&id, &UpdateReq::write(0, b"lose")).unwrap();
    assert!(engine.get(&id).unwrap().unwrap().uncommitted());
    drop(pending);

    let chunk = engine.get(&id).unwrap().unwrap();
    assert!(!chunk.uncommitted());
    assert_eq!(chunk.read_verified().unwrap(), b"keep");
    assert!(engine.query_uncommitted(b"").unwrap().is_empty());
}

// --- Preconditions ---

#[test]
fn test_identity_retry_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let engine = test_engine(&dir);
    let id = ChunkId::from("retry");
    let identity = RequestIdentity::new(42, 7, 0);

    let req = UpdateReq::write(0, b"once").with_identity(identity);
    commit(&engine, engine.update(&id, &req).unwrap());
    let first = *engine.get(&id).unwrap().unwrap().raw_meta();
    let writes = engine.get_metrics().pwrite_times;

    // Same request again: recognised, nothing new staged or written.
    let again = engine.update(&id, &req).unwrap().into_staged().unwrap();
    assert!(!again.uncommitted());
    assert_eq!(again.outcome().commit_ver, 1);
    assert_eq!(again.raw_meta(), first);
    let reply = engine.commit(again, true).unwrap();
    assert_eq!(reply.metas(), &[first][..]);

    assert_eq!(*engine.get(&id).unwrap().unwrap().raw_meta(), first);
    assert_eq!(engine.get_metrics().pwrite_times, writes);
    assert_eq!(content(&engine, &id), b"once");
}

#[test]
fn test_tag_compare_and_swap() {
    let dir = TempDir::new().unwrap();
    let engine = test_engine(&dir);
    let id = ChunkId::from("cas");
    let first = Tag::of(b"first");
    let second = Tag::of(b"second");

    let missing = engine
        .update(&id, &UpdateReq::write(0, b"x").with_expected_tag(first))
        .unwrap();
    assert_eq!(missing.error(), Some(ErrorCode::NotFound));

    let req = UpdateReq::write(0, b"one").with_desired_tag(first);
    commit(&engine, engine.update(&id, &req).unwrap());

    let stale = engine
        .update(&id, &UpdateReq::write(0, b"two").with_expected_tag(second))
        .unwrap();
    assert_eq!(stale.error(), Some(ErrorCode::TagMismatch));
    assert_eq!(stale.outcome().commit_ver, 1);

    let req = UpdateReq::write(0, b"two")
        .with_expected_tag(first)
        .with_desired_tag(second);
    commit(&engine, engine.update(&id, &req).unwrap());
    assert_eq!(engine.get(&id).unwrap().unwrap().tag(), Some(second));
}

#[test]
fn test_create_new_rejects_existing() {
    let dir = TempDir::new().unwrap();
    let engine = test_engine(&dir);
    let id = ChunkId::from("exclusive");

    commit(&engine, engine.update(&id, &UpdateReq::write(0, b"a").create_new()).unwrap());
    let reply = engine.update(&id, &UpdateReq::write(0, b"b").create_new()).unwrap();
    assert_eq!(reply.error(), Some(ErrorCode::AlreadyExists));
}

#[test]
fn test_chain_version_fencing() {
    let dir = TempDir::new().unwrap();
    let engine = test_engine(&dir);
    let id = ChunkId::from("fenced");

    let req = UpdateReq::write(0, b"v5").with_chain_ver(5);
    commit(&engine, engine.update(&id, &req).unwrap());

    let old = UpdateReq::write(0, b"v4").with_chain_ver(4);
    let reply = engine.update(&id, &old).unwrap();
    assert_eq!(reply.error(), Some(ErrorCode::VersionConflict));
    assert_eq!(reply.outcome().chain_ver, 5);

    let newer = UpdateReq::write(0, b"v6").with_chain_ver(6);
    commit(&engine, engine.update(&id, &newer).unwrap());
    assert_eq!(engine.get(&id).unwrap().unwrap().raw_meta().chain_ver, 6);
}

#[test]
fn test_explicit_update_version() {
    let dir = TempDir::new().unwrap();
    let engine = test_engine(&dir);
    let id = ChunkId::from("versioned");

    commit(&engine, engine.update(&id, &UpdateReq::write(0, b"1")).unwrap());

    let stale = engine
        .update(&id, &UpdateReq::write(0, b"x").with_update_ver(1))
        .unwrap();
    assert_eq!(stale.error(), Some(ErrorCode::VersionConflict));

    let gap = engine
        .update(&id, &UpdateReq::write(0, b"x").with_update_ver(4))
        .unwrap();
    assert_eq!(gap.error(), Some(ErrorCode::VersionConflict));

    // Syncing replicas may skip ahead.
    let req = UpdateReq::write(0, b"4").with_update_ver(4).syncing();
    let reply = commit(&engine, engine.update(&id, &req).unwrap());
    assert_eq!(reply.metas()[0].chunk_ver, 4);
}

#[test]
fn test_checksum_mismatch_rejected() {
    let dir = TempDir::new().unwrap();
    let engine = test_engine(&dir);
    let id = ChunkId::from("crc");

    let req = UpdateReq::write(0, b"payload").with_checksum(0xdead_beef);
    let reply = engine.update(&id, &req).unwrap();
    assert_eq!(reply.error(), Some(ErrorCode::ChecksumMismatch));
    assert!(reply.outcome().non_existent);

    let req = UpdateReq::write(0, b"payload")
        .with_checksum(0xdead_beef)
        .without_checksum();
    assert!(engine.update(&id, &req).unwrap().is_staged());
}

#[test]
fn test_concurrent_update_conflicts() {
    let dir = TempDir::new().unwrap();
    let engine = test_engine(&dir);
    let id = ChunkId::from("busy");

    let first = engine.update(&id, &UpdateReq::write(0, b"first")).unwrap();
    let second = engine.update(&id, &UpdateReq::write(0, b"second")).unwrap();
    assert_eq!(second.error(), Some(ErrorCode::VersionConflict));

    commit(&engine, first);
    assert_eq!(content(&engine, &id), b"first");
}

#[test]
fn test_reader_keeps_old_generation() {
    let dir = TempDir::new().unwrap();
    let engine = test_engine(&dir);
    let id = ChunkId::from("pinned");

    commit(&engine, engine.update(&id, &UpdateReq::write(0, b"old bytes")).unwrap());
    let reader = engine.get(&id).unwrap().unwrap();

    commit(&engine, engine.update(&id, &UpdateReq::write(0, b"NEW")).unwrap());
    commit(&engine, engine.update(&id, &UpdateReq::truncate(2)).unwrap());

    assert_eq!(reader.read_verified().unwrap(), b"old bytes");
    assert_eq!(content(&engine, &id), b"NE");
}
