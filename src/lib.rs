//! # Chunk Engine
//!
//! A local chunk store: variable-size chunks live in fixed-size slots of
//! preallocated group files, and every update produces a new generation
//! that is staged first and published by an explicit commit.
//!
//! ## Core Concepts
//!
//! - **Groups**: Files of equally sized slots, one slot size per group
//! - **Generations**: Immutable chunk versions pinning their slot
//! - **Update/commit**: Copy-on-write staging, atomic batch publication
//! - **Journal**: Stage and commit records replayed after a crash
//!
//! ## Example
//!
//! ```ignore
//! use chunk_engine::{ChunkId, Engine, EngineConfig, UpdateReq};
//!
//! let engine = Engine::open(EngineConfig {
//!     path: "./my-chunks".into(),
//!     ..Default::default()
//! })?;
//!
//! // Stage a write, then publish it
//! let id = ChunkId::from("chunk-1");
//! let staged = engine.update(&id, &UpdateReq::write(0, b"hello"))?;
//! engine.commit(staged.into_staged().unwrap(), true)?;
//!
//! // Read it back
//! let chunk = engine.get(&id)?.unwrap();
//! assert_eq!(chunk.read_verified()?, b"hello");
//! ```

pub mod background;
pub mod checksum;
pub mod compaction;
pub mod engine;
pub mod error;
pub mod groups;
pub mod index;
pub mod ledger;
pub mod metrics;
pub mod query;
pub mod recovery;
pub mod types;
pub mod update;
pub mod wal;

// Re-exports
pub use background::BackgroundConfig;
pub use engine::{Engine, EngineConfig};
pub use error::{EngineError, ErrorCode, Result};
pub use groups::AllocatorConfig;
pub use index::Chunk;
pub use metrics::Metrics;
pub use query::{RawChunkEntry, RawChunks};
pub use types::*;
pub use update::{CommitReply, UpdateKind, UpdateOutcome, UpdateReply, UpdateReq, WritingChunk};
