//! Chunk index: committed generations and read handles.

mod chunk_index;
mod generation;

pub use chunk_index::ChunkIndex;
pub use generation::{Chunk, Generation};
