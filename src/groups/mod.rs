//! Group storage.
//!
//! Chunk bytes live in group files, each divided into equal-size slots. A
//! slot is shared by every generation of a chunk that kept its bytes in
//! place, and is reference counted through [`SlotRef`].

mod allocator;
mod file;

pub use allocator::{AllocatorConfig, Group, GroupAllocator, SlotRef};
pub use file::{GroupFile, GroupLayout, GROUP_HEADER_SIZE};
