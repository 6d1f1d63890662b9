//! Update/commit protocol.
//!
//! An update is validated against the chunk's current generation, staged as
//! a new generation (journal record first, data second) and handed back as
//! a [`WritingChunk`]. Committing publishes it; dropping it aborts it.

mod protocol;
mod request;
mod writer;
mod writing;

pub(crate) use protocol::{commit_batch, commit_orphan, update};
pub use request::{CommitReply, UpdateKind, UpdateOutcome, UpdateReply, UpdateReq};
pub(crate) use writer::WritePolicy;
pub use writing::WritingChunk;
