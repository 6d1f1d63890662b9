//! Error types for the chunk engine.
//!
//! Failures come in two flavours. [`EngineError`] covers structural problems
//! (I/O, corrupt files, exhausted space) and is returned through `Result`.
//! [`ErrorCode`] covers semantic outcomes of a request (version conflict, tag
//! mismatch, ...) which are part of normal operation and travel inside the
//! reply types instead.

use std::fmt;
use thiserror::Error;

/// Main error type for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Engine not initialized at {0}")]
    NotInitialized(String),

    #[error("Engine is locked by another process")]
    Locked,

    #[error("Invalid engine format: {0}")]
    InvalidFormat(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("No space left for a {0} byte slot")]
    NoSpace(u64),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Engine is shutting down")]
    ShuttingDown,
}

impl From<rmp_serde::encode::Error> for EngineError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for EngineError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        EngineError::Deserialization(e.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Semantic outcome of a rejected update or commit.
///
/// These are never failures of the engine itself. The caller refreshes its
/// view of the chunk and retries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotFound,
    AlreadyExists,
    TagMismatch,
    VersionConflict,
    ChecksumMismatch,
    IoError,
    AlreadyCommitted,
}

impl ErrorCode {
    /// Stable numeric code for callers that forward outcomes over the wire.
    pub fn code(self) -> u16 {
        match self {
            ErrorCode::NotFound => 1,
            ErrorCode::AlreadyExists => 2,
            ErrorCode::TagMismatch => 3,
            ErrorCode::VersionConflict => 4,
            ErrorCode::ChecksumMismatch => 5,
            ErrorCode::IoError => 6,
            ErrorCode::AlreadyCommitted => 7,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            1 => ErrorCode::NotFound,
            2 => ErrorCode::AlreadyExists,
            3 => ErrorCode::TagMismatch,
            4 => ErrorCode::VersionConflict,
            5 => ErrorCode::ChecksumMismatch,
            6 => ErrorCode::IoError,
            7 => ErrorCode::AlreadyCommitted,
            _ => return None,
        })
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::NotFound => "not found",
            ErrorCode::AlreadyExists => "already exists",
            ErrorCode::TagMismatch => "tag mismatch",
            ErrorCode::VersionConflict => "version conflict",
            ErrorCode::ChecksumMismatch => "checksum mismatch",
            ErrorCode::IoError => "io error",
            ErrorCode::AlreadyCommitted => "already committed",
        };
        f.write_str(name)
    }
}
