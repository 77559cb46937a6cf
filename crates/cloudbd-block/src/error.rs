//! Block device error types

use cloudbd_common::BlockNo;
use thiserror::Error;

/// Block device error
#[derive(Error, Debug)]
pub enum BlockError {
    /// Container or metadata missing and creation not permitted
    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate container, metadata or block object; never repaired automatically
    #[error("Ambiguous state: {0}")]
    AmbiguousState(String),

    /// Container is not writable
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Persisted metadata schema differs from this build
    #[error("Metadata version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    /// Allocation attempted on a block that already has a backing object
    #[error("Block {0} is already mapped")]
    AlreadyMapped(BlockNo),

    /// Fetched block content has the wrong length
    #[error("Block {index} has {actual} bytes, expected {expected}")]
    SizeMismatch {
        index: BlockNo,
        expected: u64,
        actual: u64,
    },

    /// Block index outside the device
    #[error("Block {index} out of bounds (block count {block_count})")]
    OutOfBounds { index: BlockNo, block_count: u64 },

    /// Write payload is not exactly one block
    #[error("Invalid payload length {actual}, expected {expected}")]
    InvalidLength { expected: u64, actual: u64 },

    /// Invalid geometry or options
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Remote store error, including rate limiting that outlasted every retry
    #[error("Store error: {0}")]
    Store(#[from] cloudbd_common::Error),

    /// Persisted metadata could not be decoded
    #[error("Metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    /// Device or queue has been shut down
    #[error("Device is closed")]
    Closed,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BlockError {
    /// Check if the remote store kept rejecting the call for its request rate
    #[must_use]
    pub const fn is_rate_limited(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_rate_limited())
    }
}

impl crate::retry::Throttling for BlockError {
    fn is_throttled(&self) -> bool {
        self.is_rate_limited()
    }
}

/// Result type for block operations
pub type BlockResult<T> = Result<T, BlockError>;
