//! # Error Taxonomy
//!
//! All fallible operations return `eyre::Result` with contextual messages.
//! The `StoreError` enum captures the conditions callers are expected to
//! branch on (most importantly `OutOfMemory`, which the insert path treats
//! as "grow the region and retry"). It is embedded at the root of the
//! `eyre::Report` chain so `report.downcast_ref::<StoreError>()` works even
//! after `wrap_err` adds context.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Region size not 8-byte aligned, zero-sized allocation, or a value
    /// above the maximum blob payload.
    #[error("the requested size is invalid")]
    InvalidSize,

    /// The allocator cannot satisfy the request from the free list or the
    /// watermark. Recoverable: grow the region and retry.
    #[error("not enough space allocating memory")]
    OutOfMemory,

    /// A guard file was found at open time, meaning the previous process
    /// did not shut down cleanly.
    #[error("dirty database found")]
    DirtyDatabase,

    /// Table name lookup failed.
    #[error("unknown table '{0}'")]
    UnknownTable(String),

    /// Secondary index lookup failed.
    #[error("unknown index '{0}'")]
    UnknownIndex(String),

    /// Wrong magic bytes or unsupported version in the region header.
    #[error("not a valid database image")]
    FormatError,

    /// Deallocation offset is not a page multiple. Caller bug.
    #[error("free of non page aligned offset {0}")]
    NotPageAligned(u64),
}

/// True when `report` bottoms out in `StoreError::OutOfMemory`.
pub(crate) fn is_out_of_memory(report: &eyre::Report) -> bool {
    matches!(
        report.downcast_ref::<StoreError>(),
        Some(StoreError::OutOfMemory)
    )
}
