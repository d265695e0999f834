//! # Memory Module
//!
//! Everything that touches raw region memory lives here:
//!
//! - [`region`]: the mapped buffer itself (file-backed via `memmap2` or an
//!   anonymous heap buffer), raw offset-based access, and `grow()`.
//! - [`allocator`]: the page-granular bump+freelist allocator layered over
//!   the region's data area.
//! - [`headers`]: the persisted region and allocator headers (zerocopy,
//!   little-endian).
//!
//! The rest of the crate addresses memory exclusively through u64 offset
//! handles and the safe accessors exported from here; the `unsafe` raw
//! pointer conversions are confined to `region.rs`.
//!
//! ## Concurrency
//!
//! The store wraps the `Region` in a `parking_lot::RwLock`. Every
//! dereference of a handle happens under the read side; growing (which can
//! move the buffer) takes the write side. A second, finer lock inside the
//! region serializes allocator bookkeeping only.

mod allocator;
mod headers;
mod region;

pub use headers::{
    AllocatorHeader, FreeChunk, RegionHeader, ALLOC_HEADER_OFFSET, ALLOC_MAGIC, REGION_HEADER_SIZE,
    REGION_MAGIC, REGION_VERSION,
};
pub use region::Region;
