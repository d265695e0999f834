//! # Reference-Counted Byte Blobs
//!
//! Variable-length byte storage carved out of the region. The handle is a
//! plain `{offset, size}` value; the storage behind it is
//!
//! ```text
//! [refcount: i32, padded to 8 bytes][payload: size bytes]
//! ```
//!
//! Blobs are shared freely between trie nodes (a cloned node retains the
//! original's prefix/key/value blobs rather than copying them), so the
//! refcount is an in-region atomic. When it drops to zero the storage goes
//! back to the allocator.
//!
//! Retain and release on the null handle are no-ops, which lets node code
//! treat empty fields uniformly.

use std::sync::atomic::Ordering;

use eyre::{ensure, Result};

use crate::error::StoreError;
use crate::memory::Region;

/// Aligned refcount slot preceding the payload.
pub(crate) const BLOB_PREAMBLE: u64 = 8;

/// Hard cap on blob storage (refcount slot included), a little under 10 MB.
pub const MAX_DATA_SIZE: u64 = 0x9C_4000;

/// Rejects payloads the blob layer refuses to store.
pub(crate) fn check_payload_len(len: usize) -> Result<()> {
    ensure!(
        BLOB_PREAMBLE + len as u64 <= MAX_DATA_SIZE,
        StoreError::InvalidSize
    );
    Ok(())
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobHandle {
    pub(crate) offset: u64,
    pub(crate) size: u32,
}

impl BlobHandle {
    pub const NULL: BlobHandle = BlobHandle { offset: 0, size: 0 };

    #[inline]
    pub fn is_null(&self) -> bool {
        self.offset == 0
    }

    #[inline]
    pub fn len(&self) -> u32 {
        self.size
    }

    #[allow(dead_code)]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Allocates storage for `size` payload bytes with refcount 1. The
    /// payload is left uninitialized; callers overwrite it immediately.
    pub(crate) fn new(mm: &Region, size: u32) -> Result<Self> {
        check_payload_len(size as usize)?;

        let offset = mm.allocate(BLOB_PREAMBLE + size as u64, false)?;
        let handle = BlobHandle { offset, size };
        handle.refcount(mm).store(1, Ordering::Release);
        Ok(handle)
    }

    pub(crate) fn from_slice(mm: &Region, data: &[u8]) -> Result<Self> {
        let handle = Self::new(mm, data.len() as u32)?;
        handle.bytes_mut(mm).copy_from_slice(data);
        Ok(handle)
    }

    /// Fresh copy of the storage (refcount 1), not a refcount bump.
    #[allow(dead_code)]
    pub(crate) fn clone_storage(&self, mm: &Region) -> Result<Self> {
        let clone = Self::new(mm, self.size)?;
        clone.bytes_mut(mm).copy_from_slice(self.bytes(mm));
        Ok(clone)
    }

    #[inline]
    fn refcount<'a>(&self, mm: &'a Region) -> &'a std::sync::atomic::AtomicI32 {
        mm.atomic_i32(self.offset)
    }

    #[inline]
    pub(crate) fn bytes<'a>(&self, mm: &'a Region) -> &'a [u8] {
        mm.bytes(self.offset + BLOB_PREAMBLE, self.size as usize)
    }

    #[inline]
    pub(crate) fn bytes_mut<'a>(&self, mm: &'a Region) -> &'a mut [u8] {
        mm.bytes_mut(self.offset + BLOB_PREAMBLE, self.size as usize)
    }

    pub(crate) fn retain(&self, mm: &Region) {
        if self.is_null() {
            return;
        }
        let prev = self.refcount(mm).fetch_add(1, Ordering::AcqRel);
        assert!(prev > 0, "retain of a released blob at {}", self.offset);
    }

    /// Drops one reference, freeing the storage at zero. The handle is
    /// nulled out either way.
    pub(crate) fn release(&mut self, mm: &Region) {
        if self.is_null() {
            return;
        }

        let prev = self.refcount(mm).fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "blob refcount underflow at {}", self.offset);

        if prev == 1 {
            if let Err(err) = mm.deallocate(self.offset, BLOB_PREAMBLE + self.size as u64) {
                panic!("failed to free blob storage: {err}");
            }
        }

        self.offset = 0;
        self.size = 0;
    }
}
