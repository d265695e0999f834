//! # Region Backing
//!
//! A `Region` is the single contiguous byte buffer that backs an entire
//! store: either a memory-mapped file or an anonymous in-process buffer.
//! Everything the store persists — headers, trie nodes, byte blobs, the
//! free list — lives inside this one buffer and is addressed by u64 byte
//! offsets ("handles") from its base. Offset 0 is the null sentinel.
//!
//! ## Why offsets, not pointers
//!
//! The buffer can move: growing the store unmaps and remaps the file (or
//! reallocates the heap buffer) at a new address. Handles survive that
//! because they are relative; raw pointers would not. Nothing outside this
//! module ever sees the base address.
//!
//! ## Safety Model
//!
//! The region hands out `&[u8]` / `&mut [u8]` and typed references derived
//! from its base pointer. Soundness rests on three invariants enforced by
//! the layers above:
//!
//! 1. **No access races remapping**: every dereference happens while the
//!    caller holds the read side of the store's region lock; `grow()` takes
//!    `&mut self`, which the store only reaches through the write side.
//! 2. **Single mutator per object**: a trie node is only mutated by the
//!    snapshot that created it during the current transaction (copy-on-write
//!    plus the per-snapshot writer mutex), and allocator bookkeeping is
//!    serialized by the header lock. Distinct offsets never overlap because
//!    the allocator hands out disjoint page runs.
//! 3. **No use after release**: reference counts keep every reachable node
//!    and blob alive; the allocator only recycles pages whose count dropped
//!    to zero.
//!
//! Shared refcount fields are `AtomicI32`, so concurrent retain/release
//! from different snapshots is well-defined without any lock.
//!
//! All `unsafe` in the crate is confined to this file.

use std::fs::File;
use std::sync::atomic::AtomicI32;

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;
use parking_lot::Mutex;
use zerocopy::FromBytes;

use crate::error::StoreError;

use super::headers::{AllocatorHeader, RegionHeader, ALLOC_HEADER_OFFSET, REGION_HEADER_SIZE};

const ALIGNMENT: u64 = 8;

#[derive(Debug)]
enum Backing {
    File {
        file: File,
        // Held for the lifetime of the mapping; all access goes through
        // `base` below. Re-created on grow.
        mmap: MmapMut,
    },
    Mem {
        buf: Box<[u8]>,
    },
}

#[derive(Debug)]
pub struct Region {
    backing: Backing,
    base: *mut u8,
    size: u64,
    page_size: u16,
    /// Serializes allocator-header bookkeeping (allocate/deallocate). Never
    /// held while user data is written.
    pub(crate) head_lock: Mutex<()>,
}

// SAFETY: the raw base pointer makes Region !Send + !Sync automatically,
// but the pointed-to buffer is owned by the Region (mmap or boxed slice)
// and all mutation follows the discipline documented in the module header:
// remaps require exclusive access, shared mutation is limited to atomics
// and allocator state behind head_lock, and object mutation is unique by
// construction (COW). Under those rules cross-thread access is sound.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Maps an existing (possibly freshly initialized) database file.
    pub fn map_file(file: File, page_size: u16) -> Result<Self> {
        let len = file
            .metadata()
            .wrap_err("failed to stat database file")?
            .len();

        ensure!(len > 0, "cannot map an empty database file");
        ensure!(
            len % ALIGNMENT == 0,
            StoreError::InvalidSize
        );

        // SAFETY: MmapMut::map_mut is unsafe because the file could be
        // modified externally. This is safe because:
        // 1. The store is single-process by contract; the guard file keeps
        //    a second instance from opening the same path.
        // 2. The mapping is owned by this Region and dropped before any
        //    remap replaces it.
        // 3. All access is bounds-checked against `size` below.
        let mut mmap =
            unsafe { MmapMut::map_mut(&file).wrap_err("failed to memory-map database file")? };
        let base = mmap.as_mut_ptr();

        Ok(Self {
            backing: Backing::File { file, mmap },
            base,
            size: len,
            page_size,
            head_lock: Mutex::new(()),
        })
    }

    /// Creates an anonymous in-process region of `size` zeroed bytes.
    pub fn anonymous(size: u64, page_size: u16) -> Result<Self> {
        ensure!(size > 0 && size % ALIGNMENT == 0, StoreError::InvalidSize);

        let mut buf = vec![0u8; size as usize].into_boxed_slice();
        let base = buf.as_mut_ptr();

        Ok(Self {
            backing: Backing::Mem { buf },
            base,
            size,
            page_size,
            head_lock: Mutex::new(()),
        })
    }

    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn page_size(&self) -> u16 {
        self.page_size
    }

    /// Extends the backing store to `new_size` bytes and rebinds the base
    /// pointer. Requires exclusive access: the caller reaches this through
    /// the write side of the region lock, so no reader can hold a reference
    /// into the old mapping.
    pub fn grow(&mut self, new_size: u64) -> Result<()> {
        ensure!(new_size % ALIGNMENT == 0, StoreError::InvalidSize);
        if new_size <= self.size {
            return Ok(());
        }

        match &mut self.backing {
            Backing::File { file, mmap } => {
                mmap.flush().wrap_err("failed to flush mmap before grow")?;

                file.set_len(new_size)
                    .wrap_err_with(|| format!("failed to extend file to {} bytes", new_size))?;

                // SAFETY: same justification as map_file; additionally the
                // old mapping is replaced below while we hold &mut self, so
                // no reference into it can exist (the region write lock is
                // held by the caller).
                let mut remapped = unsafe {
                    MmapMut::map_mut(&*file).wrap_err("failed to remap file after grow")?
                };
                self.base = remapped.as_mut_ptr();
                *mmap = remapped;
            }
            Backing::Mem { buf } => {
                let mut grown = vec![0u8; new_size as usize].into_boxed_slice();
                grown[..self.size as usize].copy_from_slice(buf);
                self.base = grown.as_mut_ptr();
                *buf = grown;
            }
        }

        self.size = new_size;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        match &self.backing {
            Backing::File { mmap, .. } => mmap.flush().wrap_err("failed to sync mmap to disk"),
            Backing::Mem { .. } => Ok(()),
        }
    }

    #[inline]
    fn check_range(&self, offset: u64, len: usize) {
        // Out-of-bounds access through a handle is a logic bug, not a
        // recoverable condition; abort with a diagnostic.
        assert!(
            offset
                .checked_add(len as u64)
                .is_some_and(|end| end <= self.size),
            "region access out of bounds: offset {} len {} size {}",
            offset,
            len,
            self.size
        );
    }

    #[inline]
    pub(crate) fn bytes(&self, offset: u64, len: usize) -> &[u8] {
        self.check_range(offset, len);
        // SAFETY: range checked above; the base pointer is valid for the
        // whole region while &self is held (grow requires &mut self).
        unsafe { std::slice::from_raw_parts(self.base.add(offset as usize), len) }
    }

    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) fn bytes_mut(&self, offset: u64, len: usize) -> &mut [u8] {
        self.check_range(offset, len);
        // SAFETY: range checked above. Handing out &mut from &self is sound
        // under the module invariants: each object (node page, blob run,
        // allocator header) has exactly one mutator at a time, and distinct
        // offsets address disjoint memory.
        unsafe { std::slice::from_raw_parts_mut(self.base.add(offset as usize), len) }
    }

    /// Typed view of a `#[repr(C)]` in-region struct. Used by the trie for
    /// node pages, whose refcount field is an atomic and therefore cannot
    /// go through zerocopy.
    #[inline]
    pub(crate) fn get_raw<T>(&self, offset: u64) -> &T {
        self.check_range(offset, std::mem::size_of::<T>());
        let ptr = self.base.wrapping_add(offset as usize);
        assert!(
            ptr as usize % std::mem::align_of::<T>() == 0,
            "misaligned region access at offset {}",
            offset
        );
        // SAFETY: bounds and alignment checked; page contents are either
        // zero-initialized at allocation or a previously written T image.
        unsafe { &*(ptr as *const T) }
    }

    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) fn get_raw_mut<T>(&self, offset: u64) -> &mut T {
        self.check_range(offset, std::mem::size_of::<T>());
        let ptr = self.base.wrapping_add(offset as usize);
        assert!(
            ptr as usize % std::mem::align_of::<T>() == 0,
            "misaligned region access at offset {}",
            offset
        );
        // SAFETY: as get_raw, plus the single-mutator invariant from the
        // module header.
        unsafe { &mut *(ptr as *mut T) }
    }

    /// Blob refcounts live in-line with their payload at an 8-aligned
    /// offset; they are shared across snapshots and mutated atomically.
    #[inline]
    pub(crate) fn atomic_i32(&self, offset: u64) -> &AtomicI32 {
        self.get_raw::<AtomicI32>(offset)
    }

    pub(crate) fn header(&self) -> &RegionHeader {
        RegionHeader::ref_from_bytes(self.bytes(0, REGION_HEADER_SIZE)).unwrap()
    }

    pub(crate) fn header_mut(&self) -> &mut RegionHeader {
        RegionHeader::mut_from_bytes(self.bytes_mut(0, REGION_HEADER_SIZE)).unwrap()
    }

    pub(crate) fn alloc_header(&self) -> &AllocatorHeader {
        AllocatorHeader::ref_from_bytes(self.bytes(
            ALLOC_HEADER_OFFSET,
            std::mem::size_of::<AllocatorHeader>(),
        ))
        .unwrap()
    }

    pub(crate) fn alloc_header_mut(&self) -> &mut AllocatorHeader {
        AllocatorHeader::mut_from_bytes(self.bytes_mut(
            ALLOC_HEADER_OFFSET,
            std::mem::size_of::<AllocatorHeader>(),
        ))
        .unwrap()
    }
}
