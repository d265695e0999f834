//! # Page Allocator
//!
//! Bump-plus-freelist allocator over the region's data area. The page size
//! equals the size of one trie node, so node allocations are exact-fit and
//! O(1); variable-length blobs round up to whole pages.
//!
//! ## Allocation Policy
//!
//! 1. If the free-list head is an exact page-count match, unlink and return
//!    it.
//! 2. If the head is larger, split it: return its offset and relink the
//!    remainder.
//! 3. Otherwise bump the data watermark, failing with `OutOfMemory` when
//!    the region is exhausted (the store then grows the backing and the
//!    caller retries).
//!
//! ## Deallocation and Coalescing
//!
//! A freed page run gets a `FreeChunk` link written into its first bytes
//! and becomes the new list head. A coalesce pass then runs from the head:
//! runs that touch the watermark give their pages back to the bump area,
//! and runs adjacent to their list neighbor merge forward or backward.
//! The watermark is the only way pages leave the free list wholesale; holes
//! below it stay on the list until reused.
//!
//! ## Locking
//!
//! All bookkeeping happens under the region's header lock. Zero-filling a
//! fresh allocation happens after the lock is dropped, so large zeroed
//! allocations do not stall concurrent allocators.
//!
//! `free()` reports `capacity - watermark` — the bump headroom, not the
//! sum of free-list holes. The grow policy keys off this number.

use eyre::{ensure, Result};
use zerocopy::FromBytes;

use crate::error::StoreError;

use super::headers::{AllocatorHeader, FreeChunk, ALLOC_HEADER_OFFSET};
use super::region::Region;

const ALIGNMENT: u64 = 8;

#[inline]
pub(crate) fn align_size(size: u64) -> u64 {
    (size + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

impl Region {
    /// First-time allocator setup. A region whose allocator header carries
    /// the magic is reopened as-is; anything else gets a fresh header with
    /// the data area starting at the first page boundary past the headers.
    pub(crate) fn init_allocator(&self) {
        let psize = self.page_size() as u64;
        let header_end = ALLOC_HEADER_OFFSET + std::mem::size_of::<AllocatorHeader>() as u64;

        let header = self.alloc_header_mut();
        if !header.is_initialized() {
            let data_start = self.page_floor(align_size(header_end) + psize - 1);
            header.init(data_start as u32);
        }
        header.set_page_size(self.page_size());
    }

    #[inline]
    fn page_floor(&self, offset: u64) -> u64 {
        let psize = self.page_size() as u64;
        (offset / psize) * psize
    }

    fn chunk(&self, offset: u64) -> &FreeChunk {
        FreeChunk::ref_from_bytes(self.bytes(offset, std::mem::size_of::<FreeChunk>())).unwrap()
    }

    fn chunk_mut(&self, offset: u64) -> &mut FreeChunk {
        FreeChunk::mut_from_bytes(self.bytes_mut(offset, std::mem::size_of::<FreeChunk>())).unwrap()
    }

    /// Allocates `size` bytes rounded up to whole pages, optionally
    /// zero-filled. Returns the page-aligned handle.
    pub fn allocate(&self, size: u64, zero: bool) -> Result<u64> {
        ensure!(size > 0, StoreError::InvalidSize);

        let size = align_size(size);
        let psize = self.page_size() as u64;
        let pages_needed = (size + psize - 1) / psize;
        let byte_len = pages_needed * psize;

        let guard = self.head_lock.lock();

        let head = self.alloc_header().free_page_list();
        let head_pages = if head != 0 {
            self.chunk(head).page_count() as u64
        } else {
            0
        };

        let offset;
        if head != 0 && head_pages == pages_needed {
            offset = head;
            let next = self.chunk(head).next_free();
            self.alloc_header_mut().set_free_page_list(next);
        } else if head != 0 && head_pages > pages_needed {
            offset = head;
            let next = self.chunk(head).next_free();
            let remainder = head + byte_len;
            let rest = self.chunk_mut(remainder);
            rest.set_next_free(next);
            rest.set_page_count((head_pages - pages_needed) as u32);
            self.alloc_header_mut().set_free_page_list(remainder);
        } else {
            let watermark = self.alloc_header().data_watermark();
            if watermark + byte_len > self.len() {
                drop(guard);
                return Err(StoreError::OutOfMemory.into());
            }
            offset = watermark;
            self.alloc_header_mut().set_data_watermark(watermark + byte_len);
        }

        self.alloc_header_mut().add_used(byte_len);
        drop(guard);

        if zero {
            self.bytes_mut(offset, size as usize).fill(0);
        }

        Ok(offset)
    }

    /// Returns a page run to the free list and coalesces.
    pub fn deallocate(&self, offset: u64, size: u64) -> Result<()> {
        let size = align_size(size);
        let psize = self.page_size() as u64;

        ensure!(offset % psize == 0, StoreError::NotPageAligned(offset));
        assert!(offset != 0, "deallocate of the null handle");

        let pages = (size + psize - 1) / psize;
        let byte_len = pages * psize;

        let _guard = self.head_lock.lock();

        self.alloc_header_mut().sub_used(byte_len);

        let head = self.alloc_header().free_page_list();
        let chunk = self.chunk_mut(offset);
        chunk.set_next_free(head);
        chunk.set_page_count(pages as u32);

        let new_head = self.merge_chunks(offset);
        self.alloc_header_mut().set_free_page_list(new_head);

        Ok(())
    }

    /// Coalesce pass starting at the just-pushed head. Caller holds the
    /// header lock.
    fn merge_chunks(&self, offset: u64) -> u64 {
        let psize = self.page_size() as u64;
        let mut cur = offset;

        while cur != 0 {
            let (count, next) = {
                let c = self.chunk(cur);
                (c.page_count() as u64, c.next_free())
            };

            // Top of the data area: give the pages back to the bump space.
            if cur + count * psize == self.alloc_header().data_watermark() {
                self.alloc_header_mut().set_data_watermark(cur);
                cur = next;
                continue;
            }

            if next == 0 {
                break;
            }

            let (next_count, next_next) = {
                let c = self.chunk(next);
                (c.page_count(), c.next_free())
            };

            if next == cur + count * psize {
                // Current run abuts its successor: merge forward.
                let c = self.chunk_mut(cur);
                c.set_next_free(next_next);
                c.set_page_count(count as u32 + next_count);
                continue;
            } else if next + next_count as u64 * psize == cur {
                // Successor abuts the current run from below: merge backward.
                let c = self.chunk_mut(next);
                c.set_page_count(next_count + count as u32);
                cur = next;
                continue;
            }

            break;
        }

        cur
    }

    /// Watermark-bounded headroom. Holes on the free list do not count.
    pub fn free(&self) -> u64 {
        let _guard = self.head_lock.lock();
        self.len() - self.alloc_header().data_watermark()
    }

    /// Bytes currently allocated, page-aligned.
    pub fn used(&self) -> u64 {
        let _guard = self.head_lock.lock();
        self.alloc_header().total_used()
    }

    pub fn capacity(&self) -> u64 {
        self.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::headers::{RegionHeader, REGION_HEADER_SIZE};
    use zerocopy::FromBytes;

    const PSIZE: u64 = 192;

    fn test_region() -> Region {
        let region = Region::anonymous(64 * 1024, PSIZE as u16).unwrap();
        RegionHeader::mut_from_bytes(region.bytes_mut(0, REGION_HEADER_SIZE))
            .unwrap()
            .init();
        region.init_allocator();
        region
    }

    #[test]
    fn align_size_rounds_to_eight() {
        assert_eq!(align_size(1), 8);
        assert_eq!(align_size(8), 8);
        assert_eq!(align_size(9), 16);
        assert_eq!(align_size(192), 192);
    }

    #[test]
    fn data_area_starts_on_first_page_boundary() {
        let region = test_region();

        assert_eq!(region.alloc_header().buffer_start() as u64, PSIZE);
        assert_eq!(region.alloc_header().data_watermark(), PSIZE);
    }

    #[test]
    fn allocate_bumps_watermark_and_used() {
        let region = test_region();

        let a = region.allocate(PSIZE, true).unwrap();
        let b = region.allocate(10, false).unwrap();

        assert_eq!(a, PSIZE);
        assert_eq!(b, 2 * PSIZE);
        assert_eq!(region.used(), 2 * PSIZE);
        assert_eq!(region.free(), region.capacity() - 3 * PSIZE);
    }

    #[test]
    fn allocate_zero_size_is_invalid() {
        let region = test_region();

        let err = region.allocate(0, false).unwrap_err();
        assert_eq!(
            err.downcast_ref::<StoreError>(),
            Some(&StoreError::InvalidSize)
        );
    }

    #[test]
    fn allocate_beyond_capacity_is_out_of_memory() {
        let region = test_region();

        let err = region.allocate(region.capacity(), false).unwrap_err();
        assert_eq!(
            err.downcast_ref::<StoreError>(),
            Some(&StoreError::OutOfMemory)
        );
    }

    #[test]
    fn freeing_top_chunk_shrinks_watermark() {
        let region = test_region();

        let a = region.allocate(PSIZE, false).unwrap();
        let watermark_before = region.capacity() - region.free();

        region.deallocate(a, PSIZE).unwrap();

        assert_eq!(region.used(), 0);
        assert_eq!(region.capacity() - region.free(), watermark_before - PSIZE);
    }

    #[test]
    fn freed_hole_is_reused_exact_fit() {
        let region = test_region();

        let a = region.allocate(PSIZE, false).unwrap();
        let _b = region.allocate(PSIZE, false).unwrap();

        region.deallocate(a, PSIZE).unwrap();
        let c = region.allocate(PSIZE, false).unwrap();

        assert_eq!(c, a);
    }

    #[test]
    fn larger_hole_is_split() {
        let region = test_region();

        let a = region.allocate(3 * PSIZE, false).unwrap();
        let guard = region.allocate(PSIZE, false).unwrap();

        region.deallocate(a, 3 * PSIZE).unwrap();

        let c = region.allocate(PSIZE, false).unwrap();
        let d = region.allocate(2 * PSIZE, false).unwrap();

        assert_eq!(c, a);
        assert_eq!(d, a + PSIZE);
        // The guard page keeps the hole from coalescing into the watermark.
        assert_ne!(guard, c);
        assert_ne!(guard, d);
    }

    #[test]
    fn adjacent_holes_merge_forward() {
        let region = test_region();

        let a = region.allocate(PSIZE, false).unwrap();
        let b = region.allocate(PSIZE, false).unwrap();
        let _guard = region.allocate(PSIZE, false).unwrap();

        region.deallocate(b, PSIZE).unwrap();
        region.deallocate(a, PSIZE).unwrap();

        let c = region.allocate(2 * PSIZE, false).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn adjacent_holes_merge_backward() {
        let region = test_region();

        let a = region.allocate(PSIZE, false).unwrap();
        let b = region.allocate(PSIZE, false).unwrap();
        let _guard = region.allocate(PSIZE, false).unwrap();

        region.deallocate(a, PSIZE).unwrap();
        region.deallocate(b, PSIZE).unwrap();

        let c = region.allocate(2 * PSIZE, false).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn cascading_free_returns_everything_to_watermark() {
        let region = test_region();
        let start_free = region.free();

        let a = region.allocate(PSIZE, false).unwrap();
        let b = region.allocate(2 * PSIZE, false).unwrap();
        let c = region.allocate(PSIZE, false).unwrap();

        region.deallocate(a, PSIZE).unwrap();
        region.deallocate(b, 2 * PSIZE).unwrap();
        region.deallocate(c, PSIZE).unwrap();

        assert_eq!(region.used(), 0);
        assert_eq!(region.free(), start_free);
    }

    #[test]
    fn deallocate_unaligned_offset_is_rejected() {
        let region = test_region();
        let a = region.allocate(PSIZE, false).unwrap();

        let err = region.deallocate(a + 1, PSIZE).unwrap_err();
        assert_eq!(
            err.downcast_ref::<StoreError>(),
            Some(&StoreError::NotPageAligned(a + 1))
        );
    }

    #[test]
    fn zeroed_allocation_is_zeroed_after_reuse() {
        let region = test_region();

        let a = region.allocate(PSIZE, false).unwrap();
        region.bytes_mut(a, PSIZE as usize).fill(0xAB);
        region.deallocate(a, PSIZE).unwrap();

        let b = region.allocate(PSIZE, true).unwrap();
        assert_eq!(b, a);
        assert!(region.bytes(b, PSIZE as usize).iter().all(|&x| x == 0));
    }

    #[test]
    fn reopen_preserves_allocator_state() {
        let region = test_region();
        let _a = region.allocate(PSIZE, false).unwrap();
        let watermark = region.alloc_header().data_watermark();

        // Re-running init on an initialized header must not reset it.
        region.init_allocator();

        assert_eq!(region.alloc_header().data_watermark(), watermark);
        assert_eq!(region.used(), PSIZE);
    }

    #[test]
    fn concurrent_allocate_deallocate_is_consistent() {
        let region = std::sync::Arc::new({
            let r = Region::anonymous(1024 * 1024, PSIZE as u16).unwrap();
            RegionHeader::mut_from_bytes(r.bytes_mut(0, REGION_HEADER_SIZE))
                .unwrap()
                .init();
            r.init_allocator();
            r
        });

        let mut handles = Vec::new();
        for _ in 0..4 {
            let region = region.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    let a = region.allocate(PSIZE, true).unwrap();
                    let b = region.allocate(2 * PSIZE, false).unwrap();
                    region.deallocate(a, PSIZE).unwrap();
                    region.deallocate(b, 2 * PSIZE).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(region.used(), 0);
    }
}
