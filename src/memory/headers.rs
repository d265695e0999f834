//! # Persisted Header Definitions
//!
//! Two headers live at the front of every region image and survive restart:
//!
//! 1. **RegionHeader** (offset 0, 16 bytes) — store identity plus the root
//!    trie handle. Written on first open, mutated only when a snapshot is
//!    committed as the new root.
//! 2. **AllocatorHeader** (offset 16, 34 bytes) — page-allocator state:
//!    where the page area begins, the bump watermark, the free-page list
//!    head and the live-byte counter. Initialized once per region; trusted
//!    as-is on reopen.
//!
//! A third struct, **FreeChunk**, is not a header proper: it is scribbled
//! into the first bytes of every freed page run and links the free list
//! together.
//!
//! ## Layout
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  ----------------------------------
//! 0       4     region magic     = 0xFF01CF11
//! 4       4     version          = 1
//! 8       8     root handle      (0 until first init)
//! 16      4     allocator magic  = 0xCA01AF01
//! 20      4     buffer_start     (first data page, page aligned)
//! 24      2     page_size        (= size of one trie node)
//! 26      8     data_watermark
//! 34      8     free_page_list   (head handle, 0 = empty)
//! 42      8     total_used
//! ```
//!
//! All multi-byte fields are little-endian; the zerocopy wrapper types
//! handle conversion and keep the structs alignment-free so they can be
//! read in place at any offset of the mapped buffer.

use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const REGION_MAGIC: u32 = 0xFF01_CF11;
pub const REGION_VERSION: u32 = 1;
pub const ALLOC_MAGIC: u32 = 0xCA01_AF01;

pub const REGION_HEADER_SIZE: usize = 16;
pub const ALLOC_HEADER_OFFSET: u64 = REGION_HEADER_SIZE as u64;

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct RegionHeader {
    magic: U32,
    version: U32,
    root: U64,
}

const _: () = assert!(std::mem::size_of::<RegionHeader>() == REGION_HEADER_SIZE);

impl RegionHeader {
    pub fn init(&mut self) {
        self.magic = U32::new(REGION_MAGIC);
        self.version = U32::new(REGION_VERSION);
        self.root = U64::new(0);
    }

    pub fn is_valid(&self) -> bool {
        self.magic.get() == REGION_MAGIC && self.version.get() == REGION_VERSION
    }

    pub fn root(&self) -> u64 {
        self.root.get()
    }

    pub fn set_root(&mut self, handle: u64) {
        self.root = U64::new(handle);
    }
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct AllocatorHeader {
    magic: U32,
    buffer_start: U32,
    page_size: U16,
    data_watermark: U64,
    free_page_list: U64,
    total_used: U64,
}

const _: () = assert!(std::mem::size_of::<AllocatorHeader>() == 34);

impl AllocatorHeader {
    pub fn is_initialized(&self) -> bool {
        self.magic.get() == ALLOC_MAGIC
    }

    pub fn init(&mut self, buffer_start: u32) {
        self.magic = U32::new(ALLOC_MAGIC);
        self.buffer_start = U32::new(buffer_start);
        self.data_watermark = U64::new(buffer_start as u64);
        self.free_page_list = U64::new(0);
        self.total_used = U64::new(0);
    }

    pub fn buffer_start(&self) -> u32 {
        self.buffer_start.get()
    }

    pub fn page_size(&self) -> u16 {
        self.page_size.get()
    }

    pub fn set_page_size(&mut self, size: u16) {
        self.page_size = U16::new(size);
    }

    pub fn data_watermark(&self) -> u64 {
        self.data_watermark.get()
    }

    pub fn set_data_watermark(&mut self, watermark: u64) {
        self.data_watermark = U64::new(watermark);
    }

    pub fn free_page_list(&self) -> u64 {
        self.free_page_list.get()
    }

    pub fn set_free_page_list(&mut self, head: u64) {
        self.free_page_list = U64::new(head);
    }

    pub fn total_used(&self) -> u64 {
        self.total_used.get()
    }

    pub fn add_used(&mut self, bytes: u64) {
        self.total_used = U64::new(self.total_used.get() + bytes);
    }

    pub fn sub_used(&mut self, bytes: u64) {
        let used = self.total_used.get();
        assert!(used >= bytes, "allocator used-byte counter underflow");
        self.total_used = U64::new(used - bytes);
    }
}

/// Link record written into the first bytes of a freed page run.
#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FreeChunk {
    next_free: U64,
    page_count: U32,
}

const _: () = assert!(std::mem::size_of::<FreeChunk>() == 12);

impl FreeChunk {
    pub fn next_free(&self) -> u64 {
        self.next_free.get()
    }

    pub fn set_next_free(&mut self, offset: u64) {
        self.next_free = U64::new(offset);
    }

    pub fn page_count(&self) -> u32 {
        self.page_count.get()
    }

    pub fn set_page_count(&mut self, pages: u32) {
        self.page_count = U32::new(pages);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes;

    #[test]
    fn region_header_size_is_16() {
        assert_eq!(std::mem::size_of::<RegionHeader>(), 16);
    }

    #[test]
    fn region_header_init_and_validate() {
        let mut bytes = [0u8; 16];
        let header = RegionHeader::mut_from_bytes(&mut bytes).unwrap();

        assert!(!header.is_valid());

        header.init();

        assert!(header.is_valid());
        assert_eq!(header.root(), 0);
        assert_eq!(&bytes[..4], &REGION_MAGIC.to_le_bytes());
    }

    #[test]
    fn region_header_root_roundtrip() {
        let mut bytes = [0u8; 16];
        let header = RegionHeader::mut_from_bytes(&mut bytes).unwrap();

        header.init();
        header.set_root(0xDEAD_BEEF);

        let reread = RegionHeader::ref_from_bytes(&bytes).unwrap();
        assert_eq!(reread.root(), 0xDEAD_BEEF);
    }

    #[test]
    fn allocator_header_init_sets_watermark_to_buffer_start() {
        let mut bytes = [0u8; 34];
        let header = AllocatorHeader::mut_from_bytes(&mut bytes).unwrap();

        assert!(!header.is_initialized());

        header.init(192);
        header.set_page_size(192);

        assert!(header.is_initialized());
        assert_eq!(header.buffer_start(), 192);
        assert_eq!(header.data_watermark(), 192);
        assert_eq!(header.free_page_list(), 0);
        assert_eq!(header.total_used(), 0);
    }

    #[test]
    fn allocator_header_used_accounting() {
        let mut bytes = [0u8; 34];
        let header = AllocatorHeader::mut_from_bytes(&mut bytes).unwrap();
        header.init(192);

        header.add_used(576);
        header.sub_used(192);

        assert_eq!(header.total_used(), 384);
    }

    #[test]
    #[should_panic(expected = "underflow")]
    fn allocator_header_used_underflow_panics() {
        let mut bytes = [0u8; 34];
        let header = AllocatorHeader::mut_from_bytes(&mut bytes).unwrap();
        header.init(192);

        header.sub_used(1);
    }

    #[test]
    fn free_chunk_layout() {
        let mut chunk = FreeChunk {
            next_free: U64::new(0),
            page_count: U32::new(0),
        };
        chunk.set_next_free(384);
        chunk.set_page_count(3);

        let bytes = chunk.as_bytes();
        assert_eq!(&bytes[..8], &384u64.to_le_bytes());
        assert_eq!(&bytes[8..], &3u32.to_le_bytes());
    }
}
