//! # Store Front Door
//!
//! `Db` owns the region (file-backed or in-memory), the persisted root
//! handle, and the guard file that flags unclean shutdown.
//!
//! ## Open Protocol
//!
//! 1. A sibling guard file `<path>~` is checked: if it already exists the
//!    previous process died with the store open and the image may be
//!    inconsistent — open fails with `DirtyDatabase` and a human decides.
//!    Otherwise the guard is created; it is removed again on clean close.
//! 2. A zero-length file gets a fresh region header and a 1 MiB initial
//!    size before mapping. In-memory stores start at 16 MiB.
//! 3. The header magic/version are validated, the allocator is
//!    bootstrapped, and a root trie node is allocated on first open.
//!
//! ## Growth
//!
//! The region doubles until it reaches 1 GiB and then grows by 1 GiB
//! steps. Growing takes the region write lock, so it blocks all readers
//! for the duration of the remap; handles are offsets, so nothing else
//! notices the move. Deletes never shrink the backing store.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use parking_lot::RwLock;
use zerocopy::FromBytes;

use crate::error::StoreError;
use crate::memory::{Region, RegionHeader, REGION_HEADER_SIZE};
use crate::snapshot::Snapshot;
use crate::table::TableRow;
use crate::trie::node::NODE_SIZE;
use crate::trie::ops;
use crate::trie::{Node, NodeHandle, TrieIterator};

const KILO_BYTE: u64 = 1024;
const MEGA_BYTE: u64 = 1024 * KILO_BYTE;
const GIGA_BYTE: u64 = 1024 * MEGA_BYTE;

const INITIAL_FILE_SIZE: u64 = MEGA_BYTE;
const INITIAL_MEMORY_SIZE: u64 = 16 * MEGA_BYTE;

#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Refuse mutations through this handle. The mapping itself stays
    /// writable: even reads maintain reference counts inside the region.
    pub read_only: bool,
}

/// Snapshot of the store's allocator state, as surfaced by the `info`
/// tooling.
#[derive(Debug, Clone)]
pub struct DbInfo {
    pub path: PathBuf,
    pub buffer_start: u32,
    pub page_size: u16,
    pub watermark: u64,
    pub total_used: u64,
    pub total_capacity: u64,
}

#[derive(Debug)]
pub struct Db {
    mm: RwLock<Region>,
    path: PathBuf,
    guard_path: Option<PathBuf>,
    read_only: bool,
}

impl Db {
    /// Opens (creating if needed) a file-backed store.
    pub fn open(path: impl AsRef<Path>, options: Options) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut guard_path = path.as_os_str().to_owned();
        guard_path.push("~");
        let guard_path = PathBuf::from(guard_path);

        ensure!(!guard_path.exists(), StoreError::DirtyDatabase);
        std::fs::File::create(&guard_path).wrap_err_with(|| {
            format!("failed to create guard file '{}'", guard_path.display())
        })?;

        let opened = Self::open_file_region(&path).and_then(Self::bootstrap);
        let region = match opened {
            Ok(region) => region,
            Err(err) => {
                let _ = std::fs::remove_file(&guard_path);
                return Err(err);
            }
        };

        tracing::debug!(path = %path.display(), size = region.len(), "opened store");

        Ok(Db {
            mm: RwLock::new(region),
            path,
            guard_path: Some(guard_path),
            read_only: options.read_only,
        })
    }

    /// Opens a store backed by an anonymous in-process buffer.
    pub fn open_in_memory(options: Options) -> Result<Self> {
        let region = Region::anonymous(INITIAL_MEMORY_SIZE, NODE_SIZE as u16)?;
        RegionHeader::mut_from_bytes(region.bytes_mut(0, REGION_HEADER_SIZE))
            .unwrap()
            .init();
        let region = Self::bootstrap(region)?;

        tracing::debug!(size = region.len(), "opened in-memory store");

        Ok(Db {
            mm: RwLock::new(region),
            path: PathBuf::from("memory_buffer"),
            guard_path: None,
            read_only: options.read_only,
        })
    }

    fn open_file_region(path: &Path) -> Result<Region> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open database file '{}'", path.display()))?;

        let len = file
            .metadata()
            .wrap_err("failed to stat database file")?
            .len();
        if len == 0 {
            let mut header = [0u8; REGION_HEADER_SIZE];
            RegionHeader::mut_from_bytes(&mut header).unwrap().init();
            file.write_all(&header)
                .wrap_err("failed to write region header")?;
            file.set_len(INITIAL_FILE_SIZE)
                .wrap_err("failed to size new database file")?;
        }

        Region::map_file(file, NODE_SIZE as u16)
    }

    /// Validates the header, wires up the allocator and makes sure a root
    /// node exists.
    fn bootstrap(region: Region) -> Result<Region> {
        ensure!(region.header().is_valid(), StoreError::FormatError);

        region.init_allocator();

        if region.header().root() == 0 {
            let root = Node::alloc(&region).wrap_err("failed to allocate root node")?;
            region.header_mut().set_root(root.0);
        }

        Ok(region)
    }

    pub(crate) fn region(&self) -> &RwLock<Region> {
        &self.mm
    }

    pub(crate) fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self) -> DbInfo {
        let mm = self.mm.read();
        let header = mm.alloc_header();
        DbInfo {
            path: self.path.clone(),
            buffer_start: header.buffer_start(),
            page_size: header.page_size(),
            watermark: header.data_watermark(),
            total_used: header.total_used(),
            total_capacity: mm.capacity(),
        }
    }

    /// Copy of the value under `key` in the committed tree.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let nibbles = crate::encoding::encode_nibbles(key);
        let mm = self.mm.read();
        let root = NodeHandle(mm.header().root());
        ops::get(&mm, root, &nibbles)
    }

    /// Iterator over the committed tree.
    pub fn iter(&self) -> TrieIterator<'_> {
        let guard = self.mm.read();
        let root = NodeHandle(guard.header().root());
        TrieIterator::new(guard, root)
    }

    /// Retains the committed root and wraps it in a transaction handle.
    pub fn root_snapshot(&self) -> Snapshot<'_> {
        let mm = self.mm.read();
        let root = NodeHandle(mm.header().root());
        root.retain(&mm);
        drop(mm);

        Snapshot::new(self, root)
    }

    /// Commits `snap`'s tree as the new store root. Readers that arrive
    /// after this see the new tree; live snapshots keep their own.
    pub fn set_root_snapshot(&self, snap: &Snapshot<'_>) -> Result<()> {
        ensure!(!self.read_only, "store is opened read-only");

        // Holding the snapshot's writer lock across the swap keeps its
        // root stable, and clearing the writable set makes it clone before
        // mutating anything that just became globally visible.
        let mut snap_inner = snap.inner.lock();
        snap_inner.writable.clear();
        let new_root = snap_inner.root;

        let mm = self.mm.write();
        let old_root = NodeHandle(mm.header().root());
        new_root.retain(&mm);
        mm.header_mut().set_root(new_root.0);
        old_root.release(&mm);

        Ok(())
    }

    /// Creates `name` with `T`'s schema and commits the root.
    pub fn create_table<T: TableRow>(&self, name: &str) -> Result<()> {
        let snap = self.root_snapshot();
        snap.create_table::<T>(name)?;
        self.set_root_snapshot(&snap)
    }

    /// Adds a secondary index on `field` and commits the root.
    pub fn create_index(&self, table: &str, field: &str) -> Result<()> {
        let snap = self.root_snapshot();
        snap.create_index(table, field)?;
        self.set_root_snapshot(&snap)
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.root_snapshot().has_table(name)
    }

    /// One growth increment: double below 1 GiB, +1 GiB beyond. Blocks
    /// all readers for the remap.
    pub(crate) fn grow_step(&self) -> Result<()> {
        let mut mm = self.mm.write();
        let capacity = mm.capacity();
        let new_size = if capacity < GIGA_BYTE {
            capacity * 2
        } else {
            capacity + GIGA_BYTE
        };

        tracing::debug!(from = capacity, to = new_size, "growing region");
        mm.grow(new_size)
    }

    /// Opportunistic growth at 70% occupancy, called after mutations.
    pub(crate) fn grow_if_needed(&self) -> Result<()> {
        let wants_grow = {
            let mm = self.mm.read();
            mm.free() * 10 <= mm.capacity() * 3
        };
        if wants_grow {
            self.grow_step()?;
        }
        Ok(())
    }

    /// Grows until at least `need` bytes of bump headroom exist. Multi-step
    /// table mutations reserve their worst case up front so they cannot
    /// fail half-applied.
    pub(crate) fn ensure_headroom(&self, need: u64) -> Result<()> {
        loop {
            if self.mm.read().free() >= need {
                return Ok(());
            }
            self.grow_step()?;
        }
    }

    fn close_inner(&mut self) -> Result<()> {
        if let Err(err) = self.mm.read().sync() {
            tracing::warn!(error = %err, "sync on close failed");
        }
        if let Some(guard) = self.guard_path.take() {
            std::fs::remove_file(&guard)
                .wrap_err_with(|| format!("failed to remove guard file '{}'", guard.display()))?;
        }
        tracing::debug!(path = %self.path.display(), "closed store");
        Ok(())
    }

    /// Flushes and removes the guard file. Dropping the handle does the
    /// same, ignoring errors.
    pub fn close(mut self) -> Result<()> {
        self.close_inner()
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        let _ = self.close_inner();
    }
}
