//! # EbakusDB
//!
//! An embedded, memory-mapped key/value store built on a persistent
//! (copy-on-write) radix trie, with lightweight tables, secondary indexes
//! and a small query surface layered on top.
//!
//! The entire store lives in one contiguous byte region — a memory-mapped
//! file or an in-process buffer. Every internal reference is a u64 offset
//! into that region, so the image on disk and the image in memory are the
//! same thing and the buffer can be remapped (grown) without touching a
//! single stored structure.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │   Db (open/close, guard file, root)      │
//! ├──────────────────────────────────────────┤
//! │   Table overlay (schemas, indexes,       │
//! │   select with where/order)               │
//! ├──────────────────────────────────────────┤
//! │   Snapshots (COW transactions)           │
//! ├──────────────────────────────────────────┤
//! │   Radix trie (nibble fan-out 16,         │
//! │   refcounted nodes and blobs)            │
//! ├──────────────────────────────────────────┤
//! │   Page allocator (bump + freelist)       │
//! ├──────────────────────────────────────────┤
//! │   Region (mmap or heap, offset handles)  │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use ebakusdb::{Db, Options};
//!
//! let db = Db::open("./my.db", Options::default())?;
//!
//! let snap = db.root_snapshot();
//! snap.insert(b"harry", b"kalogirou")?;
//! db.set_root_snapshot(&snap)?;
//! drop(snap);
//!
//! assert_eq!(db.get(b"harry").as_deref(), Some(b"kalogirou".as_ref()));
//! ```
//!
//! ## Snapshots
//!
//! A snapshot is a retained trie root: creating one is O(1), reading it is
//! unaffected by later commits, and mutating it copies only the touched
//! path. [`Db::set_root_snapshot`] publishes a snapshot's tree as the new
//! store root with a single pointer swap.
//!
//! ## Tables
//!
//! Tables and their secondary indexes are ordinary trie entries whose
//! values carry nested trie roots. Declare a row type with [`table_row!`],
//! then use [`Snapshot::create_table`], [`Snapshot::insert_obj`] and
//! [`Snapshot::select`].
//!
//! ## Durability Model
//!
//! Writes go straight into the mapped region; there is no write-ahead log.
//! A guard file flags unclean shutdown at the next open
//! ([`StoreError::DirtyDatabase`]) rather than attempting recovery.

#[macro_use]
mod macros;

pub mod db;
pub mod encoding;
pub mod error;
pub mod memory;
pub mod snapshot;
pub mod table;
pub mod trie;

pub use db::{Db, DbInfo, Options};
pub use encoding::{decode_nibbles, encode_nibbles, IndexValue, Int256};
pub use error::StoreError;
pub use snapshot::Snapshot;
pub use table::{Condition, Direction, OrderClause, ResultIterator, TableRow, WhereClause};
pub use trie::{NodeHandle, TrieIterator, MAX_DATA_SIZE};
