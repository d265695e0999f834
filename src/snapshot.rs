//! # Snapshots
//!
//! A snapshot is both a consistent view and the transaction handle for
//! mutation. It owns one strong reference to a trie root; every mutation
//! copies the touched path and swaps the snapshot's root, so other
//! snapshots sharing structure never observe the change.
//!
//! Cheap forks: `snapshot()` retains the current root and hands it to a
//! new `Snapshot`. The parent's writable hazard set is cleared at that
//! point — nodes it could previously mutate in place are now shared and
//! must be cloned again before mutation.
//!
//! ## Locking
//!
//! - The per-snapshot writer mutex serializes mutators (and point reads)
//!   on the same snapshot; different snapshots proceed in parallel.
//! - Every region dereference happens under the store's region read lock;
//!   growing takes the write side. Lock order is always snapshot-inner
//!   before region.
//!
//! ## Growth
//!
//! A mutation that runs out of region space fails cleanly, the store grows
//! the backing (doubling below 1 GiB, +1 GiB beyond) and the operation
//! retries. After any successful mutation the store also grows
//! opportunistically once the allocator passes 70% occupancy.

use eyre::{ensure, Result};
use parking_lot::Mutex;

use crate::db::Db;
use crate::encoding::{decode_nibbles, encode_nibbles};
use crate::error::is_out_of_memory;
use crate::memory::Region;
use crate::trie::blob::check_payload_len;
use crate::trie::ops::{self, TrieWriter, WritableSet};
use crate::trie::{BlobHandle, NodeHandle, TrieIterator};

pub(crate) struct SnapInner {
    pub(crate) root: NodeHandle,
    pub(crate) writable: WritableSet,
}

pub struct Snapshot<'db> {
    pub(crate) db: &'db Db,
    pub(crate) inner: Mutex<SnapInner>,
}

impl<'db> Snapshot<'db> {
    /// Wraps an already-retained root.
    pub(crate) fn new(db: &'db Db, root: NodeHandle) -> Self {
        Snapshot {
            db,
            inner: Mutex::new(SnapInner {
                root,
                writable: WritableSet::new(),
            }),
        }
    }

    /// Copy of the value stored under `key`, if any.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let nibbles = encode_nibbles(key);

        let inner = self.inner.lock();
        let mm = self.db.region().read();
        let root = inner.root;
        root.retain(&mm);
        drop(inner);

        let result = ops::get(&mm, root, &nibbles);
        root.release(&mm);
        result
    }

    /// Deepest stored entry whose key is a prefix of `key`.
    pub fn longest_prefix(&self, key: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        let nibbles = encode_nibbles(key);

        let inner = self.inner.lock();
        let mm = self.db.region().read();
        let root = inner.root;
        root.retain(&mm);
        drop(inner);

        let result = ops::longest_prefix(&mm, root, &nibbles)
            .and_then(|(k, v)| decode_nibbles(&k).map(|k| (k, v)));
        root.release(&mm);
        result
    }

    /// Inserts `value` under `key`. Returns the previous value (if the key
    /// existed) and whether this was an update.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<(Option<Vec<u8>>, bool)> {
        self.insert_with_subtree(key, value, NodeHandle::NULL)
    }

    /// Insert that also hangs `subtree` off the entry — the table overlay
    /// stores nested trie roots this way. Ownership of `subtree` moves
    /// into the trie on success.
    pub(crate) fn insert_with_subtree(
        &self,
        key: &[u8],
        value: &[u8],
        subtree: NodeHandle,
    ) -> Result<(Option<Vec<u8>>, bool)> {
        check_payload_len(value.len())?;
        ensure!(!self.db.is_read_only(), "store is opened read-only");

        let mut inner = self.inner.lock();
        loop {
            let attempt = {
                let mm = self.db.region().read();
                self.insert_locked(&mut inner, &mm, key, value, subtree)
            };
            match attempt {
                Err(err) if is_out_of_memory(&err) => self.db.grow_step()?,
                Ok(result) => {
                    self.db.grow_if_needed()?;
                    return Ok(result);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// One insert attempt with the writer lock and region guard already
    /// held. A clean `OutOfMemory` failure leaves the root untouched and
    /// `subtree` still owned by the caller.
    pub(crate) fn insert_locked(
        &self,
        inner: &mut SnapInner,
        mm: &Region,
        key: &[u8],
        value: &[u8],
        subtree: NodeHandle,
    ) -> Result<(Option<Vec<u8>>, bool)> {
        check_payload_len(value.len())?;

        let nibbles = encode_nibbles(key);
        let value_blob = BlobHandle::from_slice(mm, value)?;

        let mut writer = TrieWriter {
            mm,
            writable: &mut inner.writable,
            root: inner.root,
        };
        let outcome = writer.insert(inner.root, &nibbles, &nibbles, value_blob, subtree);

        let mut value_blob = value_blob;
        let (new_root, old_val, updated) = match outcome {
            Ok(parts) => parts,
            Err(err) => {
                value_blob.release(mm);
                return Err(err);
            }
        };

        if let Some(new_root) = new_root {
            inner.root.release(mm);
            inner.root = new_root;
        }
        value_blob.release(mm);

        let old = old_val.map(|mut blob| {
            let bytes = blob.bytes(mm).to_vec();
            blob.release(mm);
            bytes
        });
        Ok((old, updated))
    }

    /// Removes `key`. Returns whether a value was removed.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        ensure!(!self.db.is_read_only(), "store is opened read-only");

        let mut inner = self.inner.lock();
        loop {
            let attempt = {
                let mm = self.db.region().read();
                self.delete_locked(&mut inner, &mm, key)
            };
            match attempt {
                Err(err) if is_out_of_memory(&err) => self.db.grow_step()?,
                Ok(deleted) => return Ok(deleted),
                Err(err) => return Err(err),
            }
        }
    }

    pub(crate) fn delete_locked(
        &self,
        inner: &mut SnapInner,
        mm: &Region,
        key: &[u8],
    ) -> Result<bool> {
        let nibbles = encode_nibbles(key);

        let mut writer = TrieWriter {
            mm,
            writable: &mut inner.writable,
            root: inner.root,
        };
        let (new_root, old_val) = writer.delete(None, inner.root, &nibbles)?;

        if let Some(mut old) = old_val {
            old.release(mm);
        }

        match new_root {
            Some(new_root) => {
                inner.root.release(mm);
                inner.root = new_root;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Forks an independent snapshot sharing the current tree. The fork
    /// makes the shared nodes immutable for this snapshot too, so the
    /// writable set is cleared.
    pub fn snapshot(&self) -> Snapshot<'db> {
        let mut inner = self.inner.lock();
        inner.writable.clear();

        let mm = self.db.region().read();
        inner.root.retain(&mm);
        let root = inner.root;
        drop(mm);
        drop(inner);

        Snapshot::new(self.db, root)
    }

    /// Abandons this snapshot's state and adopts `other`'s tree.
    pub fn reset_to(&self, other: &Snapshot<'_>) {
        let new_root = {
            let other_inner = other.inner.lock();
            let mm = self.db.region().read();
            other_inner.root.retain(&mm);
            other_inner.root
        };

        let mut inner = self.inner.lock();
        let mm = self.db.region().read();
        inner.writable.clear();

        if inner.root == new_root {
            new_root.release(&mm);
            return;
        }

        let old_root = inner.root;
        inner.root = new_root;
        old_root.release(&mm);
    }

    /// Ordered iterator over this snapshot's tree. Holds the region read
    /// lock until dropped.
    pub fn iter(&self) -> TrieIterator<'db> {
        let inner = self.inner.lock();
        let guard = self.db.region().read();
        let root = inner.root;
        root.retain(&guard);
        drop(inner);

        TrieIterator::from_retained(guard, root)
    }

    /// Explicit release; equivalent to dropping the snapshot.
    pub fn release(self) {}
}

impl Drop for Snapshot<'_> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let root = inner.root;
        inner.root = NodeHandle::NULL;

        if !root.is_null() {
            let mm = self.db.region().read();
            root.release(&mm);
        }
    }
}
