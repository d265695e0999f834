//! # Table Operations
//!
//! The snapshot-level table surface: DDL (`create_table`, `create_index`),
//! typed row mutation (`insert_obj`, `delete_obj`) and `select`.
//!
//! All of these are plain trie edits under the snapshot's writer lock, so
//! a table mutation commits atomically with everything else the snapshot
//! holds. Multi-step operations reserve region headroom up front; a store
//! that cannot grow any further fails the operation before the first edit.
//!
//! ## Reference-Count Choreography
//!
//! Inserting into a nested trie returns a new root that the caller adopts
//! into the table record: the record entry's `subtree` releases the old
//! root and takes ownership of the new one when the record is re-inserted.
//! When a mutation happens to rebuild in place (the root was already
//! writable), the returned handle equals the current one carrying one
//! extra reference, which is dropped immediately — re-inserting the record
//! with an unchanged subtree neither retains nor releases it.

use eyre::{bail, ensure, eyre, Result};

use crate::encoding::{encode_nibbles, IndexValue};
use crate::error::StoreError;
use crate::memory::Region;
use crate::snapshot::{SnapInner, Snapshot};
use crate::trie::blob::check_payload_len;
use crate::trie::ops::{self, TrieWriter};
use crate::trie::{BlobHandle, Node, NodeHandle};

use super::codec;
use super::query::ResultIterator;
use super::{index_key, table_key, Condition, Direction, OrderClause, Table, TableRow, WhereClause};

/// Bump headroom reserved before a multi-step table mutation.
const TABLE_OP_HEADROOM: u64 = 256 * 1024;

impl<'db> Snapshot<'db> {
    pub fn has_table(&self, table: &str) -> bool {
        self.get(&table_key(table)).is_some()
    }

    /// Creates `name` with `T`'s schema. The table starts with the
    /// implicit `Id` index only.
    pub fn create_table<T: TableRow>(&self, name: &str) -> Result<()> {
        ensure!(!self.db.is_read_only(), "store is opened read-only");
        self.db.ensure_headroom(TABLE_OP_HEADROOM)?;

        let mut inner = self.inner.lock();
        let mm = self.db.region().read();

        let primary = Node::alloc(&mm)?;
        let table = Table {
            indexes: vec!["Id".to_string()],
            node: primary,
            schema: T::table_schema(),
        };

        let inserted = codec::encode(&table).and_then(|value| {
            self.insert_locked(&mut inner, &mm, &table_key(name), &value, primary)
        });
        if let Err(err) = inserted {
            primary.release(&mm);
            return Err(err);
        }

        tracing::debug!(table = name, "created table");
        Ok(())
    }

    /// Registers a secondary index over `field` and roots an empty index
    /// trie under `<table>.<field>`.
    pub fn create_index(&self, table: &str, field: &str) -> Result<()> {
        ensure!(!self.db.is_read_only(), "store is opened read-only");
        self.db.ensure_headroom(TABLE_OP_HEADROOM)?;

        let mut inner = self.inner.lock();
        let mm = self.db.region().read();

        let raw = entry(&inner, &mm, &table_key(table))
            .ok_or_else(|| eyre::Report::new(StoreError::UnknownTable(table.to_string())))?;
        let mut record: Table = codec::decode(&raw)?;
        record.indexes.push(field.to_string());

        let value = codec::encode(&record)?;
        // The subtree handle is unchanged here, so no ownership moves.
        self.insert_locked(&mut inner, &mm, &table_key(table), &value, record.node)?;

        let index_root = Node::alloc(&mm)?;
        let inserted = codec::encode(&index_root).and_then(|value| {
            self.insert_locked(&mut inner, &mm, &index_key(table, field), &value, index_root)
        });
        if let Err(err) = inserted {
            index_root.release(&mm);
            return Err(err);
        }

        tracing::debug!(table, field, "created index");
        Ok(())
    }

    /// Inserts or updates one row, keyed by its `Id` field, and patches
    /// every secondary index whose field value changed.
    pub fn insert_obj<T: TableRow>(&self, table: &str, row: &T) -> Result<()> {
        ensure!(!self.db.is_read_only(), "store is opened read-only");

        let encoded_row = codec::encode(row)?;
        check_payload_len(encoded_row.len())?;
        self.db
            .ensure_headroom(TABLE_OP_HEADROOM + 4 * encoded_row.len() as u64)?;

        let mut inner = self.inner.lock();
        let mm = self.db.region().read();

        let raw = entry(&inner, &mm, &table_key(table))
            .ok_or_else(|| eyre::Report::new(StoreError::UnknownTable(table.to_string())))?;
        let mut record: Table = codec::decode(&raw)?;

        let primary = row
            .field("Id")
            .ok_or_else(|| eyre!("row has no Id field"))?;
        let pk = primary.encode();
        let pk_nibbles = encode_nibbles(&pk);

        // Primary trie insert.
        let row_blob = BlobHandle::from_slice(&mm, &encoded_row)?;
        let mut writer = TrieWriter {
            mm: &mm,
            writable: &mut inner.writable,
            root: record.node,
        };
        let outcome = writer.insert(record.node, &pk_nibbles, &pk_nibbles, row_blob, NodeHandle::NULL);
        let mut row_blob = row_blob;
        let (new_root, old_val, _) = match outcome {
            Ok(parts) => parts,
            Err(err) => {
                row_blob.release(&mm);
                return Err(err);
            }
        };
        row_blob.release(&mm);

        if let Some(new_root) = new_root {
            let adopted = new_root != record.node;
            if adopted {
                record.node = new_root;
            } else {
                // Rebuilt in place: drop the extra reference from the
                // write-path retain.
                new_root.release(&mm);
            }
            let reinserted = codec::encode(&record).and_then(|value| {
                self.insert_locked(&mut inner, &mm, &table_key(table), &value, record.node)
            });
            if let Err(err) = reinserted {
                if adopted {
                    // The record entry still points at the old root; the
                    // orphaned new tree rolls back on release.
                    new_root.release(&mm);
                }
                if let Some(mut old) = old_val {
                    old.release(&mm);
                }
                return Err(err);
            }
        }

        let old_row: Option<T> = match old_val {
            Some(mut blob) => {
                let bytes = blob.bytes(&mm).to_vec();
                blob.release(&mm);
                Some(codec::decode(&bytes)?)
            }
            None => None,
        };

        // Patch the secondary indexes.
        for field_name in &record.indexes {
            if field_name == "Id" {
                continue;
            }

            let key = index_key(table, field_name);
            let raw = entry(&inner, &mm, &key).ok_or_else(|| {
                eyre::Report::new(StoreError::UnknownIndex(field_name.clone()))
            })?;
            let mut index_root: NodeHandle = codec::decode(&raw)?;

            let value = row
                .field(field_name)
                .ok_or_else(|| eyre!("row has no {field_name} field"))?;

            // Remove the primary key from the field's previous postings
            // when this is an update that moved the value.
            if let Some(old_row) = &old_row {
                let old_value = old_row
                    .field(field_name)
                    .ok_or_else(|| eyre!("old row has no {field_name} field"))?;
                if old_value == value {
                    continue;
                }

                let old_entry = encode_nibbles(&old_value.encode());
                let mut postings = load_postings(&mm, index_root, &old_entry)?;

                if postings.len() > 1 {
                    let before = postings.len();
                    postings.retain(|entry| entry != &pk);
                    ensure!(
                        postings.len() < before,
                        "indexed key not found in old position"
                    );
                    postings.sort();
                    let value = codec::encode(&postings)?;
                    index_root =
                        index_insert(&mut inner, &mm, index_root, &old_entry, &value)?;
                } else {
                    index_root = index_delete(&mut inner, &mm, index_root, &old_entry)?;
                }

                let value = codec::encode(&index_root)?;
                self.insert_locked(&mut inner, &mm, &key, &value, index_root)?;
            }

            let new_entry = encode_nibbles(&value.encode());
            let mut postings = load_postings(&mm, index_root, &new_entry)?;
            postings.push(pk.clone());
            postings.sort();

            let encoded = codec::encode(&postings)?;
            let updated = index_insert(&mut inner, &mm, index_root, &new_entry, &encoded)?;
            let value = codec::encode(&updated)?;
            self.insert_locked(&mut inner, &mm, &key, &value, updated)?;
        }

        Ok(())
    }

    /// Deletes the row with the given `Id`, unhooking it from every
    /// secondary index.
    pub fn delete_obj<T: TableRow, I: Into<IndexValue>>(&self, table: &str, id: I) -> Result<()> {
        ensure!(!self.db.is_read_only(), "store is opened read-only");
        self.db.ensure_headroom(TABLE_OP_HEADROOM)?;

        let mut inner = self.inner.lock();
        let mm = self.db.region().read();

        let raw = entry(&inner, &mm, &table_key(table))
            .ok_or_else(|| eyre::Report::new(StoreError::UnknownTable(table.to_string())))?;
        let mut record: Table = codec::decode(&raw)?;

        let pk = id.into().encode();
        let pk_nibbles = encode_nibbles(&pk);

        let mut writer = TrieWriter {
            mm: &mm,
            writable: &mut inner.writable,
            root: record.node,
        };
        let (new_root, old_val) = writer.delete(None, record.node, &pk_nibbles)?;

        let old_bytes = old_val.map(|mut blob| {
            let bytes = blob.bytes(&mm).to_vec();
            blob.release(&mm);
            bytes
        });

        if let Some(new_root) = new_root {
            if new_root == record.node {
                new_root.release(&mm);
            } else {
                record.node = new_root;
            }
            let value = codec::encode(&record)?;
            self.insert_locked(&mut inner, &mm, &table_key(table), &value, record.node)?;
        }

        if record.indexes.len() > 1 {
            let Some(old_bytes) = old_bytes else {
                bail!("no row with the given id in '{table}'");
            };
            let old_row: T = codec::decode(&old_bytes)?;

            for field_name in &record.indexes {
                if field_name == "Id" {
                    continue;
                }

                let key = index_key(table, field_name);
                let raw = entry(&inner, &mm, &key).ok_or_else(|| {
                    eyre::Report::new(StoreError::UnknownIndex(field_name.clone()))
                })?;
                let mut index_root: NodeHandle = codec::decode(&raw)?;

                let old_value = old_row
                    .field(field_name)
                    .ok_or_else(|| eyre!("old row has no {field_name} field"))?;
                let old_entry = encode_nibbles(&old_value.encode());
                let mut postings = load_postings(&mm, index_root, &old_entry)?;

                if postings.len() > 1 {
                    let before = postings.len();
                    postings.retain(|entry| entry != &pk);
                    ensure!(postings.len() < before, "key to be deleted not found");
                    postings.sort();
                    let value = codec::encode(&postings)?;
                    index_root =
                        index_insert(&mut inner, &mm, index_root, &old_entry, &value)?;
                } else {
                    index_root = index_delete(&mut inner, &mm, index_root, &old_entry)?;
                }

                let value = codec::encode(&index_root)?;
                self.insert_locked(&mut inner, &mm, &key, &value, index_root)?;
            }
        }

        Ok(())
    }

    /// Streams rows of `table`, optionally filtered and ordered. Ordering
    /// by a non-indexed field falls back to `Id` order.
    pub fn select<T: TableRow>(
        &self,
        table: &str,
        where_clause: Option<WhereClause>,
        order: Option<OrderClause>,
    ) -> Result<ResultIterator<'db, T>> {
        let (iter_root, table_root, order) = {
            let inner = self.inner.lock();
            let mm = self.db.region().read();

            let raw = entry(&inner, &mm, &table_key(table))
                .ok_or_else(|| eyre::Report::new(StoreError::UnknownTable(table.to_string())))?;
            let record: Table = codec::decode(&raw)?;

            let order = order
                .filter(|o| record.indexes.iter().any(|field| field == &o.field))
                .unwrap_or_else(|| OrderClause {
                    field: "Id".to_string(),
                    direction: Direction::Asc,
                });

            let (iter_root, table_root) = if order.field == "Id" {
                (record.node, NodeHandle::NULL)
            } else {
                let raw = entry(&inner, &mm, &index_key(table, &order.field)).ok_or_else(|| {
                    eyre::Report::new(StoreError::UnknownIndex(order.field.clone()))
                })?;
                let index_root: NodeHandle = codec::decode(&raw)?;
                (index_root, record.node)
            };

            // Pin both roots before any lock is released; the snapshot
            // could otherwise drop them mid-construction.
            iter_root.retain(&mm);
            table_root.retain(&mm);
            (iter_root, table_root, order)
        };

        let guard = self.db.region().read();
        let mut iterator = ResultIterator::new(guard, iter_root, table_root, where_clause, order);

        // A LIKE over the ordered non-string field degenerates into one
        // prefix seek, after which no filtering remains.
        iterator.apply_like_seek();

        Ok(iterator)
    }
}

fn entry(inner: &SnapInner, mm: &Region, key: &[u8]) -> Option<Vec<u8>> {
    ops::get(mm, inner.root, &encode_nibbles(key))
}

fn load_postings(mm: &Region, root: NodeHandle, entry: &[u8]) -> Result<Vec<Vec<u8>>> {
    match ops::get(mm, root, entry) {
        Some(bytes) => codec::decode(&bytes),
        None => Ok(Vec::new()),
    }
}

/// Inserts into a nested index trie, balancing the in-place case. The
/// returned root is owned by the caller (who hands it to the record entry).
fn index_insert(
    inner: &mut SnapInner,
    mm: &Region,
    root: NodeHandle,
    entry: &[u8],
    value: &[u8],
) -> Result<NodeHandle> {
    let blob = BlobHandle::from_slice(mm, value)?;
    let mut writer = TrieWriter {
        mm,
        writable: &mut inner.writable,
        root,
    };
    let outcome = writer.insert(root, entry, entry, blob, NodeHandle::NULL);

    let mut blob = blob;
    let (new_root, old_val, _) = match outcome {
        Ok(parts) => parts,
        Err(err) => {
            blob.release(mm);
            return Err(err);
        }
    };
    blob.release(mm);
    if let Some(mut old) = old_val {
        old.release(mm);
    }

    Ok(match new_root {
        Some(new_root) if new_root == root => {
            new_root.release(mm);
            root
        }
        Some(new_root) => new_root,
        None => root,
    })
}

fn index_delete(
    inner: &mut SnapInner,
    mm: &Region,
    root: NodeHandle,
    entry: &[u8],
) -> Result<NodeHandle> {
    let mut writer = TrieWriter {
        mm,
        writable: &mut inner.writable,
        root,
    };
    let (new_root, old_val) = writer.delete(None, root, entry)?;
    if let Some(mut old) = old_val {
        old.release(mm);
    }

    Ok(match new_root {
        Some(new_root) if new_root == root => {
            new_root.release(mm);
            root
        }
        Some(new_root) => new_root,
        None => root,
    })
}

pub(crate) fn row_matches<T: TableRow>(row: &T, clause: &WhereClause) -> bool {
    let Some(value) = row.field(&clause.field) else {
        return false;
    };

    use std::cmp::Ordering;
    match clause.condition {
        Condition::Equal => value == clause.value,
        Condition::NotEqual => value != clause.value,
        Condition::Smaller => value.partial_cmp(&clause.value) == Some(Ordering::Less),
        Condition::SmallerOrEqual => matches!(
            value.partial_cmp(&clause.value),
            Some(Ordering::Less | Ordering::Equal)
        ),
        Condition::Larger => value.partial_cmp(&clause.value) == Some(Ordering::Greater),
        Condition::LargerOrEqual => matches!(
            value.partial_cmp(&clause.value),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        Condition::Like => value.like(&clause.value),
    }
}
