//! # Result Iteration
//!
//! `ResultIterator` streams decoded rows out of a `select`. Two shapes:
//!
//! - **Primary order** (`Id` or no order given): walk the table's primary
//!   trie directly; values are rows.
//! - **Index order**: walk the index trie; each value is a postings list
//!   of primary keys, drained one at a time (front for ascending, back for
//!   descending) with the row fetched from the primary trie.
//!
//! Where-filtering happens after decoding, so it works on any field, not
//! just indexed ones. Rows that fail the filter are skipped, not
//! terminated on.
//!
//! The iterator pins the region read lock and both trie roots for its
//! lifetime; drop it before committing the snapshot elsewhere.

use std::collections::VecDeque;
use std::marker::PhantomData;

use eyre::Result;
use parking_lot::RwLockReadGuard;

use crate::encoding::{encode_nibbles, IndexValue};
use crate::memory::Region;
use crate::trie::iter::IterCore;
use crate::trie::ops;
use crate::trie::NodeHandle;

use super::overlay::row_matches;
use super::{codec, Condition, Direction, OrderClause, TableRow, WhereClause};

pub struct ResultIterator<'db, T> {
    guard: RwLockReadGuard<'db, Region>,
    core: IterCore,
    /// Primary trie root when walking an index; null when walking the
    /// primary trie itself.
    table_root: NodeHandle,
    where_clause: Option<WhereClause>,
    order: OrderClause,
    /// Postings currently being drained (index walks only).
    entries: VecDeque<Vec<u8>>,
    _row: PhantomData<fn() -> T>,
}

impl<'db, T: TableRow> ResultIterator<'db, T> {
    /// Both `iter_root` and `table_root` arrive already retained; the
    /// iterator owns those references and releases them on drop.
    pub(crate) fn new(
        guard: RwLockReadGuard<'db, Region>,
        iter_root: NodeHandle,
        table_root: NodeHandle,
        where_clause: Option<WhereClause>,
        order: OrderClause,
    ) -> Self {
        let core = IterCore::from_retained(iter_root);
        ResultIterator {
            guard,
            core,
            table_root,
            where_clause,
            order,
            entries: VecDeque::new(),
            _row: PhantomData,
        }
    }

    /// A LIKE on the ordered field with a non-string value cannot filter
    /// by substring; it degenerates into one prefix seek over the encoded
    /// value, after which the clause is dropped.
    pub(crate) fn apply_like_seek(&mut self) {
        let Some(clause) = &self.where_clause else {
            return;
        };
        if clause.condition == Condition::Like
            && clause.field == self.order.field
            && !matches!(clause.value, IndexValue::Str(_))
        {
            let prefix = clause.value.encode();
            self.core.seek_prefix(&self.guard, &prefix);
            self.where_clause = None;
        }
    }

    fn advance(&mut self) -> Option<(Vec<u8>, Vec<u8>)> {
        match self.order.direction {
            Direction::Asc => self.core.next(&self.guard),
            Direction::Desc => self.core.prev(&self.guard),
        }
    }

    /// Next row passing the filter, or `None` at the end of the scan.
    pub fn next_row(&mut self) -> Result<Option<T>> {
        loop {
            let row: T = if !self.table_root.is_null() {
                if self.entries.is_empty() {
                    let Some((_, value)) = self.advance() else {
                        return Ok(None);
                    };
                    let postings: Vec<Vec<u8>> = codec::decode(&value)?;
                    self.entries = postings.into();
                    continue;
                }

                let primary_key = match self.order.direction {
                    Direction::Asc => self.entries.pop_front().unwrap(),
                    Direction::Desc => self.entries.pop_back().unwrap(),
                };
                let nibbles = encode_nibbles(&primary_key);
                let Some(bytes) = ops::get(&self.guard, self.table_root, &nibbles) else {
                    return Ok(None);
                };
                codec::decode(&bytes)?
            } else {
                let Some((_, value)) = self.advance() else {
                    return Ok(None);
                };
                codec::decode(&value)?
            };

            if let Some(clause) = &self.where_clause {
                if !row_matches(&row, clause) {
                    continue;
                }
            }

            return Ok(Some(row));
        }
    }

    /// Collects every remaining row.
    pub fn collect_rows(&mut self) -> Result<Vec<T>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next_row()? {
            rows.push(row);
        }
        Ok(rows)
    }
}

impl<T> Drop for ResultIterator<'_, T> {
    fn drop(&mut self) {
        self.core.release(&self.guard);
        let table_root = self.table_root;
        self.table_root = NodeHandle::NULL;
        table_root.release(&self.guard);
    }
}
