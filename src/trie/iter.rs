//! # Trie Iteration
//!
//! Depth-first walk over a retained trie root. The iterator keeps a stack
//! of edge snapshots: when a node is first expanded, its non-null edges are
//! collected in ascending nibble order (descending for `prev`), so keys
//! come out in lexicographic order of their nibble expansion — which is
//! byte order of the original keys.
//!
//! `seek_prefix` positions the walk at the subtree covering a key prefix;
//! a prefix that ends inside a node's compressed prefix still matches.
//!
//! The public [`TrieIterator`] owns a read guard on the region for its
//! whole lifetime, so the buffer cannot be remapped underneath a running
//! walk; release iterators before committing large batches. Iteration is
//! not transactional with mutations made through the same snapshot while
//! the iterator is live.

use parking_lot::RwLockReadGuard;
use smallvec::SmallVec;

use crate::encoding::{decode_nibbles, encode_nibbles};
use crate::memory::Region;

use super::node::{NodeHandle, FANOUT};

type EdgeList = SmallVec<[NodeHandle; FANOUT]>;

/// Region-independent iterator state; the callers thread the region in.
pub(crate) struct IterCore {
    root: NodeHandle,
    node: NodeHandle,
    stack: Option<Vec<EdgeList>>,
}

impl IterCore {
    /// Retains `root` for the lifetime of the iterator.
    pub(crate) fn new(mm: &Region, root: NodeHandle) -> Self {
        root.retain(mm);
        Self::from_retained(root)
    }

    /// Wraps a root the caller has already retained; the iterator takes
    /// over that reference.
    pub(crate) fn from_retained(root: NodeHandle) -> Self {
        IterCore {
            root,
            node: root,
            stack: None,
        }
    }

    pub(crate) fn release(&mut self, mm: &Region) {
        let root = self.root;
        self.root = NodeHandle::NULL;
        self.node = NodeHandle::NULL;
        root.release(mm);
    }

    /// Positions the walk at the subtree of keys starting with `prefix`
    /// (raw bytes, nibble-expanded internally). A miss parks the iterator
    /// at the end; a later seek restarts from the root.
    pub(crate) fn seek_prefix(&mut self, mm: &Region, prefix: &[u8]) {
        let prefix = encode_nibbles(prefix);
        self.stack = None;

        let mut node = if self.node.is_null() {
            self.root
        } else {
            self.node
        };
        let mut search = prefix.as_slice();

        loop {
            if search.is_empty() {
                self.node = node;
                return;
            }

            let next = node.node(mm).edges[search[0] as usize];
            if next.is_null() {
                self.node = NodeHandle::NULL;
                return;
            }
            node = next;

            let node_prefix = node.node(mm).prefix.bytes(mm);
            if search.starts_with(node_prefix) {
                search = &search[node_prefix.len()..];
            } else if node_prefix.starts_with(search) {
                // The prefix ends inside this node's compressed run.
                self.node = node;
                return;
            } else {
                self.node = NodeHandle::NULL;
                return;
            }
        }
    }

    pub(crate) fn next(&mut self, mm: &Region) -> Option<(Vec<u8>, Vec<u8>)> {
        self.step(mm, false)
    }

    pub(crate) fn prev(&mut self, mm: &Region) -> Option<(Vec<u8>, Vec<u8>)> {
        self.step(mm, true)
    }

    fn step(&mut self, mm: &Region, descending: bool) -> Option<(Vec<u8>, Vec<u8>)> {
        if self.stack.is_none() && !self.node.is_null() {
            let mut first = EdgeList::new();
            first.push(self.node);
            self.stack = Some(vec![first]);
        }
        let stack = self.stack.as_mut()?;

        while !stack.is_empty() {
            let (elem, drained) = {
                let last = stack.last_mut().unwrap();
                let elem = last.remove(0);
                (elem, last.is_empty())
            };
            if drained {
                stack.pop();
            }

            let node = elem.node(mm);

            let mut edges = EdgeList::new();
            if descending {
                for edge in node.edges.iter().rev() {
                    if !edge.is_null() {
                        edges.push(*edge);
                    }
                }
            } else {
                for edge in node.edges.iter() {
                    if !edge.is_null() {
                        edges.push(*edge);
                    }
                }
            }
            if !edges.is_empty() {
                stack.push(edges);
            }

            if node.is_leaf() {
                let key = decode_nibbles(node.key.bytes(mm)).unwrap_or_default();
                return Some((key, node.value.bytes(mm).to_vec()));
            }
        }

        None
    }
}

/// Iterator over one trie, holding the store's region read lock for its
/// lifetime (growing blocks until it is dropped).
pub struct TrieIterator<'a> {
    guard: RwLockReadGuard<'a, Region>,
    core: IterCore,
}

impl<'a> TrieIterator<'a> {
    pub(crate) fn new(guard: RwLockReadGuard<'a, Region>, root: NodeHandle) -> Self {
        let core = IterCore::new(&guard, root);
        TrieIterator { guard, core }
    }

    /// Takes over a reference the caller already retained under its own
    /// lock (a snapshot's root could be swapped between that lock being
    /// dropped and a retain here).
    pub(crate) fn from_retained(guard: RwLockReadGuard<'a, Region>, root: NodeHandle) -> Self {
        TrieIterator {
            guard,
            core: IterCore::from_retained(root),
        }
    }

    pub fn seek_prefix(&mut self, prefix: &[u8]) {
        self.core.seek_prefix(&self.guard, prefix);
    }

    /// Next `(key, value)` pair in ascending key order.
    pub fn next_entry(&mut self) -> Option<(Vec<u8>, Vec<u8>)> {
        self.core.next(&self.guard)
    }

    /// Next `(key, value)` pair in descending key order.
    pub fn prev_entry(&mut self) -> Option<(Vec<u8>, Vec<u8>)> {
        self.core.prev(&self.guard)
    }
}

impl Drop for TrieIterator<'_> {
    fn drop(&mut self) {
        self.core.release(&self.guard);
    }
}
