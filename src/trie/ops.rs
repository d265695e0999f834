//! # Trie Algorithms
//!
//! Lookup, longest-prefix, copy-on-write insert and delete-with-merge over
//! the node layer. All keys arriving here are already nibble-expanded.
//!
//! ## Copy-on-Write
//!
//! Mutations never touch shared structure. `TrieWriter::write_node` either
//! reuses a node this transaction already owns (tracked by the bounded
//! [`WritableSet`] hazard set) or clones it, retaining every blob and child
//! the clone shares with the original. The mutated path is rebuilt from the
//! leaf up and the caller swaps the returned root in; releasing the old
//! root then cascades through whatever became unreachable.
//!
//! ## Failure Atomicity
//!
//! Each recursion frame performs its fallible allocations *before* wiring
//! anything into the result, and releases its partial products on error.
//! An allocation failure therefore unwinds to the caller with the original
//! trie intact; the store grows the region and retries the operation.
//!
//! ## Delete and Merge
//!
//! Removing a leaf that leaves a node with exactly one child merges the
//! node with that child (prefix concatenation, field adoption). The trie
//! root is never merged — insert relies on the root having an empty prefix.

use eyre::Result;
use hashbrown::HashMap;

use crate::memory::Region;

use super::blob::BlobHandle;
use super::node::{Node, NodeHandle};

/// Bound on the writable hazard set. Purely a performance knob: evicted
/// entries just cause an extra clone on the next touch.
pub(crate) const DEFAULT_WRITABLE_CACHE: usize = 8192;

/// Handles cloned (or created) by the current transaction, and therefore
/// safe to mutate in place. Bounded LRU; not an ownership structure.
#[derive(Debug)]
pub(crate) struct WritableSet {
    map: HashMap<u64, u64>,
    tick: u64,
    capacity: usize,
}

impl WritableSet {
    pub(crate) fn new() -> Self {
        Self::with_capacity(DEFAULT_WRITABLE_CACHE)
    }

    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            map: HashMap::new(),
            tick: 0,
            capacity,
        }
    }

    /// Membership test that refreshes the entry's recency.
    pub(crate) fn touch(&mut self, handle: NodeHandle) -> bool {
        self.tick += 1;
        let tick = self.tick;
        match self.map.get_mut(&handle.0) {
            Some(stamp) => {
                *stamp = tick;
                true
            }
            None => false,
        }
    }

    pub(crate) fn insert(&mut self, handle: NodeHandle) {
        if self.map.len() >= self.capacity {
            let oldest = self
                .map
                .iter()
                .min_by_key(|(_, &stamp)| stamp)
                .map(|(&handle, _)| handle);
            if let Some(oldest) = oldest {
                self.map.remove(&oldest);
            }
        }
        self.tick += 1;
        self.map.insert(handle.0, self.tick);
    }

    pub(crate) fn clear(&mut self) {
        self.map.clear();
    }
}

pub(crate) fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    let max = a.len().min(b.len());
    let mut i = 0;
    while i < max && a[i] == b[i] {
        i += 1;
    }
    i
}

/// Descends from `root` following nibbles of `key`. Returns a copy of the
/// value bytes; callers never see allocator-owned memory.
pub(crate) fn get(mm: &Region, root: NodeHandle, key: &[u8]) -> Option<Vec<u8>> {
    let mut node = root;
    let mut search = key;

    loop {
        let n = node.node(mm);

        if search.is_empty() {
            if n.is_leaf() {
                return Some(n.value.bytes(mm).to_vec());
            }
            return None;
        }

        let next = n.edges[search[0] as usize];
        if next.is_null() {
            return None;
        }

        let prefix = next.node(mm).prefix.bytes(mm);
        if !search.starts_with(prefix) {
            return None;
        }
        search = &search[prefix.len()..];
        node = next;
    }
}

/// Same descent as `get`, tracking the deepest leaf on the path. Returns
/// copies of its (nibble-expanded) key and value.
pub(crate) fn longest_prefix(
    mm: &Region,
    root: NodeHandle,
    key: &[u8],
) -> Option<(Vec<u8>, Vec<u8>)> {
    let mut last = NodeHandle::NULL;
    let mut node = root;
    let mut search = key;

    loop {
        let n = node.node(mm);
        if n.is_leaf() {
            last = node;
        }

        if search.is_empty() {
            break;
        }

        let next = n.edges[search[0] as usize];
        if next.is_null() {
            break;
        }

        let prefix = next.node(mm).prefix.bytes(mm);
        if !search.starts_with(prefix) {
            break;
        }
        search = &search[prefix.len()..];
        node = next;
    }

    if last.is_null() {
        return None;
    }
    let n = last.node(mm);
    Some((n.key.bytes(mm).to_vec(), n.value.bytes(mm).to_vec()))
}

/// Copy-on-write mutator for one trie rooted at `root`, using the owning
/// snapshot's writable set.
pub(crate) struct TrieWriter<'a> {
    pub mm: &'a Region,
    pub writable: &'a mut WritableSet,
    pub root: NodeHandle,
}

impl TrieWriter<'_> {
    /// Returns a handle this transaction may mutate: the node itself when
    /// it is already ours (retained, so edge rewiring stays balanced), or
    /// a clone sharing all of its fields.
    fn write_node(&mut self, handle: NodeHandle) -> Result<NodeHandle> {
        let mm = self.mm;

        if self.writable.touch(handle) {
            handle.retain(mm);
            return Ok(handle);
        }

        let clone = Node::alloc(mm)?;
        {
            let src = handle.node(mm);
            let dst = clone.node_mut(mm);

            dst.key = src.key;
            dst.key.retain(mm);
            dst.value = src.value;
            dst.value.retain(mm);
            dst.prefix = src.prefix;
            dst.prefix.retain(mm);

            dst.edges = src.edges;
            for edge in dst.edges {
                edge.retain(mm);
            }

            if !src.subtree.is_null() {
                dst.subtree = src.subtree;
                dst.subtree.retain(mm);
            }
        }

        self.writable.insert(clone);
        Ok(clone)
    }

    /// Fresh leaf carrying `key`/`value` under `prefix`. On error nothing
    /// is leaked and `value`'s refcount is untouched.
    fn new_leaf(&mut self, key: &[u8], prefix: &[u8], value: BlobHandle) -> Result<NodeHandle> {
        let mm = self.mm;
        let leaf = Node::alloc(mm)?;

        let filled = (|| -> Result<()> {
            let key_blob = BlobHandle::from_slice(mm, key)?;
            leaf.node_mut(mm).key = key_blob;
            let prefix_blob = BlobHandle::from_slice(mm, prefix)?;
            leaf.node_mut(mm).prefix = prefix_blob;
            Ok(())
        })();

        match filled {
            Ok(()) => {
                let n = leaf.node_mut(mm);
                n.value = value;
                n.value.retain(mm);
                Ok(leaf)
            }
            Err(err) => {
                leaf.release(mm);
                Err(err)
            }
        }
    }

    /// Recursive COW insert. `key` is the full nibble-expanded key,
    /// `search` the remaining suffix at this node. `subtree` ownership
    /// transfers into the trie when it differs from the terminal node's
    /// current subtree; an identical handle is left untouched (the caller
    /// balances that case).
    ///
    /// Returns `(replacement-for-this-node, previous-value, updated)`.
    pub(crate) fn insert(
        &mut self,
        node: NodeHandle,
        key: &[u8],
        search: &[u8],
        value: BlobHandle,
        subtree: NodeHandle,
    ) -> Result<(Option<NodeHandle>, Option<BlobHandle>, bool)> {
        let mm = self.mm;

        // Key exhausted: this node becomes (or already is) the leaf.
        if search.is_empty() {
            let new_key = BlobHandle::from_slice(mm, key)?;
            let nc_ptr = match self.write_node(node) {
                Ok(p) => p,
                Err(err) => {
                    let mut blob = new_key;
                    blob.release(mm);
                    return Err(err);
                }
            };

            let nc = nc_ptr.node_mut(mm);
            let mut old_val = None;
            let mut did_update = false;
            if nc.is_leaf() {
                did_update = true;
                let old = nc.value;
                old.retain(mm);
                old_val = Some(old);
            }

            nc.key.release(mm);
            nc.key = new_key;
            nc.value.release(mm);
            nc.value = value;
            nc.value.retain(mm);

            if nc.subtree != subtree {
                let old_subtree = nc.subtree;
                nc.subtree = subtree;
                old_subtree.release(mm);
            }

            return Ok((Some(nc_ptr), old_val, did_update));
        }

        let label = search[0] as usize;
        let child_ptr = node.node(mm).edges[label];

        // No edge: attach a fresh leaf.
        if child_ptr.is_null() {
            let leaf = self.new_leaf(key, search, value)?;
            let nc_ptr = match self.write_node(node) {
                Ok(p) => p,
                Err(err) => {
                    leaf.release(mm);
                    return Err(err);
                }
            };
            leaf.node_mut(mm).subtree = subtree;
            nc_ptr.node_mut(mm).edges[label] = leaf;
            return Ok((Some(nc_ptr), None, false));
        }

        let child_prefix = child_ptr.node(mm).prefix.bytes(mm).to_vec();
        let common = common_prefix_len(search, &child_prefix);

        // Child prefix fully consumed: recurse and swap the edge.
        if common == child_prefix.len() {
            let (new_child, old_val, did_update) =
                self.insert(child_ptr, key, &search[common..], value, subtree)?;

            let Some(new_child) = new_child else {
                return Ok((None, old_val, did_update));
            };

            let nc_ptr = match self.write_node(node) {
                Ok(p) => p,
                Err(err) => {
                    new_child.release(mm);
                    if let Some(mut old) = old_val {
                        old.release(mm);
                    }
                    return Err(err);
                }
            };
            let nc = nc_ptr.node_mut(mm);
            let old_edge = nc.edges[label];
            nc.edges[label] = new_child;
            old_edge.release(mm);

            return Ok((Some(nc_ptr), old_val, did_update));
        }

        // Partial overlap: split the edge with an intermediate node.
        let rest = &search[common..];

        let split_ptr = Node::alloc(mm)?;
        match BlobHandle::from_slice(mm, &search[..common]) {
            Ok(blob) => split_ptr.node_mut(mm).prefix = blob,
            Err(err) => {
                split_ptr.release(mm);
                return Err(err);
            }
        }

        let mut terminal_key = BlobHandle::NULL;
        let mut sibling = NodeHandle::NULL;
        if rest.is_empty() {
            // The new key terminates at the split node itself.
            terminal_key = match BlobHandle::from_slice(mm, key) {
                Ok(blob) => blob,
                Err(err) => {
                    split_ptr.release(mm);
                    return Err(err);
                }
            };
        } else {
            sibling = match self.new_leaf(key, rest, value) {
                Ok(leaf) => leaf,
                Err(err) => {
                    split_ptr.release(mm);
                    return Err(err);
                }
            };
        }

        let release_partials = |writer: &TrieWriter<'_>| {
            let mm = writer.mm;
            split_ptr.release(mm);
            sibling.release(mm);
            let mut blob = terminal_key;
            blob.release(mm);
        };

        let mod_child = match self.write_node(child_ptr) {
            Ok(c) => c,
            Err(err) => {
                release_partials(self);
                return Err(err);
            }
        };
        let shortened = match BlobHandle::from_slice(mm, &child_prefix[common..]) {
            Ok(blob) => blob,
            Err(err) => {
                mod_child.release(mm);
                release_partials(self);
                return Err(err);
            }
        };
        let nc_ptr = match self.write_node(node) {
            Ok(p) => p,
            Err(err) => {
                let mut blob = shortened;
                blob.release(mm);
                mod_child.release(mm);
                release_partials(self);
                return Err(err);
            }
        };

        // Everything allocated; wire it up.
        {
            let mc = mod_child.node_mut(mm);
            mc.prefix.release(mm);
            mc.prefix = shortened;
        }
        {
            let sp = split_ptr.node_mut(mm);
            sp.edges[child_prefix[common] as usize] = mod_child;
            if rest.is_empty() {
                sp.key = terminal_key;
                sp.value = value;
                sp.value.retain(mm);
                sp.subtree = subtree;
            } else {
                sp.edges[rest[0] as usize] = sibling;
                sibling.node_mut(mm).subtree = subtree;
            }
        }
        {
            let nc = nc_ptr.node_mut(mm);
            let old_edge = nc.edges[label];
            nc.edges[label] = split_ptr;
            old_edge.release(mm);
        }

        Ok((Some(nc_ptr), None, false))
    }

    /// Collapses a single-child node into its child: concatenated prefix,
    /// adopted key/value/subtree/edges. Never called on the trie root.
    fn merge_child(&mut self, node: NodeHandle) -> Result<()> {
        let mm = self.mm;

        let child_ptr = node.node(mm).first_child();
        {
            let n = node.node(mm);
            if !n.has_one_child() || n.is_leaf() {
                panic!("merge of a node that is not a single-child internal node");
            }
        }

        let merged: Vec<u8> = {
            let n = node.node(mm);
            let child = child_ptr.node(mm);
            let mut buf = Vec::with_capacity(
                n.prefix.len() as usize + child.prefix.len() as usize,
            );
            buf.extend_from_slice(n.prefix.bytes(mm));
            buf.extend_from_slice(child.prefix.bytes(mm));
            buf
        };
        let merged_blob = BlobHandle::from_slice(mm, &merged)?;

        let n = node.node_mut(mm);
        let child = child_ptr.node(mm);

        n.prefix.release(mm);
        n.prefix = merged_blob;

        n.key.release(mm);
        n.key = child.key;
        n.key.retain(mm);
        n.value.release(mm);
        n.value = child.value;
        n.value.retain(mm);
        n.subtree = child.subtree;
        n.subtree.retain(mm);

        n.edges = child.edges;
        for edge in n.edges {
            edge.retain(mm);
        }

        child_ptr.release(mm);
        Ok(())
    }

    /// Recursive COW delete. Returns the replacement node (None when the
    /// key was not found) and the removed value, retained for the caller.
    pub(crate) fn delete(
        &mut self,
        parent: Option<NodeHandle>,
        node: NodeHandle,
        search: &[u8],
    ) -> Result<(Option<NodeHandle>, Option<BlobHandle>)> {
        let mm = self.mm;

        if search.is_empty() {
            if !node.node(mm).is_leaf() {
                return Ok((None, None));
            }

            let old_val = {
                let v = node.node(mm).value;
                v.retain(mm);
                v
            };

            let nc_ptr = match self.write_node(node) {
                Ok(p) => p,
                Err(err) => {
                    let mut blob = old_val;
                    blob.release(mm);
                    return Err(err);
                }
            };
            {
                let nc = nc_ptr.node_mut(mm);
                nc.key.release(mm);
                nc.value.release(mm);
                let subtree = nc.subtree;
                nc.subtree = NodeHandle::NULL;
                subtree.release(mm);
            }

            if node != self.root && parent.is_some() && nc_ptr.node(mm).has_one_child() {
                if let Err(err) = self.merge_child(nc_ptr) {
                    nc_ptr.release(mm);
                    let mut blob = old_val;
                    blob.release(mm);
                    return Err(err);
                }
            }

            return Ok((Some(nc_ptr), Some(old_val)));
        }

        let label = search[0] as usize;
        let child_ptr = node.node(mm).edges[label];
        if child_ptr.is_null() {
            return Ok((None, None));
        }

        let child_prefix = child_ptr.node(mm).prefix.bytes(mm).to_vec();
        if !search.starts_with(&child_prefix) {
            return Ok((None, None));
        }

        let (new_child, old_val) =
            self.delete(Some(node), child_ptr, &search[child_prefix.len()..])?;
        let Some(new_child) = new_child else {
            return Ok((None, old_val));
        };

        let nc_ptr = match self.write_node(node) {
            Ok(p) => p,
            Err(err) => {
                new_child.release(mm);
                if let Some(mut blob) = old_val {
                    blob.release(mm);
                }
                return Err(err);
            }
        };

        let drained = {
            let n = new_child.node(mm);
            !n.is_leaf() && n.first_child().is_null()
        };

        {
            let nc = nc_ptr.node_mut(mm);
            let old_edge = nc.edges[label];
            nc.edges[label] = if drained { NodeHandle::NULL } else { new_child };
            old_edge.release(mm);
        }

        if drained {
            let mergeable = {
                let nc = nc_ptr.node(mm);
                node != self.root && parent.is_some() && nc.has_one_child() && !nc.is_leaf()
            };
            if mergeable {
                if let Err(err) = self.merge_child(nc_ptr) {
                    nc_ptr.release(mm);
                    new_child.release(mm);
                    if let Some(mut blob) = old_val {
                        blob.release(mm);
                    }
                    return Err(err);
                }
            }
            new_child.release(mm);
        }

        Ok((Some(nc_ptr), old_val))
    }
}
