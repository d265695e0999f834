//! # Trie Nodes
//!
//! One radix-trie node occupies exactly one allocator page; the page size
//! is defined as `size_of::<Node>()`, so node allocation is a single
//! exact-fit page grab and handles are always page multiples.
//!
//! A node is:
//!
//! - a **leaf** when it carries a key (and value) or a subtree handle, and
//! - **internal** otherwise. A leaf may still have descendants: inserting
//!   `"key"` under an existing `"key_long"` turns the shared node into a
//!   leaf with an edge.
//!
//! `edges` is indexed by nibble, bounding fan-out at 16. `subtree` is a
//! side channel used by the table overlay: it gives a value entry a strong
//! reference to another trie root (a table's primary trie or a secondary
//! index trie), so snapshotting the outer trie transitively snapshots the
//! nested ones. Lookup and iteration never follow it.
//!
//! Nodes are shared between snapshots; the refcount is an in-region atomic
//! and releasing the last reference cascades into every owned blob, edge
//! and subtree before the page goes back to the allocator.

use std::sync::atomic::{AtomicI32, Ordering};

use eyre::Result;
use serde::{Deserialize, Serialize};

use crate::memory::Region;

use super::blob::BlobHandle;

/// Offset-based handle to a node page. Zero is the null sentinel.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeHandle(pub(crate) u64);

pub const FANOUT: usize = 16;

#[repr(C)]
pub struct Node {
    pub(crate) refcount: AtomicI32,
    pub(crate) prefix: BlobHandle,
    pub(crate) edges: [NodeHandle; FANOUT],
    pub(crate) key: BlobHandle,
    pub(crate) value: BlobHandle,
    pub(crate) subtree: NodeHandle,
}

/// The allocator page size. Every node allocation is exactly one page.
pub const NODE_SIZE: usize = std::mem::size_of::<Node>();
const _: () = assert!(NODE_SIZE == 192);

impl Node {
    /// Allocates a zeroed node page with refcount 1.
    pub(crate) fn alloc(mm: &Region) -> Result<NodeHandle> {
        let offset = mm.allocate(NODE_SIZE as u64, true)?;
        let handle = NodeHandle(offset);
        handle
            .node(mm)
            .refcount
            .store(1, Ordering::Release);
        Ok(handle)
    }

    #[inline]
    pub(crate) fn is_leaf(&self) -> bool {
        !self.key.is_null() || !self.subtree.is_null()
    }

    pub(crate) fn has_one_child(&self) -> bool {
        let mut count = 0;
        for edge in &self.edges {
            if !edge.is_null() {
                count += 1;
                if count > 1 {
                    return false;
                }
            }
        }
        count == 1
    }

    pub(crate) fn first_child(&self) -> NodeHandle {
        for edge in &self.edges {
            if !edge.is_null() {
                return *edge;
            }
        }
        NodeHandle::NULL
    }
}

impl NodeHandle {
    pub const NULL: NodeHandle = NodeHandle(0);

    #[inline]
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub(crate) fn node<'a>(self, mm: &'a Region) -> &'a Node {
        mm.get_raw::<Node>(self.0)
    }

    #[inline]
    pub(crate) fn node_mut<'a>(self, mm: &'a Region) -> &'a mut Node {
        mm.get_raw_mut::<Node>(self.0)
    }

    /// Bumps the refcount. No-op on the null handle.
    pub(crate) fn retain(self, mm: &Region) -> bool {
        if self.is_null() {
            return false;
        }
        let prev = self.node(mm).refcount.fetch_add(1, Ordering::AcqRel);
        assert!(prev > 0, "retain of a released node at {}", self.0);
        true
    }

    /// Drops one reference. At zero, releases every owned blob, edge and
    /// subtree, then returns the page to the allocator. Returns whether the
    /// node was freed.
    pub(crate) fn release(self, mm: &Region) -> bool {
        if self.is_null() {
            return false;
        }

        let prev = self.node(mm).refcount.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "node refcount underflow at {}", self.0);
        if prev != 1 {
            return false;
        }

        {
            let node = self.node_mut(mm);
            node.prefix.release(mm);
            node.key.release(mm);
            node.value.release(mm);

            for i in 0..FANOUT {
                let edge = node.edges[i];
                node.edges[i] = NodeHandle::NULL;
                edge.release(mm);
            }

            let subtree = node.subtree;
            node.subtree = NodeHandle::NULL;
            subtree.release(mm);
        }

        if let Err(err) = mm.deallocate(self.0, NODE_SIZE as u64) {
            panic!("failed to free node page: {err}");
        }
        true
    }
}
