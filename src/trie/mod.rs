//! # Persistent Radix Trie
//!
//! A path-compressed radix trie with fan-out 16 (one edge per nibble),
//! allocated entirely inside the region and shared structurally between
//! snapshots:
//!
//! - [`blob`]: refcounted variable-length byte storage for prefixes, keys
//!   and values.
//! - [`node`]: the fixed-size node page (refcount, prefix, 16 edges,
//!   key/value, subtree side channel).
//! - [`ops`]: lookup, longest-prefix, copy-on-write insert, delete with
//!   node merging, and the writable hazard set.
//! - [`iter`]: ordered iteration with prefix seek.
//!
//! Mutations rebuild only the touched path; a snapshot's root pins its
//! whole tree through reference counts, and releasing a root cascades
//! through everything that became unreachable. The `subtree` field lets a
//! value carry another trie root (how tables nest their primary and index
//! tries into the outer trie).

pub(crate) mod blob;
pub(crate) mod iter;
pub(crate) mod node;
pub(crate) mod ops;

pub use blob::MAX_DATA_SIZE;
pub use iter::TrieIterator;
pub use node::NodeHandle;

pub(crate) use blob::BlobHandle;
pub(crate) use node::Node;
