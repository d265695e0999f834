//! # Encoding Module
//!
//! Two byte-level encodings sit at the trie boundary:
//!
//! - [`nibble`]: expansion of user keys into 4-bit symbols, which bounds
//!   trie fan-out at 16. Applied to every key before it touches the trie
//!   and reversed on the way out.
//! - [`index`]: order-preserving rendering of typed field values, so that
//!   nibble-order iteration of a secondary index yields rows in native
//!   value order.

mod index;
mod nibble;

pub use index::{IndexValue, Int256};
pub use nibble::{decode_nibbles, encode_nibbles};
