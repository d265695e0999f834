//! # Table Overlay
//!
//! Tables are not a separate storage engine: a table is an ordinary trie
//! entry whose value is the serialized [`Table`] record and whose entry
//! carries the table's primary trie root in its `subtree` field. Secondary
//! indexes hang the same way under `<table>.<field>`. Snapshotting the
//! outer trie therefore transitively pins every table and index trie.
//!
//! - Primary trie: order-preserving-encoded `Id` → serialized row.
//! - Index trie: order-preserving-encoded field value → postings list
//!   (the sorted primary keys of the rows carrying that value).
//!
//! Row types implement [`TableRow`] — the schema string plus a by-name
//! field accessor — most conveniently through the [`table_row!`] macro.
//! Rows and metadata go through the JSON codec in [`codec`]; the trie only
//! ever sees opaque bytes, so swapping the codec swaps the row format.
//!
//! [`table_row!`]: crate::table_row

pub(crate) mod overlay;
pub(crate) mod query;

use eyre::{Result, WrapErr};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::encoding::IndexValue;
use crate::trie::NodeHandle;

pub use query::ResultIterator;

/// Access layer a row type provides to the overlay: a schema description
/// and dynamic field extraction for indexing and filtering. The primary
/// key lives in a field named `Id`.
pub trait TableRow: Serialize + DeserializeOwned {
    /// Comma-separated `"Name Type"` list, recorded in the table metadata.
    fn table_schema() -> String;

    /// The named field as an [`IndexValue`], or `None` when the row has no
    /// such field.
    fn field(&self, name: &str) -> Option<IndexValue>;
}

/// Persisted table metadata, stored under `t_<name>`. `indexes[0]` is
/// always `"Id"`; `node` mirrors the entry's subtree handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Table {
    pub indexes: Vec<String>,
    pub node: NodeHandle,
    pub schema: String,
}

pub(crate) fn table_key(name: &str) -> Vec<u8> {
    format!("t_{name}").into_bytes()
}

pub(crate) fn index_key(table: &str, field: &str) -> Vec<u8> {
    format!("{table}.{field}").into_bytes()
}

/// Row/metadata serialization. JSON by default; the overlay is agnostic to
/// the format as long as encode/decode stay symmetric.
pub(crate) mod codec {
    use super::*;

    pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).wrap_err("failed to encode value")
    }

    pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).wrap_err("failed to decode value")
    }
}

/// Comparison applied by `select`'s where-filtering, post-decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Equal,
    NotEqual,
    Smaller,
    SmallerOrEqual,
    Larger,
    LargerOrEqual,
    Like,
}

#[derive(Debug, Clone)]
pub struct WhereClause {
    pub field: String,
    pub condition: Condition,
    pub value: IndexValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone)]
pub struct OrderClause {
    pub field: String,
    pub direction: Direction,
}

impl OrderClause {
    pub fn asc(field: impl Into<String>) -> Self {
        OrderClause {
            field: field.into(),
            direction: Direction::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        OrderClause {
            field: field.into(),
            direction: Direction::Desc,
        }
    }
}

impl WhereClause {
    pub fn new(field: impl Into<String>, condition: Condition, value: impl Into<IndexValue>) -> Self {
        WhereClause {
            field: field.into(),
            condition,
            value: value.into(),
        }
    }
}
