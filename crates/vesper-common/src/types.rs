//! Core types for Vesper

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::time::Timestamp;
use crate::utils::{escape_bytes, prefix_successor};

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identity of a lock requester (one per transaction).
///
/// Ordered byte-lexicographically; the order breaks ties between claims
/// written at the same instant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequesterId(Bytes);

impl RequesterId {
    pub fn new(id: impl Into<Bytes>) -> Self {
        RequesterId(id.into())
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }
}

impl fmt::Display for RequesterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0.iter() {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

// ============================================================================
// Cells
// ============================================================================

/// Address of one cell: a row key plus a column. Lock granularity unit.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyColumn {
    key: Bytes,
    column: Bytes,
}

impl KeyColumn {
    pub fn new(key: impl Into<Bytes>, column: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            column: column.into(),
        }
    }

    pub fn key(&self) -> &Bytes {
        &self.key
    }

    pub fn column(&self) -> &Bytes {
        &self.column
    }

    /// Row key of the lock row for this cell: `len(key) as u32 BE | key | column`.
    pub fn lock_key(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.key.len() + self.column.len());
        buf.put_u32(self.key.len() as u32);
        buf.put_slice(&self.key);
        buf.put_slice(&self.column);
        buf.freeze()
    }

    /// Inverse of [`KeyColumn::lock_key`].
    pub fn from_lock_key(lock_key: &[u8]) -> Option<Self> {
        let len_bytes: [u8; 4] = lock_key.get(..4)?.try_into().ok()?;
        let key_len = u32::from_be_bytes(len_bytes) as usize;
        let key = lock_key.get(4..4 + key_len)?;
        let column = &lock_key[4 + key_len..];
        Some(KeyColumn::new(
            Bytes::copy_from_slice(key),
            Bytes::copy_from_slice(column),
        ))
    }
}

impl fmt::Display for KeyColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", escape_bytes(&self.key), escape_bytes(&self.column))
    }
}

/// A column/value pair within a row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub column: Bytes,
    pub value: Bytes,
    pub timestamp: Option<Timestamp>,
}

impl Entry {
    pub fn new(column: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
            timestamp: None,
        }
    }

    pub fn with_timestamp(mut self, ts: Timestamp) -> Self {
        self.timestamp = Some(ts);
        self
    }
}

pub type EntryList = Vec<Entry>;

// ============================================================================
// Queries
// ============================================================================

/// Column range `[start, end)` within a row. `end == None` is unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SliceQuery {
    pub start: Bytes,
    pub end: Option<Bytes>,
    pub limit: Option<usize>,
}

impl SliceQuery {
    pub fn new(start: impl Into<Bytes>, end: impl Into<Bytes>) -> Self {
        Self {
            start: start.into(),
            end: Some(end.into()),
            limit: None,
        }
    }

    /// Every column of a row.
    pub fn all() -> Self {
        Self::default()
    }

    /// Exactly one column.
    pub fn column(column: &[u8]) -> Self {
        let mut end = BytesMut::with_capacity(column.len() + 1);
        end.put_slice(column);
        end.put_u8(0);
        Self {
            start: Bytes::copy_from_slice(column),
            end: Some(end.freeze()),
            limit: None,
        }
    }

    /// Every column starting with `prefix`.
    pub fn prefix(prefix: &[u8]) -> Self {
        Self {
            start: Bytes::copy_from_slice(prefix),
            end: prefix_successor(prefix),
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn contains(&self, column: &[u8]) -> bool {
        column >= &self.start[..] && self.end.as_ref().map_or(true, |end| column < &end[..])
    }
}

/// A slice of a single row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySliceQuery {
    pub key: Bytes,
    pub slice: SliceQuery,
}

impl KeySliceQuery {
    pub fn new(key: impl Into<Bytes>, slice: SliceQuery) -> Self {
        Self {
            key: key.into(),
            slice,
        }
    }

    /// Query reading exactly the cell addressed by `kc`.
    pub fn cell(kc: &KeyColumn) -> Self {
        Self::new(kc.key().clone(), SliceQuery::column(kc.column()))
    }
}

/// Row key range `[start, end)`. `end == None` is unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeyRange {
    pub start: Bytes,
    pub end: Option<Bytes>,
}

impl KeyRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        key >= &self.start[..] && self.end.as_ref().map_or(true, |end| key < &end[..])
    }
}

// ============================================================================
// Schema-level consistency
// ============================================================================

/// Consistency setting attached to a schema element (property key or edge
/// label).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConsistencyModifier {
    /// Whatever the backend and enclosing transaction guarantee.
    #[default]
    Default,
    /// Acquire an explicit lock before mutating.
    Lock,
    /// Never overwrite: add new state and tombstone the old.
    Fork,
}

impl ConsistencyModifier {
    pub fn requires_lock(&self) -> bool {
        matches!(self, ConsistencyModifier::Lock)
    }
}

impl fmt::Display for ConsistencyModifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConsistencyModifier::Default => "DEFAULT",
            ConsistencyModifier::Lock => "LOCK",
            ConsistencyModifier::Fork => "FORK",
        };
        f.write_str(s)
    }
}
