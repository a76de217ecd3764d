//! FORK consistency: versioned cells that are never overwritten.
//!
//! A logical cell `(key, base)` is stored as a set of physical columns
//! sharing the prefix `u16 BE len | base`:
//!
//! ```text
//! u16 base_len | base | u64 BE version | u8 rid_len | requester | u8 kind
//! ```
//!
//! A write adds a version column and a tombstone for every version it saw
//! live. Readers take the latest live version as current.

use bytes::{Buf, BufMut, BytesMut};
use std::collections::BTreeSet;
use vesper_common::prelude::*;
use vesper_storage::KcvMutation;

const KIND_VERSION: u8 = 0;
const KIND_TOMBSTONE: u8 = 1;

/// Identity of one version of a forked cell.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionId {
    /// Write instant in the provider's native resolution
    pub version: u64,
    pub requester: RequesterId,
}

/// Decoded physical column of a forked cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkColumn {
    pub base: Bytes,
    pub id: VersionId,
    pub tombstone: bool,
}

impl ForkColumn {
    /// Column prefix shared by every version of `base`.
    pub fn prefix(base: &[u8]) -> Result<Bytes> {
        let len = u16::try_from(base.len())
            .map_err(|_| Error::invalid_argument(format!("forked column of {} bytes is too long", base.len())))?;
        let mut buf = BytesMut::with_capacity(2 + base.len());
        buf.put_u16(len);
        buf.put_slice(base);
        Ok(buf.freeze())
    }

    pub fn encode(&self) -> Result<Bytes> {
        let rid = self.id.requester.as_bytes();
        let rid_len = u8::try_from(rid.len())
            .map_err(|_| Error::invalid_argument(format!("requester id of {} bytes is too long", rid.len())))?;
        let prefix = Self::prefix(&self.base)?;
        let mut buf = BytesMut::with_capacity(prefix.len() + 8 + 1 + rid.len() + 1);
        buf.put_slice(&prefix);
        buf.put_u64(self.id.version);
        buf.put_u8(rid_len);
        buf.put_slice(rid);
        buf.put_u8(if self.tombstone { KIND_TOMBSTONE } else { KIND_VERSION });
        Ok(buf.freeze())
    }

    pub fn decode(column: &[u8]) -> Option<Self> {
        let mut buf = column;
        if buf.remaining() < 2 {
            return None;
        }
        let base_len = buf.get_u16() as usize;
        if buf.remaining() < base_len + 8 + 1 {
            return None;
        }
        let base = Bytes::copy_from_slice(&buf[..base_len]);
        buf.advance(base_len);
        let version = buf.get_u64();
        let rid_len = buf.get_u8() as usize;
        if buf.remaining() != rid_len + 1 {
            return None;
        }
        let requester = RequesterId::new(Bytes::copy_from_slice(&buf[..rid_len]));
        buf.advance(rid_len);
        let tombstone = match buf.get_u8() {
            KIND_VERSION => false,
            KIND_TOMBSTONE => true,
            _ => return None,
        };
        Some(Self {
            base,
            id: VersionId { version, requester },
            tombstone,
        })
    }
}

/// One stored version of a forked cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkVersion {
    pub id: VersionId,
    pub value: Bytes,
    /// Superseded: tombstoned by a later writer, or shadowed by a newer
    /// live version
    pub tombstoned: bool,
}

/// Reader's view of a forked cell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForkedValue {
    /// Latest live version, if any
    pub current: Option<ForkVersion>,
    /// Every other version, newest first
    pub superseded: Vec<ForkVersion>,
}

impl ForkedValue {
    pub fn value(&self) -> Option<&Bytes> {
        self.current.as_ref().map(|v| &v.value)
    }
}

/// Every stored version of `base`, newest first, flagged only by explicit
/// tombstones.
fn stored_versions(base: &[u8], entries: &[Entry]) -> Vec<ForkVersion> {
    let mut versions = Vec::new();
    let mut tombstones = BTreeSet::new();
    for entry in entries {
        let Some(col) = ForkColumn::decode(&entry.column) else {
            continue;
        };
        if &col.base[..] != base {
            continue;
        }
        if col.tombstone {
            tombstones.insert(col.id);
        } else {
            versions.push((col.id, entry.value.clone()));
        }
    }

    let mut all: Vec<ForkVersion> = versions
        .into_iter()
        .map(|(id, value)| ForkVersion {
            tombstoned: tombstones.contains(&id),
            id,
            value,
        })
        .collect();
    all.sort_by(|a, b| b.id.cmp(&a.id));
    all
}

/// Merge the physical columns of `base` into a [`ForkedValue`].
///
/// Live versions older than the current one were written by concurrent
/// writers that lost; the view reports them as tombstoned.
pub fn resolve(base: &[u8], entries: &[Entry]) -> ForkedValue {
    let mut all = stored_versions(base, entries);
    let current = all
        .iter()
        .position(|v| !v.tombstoned)
        .map(|idx| all.remove(idx));
    for shadowed in &mut all {
        shadowed.tombstoned = true;
    }
    ForkedValue {
        current,
        superseded: all,
    }
}

/// Mutation writing `value` (or deleting, if `None`) as version `id`,
/// tombstoning every version live in `existing`.
pub fn plan_write(base: &[u8], existing: &[Entry], id: VersionId, value: Option<Bytes>) -> Result<KcvMutation> {
    let stored = stored_versions(base, existing);
    let mut mutation = KcvMutation::default();
    let live = stored.iter().filter(|v| !v.tombstoned && v.id != id);
    for version in live {
        let tombstone = ForkColumn {
            base: Bytes::copy_from_slice(base),
            id: version.id.clone(),
            tombstone: true,
        };
        mutation.addition(Entry::new(tombstone.encode()?, Bytes::new()));
    }
    if let Some(value) = value {
        let column = ForkColumn {
            base: Bytes::copy_from_slice(base),
            id,
            tombstone: false,
        };
        mutation.addition(Entry::new(column.encode()?, value));
    }
    Ok(mutation)
}
