//! Utility functions and helpers

use bytes::{BufMut, Bytes, BytesMut};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::RequesterId;

/// Thread-safe requester id generator.
///
/// Ids are `node (16 bytes) | counter (8 bytes, BE)`, so every id issued by
/// one generator is unique and ids from different processes differ in the
/// node part.
pub struct RequesterIdGenerator {
    node: [u8; 16],
    counter: AtomicU64,
}

impl RequesterIdGenerator {
    /// Generator with a random node part.
    pub fn new() -> Self {
        Self::with_node(*uuid::Uuid::new_v4().as_bytes())
    }

    pub fn with_node(node: [u8; 16]) -> Self {
        Self {
            node,
            counter: AtomicU64::new(0),
        }
    }

    pub fn node(&self) -> &[u8; 16] {
        &self.node
    }

    /// Generate a unique requester id
    pub fn next_id(&self) -> RequesterId {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut buf = BytesMut::with_capacity(24);
        buf.put_slice(&self.node);
        buf.put_u64(seq);
        RequesterId::new(buf.freeze())
    }
}

impl Default for RequesterIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Smallest byte string greater than every string starting with `prefix`,
/// or `None` if no such bound exists (empty or all `0xff`).
pub fn prefix_successor(prefix: &[u8]) -> Option<Bytes> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return Some(Bytes::from(end));
        }
    }
    None
}

/// Printable form of a byte string: ASCII kept, everything else `\xNN`.
pub fn escape_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        if b.is_ascii_graphic() || b == b' ' {
            out.push(b as char);
        } else {
            out.push_str(&format!("\\x{:02x}", b));
        }
    }
    out
}
