//! Lock claims as stored in a lock store.
//!
//! A claim lives in the lock row derived from the locked KeyColumn. Its
//! column is the requester id, so concurrent claimants never overwrite each
//! other, and its value is a bincode-encoded [`AuditLockEntry`].

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::Duration;
use vesper_common::prelude::*;

/// Value of one claim column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLockEntry {
    pub requester: RequesterId,
    /// Instant the claim was written, used for tie-breaks and expiry
    pub written_at: Timestamp,
    /// Write instant of the claim this one replaced, if it is a re-claim
    pub prior: Option<Timestamp>,
}

impl AuditLockEntry {
    pub fn new(requester: RequesterId, written_at: Timestamp) -> Self {
        Self {
            requester,
            written_at,
            prior: None,
        }
    }

    /// Claim replacing `previous` at `written_at`.
    pub fn reclaim(previous: &AuditLockEntry, written_at: Timestamp) -> Self {
        Self {
            requester: previous.requester.clone(),
            written_at,
            prior: Some(previous.written_at),
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn expires_at(&self, expiration: Duration) -> Timestamp {
        self.written_at.saturating_add(expiration)
    }

    /// Expired once `written_at + expiration` is no longer in the future.
    pub fn is_expired(&self, expiration: Duration, now: Timestamp) -> bool {
        self.expires_at(expiration) <= now
    }

    /// Tie-break order: earlier write wins, then the smaller requester id.
    pub fn precedence(&self, other: &AuditLockEntry) -> Ordering {
        self.written_at
            .cmp(&other.written_at)
            .then_with(|| self.requester.cmp(&other.requester))
    }
}

/// A claim this process wrote, with the exact bytes that were stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockClaim {
    pub kc: KeyColumn,
    pub entry: AuditLockEntry,
    pub value: Bytes,
    /// Live foreign claim ranked ahead of this one, seen right after the
    /// write. Its owner may commit and delete it before this claim is
    /// checked, so it decides the lock even once gone.
    pub preceded_by: Option<AuditLockEntry>,
}

impl LockClaim {
    pub fn lock_row(&self) -> Bytes {
        self.kc.lock_key()
    }

    pub fn column(&self) -> &Bytes {
        self.entry.requester.as_bytes()
    }
}

/// Decode every claim of a lock row, skipping values that do not parse.
pub fn decode_claims(entries: &[Entry]) -> Vec<AuditLockEntry> {
    entries
        .iter()
        .filter_map(|e| match AuditLockEntry::decode(&e.value) {
            Ok(claim) if claim.requester.as_bytes() == &e.column => Some(claim),
            Ok(claim) => {
                warn!(
                    column = %vesper_common::utils::escape_bytes(&e.column),
                    requester = %claim.requester,
                    "Ignoring claim stored under a foreign column"
                );
                None
            }
            Err(err) => {
                warn!(
                    column = %vesper_common::utils::escape_bytes(&e.column),
                    error = %err,
                    "Ignoring undecodable lock claim"
                );
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use vesper_common::testing::fixtures::requester;

    fn at(ms: u64) -> Timestamp {
        Timestamp::from_millis(ms)
    }

    #[test]
    fn test_encode_decode() {
        let entry = AuditLockEntry::new(requester(1), at(1_000));
        let bytes = entry.encode().unwrap();
        assert_eq!(AuditLockEntry::decode(&bytes).unwrap(), entry);

        let again = AuditLockEntry::reclaim(&entry, at(2_000));
        assert_eq!(again.prior, Some(at(1_000)));
        assert_eq!(AuditLockEntry::decode(&again.encode().unwrap()).unwrap(), again);
    }

    #[test]
    fn test_precedence() {
        let early = AuditLockEntry::new(requester(9), at(1));
        let late = AuditLockEntry::new(requester(1), at(2));
        assert_eq!(early.precedence(&late), Ordering::Less);

        // Same instant: smaller requester wins
        let a = AuditLockEntry::new(requester(1), at(5));
        let b = AuditLockEntry::new(requester(2), at(5));
        assert_eq!(a.precedence(&b), Ordering::Less);
        assert_eq!(b.precedence(&a), Ordering::Greater);
    }

    #[test]
    fn test_expiry_boundary() {
        let entry = AuditLockEntry::new(requester(1), at(1_000));
        let expiration = Duration::from_millis(500);
        assert!(!entry.is_expired(expiration, at(1_499)));
        assert!(entry.is_expired(expiration, at(1_500)));
    }

    #[test]
    fn test_decode_claims_skips_garbage() {
        let good = AuditLockEntry::new(requester(1), at(1));
        let foreign = AuditLockEntry::new(requester(3), at(1));
        let entries = vec![
            Entry::new(requester(1).as_bytes().clone(), good.encode().unwrap()),
            Entry::new(requester(2).as_bytes().clone(), Bytes::from_static(b"\xff")),
            Entry::new(requester(4).as_bytes().clone(), foreign.encode().unwrap()),
        ];
        assert_eq!(decode_claims(&entries), vec![good]);
    }
}
