//! Claim-based locking against a lock store.
//!
//! A lock is taken in two steps: a grant from the [`LocalLockMediator`]
//! keeps other transactions of this process away, then a claim written to
//! the lock store announces the lock to other processes. Claims are checked
//! after the settle delay: the live claim with the earliest
//! `(written_at, requester)` owns the lock. A claimant that saw an earlier
//! live claim right after writing its own loses, even if that claim is
//! deleted before the check.

use crate::claim::{decode_claims, AuditLockEntry, LockClaim};
use crate::mediator::LocalLockMediator;
use std::sync::Arc;
use vesper_common::prelude::*;
use vesper_storage::{BackendOperation, ExpectedValueOutcome, KeyColumnValueStore, StoreTransaction};

/// Writes, checks and deletes claims in one lock store.
pub struct ConsistentKeyLocker {
    lock_store: Arc<dyn KeyColumnValueStore>,
    mediator: Arc<LocalLockMediator>,
    clock: Arc<dyn TimestampProvider>,
    config: TransactionConfig,
}

impl ConsistentKeyLocker {
    pub fn new(
        lock_store: Arc<dyn KeyColumnValueStore>,
        mediator: Arc<LocalLockMediator>,
        clock: Arc<dyn TimestampProvider>,
        config: TransactionConfig,
    ) -> Self {
        Self {
            lock_store,
            mediator,
            clock,
            config,
        }
    }

    pub fn mediator(&self) -> &Arc<LocalLockMediator> {
        &self.mediator
    }

    pub fn lock_store_name(&self) -> &str {
        self.lock_store.name()
    }

    /// Policy for claim writes: `lock_retries` attempts in total.
    fn claim_retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.config.lock_retries.saturating_sub(1),
            ..self.config.retry.clone()
        }
    }

    /// Take the local grant for `kc` and write a claim for it.
    ///
    /// `previous` is this requester's earlier claim on the same cell; the new
    /// claim replaces it through a conditional write expecting its bytes.
    pub async fn write_claim(
        &self,
        kc: &KeyColumn,
        requester: &RequesterId,
        previous: Option<&LockClaim>,
        txh: &dyn StoreTransaction,
    ) -> Result<LockClaim> {
        let written_at = self.clock.now();
        let expires_at = written_at.saturating_add(self.config.lock_expiration);
        if !self.mediator.lock(kc, requester, expires_at) {
            return Err(TransactionError::LocalLockContention(kc.to_string()).into());
        }

        let mut claim = match self.put_claim(kc, requester, previous, written_at, txh).await {
            Ok(claim) => claim,
            Err(e) => {
                self.mediator.unlock(kc, requester);
                return Err(e);
            }
        };

        match self.observe_earlier(&claim, txh).await {
            Ok(observed) => {
                claim.preceded_by = previous.and_then(|p| p.preceded_by.clone()).or(observed);
                Ok(claim)
            }
            Err(e) => {
                // The claim is unusable without knowing what it raced with
                let _ = self.release(&claim, txh).await;
                Err(e)
            }
        }
    }

    /// Read the lock row after a claim write and return the highest ranked
    /// live foreign claim ahead of `claim`, if any.
    async fn observe_earlier(&self, claim: &LockClaim, txh: &dyn StoreTransaction) -> Result<Option<AuditLockEntry>> {
        let now = self.clock.now();
        let expiration = self.config.lock_expiration;
        let earlier = self
            .read_claims(claim, txh)
            .await?
            .into_iter()
            .filter(|c| c.requester != claim.entry.requester && !c.is_expired(expiration, now))
            .filter(|c| c.precedence(&claim.entry).is_lt())
            .min_by(|a, b| a.precedence(b));
        if let Some(ahead) = &earlier {
            debug!(
                kc = %claim.kc,
                holder = %ahead.requester,
                since = %ahead.written_at,
                "Lock claim written behind an earlier claim"
            );
        }
        Ok(earlier)
    }

    async fn read_claims(&self, claim: &LockClaim, txh: &dyn StoreTransaction) -> Result<Vec<AuditLockEntry>> {
        let query = KeySliceQuery::new(claim.lock_row(), SliceQuery::all());
        let store = &self.lock_store;
        let entries = BackendOperation::execute(&self.config.retry, "lock.read", || {
            let query = &query;
            async move { store.get_slice(query, txh).await }
        })
        .await?;
        Ok(decode_claims(&entries))
    }

    async fn put_claim(
        &self,
        kc: &KeyColumn,
        requester: &RequesterId,
        previous: Option<&LockClaim>,
        written_at: Timestamp,
        txh: &dyn StoreTransaction,
    ) -> Result<LockClaim> {
        let entry = match previous {
            Some(prev) => AuditLockEntry::reclaim(&prev.entry, written_at),
            None => AuditLockEntry::new(requester.clone(), written_at),
        };
        let value = entry.encode()?;
        let row = kc.lock_key();
        let column = requester.as_bytes();
        let expected = previous.map(|p| &p.value);

        let store = &self.lock_store;
        BackendOperation::execute(&self.claim_retry(), "lock.claim", || {
            let (row, value) = (&row, value.clone());
            async move {
                match store.acquire_lock(row, column, expected, value.clone(), txh).await? {
                    ExpectedValueOutcome::Applied => Ok(()),
                    // An attempt that failed after the write landed
                    ExpectedValueOutcome::Conflict { current } if current.as_ref() == Some(&value) => {
                        Ok(())
                    }
                    ExpectedValueOutcome::Conflict { .. } => {
                        Err(Error::from(TransactionError::LockConflict(format!(
                            "{} (claim rejected)",
                            kc
                        ))))
                    }
                }
            }
        })
        .await?;

        debug!(
            lock_store = self.lock_store.name(),
            %kc,
            %requester,
            %written_at,
            "Lock claim written"
        );
        Ok(LockClaim {
            kc: kc.clone(),
            entry,
            value,
            preceded_by: None,
        })
    }

    /// Check that `claim` is live and precedes every other claim it has
    /// observed.
    ///
    /// Callers must already have waited past `written_at + lock_wait`.
    pub async fn check_claim(&self, claim: &LockClaim, txh: &dyn StoreTransaction) -> Result<()> {
        let claims = self.read_claims(claim, txh).await?;

        let now = self.clock.now();
        let expiration = self.config.lock_expiration;
        if claim.entry.is_expired(expiration, now) {
            return Err(TransactionError::ExpirationRaceAborted(format!(
                "{} (claimed at {}, checked at {})",
                claim.kc, claim.entry.written_at, now
            ))
            .into());
        }
        if let Some(ahead) = &claim.preceded_by {
            return Err(TransactionError::LockConflict(format!(
                "{} (claimed earlier by {} at {})",
                claim.kc, ahead.requester, ahead.written_at
            ))
            .into());
        }

        let (live, expired): (Vec<_>, Vec<_>) = claims
            .into_iter()
            .partition(|c| !c.is_expired(expiration, now));
        if !expired.is_empty() {
            self.delete_expired(claim, &expired, txh).await;
        }

        if !live.iter().any(|c| *c == claim.entry) {
            return Err(TransactionError::LockConflict(format!("{} (own claim missing)", claim.kc)).into());
        }
        let winner = live.iter().min_by(|a, b| a.precedence(b));
        match winner {
            Some(w) if *w == claim.entry => {
                trace!(lock_store = self.lock_store.name(), kc = %claim.kc, "Lock claim verified");
                Ok(())
            }
            Some(w) => Err(TransactionError::LockConflict(format!(
                "{} (held by {} since {})",
                claim.kc, w.requester, w.written_at
            ))
            .into()),
            None => Err(Error::internal("live claim set empty after containment check")),
        }
    }

    /// Best-effort removal of expired foreign claims found in a lock row.
    async fn delete_expired(&self, claim: &LockClaim, expired: &[AuditLockEntry], txh: &dyn StoreTransaction) {
        let row = claim.lock_row();
        let columns: Vec<Bytes> = expired
            .iter()
            .filter(|c| c.requester != claim.entry.requester)
            .map(|c| c.requester.as_bytes().clone())
            .collect();
        if columns.is_empty() {
            return;
        }
        match self.lock_store.mutate(&row, &[], &columns, txh).await {
            Ok(()) => debug!(kc = %claim.kc, removed = columns.len(), "Removed expired lock claims"),
            Err(e) => debug!(kc = %claim.kc, error = %e, "Failed to remove expired lock claims"),
        }
    }

    /// Delete `claim` from the lock store and drop the local grant.
    ///
    /// The local grant is dropped even if the delete fails; an undeleted
    /// claim expires on its own.
    pub async fn release(&self, claim: &LockClaim, txh: &dyn StoreTransaction) -> Result<()> {
        let row = claim.lock_row();
        let deletions = std::slice::from_ref(claim.column());
        let store = &self.lock_store;
        let deleted = BackendOperation::execute(&self.config.retry, "lock.release", || {
            let row = &row;
            async move { store.mutate(row, &[], deletions, txh).await }
        })
        .await;
        self.mediator.unlock(&claim.kc, &claim.entry.requester);
        deleted
    }

    /// Drop the local grant only.
    pub fn release_local(&self, kc: &KeyColumn, requester: &RequesterId) -> bool {
        self.mediator.unlock(kc, requester)
    }
}
