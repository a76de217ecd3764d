//! Expected-value-checking transaction.
//!
//! Buffers mutations and takes claim locks for LOCK cells as it goes. At
//! commit every claim is verified after the settle delay, locked cells are
//! checked against the values the caller expected, and only then are the
//! buffered mutations flushed. Locks are released on every terminal path.

use crate::claim::LockClaim;
use crate::fork::{self, ForkColumn, ForkedValue, VersionId};
use crate::provider::{ExpectedValueCheckingStore, TransactionProvider};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use vesper_common::prelude::*;
use vesper_storage::{BackendOperation, KcvMutation, StoreMutations, StoreTransaction};

/// Transaction lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Open,
    /// At least one lock claim has been written
    Locking,
    Verifying,
    Committing,
    Committed,
    RolledBack,
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::RolledBack)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionState::Open => "OPEN",
            TransactionState::Locking => "LOCKING",
            TransactionState::Verifying => "VERIFYING",
            TransactionState::Committing => "COMMITTING",
            TransactionState::Committed => "COMMITTED",
            TransactionState::RolledBack => "ROLLED_BACK",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ExpectedValue {
    /// Locked by a LOCK mutation; the prior value is not checked
    Unchecked,
    /// Cell must still hold this value (`None` = absent) at commit
    Value(Option<Bytes>),
}

struct LockedCell {
    store: Arc<ExpectedValueCheckingStore>,
    claim: LockClaim,
    expected: ExpectedValue,
}

/// Transaction emulating atomic, isolated writes on a non-transactional
/// backend.
pub struct ExpectedValueCheckingTransaction {
    provider: TransactionProvider,
    requester: RequesterId,
    store_tx: Arc<dyn StoreTransaction>,
    state: TransactionState,
    mutations: StoreMutations,
    locks: BTreeMap<(String, KeyColumn), LockedCell>,
}

impl ExpectedValueCheckingTransaction {
    pub(crate) fn new(
        provider: TransactionProvider,
        requester: RequesterId,
        store_tx: Arc<dyn StoreTransaction>,
    ) -> Self {
        Self {
            provider,
            requester,
            store_tx,
            state: TransactionState::Open,
            mutations: StoreMutations::new(),
            locks: BTreeMap::new(),
        }
    }

    pub fn requester(&self) -> &RequesterId {
        &self.requester
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Cells locked so far, as `(store, cell)`.
    pub fn locked_cells(&self) -> Vec<(String, KeyColumn)> {
        self.locks.keys().cloned().collect()
    }

    /// Number of rows with buffered mutations
    pub fn pending_rows(&self) -> usize {
        self.mutations.values().map(|rows| rows.len()).sum()
    }

    fn ensure_active(&self, op: &str) -> Result<()> {
        match self.state {
            TransactionState::Open | TransactionState::Locking => Ok(()),
            state => Err(TransactionError::InvalidState {
                state: state.to_string(),
                op: op.to_string(),
            }
            .into()),
        }
    }

    /// Lock `kc` in `store` and record that it must still hold `expected`
    /// (`None` = absent) when the transaction commits.
    pub async fn acquire_lock(&mut self, store: &str, kc: &KeyColumn, expected: Option<Bytes>) -> Result<()> {
        self.ensure_active("acquire_lock")?;
        self.lock_cell(store, kc, ExpectedValue::Value(expected)).await
    }

    /// Buffer a write of `value` to `kc` (`None` deletes), protected according
    /// to the cell's consistency modifier.
    pub async fn mutate(&mut self, store: &str, kc: KeyColumn, value: Option<Bytes>) -> Result<()> {
        self.ensure_active("mutate")?;
        let modifier = self.provider.resolver().consistency(store, &kc);
        trace!(requester = %self.requester, store, %kc, %modifier, "Buffering mutation");
        match modifier {
            ConsistencyModifier::Default => {
                self.buffer(store, &kc, value);
                Ok(())
            }
            ConsistencyModifier::Lock => {
                self.lock_cell(store, &kc, ExpectedValue::Unchecked).await?;
                self.buffer(store, &kc, value);
                Ok(())
            }
            ConsistencyModifier::Fork => self.fork_write(store, &kc, value).await,
        }
    }

    /// Read a slice of `store` directly from the backend.
    ///
    /// Buffered mutations of this transaction are not visible.
    pub async fn get_slice(&self, store: &str, query: &KeySliceQuery) -> Result<EntryList> {
        self.ensure_active("get_slice")?;
        let store = self.provider.open_store(store).await?;
        self.read(&store, query).await
    }

    /// Current and superseded versions of a FORK cell.
    pub async fn read_forked(&self, store: &str, kc: &KeyColumn) -> Result<ForkedValue> {
        self.ensure_active("read_forked")?;
        let store = self.provider.open_store(store).await?;
        let prefix = ForkColumn::prefix(kc.column())?;
        let query = KeySliceQuery::new(kc.key().clone(), SliceQuery::prefix(&prefix));
        let entries = self.read(&store, &query).await?;
        Ok(fork::resolve(kc.column(), &entries))
    }

    /// Verify locks, check expected values and flush.
    ///
    /// On any failure the transaction is rolled back and every lock released.
    pub async fn commit(&mut self) -> Result<()> {
        self.ensure_active("commit")?;

        if !self.locks.is_empty() {
            self.state = TransactionState::Verifying;
            if let Err(e) = self.verify().await {
                return Err(self.abort(e).await);
            }
        }

        self.state = TransactionState::Committing;
        if let Err(e) = self.flush().await {
            return Err(self.abort(e).await);
        }

        let locks = self.locks.len();
        self.release_locks().await;
        self.state = TransactionState::Committed;
        debug!(
            requester = %self.requester,
            locks,
            rows = self.pending_rows(),
            "Transaction committed"
        );
        self.mutations.clear();
        Ok(())
    }

    /// Discard buffered mutations and release every lock.
    ///
    /// Rolling back twice is a no-op; rolling back a committed transaction
    /// is an error.
    pub async fn rollback(&mut self) -> Result<()> {
        match self.state {
            TransactionState::RolledBack => return Ok(()),
            TransactionState::Committed => {
                return Err(TransactionError::InvalidState {
                    state: self.state.to_string(),
                    op: "rollback".to_string(),
                }
                .into())
            }
            _ => {}
        }
        self.release_locks().await;
        self.mutations.clear();
        self.state = TransactionState::RolledBack;
        debug!(requester = %self.requester, "Transaction rolled back");
        self.store_tx.rollback().await
    }

    async fn lock_cell(&mut self, store_name: &str, kc: &KeyColumn, expected: ExpectedValue) -> Result<()> {
        let key = (store_name.to_string(), kc.clone());
        // A claim that would expire before it can be verified is rewritten.
        let expiration = self.provider.config().lock_expiration;
        let verify_by = self.provider.clock().now().saturating_add(self.provider.config().lock_wait);
        let previous = match self.locks.get_mut(&key) {
            Some(cell) => {
                if cell.expected == ExpectedValue::Unchecked {
                    cell.expected = expected.clone();
                }
                if !cell.claim.entry.is_expired(expiration, verify_by) {
                    return Ok(());
                }
                Some(cell.claim.clone())
            }
            None => None,
        };

        self.state = TransactionState::Locking;
        let result = match self.provider.open_store(store_name).await {
            Ok(store) => store
                .locker()
                .write_claim(kc, &self.requester, previous.as_ref(), self.store_tx.as_ref())
                .await
                .map(|claim| (store, claim)),
            Err(e) => Err(e),
        };
        match result {
            Ok((store, claim)) => {
                let expected = match self.locks.remove(&key) {
                    Some(old) => old.expected,
                    None => expected,
                };
                self.locks.insert(
                    key,
                    LockedCell {
                        store,
                        claim,
                        expected,
                    },
                );
                Ok(())
            }
            Err(e) => Err(self.abort(e).await),
        }
    }

    fn buffer(&mut self, store: &str, kc: &KeyColumn, value: Option<Bytes>) {
        let row = self.row_mutation(store, kc.key());
        match value {
            Some(value) => row.addition(Entry::new(kc.column().clone(), value)),
            None => row.deletion(kc.column().clone()),
        }
    }

    fn row_mutation(&mut self, store: &str, key: &Bytes) -> &mut KcvMutation {
        self.mutations
            .entry(store.to_string())
            .or_default()
            .entry(key.clone())
            .or_default()
    }

    async fn fork_write(&mut self, store_name: &str, kc: &KeyColumn, value: Option<Bytes>) -> Result<()> {
        let store = self.provider.open_store(store_name).await?;
        let prefix = ForkColumn::prefix(kc.column())?;
        let query = KeySliceQuery::new(kc.key().clone(), SliceQuery::prefix(&prefix));
        let mut existing = self.read(&store, &query).await?;
        if let Some(buffered) = self.mutations.get(store_name).and_then(|rows| rows.get(kc.key())) {
            existing.extend(
                buffered
                    .additions
                    .iter()
                    .filter(|e| e.column.starts_with(&prefix))
                    .cloned(),
            );
        }

        let clock = self.provider.clock();
        let id = VersionId {
            version: clock.to_native(clock.now()),
            requester: self.requester.clone(),
        };
        let planned = fork::plan_write(kc.column(), &existing, id, value)?;
        self.row_mutation(store_name, kc.key()).merge(planned);
        Ok(())
    }

    async fn read(&self, store: &ExpectedValueCheckingStore, query: &KeySliceQuery) -> Result<EntryList> {
        let (data, txh) = (store.data(), self.store_tx.as_ref());
        BackendOperation::execute(&self.provider.config().retry, "tx.read", || async move {
            data.get_slice(query, txh).await
        })
        .await
    }

    async fn verify(&self) -> Result<()> {
        let latest = self
            .locks
            .values()
            .map(|cell| cell.claim.entry.written_at)
            .max()
            .unwrap_or(Timestamp::EPOCH);
        let settle_until = latest.saturating_add(self.provider.config().lock_wait);
        self.provider.clock().sleep_past(settle_until).await;

        for cell in self.locks.values() {
            cell.store
                .locker()
                .check_claim(&cell.claim, self.store_tx.as_ref())
                .await?;
        }

        for cell in self.locks.values() {
            let ExpectedValue::Value(expected) = &cell.expected else {
                continue;
            };
            let actual = self
                .read(&cell.store, &KeySliceQuery::cell(&cell.claim.kc))
                .await?
                .into_iter()
                .next()
                .map(|e| e.value);
            if actual != *expected {
                return Err(TransactionError::ExpectedValueMismatch(format!(
                    "{} in {}",
                    cell.claim.kc,
                    cell.store.name()
                ))
                .into());
            }
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        if !self.mutations.is_empty() {
            let (manager, mutations, txh) = (self.provider.manager(), &self.mutations, self.store_tx.as_ref());
            BackendOperation::execute(&self.provider.config().retry, "tx.flush", || async move {
                manager.mutate_many(mutations, txh).await
            })
            .await?;
        }
        self.store_tx.commit().await
    }

    /// Roll back after a failure and hand the failure back.
    async fn abort(&mut self, err: Error) -> Error {
        warn!(
            requester = %self.requester,
            state = %self.state,
            code = err.code(),
            error = %err,
            "Transaction aborted"
        );
        self.release_locks().await;
        self.mutations.clear();
        self.state = TransactionState::RolledBack;
        if let Err(e) = self.store_tx.rollback().await {
            debug!(requester = %self.requester, error = %e, "Store transaction rollback failed");
        }
        err
    }

    async fn release_locks(&mut self) {
        let locks = std::mem::take(&mut self.locks);
        for cell in locks.into_values() {
            if let Err(e) = cell.store.locker().release(&cell.claim, self.store_tx.as_ref()).await {
                debug!(
                    kc = %cell.claim.kc,
                    error = %e,
                    "Lock claim not deleted, leaving it to expire"
                );
            }
        }
    }
}

impl Drop for ExpectedValueCheckingTransaction {
    fn drop(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        if !self.locks.is_empty() {
            warn!(
                requester = %self.requester,
                locks = self.locks.len(),
                "Transaction dropped without commit/rollback, releasing local locks"
            );
        }
        for ((_, kc), cell) in std::mem::take(&mut self.locks) {
            cell.store.locker().release_local(&kc, &self.requester);
        }
    }
}

impl fmt::Debug for ExpectedValueCheckingTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpectedValueCheckingTransaction")
            .field("requester", &self.requester.to_string())
            .field("state", &self.state)
            .field("locks", &self.locks.len())
            .field("pending_rows", &self.pending_rows())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consistency::SchemaConsistency;
    use std::time::Duration;
    use vesper_common::testing::ManualClock;
    use vesper_storage::{InMemoryStoreManager, KeyColumnValueStore, StoreManager, StoreTxConfig};

    async fn provider() -> (Arc<InMemoryStoreManager>, TransactionProvider) {
        let manager = Arc::new(InMemoryStoreManager::new());
        let clock = Arc::new(ManualClock::new(TimestampResolution::Micro));
        let schema = SchemaConsistency::new()
            .with_column("p_name", ConsistencyModifier::Lock)
            .with_column("p_tag", ConsistencyModifier::Fork);
        let provider = TransactionProvider::builder(manager.clone())
            .clock(clock)
            .resolver(Arc::new(schema))
            .config(TransactionConfig {
                lock_expiration: Duration::from_secs(10),
                lock_wait: Duration::from_millis(20),
                ..TransactionConfig::default()
            })
            .build()
            .unwrap();
        (manager, provider)
    }

    async fn stored(manager: &InMemoryStoreManager, store: &str, kc: &KeyColumn) -> Option<Bytes> {
        let txh = manager.begin_transaction(StoreTxConfig::default()).await.unwrap();
        let store = manager.open_database(store).await.unwrap();
        store
            .get_slice(&KeySliceQuery::cell(kc), txh.as_ref())
            .await
            .unwrap()
            .into_iter()
            .next()
            .map(|e| e.value)
    }

    #[tokio::test]
    async fn test_default_mutation_commits_without_locks() {
        let (manager, provider) = provider().await;
        let mut tx = provider.begin().await.unwrap();
        let kc = KeyColumn::new("v1", "p_age");
        tx.mutate("edgestore", kc.clone(), Some("30".into())).await.unwrap();
        assert_eq!(tx.state(), TransactionState::Open);
        assert!(tx.locked_cells().is_empty());
        tx.commit().await.unwrap();
        assert_eq!(tx.state(), TransactionState::Committed);
        assert_eq!(stored(&manager, "edgestore", &kc).await, Some(Bytes::from_static(b"30")));
    }

    #[tokio::test]
    async fn test_lock_mutation_goes_through_protocol() {
        let (manager, provider) = provider().await;
        let mut tx = provider.begin().await.unwrap();
        let kc = KeyColumn::new("v1", "p_name");
        tx.mutate("edgestore", kc.clone(), Some("alice".into())).await.unwrap();
        assert_eq!(tx.state(), TransactionState::Locking);
        assert_eq!(tx.locked_cells(), vec![("edgestore".to_string(), kc.clone())]);

        tx.commit().await.unwrap();
        assert_eq!(stored(&manager, "edgestore", &kc).await, Some(Bytes::from_static(b"alice")));
        // Claim removed and local grant released
        let txh = manager.begin_transaction(StoreTxConfig::default()).await.unwrap();
        let lock_store = manager.open_database("edgestore_lock_").await.unwrap();
        let claims = lock_store
            .get_slice(&KeySliceQuery::new(kc.lock_key(), SliceQuery::all()), txh.as_ref())
            .await
            .unwrap();
        assert!(claims.is_empty());
        assert!(provider.mediators().get_or_create("edgestore_lock_").is_empty());
    }

    #[tokio::test]
    async fn test_expected_value_mismatch_rolls_back() {
        let (manager, provider) = provider().await;
        let kc = KeyColumn::new("v1", "p_name");

        let mut setup = provider.begin().await.unwrap();
        setup.mutate("edgestore", kc.clone(), Some("alice".into())).await.unwrap();
        setup.commit().await.unwrap();

        let mut tx = provider.begin().await.unwrap();
        tx.acquire_lock("edgestore", &kc, Some("bob".into())).await.unwrap();
        tx.mutate("edgestore", kc.clone(), Some("carol".into())).await.unwrap();
        let err = tx.commit().await.unwrap_err();
        assert_eq!(err.code(), "EXPECTED_VALUE_MISMATCH");
        assert_eq!(tx.state(), TransactionState::RolledBack);
        assert_eq!(stored(&manager, "edgestore", &kc).await, Some(Bytes::from_static(b"alice")));

        let mut ok = provider.begin().await.unwrap();
        ok.acquire_lock("edgestore", &kc, Some("alice".into())).await.unwrap();
        ok.mutate("edgestore", kc.clone(), None).await.unwrap();
        ok.commit().await.unwrap();
        assert_eq!(stored(&manager, "edgestore", &kc).await, None);
    }

    #[tokio::test]
    async fn test_local_contention_rolls_back_loser() {
        let (_manager, provider) = provider().await;
        let kc = KeyColumn::new("v1", "p_name");
        let mut a = provider.begin().await.unwrap();
        let mut b = provider.begin().await.unwrap();
        a.mutate("edgestore", kc.clone(), Some("a".into())).await.unwrap();
        b.mutate("edgestore", KeyColumn::new("v2", "p_name"), Some("b".into()))
            .await
            .unwrap();

        let err = b.mutate("edgestore", kc.clone(), Some("b".into())).await.unwrap_err();
        assert_eq!(err.code(), "LOCAL_LOCK_CONTENTION");
        assert_eq!(b.state(), TransactionState::RolledBack);
        assert!(b.locked_cells().is_empty());

        let err = b.commit().await.unwrap_err();
        assert_eq!(err.code(), "INVALID_TXN_STATE");
        a.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_rollback_releases_and_is_idempotent() {
        let (manager, provider) = provider().await;
        let kc = KeyColumn::new("v1", "p_name");
        let mut tx = provider.begin().await.unwrap();
        tx.mutate("edgestore", kc.clone(), Some("x".into())).await.unwrap();
        tx.rollback().await.unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(stored(&manager, "edgestore", &kc).await, None);

        let mut next = provider.begin().await.unwrap();
        next.mutate("edgestore", kc.clone(), Some("y".into())).await.unwrap();
        next.commit().await.unwrap();
        assert!(next.rollback().await.is_err());
    }

    #[tokio::test]
    async fn test_drop_releases_local_locks() {
        let (_manager, provider) = provider().await;
        let kc = KeyColumn::new("v1", "p_name");
        {
            let mut tx = provider.begin().await.unwrap();
            tx.mutate("edgestore", kc.clone(), Some("x".into())).await.unwrap();
        }
        // The dropped claim stays in the lock store until it expires, but the
        // local grant is gone
        assert!(provider.mediators().get_or_create("edgestore_lock_").is_empty());
        let mut tx = provider.begin().await.unwrap();
        tx.mutate("edgestore", kc.clone(), Some("y".into())).await.unwrap();
        assert_eq!(tx.locked_cells().len(), 1);
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_fork_writes_and_reads() {
        let (_manager, provider) = provider().await;
        let kc = KeyColumn::new("v1", "p_tag");

        let mut tx = provider.begin().await.unwrap();
        tx.mutate("edgestore", kc.clone(), Some("one".into())).await.unwrap();
        assert!(tx.locked_cells().is_empty());
        tx.commit().await.unwrap();

        let mut tx = provider.begin().await.unwrap();
        tx.mutate("edgestore", kc.clone(), Some("two".into())).await.unwrap();
        tx.commit().await.unwrap();

        let reader = provider.begin().await.unwrap();
        let view = reader.read_forked("edgestore", &kc).await.unwrap();
        assert_eq!(view.value(), Some(&Bytes::from_static(b"two")));
        assert_eq!(view.superseded.len(), 1);
        assert!(view.superseded[0].tombstoned);
    }

    #[tokio::test]
    async fn test_fork_rewrite_within_transaction() {
        let (_manager, provider) = provider().await;
        let kc = KeyColumn::new("v1", "p_tag");
        let mut tx = provider.begin().await.unwrap();
        tx.mutate("edgestore", kc.clone(), Some("one".into())).await.unwrap();
        tx.mutate("edgestore", kc.clone(), Some("two".into())).await.unwrap();
        tx.commit().await.unwrap();

        let reader = provider.begin().await.unwrap();
        let view = reader.read_forked("edgestore", &kc).await.unwrap();
        assert_eq!(view.value(), Some(&Bytes::from_static(b"two")));
    }

    #[tokio::test]
    async fn test_get_slice_reads_backend() {
        let (_manager, provider) = provider().await;
        let mut writer = provider.begin().await.unwrap();
        writer
            .mutate("edgestore", KeyColumn::new("v1", "p_age"), Some("1".into()))
            .await
            .unwrap();
        writer
            .mutate("edgestore", KeyColumn::new("v1", "p_city"), Some("x".into()))
            .await
            .unwrap();
        writer.commit().await.unwrap();

        let reader = provider.begin().await.unwrap();
        let entries = reader
            .get_slice("edgestore", &KeySliceQuery::new("v1", SliceQuery::prefix(b"p_")))
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
    }
}
