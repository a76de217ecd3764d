//! Fault injection wrappers for exercising retry and locking paths.
//!
//! [`FlakyStoreManager`] and [`FlakyStore`] delegate to a real backend but
//! fail a configurable number of upcoming calls first.

use crate::{
    ExpectedValueOutcome, KeyColumnValueStore, StoreFeatures, StoreManager, StoreMutations,
    StoreTransaction, StoreTxConfig,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use vesper_common::prelude::*;

/// Which error an injected fault produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Transient,
    Permanent,
}

#[derive(Debug, Default)]
struct FaultSlot {
    transient: AtomicU32,
    permanent: AtomicU32,
    calls: AtomicU32,
}

impl FaultSlot {
    fn arm(&self, count: u32, kind: FaultKind) {
        match kind {
            FaultKind::Transient => self.transient.store(count, Ordering::SeqCst),
            FaultKind::Permanent => self.permanent.store(count, Ordering::SeqCst),
        }
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn check(&self, what: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if Self::take(&self.permanent) {
            return Err(Error::permanent(format!("injected permanent {} failure", what)));
        }
        if Self::take(&self.transient) {
            return Err(Error::unavailable(format!("injected transient {} failure", what)));
        }
        Ok(())
    }
}

/// Shared fault plan for a flaky backend.
#[derive(Debug, Default)]
pub struct FaultInjector {
    reads: FaultSlot,
    mutations: FaultSlot,
    lock_writes: FaultSlot,
}

impl FaultInjector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `count` slice and key reads.
    pub fn fail_reads(&self, count: u32, kind: FaultKind) {
        self.reads.arm(count, kind);
    }

    /// Fail the next `count` row mutations or batch flushes.
    pub fn fail_mutations(&self, count: u32, kind: FaultKind) {
        self.mutations.arm(count, kind);
    }

    /// Fail the next `count` conditional writes.
    pub fn fail_lock_writes(&self, count: u32, kind: FaultKind) {
        self.lock_writes.arm(count, kind);
    }

    pub fn read_calls(&self) -> u32 {
        self.reads.calls.load(Ordering::SeqCst)
    }

    pub fn mutation_calls(&self) -> u32 {
        self.mutations.calls.load(Ordering::SeqCst)
    }

    pub fn lock_write_calls(&self) -> u32 {
        self.lock_writes.calls.load(Ordering::SeqCst)
    }
}

/// Store wrapper that consults a [`FaultInjector`] before delegating.
pub struct FlakyStore {
    inner: Arc<dyn KeyColumnValueStore>,
    faults: Arc<FaultInjector>,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn KeyColumnValueStore>, faults: Arc<FaultInjector>) -> Self {
        Self { inner, faults }
    }
}

#[async_trait]
impl KeyColumnValueStore for FlakyStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get_slice(&self, query: &KeySliceQuery, txh: &dyn StoreTransaction) -> Result<EntryList> {
        self.faults.reads.check("read")?;
        self.inner.get_slice(query, txh).await
    }

    async fn get_keys(
        &self,
        range: &KeyRange,
        slice: &SliceQuery,
        txh: &dyn StoreTransaction,
    ) -> Result<Vec<Bytes>> {
        self.faults.reads.check("read")?;
        self.inner.get_keys(range, slice, txh).await
    }

    async fn mutate(
        &self,
        key: &Bytes,
        additions: &[Entry],
        deletions: &[Bytes],
        txh: &dyn StoreTransaction,
    ) -> Result<()> {
        self.faults.mutations.check("mutation")?;
        self.inner.mutate(key, additions, deletions, txh).await
    }

    async fn acquire_lock(
        &self,
        key: &Bytes,
        column: &Bytes,
        expected: Option<&Bytes>,
        value: Bytes,
        txh: &dyn StoreTransaction,
    ) -> Result<ExpectedValueOutcome> {
        self.faults.lock_writes.check("lock write")?;
        self.inner.acquire_lock(key, column, expected, value, txh).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

/// Store manager whose stores are [`FlakyStore`]s sharing one fault plan.
pub struct FlakyStoreManager {
    inner: Arc<dyn StoreManager>,
    faults: Arc<FaultInjector>,
}

impl FlakyStoreManager {
    pub fn new(inner: Arc<dyn StoreManager>, faults: Arc<FaultInjector>) -> Self {
        Self { inner, faults }
    }

    pub fn faults(&self) -> &Arc<FaultInjector> {
        &self.faults
    }
}

#[async_trait]
impl StoreManager for FlakyStoreManager {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn features(&self) -> StoreFeatures {
        self.inner.features()
    }

    async fn open_database(&self, name: &str) -> Result<Arc<dyn KeyColumnValueStore>> {
        let inner = self.inner.open_database(name).await?;
        Ok(Arc::new(FlakyStore::new(inner, self.faults.clone())))
    }

    async fn begin_transaction(&self, config: StoreTxConfig) -> Result<Arc<dyn StoreTransaction>> {
        self.inner.begin_transaction(config).await
    }

    /// A batch flush counts as one mutation call.
    async fn mutate_many(&self, mutations: &StoreMutations, txh: &dyn StoreTransaction) -> Result<()> {
        self.faults.mutations.check("flush")?;
        self.inner.mutate_many(mutations, txh).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryStoreManager;

    #[tokio::test]
    async fn test_faults_consumed_in_order() {
        let faults = FaultInjector::new();
        let manager = FlakyStoreManager::new(Arc::new(InMemoryStoreManager::new()), faults.clone());
        let store = manager.open_database("s").await.unwrap();
        let txh = manager.begin_transaction(StoreTxConfig::default()).await.unwrap();
        let key = Bytes::from_static(b"k");

        faults.fail_mutations(1, FaultKind::Permanent);
        faults.fail_mutations(1, FaultKind::Transient);

        let first = store.mutate(&key, &[Entry::new("c", "v")], &[], txh.as_ref()).await;
        assert_eq!(first.unwrap_err().code(), "STORAGE_PERMANENT");
        let second = store.mutate(&key, &[Entry::new("c", "v")], &[], txh.as_ref()).await;
        assert!(second.unwrap_err().is_temporary());
        store
            .mutate(&key, &[Entry::new("c", "v")], &[], txh.as_ref())
            .await
            .unwrap();
        assert_eq!(faults.mutation_calls(), 3);
    }

    #[tokio::test]
    async fn test_lock_write_faults() {
        let faults = FaultInjector::new();
        let manager = FlakyStoreManager::new(Arc::new(InMemoryStoreManager::new()), faults.clone());
        let store = manager.open_database("s").await.unwrap();
        let txh = manager.begin_transaction(StoreTxConfig::default()).await.unwrap();
        let (k, c) = (Bytes::from_static(b"k"), Bytes::from_static(b"c"));

        faults.fail_lock_writes(1, FaultKind::Transient);
        assert!(store
            .acquire_lock(&k, &c, None, Bytes::from_static(b"1"), txh.as_ref())
            .await
            .is_err());
        assert!(store
            .acquire_lock(&k, &c, None, Bytes::from_static(b"1"), txh.as_ref())
            .await
            .unwrap()
            .is_applied());
        assert_eq!(faults.lock_write_calls(), 2);
        assert_eq!(faults.read_calls(), 0);
    }
}
