//! In-memory KCV backend.
//!
//! Every store is a `BTreeMap` of rows behind a `parking_lot::RwLock`, so
//! row mutations and the conditional write are trivially atomic. Used by
//! tests and by the `vesper-tool` contention harness.

use crate::{
    BaseTransaction, ExpectedValueOutcome, KeyColumnValueStore, StoreFeatures, StoreManager,
    StoreTransaction, StoreTxConfig,
};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use vesper_common::prelude::*;

type Row = BTreeMap<Bytes, Bytes>;

fn range_bounds<'a>(start: &'a Bytes, end: Option<&'a Bytes>) -> (Bound<&'a Bytes>, Bound<&'a Bytes>) {
    let upper = match end {
        Some(end) => Bound::Excluded(end),
        None => Bound::Unbounded,
    };
    (Bound::Included(start), upper)
}

/// A single in-memory store.
#[derive(Debug)]
pub struct InMemoryStore {
    name: String,
    rows: RwLock<BTreeMap<Bytes, Row>>,
    closed: AtomicBool,
}

impl InMemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: RwLock::new(BTreeMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of non-empty rows
    pub fn row_count(&self) -> usize {
        self.rows.read().len()
    }

    /// Drop every row.
    pub fn clear(&self) {
        self.rows.write().clear();
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed(self.name.clone()).into());
        }
        Ok(())
    }

    fn slice_of(row: &Row, slice: &SliceQuery) -> EntryList {
        if slice.end.as_ref().map_or(false, |end| *end <= slice.start) {
            return Vec::new();
        }
        let limit = slice.limit.unwrap_or(usize::MAX);
        row.range::<Bytes, _>(range_bounds(&slice.start, slice.end.as_ref()))
            .take(limit)
            .map(|(column, value)| Entry::new(column.clone(), value.clone()))
            .collect()
    }
}

#[async_trait]
impl KeyColumnValueStore for InMemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_slice(&self, query: &KeySliceQuery, _txh: &dyn StoreTransaction) -> Result<EntryList> {
        self.ensure_open()?;
        let rows = self.rows.read();
        Ok(rows
            .get(&query.key)
            .map(|row| Self::slice_of(row, &query.slice))
            .unwrap_or_default())
    }

    async fn get_keys(
        &self,
        range: &KeyRange,
        slice: &SliceQuery,
        _txh: &dyn StoreTransaction,
    ) -> Result<Vec<Bytes>> {
        self.ensure_open()?;
        if range.end.as_ref().map_or(false, |end| *end <= range.start) {
            return Ok(Vec::new());
        }
        let rows = self.rows.read();
        Ok(rows
            .range::<Bytes, _>(range_bounds(&range.start, range.end.as_ref()))
            .filter(|(_, row)| row.keys().any(|column| slice.contains(column)))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn mutate(
        &self,
        key: &Bytes,
        additions: &[Entry],
        deletions: &[Bytes],
        _txh: &dyn StoreTransaction,
    ) -> Result<()> {
        self.ensure_open()?;
        let mut rows = self.rows.write();
        let row = rows.entry(key.clone()).or_default();
        for column in deletions {
            row.remove(column);
        }
        for entry in additions {
            row.insert(entry.column.clone(), entry.value.clone());
        }
        if row.is_empty() {
            rows.remove(key);
        }
        Ok(())
    }

    async fn acquire_lock(
        &self,
        key: &Bytes,
        column: &Bytes,
        expected: Option<&Bytes>,
        value: Bytes,
        _txh: &dyn StoreTransaction,
    ) -> Result<ExpectedValueOutcome> {
        self.ensure_open()?;
        let mut rows = self.rows.write();
        let current = rows.get(key).and_then(|row| row.get(column));
        if current != expected {
            return Ok(ExpectedValueOutcome::Conflict {
                current: current.cloned(),
            });
        }
        rows.entry(key.clone())
            .or_default()
            .insert(column.clone(), value);
        Ok(ExpectedValueOutcome::Applied)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Store manager for [`InMemoryStore`]s.
///
/// Stores live as long as the manager; reopening a name returns the same
/// store and its data.
#[derive(Debug, Default)]
pub struct InMemoryStoreManager {
    stores: DashMap<String, Arc<InMemoryStore>>,
}

impl InMemoryStoreManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any store currently holds data.
    pub fn exists(&self) -> bool {
        self.stores.iter().any(|s| s.row_count() > 0)
    }

    /// Drop the data of every store, keeping the stores open.
    pub fn clear_storage(&self) {
        for store in self.stores.iter() {
            store.clear();
        }
    }

    /// Names of the stores opened so far
    pub fn store_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stores.iter().map(|s| s.key().clone()).collect();
        names.sort();
        names
    }
}

#[async_trait]
impl StoreManager for InMemoryStoreManager {
    fn name(&self) -> &str {
        "inmemory"
    }

    fn features(&self) -> StoreFeatures {
        StoreFeatures {
            ordered_scan: true,
            key_consistent: true,
            native_locking: false,
            batch_mutation: false,
        }
    }

    async fn open_database(&self, name: &str) -> Result<Arc<dyn KeyColumnValueStore>> {
        if name.is_empty() {
            return Err(Error::invalid_argument("store name must not be empty"));
        }
        let store = self
            .stores
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(store = name, "Opening in-memory store");
                Arc::new(InMemoryStore::new(name))
            })
            .clone();
        store.ensure_open()?;
        Ok(store)
    }

    async fn begin_transaction(&self, config: StoreTxConfig) -> Result<Arc<dyn StoreTransaction>> {
        Ok(Arc::new(BaseTransaction::new(config)))
    }

    async fn close(&self) -> Result<()> {
        for store in self.stores.iter() {
            store.closed.store(true, Ordering::Release);
        }
        self.stores.clear();
        info!("In-memory store manager closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx() -> BaseTransaction {
        BaseTransaction::new(StoreTxConfig::default())
    }

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[tokio::test]
    async fn test_mutate_and_slice() {
        let store = InMemoryStore::new("edgestore");
        let txh = tx();
        store
            .mutate(
                &b("v1"),
                &[Entry::new("p_age", "30"), Entry::new("p_name", "alice"), Entry::new("q", "x")],
                &[],
                &txh,
            )
            .await
            .unwrap();

        let entries = store
            .get_slice(&KeySliceQuery::new("v1", SliceQuery::prefix(b"p_")), &txh)
            .await
            .unwrap();
        assert_eq!(entries, vec![Entry::new("p_age", "30"), Entry::new("p_name", "alice")]);

        let limited = store
            .get_slice(&KeySliceQuery::new("v1", SliceQuery::all().with_limit(1)), &txh)
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_deletions_applied_before_additions() {
        let store = InMemoryStore::new("s");
        let txh = tx();
        store
            .mutate(&b("k"), &[Entry::new("c", "new")], &[b("c")], &txh)
            .await
            .unwrap();
        let cell = KeySliceQuery::cell(&KeyColumn::new("k", "c"));
        assert_eq!(store.get_slice(&cell, &txh).await.unwrap(), vec![Entry::new("c", "new")]);

        store.mutate(&b("k"), &[], &[b("c")], &txh).await.unwrap();
        assert!(store.get_slice(&cell, &txh).await.unwrap().is_empty());
        assert_eq!(store.row_count(), 0);
    }

    #[tokio::test]
    async fn test_acquire_lock_compares_expected() {
        let store = InMemoryStore::new("s");
        let txh = tx();
        let (k, c) = (b("k"), b("c"));

        let first = store.acquire_lock(&k, &c, None, b("1"), &txh).await.unwrap();
        assert!(first.is_applied());

        let stale = store.acquire_lock(&k, &c, None, b("2"), &txh).await.unwrap();
        assert_eq!(stale, ExpectedValueOutcome::Conflict { current: Some(b("1")) });

        let swap = store.acquire_lock(&k, &c, Some(&b("1")), b("2"), &txh).await.unwrap();
        assert!(swap.is_applied());

        let missing = store
            .acquire_lock(&k, &b("other"), Some(&b("1")), b("3"), &txh)
            .await
            .unwrap();
        assert_eq!(missing, ExpectedValueOutcome::Conflict { current: None });
    }

    #[tokio::test]
    async fn test_get_keys() {
        let store = InMemoryStore::new("s");
        let txh = tx();
        for key in ["a", "b", "c"] {
            store.mutate(&b(key), &[Entry::new("x", "1")], &[], &txh).await.unwrap();
        }
        store.mutate(&b("d"), &[Entry::new("y", "1")], &[], &txh).await.unwrap();

        let keys = store
            .get_keys(&KeyRange::all(), &SliceQuery::column(b"x"), &txh)
            .await
            .unwrap();
        assert_eq!(keys, vec![b("a"), b("b"), b("c")]);

        let range = KeyRange {
            start: b("b"),
            end: Some(b("d")),
        };
        let keys = store.get_keys(&range, &SliceQuery::all(), &txh).await.unwrap();
        assert_eq!(keys, vec![b("b"), b("c")]);
    }

    #[tokio::test]
    async fn test_manager_reopens_same_store() {
        let manager = InMemoryStoreManager::new();
        let txh = manager.begin_transaction(StoreTxConfig::default()).await.unwrap();
        let s1 = manager.open_database("edgestore").await.unwrap();
        s1.mutate(&b("k"), &[Entry::new("c", "v")], &[], txh.as_ref()).await.unwrap();

        let s2 = manager.open_database("edgestore").await.unwrap();
        let cell = KeySliceQuery::cell(&KeyColumn::new("k", "c"));
        assert_eq!(s2.get_slice(&cell, txh.as_ref()).await.unwrap().len(), 1);
        assert!(manager.exists());

        manager.clear_storage();
        assert!(!manager.exists());
        assert_eq!(manager.store_names(), vec!["edgestore".to_string()]);
    }

    #[tokio::test]
    async fn test_closed_store_rejects_operations() {
        let store = InMemoryStore::new("s");
        store.close().await.unwrap();
        let err = store
            .get_slice(&KeySliceQuery::new("k", SliceQuery::all()), &tx())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "STORAGE_CLOSED");
        assert!(!err.is_temporary());
    }

    #[tokio::test]
    async fn test_mutate_many_default_impl() {
        let manager = InMemoryStoreManager::new();
        let txh = manager.begin_transaction(StoreTxConfig::default()).await.unwrap();
        let mut mutations = crate::StoreMutations::new();
        mutations
            .entry("a".to_string())
            .or_default()
            .insert(b("k1"), crate::KcvMutation::new(vec![Entry::new("c", "1")], vec![]));
        mutations
            .entry("b".to_string())
            .or_default()
            .insert(b("k2"), crate::KcvMutation::new(vec![Entry::new("c", "2")], vec![]));
        manager.mutate_many(&mutations, txh.as_ref()).await.unwrap();

        assert_eq!(manager.store_names(), vec!["a".to_string(), "b".to_string()]);
        let b_store = manager.open_database("b").await.unwrap();
        let got = b_store
            .get_slice(&KeySliceQuery::cell(&KeyColumn::new("k2", "c")), txh.as_ref())
            .await
            .unwrap();
        assert_eq!(got, vec![Entry::new("c", "2")]);
    }
}
