//! # Vesper Storage
//!
//! Key-column-value (KCV) storage contract for Vesper:
//! - Ordered rows keyed by opaque byte strings, each holding ordered columns
//! - Slice reads, row-atomic mutations and one conditional single-cell write
//! - Store managers that open stores and hand out store transactions
//! - Retry harness for temporary backend failures
//! - A configuration namespace persisted in a KCV store
//!
//! Concrete backends implement [`StoreManager`] and [`KeyColumnValueStore`];
//! everything above this crate only holds the trait objects.

pub mod backend_op;
pub mod kcvs_config;
pub mod memory;
pub mod testing;

pub use backend_op::{BackendOperation, TransactionalProvider};
pub use kcvs_config::KcvsConfiguration;
pub use memory::{InMemoryStore, InMemoryStoreManager};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use vesper_common::prelude::*;

/// Open the store manager of the backend named in `config`.
pub fn open_manager(config: &StorageConfig) -> Result<Arc<dyn StoreManager>> {
    match config.backend.as_str() {
        "inmemory" => Ok(Arc::new(InMemoryStoreManager::new())),
        other => Err(Error::Config(format!("unknown storage backend {:?}", other))),
    }
}

/// Outcome of a conditional (expected-value) write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpectedValueOutcome {
    /// The stored value matched and the new value was written.
    Applied,
    /// The stored value did not match; nothing was written.
    Conflict { current: Option<Bytes> },
}

impl ExpectedValueOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ExpectedValueOutcome::Applied)
    }
}

/// Additions and deletions for a single row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KcvMutation {
    pub additions: Vec<Entry>,
    pub deletions: Vec<Bytes>,
}

impl KcvMutation {
    pub fn new(additions: Vec<Entry>, deletions: Vec<Bytes>) -> Self {
        Self {
            additions,
            deletions,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.deletions.is_empty()
    }

    /// Add `entry`, cancelling any earlier deletion or addition of its column.
    pub fn addition(&mut self, entry: Entry) {
        self.deletions.retain(|c| *c != entry.column);
        self.additions.retain(|e| e.column != entry.column);
        self.additions.push(entry);
    }

    /// Delete `column`, cancelling any earlier addition of it.
    pub fn deletion(&mut self, column: Bytes) {
        self.additions.retain(|e| e.column != column);
        if !self.deletions.contains(&column) {
            self.deletions.push(column);
        }
    }

    /// Apply `other` after `self`.
    pub fn merge(&mut self, other: KcvMutation) {
        for column in other.deletions {
            self.deletion(column);
        }
        for entry in other.additions {
            self.addition(entry);
        }
    }
}

/// Buffered mutations: store name -> row key -> row mutation.
pub type StoreMutations = BTreeMap<String, BTreeMap<Bytes, KcvMutation>>;

/// Settings a store transaction is opened with.
#[derive(Debug, Clone, Default)]
pub struct StoreTxConfig {
    /// Resolution the caller's timestamps are expressed in
    pub resolution: TimestampResolution,
    /// Commit instant the backend should stamp writes with, if it supports it
    pub commit_time: Option<Timestamp>,
    /// Free-form label for log output
    pub label: Option<String>,
}

impl StoreTxConfig {
    pub fn new(resolution: TimestampResolution) -> Self {
        Self {
            resolution,
            ..Self::default()
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Backend-level transaction handle.
///
/// Backends without native transactions hand out a [`BaseTransaction`].
#[async_trait]
pub trait StoreTransaction: Send + Sync + fmt::Debug {
    fn config(&self) -> &StoreTxConfig;

    async fn commit(&self) -> Result<()>;

    async fn rollback(&self) -> Result<()>;
}

/// Store transaction for backends with no transactional state of their own.
#[derive(Debug)]
pub struct BaseTransaction {
    config: StoreTxConfig,
}

impl BaseTransaction {
    pub fn new(config: StoreTxConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl StoreTransaction for BaseTransaction {
    fn config(&self) -> &StoreTxConfig {
        &self.config
    }

    async fn commit(&self) -> Result<()> {
        trace!(label = ?self.config.label, "base transaction commit");
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        trace!(label = ?self.config.label, "base transaction rollback");
        Ok(())
    }
}

/// Capabilities a backend advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreFeatures {
    /// Rows can be scanned in key order
    pub ordered_scan: bool,
    /// Reads after a completed write on the same key observe that write
    pub key_consistent: bool,
    /// Backend provides its own locks, making claim locking unnecessary
    pub native_locking: bool,
    /// `mutate_many` is a real batch rather than a loop over rows
    pub batch_mutation: bool,
}

/// One ordered key-column-value store.
#[async_trait]
pub trait KeyColumnValueStore: Send + Sync {
    /// Store name
    fn name(&self) -> &str;

    /// Entries of one row whose columns fall in the slice, in column order.
    async fn get_slice(&self, query: &KeySliceQuery, txh: &dyn StoreTransaction) -> Result<EntryList>;

    /// Row keys in `range`, in order, that have at least one column in `slice`.
    async fn get_keys(
        &self,
        range: &KeyRange,
        slice: &SliceQuery,
        txh: &dyn StoreTransaction,
    ) -> Result<Vec<Bytes>>;

    /// Apply deletions then additions to one row, atomically for that row.
    async fn mutate(
        &self,
        key: &Bytes,
        additions: &[Entry],
        deletions: &[Bytes],
        txh: &dyn StoreTransaction,
    ) -> Result<()>;

    /// Write `value` to `(key, column)` only if the stored value equals
    /// `expected`, where `None` means the column must be absent.
    async fn acquire_lock(
        &self,
        key: &Bytes,
        column: &Bytes,
        expected: Option<&Bytes>,
        value: Bytes,
        txh: &dyn StoreTransaction,
    ) -> Result<ExpectedValueOutcome>;

    /// Release resources held by this store
    async fn close(&self) -> Result<()>;
}

/// Entry point to one backend: opens stores and starts transactions.
#[async_trait]
pub trait StoreManager: Send + Sync {
    /// Backend name, for log output
    fn name(&self) -> &str;

    fn features(&self) -> StoreFeatures;

    /// Open (creating if needed) the store called `name`.
    async fn open_database(&self, name: &str) -> Result<Arc<dyn KeyColumnValueStore>>;

    async fn begin_transaction(&self, config: StoreTxConfig) -> Result<Arc<dyn StoreTransaction>>;

    /// Apply buffered mutations across stores.
    ///
    /// Each row is applied atomically; there is no atomicity across rows.
    async fn mutate_many(&self, mutations: &StoreMutations, txh: &dyn StoreTransaction) -> Result<()> {
        for (store_name, rows) in mutations {
            let store = self.open_database(store_name).await?;
            for (key, mutation) in rows {
                if mutation.is_empty() {
                    continue;
                }
                store
                    .mutate(key, &mutation.additions, &mutation.deletions, txh)
                    .await?;
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()>;
}
