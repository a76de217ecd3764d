//! Transaction provider: wires a store manager, clock, mediators and schema
//! consistency into expected-value-checking transactions.

use crate::consistency::{ConsistencyResolver, SchemaConsistency};
use crate::locker::ConsistentKeyLocker;
use crate::mediator::MediatorRegistry;
use crate::transaction::ExpectedValueCheckingTransaction;
use dashmap::DashMap;
use std::sync::Arc;
use vesper_common::prelude::*;
use vesper_common::utils::RequesterIdGenerator;
use vesper_storage::{KeyColumnValueStore, StoreManager, StoreTxConfig};

/// A data store paired with the locker of its lock store.
pub struct ExpectedValueCheckingStore {
    name: String,
    data: Arc<dyn KeyColumnValueStore>,
    locker: ConsistentKeyLocker,
}

impl ExpectedValueCheckingStore {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self) -> &Arc<dyn KeyColumnValueStore> {
        &self.data
    }

    pub fn locker(&self) -> &ConsistentKeyLocker {
        &self.locker
    }
}

struct ProviderInner {
    manager: Arc<dyn StoreManager>,
    config: TransactionConfig,
    storage: StorageConfig,
    clock: Arc<dyn TimestampProvider>,
    mediators: Arc<MediatorRegistry>,
    resolver: Arc<dyn ConsistencyResolver>,
    ids: RequesterIdGenerator,
    stores: DashMap<String, Arc<ExpectedValueCheckingStore>>,
}

/// Starts transactions against one backend. Cheap to clone.
#[derive(Clone)]
pub struct TransactionProvider {
    inner: Arc<ProviderInner>,
}

impl TransactionProvider {
    pub fn builder(manager: Arc<dyn StoreManager>) -> TransactionProviderBuilder {
        TransactionProviderBuilder::new(manager)
    }

    /// Begin a transaction with a fresh requester id.
    pub async fn begin(&self) -> Result<ExpectedValueCheckingTransaction> {
        let requester = self.inner.ids.next_id();
        let tx_config = StoreTxConfig::new(self.inner.config.timestamp_resolution)
            .with_label(requester.to_string());
        let store_tx = self.inner.manager.begin_transaction(tx_config).await?;
        trace!(%requester, "Transaction started");
        Ok(ExpectedValueCheckingTransaction::new(self.clone(), requester, store_tx))
    }

    /// Data store `name` and its lock store, opened once and cached.
    pub async fn open_store(&self, name: &str) -> Result<Arc<ExpectedValueCheckingStore>> {
        let cached = self.inner.stores.get(name).map(|s| s.clone());
        if let Some(store) = cached {
            return Ok(store);
        }

        let data = self.inner.manager.open_database(name).await?;
        let lock_name = self.inner.storage.lock_store_name(name);
        let lock_store = self.inner.manager.open_database(&lock_name).await?;
        let mediator = self.inner.mediators.get_or_create(&lock_name);
        let store = Arc::new(ExpectedValueCheckingStore {
            name: name.to_string(),
            data,
            locker: ConsistentKeyLocker::new(
                lock_store,
                mediator,
                self.inner.clock.clone(),
                self.inner.config.clone(),
            ),
        });
        debug!(store = name, lock_store = %lock_name, "Opened expected-value-checking store");
        Ok(self
            .inner
            .stores
            .entry(name.to_string())
            .or_insert(store)
            .clone())
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.inner.config
    }

    pub fn clock(&self) -> &Arc<dyn TimestampProvider> {
        &self.inner.clock
    }

    pub fn manager(&self) -> &Arc<dyn StoreManager> {
        &self.inner.manager
    }

    pub fn mediators(&self) -> &Arc<MediatorRegistry> {
        &self.inner.mediators
    }

    pub fn resolver(&self) -> &Arc<dyn ConsistencyResolver> {
        &self.inner.resolver
    }
}

/// Builder for [`TransactionProvider`].
pub struct TransactionProviderBuilder {
    manager: Arc<dyn StoreManager>,
    config: TransactionConfig,
    storage: StorageConfig,
    clock: Option<Arc<dyn TimestampProvider>>,
    mediators: Option<Arc<MediatorRegistry>>,
    resolver: Option<Arc<dyn ConsistencyResolver>>,
    node: Option<[u8; 16]>,
}

impl TransactionProviderBuilder {
    pub fn new(manager: Arc<dyn StoreManager>) -> Self {
        Self {
            manager,
            config: TransactionConfig::default(),
            storage: StorageConfig::default(),
            clock: None,
            mediators: None,
            resolver: None,
            node: None,
        }
    }

    pub fn config(mut self, config: TransactionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn TimestampProvider>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Share local lock arbitration with other providers of this process.
    pub fn mediators(mut self, mediators: Arc<MediatorRegistry>) -> Self {
        self.mediators = Some(mediators);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn ConsistencyResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Fixed node part of requester ids instead of a random one.
    pub fn node(mut self, node: [u8; 16]) -> Self {
        self.node = Some(node);
        self
    }

    pub fn build(self) -> Result<TransactionProvider> {
        let mut errors = Vec::new();
        if let Err(e) = self.config.validate() {
            errors.extend(e);
        }
        if let Err(e) = self.storage.validate() {
            errors.extend(e);
        }
        if !errors.is_empty() {
            return Err(Error::Config(errors.join("; ")));
        }

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemTimestamps::new(self.config.timestamp_resolution)));
        if clock.resolution() != self.config.timestamp_resolution {
            warn!(
                clock = %clock.resolution(),
                configured = %self.config.timestamp_resolution,
                "Clock resolution differs from the configured timestamp resolution"
            );
        }
        let mediators = self
            .mediators
            .unwrap_or_else(|| Arc::new(MediatorRegistry::new(clock.clone())));
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(SchemaConsistency::new()));
        let ids = match self.node {
            Some(node) => RequesterIdGenerator::with_node(node),
            None => RequesterIdGenerator::new(),
        };

        info!(
            backend = self.manager.name(),
            lock_expiration = ?self.config.lock_expiration,
            lock_wait = ?self.config.lock_wait,
            "Transaction provider ready"
        );
        Ok(TransactionProvider {
            inner: Arc::new(ProviderInner {
                manager: self.manager,
                config: self.config,
                storage: self.storage,
                clock,
                mediators,
                resolver,
                ids,
                stores: DashMap::new(),
            }),
        })
    }
}
