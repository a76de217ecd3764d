//! Configuration namespace persisted in a KCV store.
//!
//! All settings of one namespace live in a single row keyed by the namespace
//! identifier; each setting is one column holding a JSON-encoded value.
//! Every access runs through [`BackendOperation`] so temporary backend
//! failures are retried.

use crate::backend_op::{BackendOperation, ManagerTxProvider, TransactionalProvider};
use crate::{ExpectedValueOutcome, KeyColumnValueStore, StoreManager, StoreTxConfig};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use vesper_common::prelude::*;

/// Typed key/value settings backed by one KCV row.
pub struct KcvsConfiguration {
    provider: Arc<dyn TransactionalProvider>,
    store: Arc<dyn KeyColumnValueStore>,
    row: Bytes,
    retry: RetryConfig,
}

impl KcvsConfiguration {
    pub fn new(
        provider: Arc<dyn TransactionalProvider>,
        store: Arc<dyn KeyColumnValueStore>,
        identifier: &str,
        retry: RetryConfig,
    ) -> Self {
        Self {
            provider,
            store,
            row: Bytes::copy_from_slice(identifier.as_bytes()),
            retry,
        }
    }

    /// Namespace `identifier` in the system store named by `config`.
    pub async fn open_system(
        manager: Arc<dyn StoreManager>,
        config: &StorageConfig,
        identifier: &str,
        retry: RetryConfig,
    ) -> Result<Self> {
        let store = manager.open_database(&config.system_store).await?;
        let provider = Arc::new(ManagerTxProvider::new(manager, StoreTxConfig::default()));
        Ok(Self::new(provider, store, identifier, retry))
    }

    fn column(key: &str) -> Result<Bytes> {
        if key.is_empty() {
            return Err(Error::invalid_argument("configuration key must not be empty"));
        }
        Ok(Bytes::copy_from_slice(key.as_bytes()))
    }

    async fn read_raw(&self, column: &Bytes) -> Result<Option<Bytes>> {
        let query = KeySliceQuery::new(self.row.clone(), SliceQuery::column(column));
        let store = &self.store;
        let entries = BackendOperation::execute_in_tx(
            self.provider.as_ref(),
            &self.retry,
            "config.get",
            |tx| {
                let query = &query;
                async move { store.get_slice(query, tx.as_ref()).await }
            },
        )
        .await?;
        Ok(entries.into_iter().next().map(|e| e.value))
    }

    /// Read and decode `key`, or `None` if unset.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let column = Self::column(key)?;
        match self.read_raw(&column).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Unconditionally store `value` under `key`.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let column = Self::column(key)?;
        let entry = Entry::new(column, serde_json::to_vec(value)?);
        let (store, row) = (&self.store, &self.row);
        BackendOperation::execute_in_tx(self.provider.as_ref(), &self.retry, "config.set", |tx| {
            let additions = std::slice::from_ref(&entry);
            async move { store.mutate(row, additions, &[], tx.as_ref()).await }
        })
        .await?;
        debug!(key, "Configuration value set");
        Ok(())
    }

    /// Store `value` under `key` only if the current value equals `expected`
    /// (`None` meaning unset). Returns whether the write happened.
    pub async fn set_if<T, E>(&self, key: &str, value: &T, expected: Option<&E>) -> Result<bool>
    where
        T: Serialize + ?Sized,
        E: Serialize + ?Sized,
    {
        let column = Self::column(key)?;
        let new_value = Bytes::from(serde_json::to_vec(value)?);
        let expected = match expected {
            Some(e) => Some(Bytes::from(serde_json::to_vec(e)?)),
            None => None,
        };
        let (store, row) = (&self.store, &self.row);
        let outcome = BackendOperation::execute_in_tx(
            self.provider.as_ref(),
            &self.retry,
            "config.set_if",
            |tx| {
                let (column, expected, new_value) = (&column, expected.as_ref(), new_value.clone());
                async move {
                    store
                        .acquire_lock(row, column, expected, new_value, tx.as_ref())
                        .await
                }
            },
        )
        .await?;
        match outcome {
            ExpectedValueOutcome::Applied => Ok(true),
            // A retried attempt may find the value its predecessor wrote.
            ExpectedValueOutcome::Conflict { current } => Ok(current.as_ref() == Some(&new_value)),
        }
    }

    /// Remove `key`; removing an unset key is not an error.
    pub async fn remove(&self, key: &str) -> Result<()> {
        let column = Self::column(key)?;
        let (store, row) = (&self.store, &self.row);
        BackendOperation::execute_in_tx(self.provider.as_ref(), &self.retry, "config.remove", |tx| {
            let deletions = std::slice::from_ref(&column);
            async move { store.mutate(row, &[], deletions, tx.as_ref()).await }
        })
        .await
    }

    /// Keys starting with `prefix`, in order.
    pub async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let query = KeySliceQuery::new(self.row.clone(), SliceQuery::prefix(prefix.as_bytes()));
        let store = &self.store;
        let entries = BackendOperation::execute_in_tx(
            self.provider.as_ref(),
            &self.retry,
            "config.keys",
            |tx| {
                let query = &query;
                async move { store.get_slice(query, tx.as_ref()).await }
            },
        )
        .await?;
        entries
            .into_iter()
            .map(|e| {
                String::from_utf8(e.column.to_vec())
                    .map_err(|err| Error::Serialization(format!("non UTF-8 configuration key: {}", err)))
            })
            .collect()
    }

    pub async fn close(&self) -> Result<()> {
        self.provider.close().await
    }
}
