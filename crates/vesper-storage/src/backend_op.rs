//! Retry harness for backend operations.
//!
//! Temporary failures (see [`Error::is_temporary`]) are retried with
//! exponential backoff up to `max_retries` times, after which the last error
//! is returned unchanged. Permanent failures are returned immediately.

use crate::{StoreManager, StoreTransaction, StoreTxConfig};
use std::future::Future;
use std::sync::Arc;
use vesper_common::prelude::*;

/// Something that can open short-lived store transactions.
#[async_trait]
pub trait TransactionalProvider: Send + Sync {
    async fn open_tx(&self) -> Result<Arc<dyn StoreTransaction>>;

    async fn close(&self) -> Result<()>;
}

/// Provider opening plain transactions on a store manager.
pub struct ManagerTxProvider {
    manager: Arc<dyn StoreManager>,
    config: StoreTxConfig,
}

impl ManagerTxProvider {
    pub fn new(manager: Arc<dyn StoreManager>, config: StoreTxConfig) -> Self {
        Self { manager, config }
    }
}

#[async_trait]
impl TransactionalProvider for ManagerTxProvider {
    async fn open_tx(&self) -> Result<Arc<dyn StoreTransaction>> {
        self.manager.begin_transaction(self.config.clone()).await
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Retry bookkeeping for one logical operation.
struct Attempts<'a> {
    policy: &'a RetryConfig,
    operation: &'a str,
    retries: u32,
}

impl<'a> Attempts<'a> {
    fn new(policy: &'a RetryConfig, operation: &'a str) -> Self {
        Self {
            policy,
            operation,
            retries: 0,
        }
    }

    /// Sleep before the next attempt, or hand back `err` if no attempt is left.
    async fn backoff_or_fail(&mut self, err: Error) -> Result<()> {
        if !err.is_temporary() {
            return Err(err);
        }
        if self.retries >= self.policy.max_retries {
            warn!(
                operation = self.operation,
                retries = self.retries,
                error = %err,
                "Backend operation failed, retries exhausted"
            );
            return Err(err);
        }
        self.retries += 1;
        let delay = self.policy.backoff(self.retries);
        debug!(
            operation = self.operation,
            retry = self.retries,
            delay = ?delay,
            error = %err,
            "Temporary backend failure, retrying"
        );
        tokio::time::sleep(delay).await;
        Ok(())
    }

    fn succeeded(&self) {
        if self.retries > 0 {
            debug!(
                operation = self.operation,
                retries = self.retries,
                "Backend operation succeeded after retries"
            );
        }
    }
}

/// Entry points for running closures under a [`RetryConfig`].
pub struct BackendOperation;

impl BackendOperation {
    /// Run `f` until it succeeds, fails permanently, or retries run out.
    pub async fn execute<T, F, Fut>(policy: &RetryConfig, operation: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = Attempts::new(policy, operation);
        loop {
            match f().await {
                Ok(value) => {
                    attempts.succeeded();
                    return Ok(value);
                }
                Err(e) => attempts.backoff_or_fail(e).await?,
            }
        }
    }

    /// Like [`BackendOperation::execute`], but each attempt runs inside a
    /// fresh store transaction that is committed on success and rolled back
    /// on failure.
    pub async fn execute_in_tx<T, F, Fut>(
        provider: &dyn TransactionalProvider,
        policy: &RetryConfig,
        operation: &str,
        mut f: F,
    ) -> Result<T>
    where
        F: FnMut(Arc<dyn StoreTransaction>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = Attempts::new(policy, operation);
        loop {
            let outcome = match provider.open_tx().await {
                Ok(tx) => match f(tx.clone()).await {
                    Ok(value) => tx.commit().await.map(|_| value),
                    Err(e) => {
                        if let Err(rollback_err) = tx.rollback().await {
                            debug!(operation, error = %rollback_err, "Rollback after failed attempt failed");
                        }
                        Err(e)
                    }
                },
                Err(e) => Err(e),
            };
            match outcome {
                Ok(value) => {
                    attempts.succeeded();
                    return Ok(value);
                }
                Err(e) => attempts.backoff_or_fail(e).await?,
            }
        }
    }
}
