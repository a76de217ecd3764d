//! Lock contention drill.
//!
//! Several simulated processes, each with its own transaction provider and
//! mediator registry, race read-increment-write transactions on one counter
//! cell of a shared backend. With LOCK consistency every committed
//! increment must be visible in the final counter.
//!
//! Each simulated process registers itself in the system store under
//! `instance.<node>.<n>` for the duration of the drill.

use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use vesper_common::prelude::*;
use vesper_storage::{KcvsConfiguration, StoreManager};
use vesper_txn::{SchemaConsistency, TransactionProvider};

const STORE: &str = "edgestore";
const INSTANCES: &str = "global";

/// Drill parameters.
#[derive(Debug, Clone)]
pub struct ContendOptions {
    /// Simulated processes sharing the backend
    pub processes: usize,
    /// Concurrent transactions per round
    pub workers: usize,
    pub rounds: usize,
    pub consistency: ConsistencyModifier,
}

impl Default for ContendOptions {
    fn default() -> Self {
        Self {
            processes: 2,
            workers: 4,
            rounds: 10,
            consistency: ConsistencyModifier::Lock,
        }
    }
}

/// Outcome of a drill.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContendReport {
    pub attempts: u64,
    pub committed: u64,
    /// Transactions rejected by the locking protocol
    pub lock_failures: u64,
    /// Any other failure
    pub errors: u64,
    /// Counter value after the last round
    pub final_value: u64,
    pub elapsed: Duration,
}

impl ContendReport {
    /// Committed increments missing from the final counter.
    pub fn lost_updates(&self) -> u64 {
        self.committed.saturating_sub(self.final_value)
    }
}

enum Outcome {
    Committed,
    LockFailure,
    Failed,
}

/// Run the drill against a fresh backend of the configured kind.
pub async fn run(config: &VesperConfig, options: &ContendOptions) -> Result<ContendReport> {
    let manager = vesper_storage::open_manager(&config.storage)?;
    run_on(manager, config, options).await
}

/// Run the drill against `manager`.
pub async fn run_on(
    manager: Arc<dyn StoreManager>,
    config: &VesperConfig,
    options: &ContendOptions,
) -> Result<ContendReport> {
    if options.processes == 0 || options.workers == 0 {
        return Err(Error::invalid_argument("processes and workers must be > 0"));
    }

    let schema = Arc::new(SchemaConsistency::new().with_column("counter", options.consistency));
    let providers = (0..options.processes)
        .map(|_| {
            TransactionProvider::builder(manager.clone())
                .config(config.transaction.clone())
                .storage(config.storage.clone())
                .resolver(schema.clone())
                .build()
        })
        .collect::<Result<Vec<_>>>()?;

    let instances = KcvsConfiguration::open_system(
        manager.clone(),
        &config.storage,
        INSTANCES,
        config.transaction.retry.clone(),
    )
    .await?;
    let names = register(&instances, &config.node_name, &providers).await?;
    let report = drill(&providers, options).await;
    for name in &names {
        if let Err(e) = instances.remove(name).await {
            warn!(instance = %name, error = %e, "Failed to deregister drill instance");
        }
    }
    report
}

/// Register one instance per provider; fails if a name is already taken.
async fn register(
    instances: &KcvsConfiguration,
    node_name: &str,
    providers: &[TransactionProvider],
) -> Result<Vec<String>> {
    let mut names: Vec<String> = Vec::with_capacity(providers.len());
    for (n, provider) in providers.iter().enumerate() {
        let name = format!("instance.{}.{}", node_name, n);
        let started_at = provider.clock().now().as_nanos();
        if !instances.set_if(&name, &started_at, None::<&u64>).await? {
            for taken in &names {
                let _ = instances.remove(taken).await;
            }
            return Err(Error::Config(format!("{} is already registered", name)));
        }
        names.push(name);
    }
    debug!(instances = names.len(), "Registered drill instances");
    Ok(names)
}

async fn drill(providers: &[TransactionProvider], options: &ContendOptions) -> Result<ContendReport> {
    let cell = KeyColumn::new("drill", "counter");
    let mut report = ContendReport::default();
    let started = Instant::now();

    for round in 0..options.rounds {
        let mut tasks = JoinSet::new();
        for worker in 0..options.workers {
            let provider = providers[worker % providers.len()].clone();
            let cell = cell.clone();
            let consistency = options.consistency;
            tasks.spawn(async move { increment(&provider, &cell, consistency).await });
        }

        while let Some(joined) = tasks.join_next().await {
            report.attempts += 1;
            match joined {
                Ok(Outcome::Committed) => report.committed += 1,
                Ok(Outcome::LockFailure) => report.lock_failures += 1,
                Ok(Outcome::Failed) => report.errors += 1,
                Err(e) => {
                    warn!(round, error = %e, "Drill task panicked");
                    report.errors += 1;
                }
            }
        }
        debug!(round, committed = report.committed, "Drill round finished");
    }

    let reader = providers[0].begin().await?;
    report.final_value = read_counter(&reader, &cell, options.consistency)
        .await?
        .map(|v| decode_counter(&v))
        .unwrap_or(0);
    report.elapsed = started.elapsed();

    info!(
        attempts = report.attempts,
        committed = report.committed,
        lock_failures = report.lock_failures,
        errors = report.errors,
        final_value = report.final_value,
        "Contention drill finished"
    );
    Ok(report)
}

async fn increment(provider: &TransactionProvider, cell: &KeyColumn, consistency: ConsistencyModifier) -> Outcome {
    let result = async {
        let mut tx = provider.begin().await?;
        let current = read_counter(&tx, cell, consistency).await?;
        if consistency.requires_lock() {
            tx.acquire_lock(STORE, cell, current.clone()).await?;
        }
        let next = current.as_deref().map(decode_counter).unwrap_or(0) + 1;
        tx.mutate(STORE, cell.clone(), Some(Bytes::copy_from_slice(&next.to_be_bytes())))
            .await?;
        tx.commit().await
    }
    .await;

    match result {
        Ok(()) => Outcome::Committed,
        Err(e) if e.is_lock_failure() => {
            trace!(code = e.code(), "Increment rejected");
            Outcome::LockFailure
        }
        Err(e) => {
            warn!(error = %e, "Increment failed");
            Outcome::Failed
        }
    }
}

async fn read_counter(
    tx: &vesper_txn::ExpectedValueCheckingTransaction,
    cell: &KeyColumn,
    consistency: ConsistencyModifier,
) -> Result<Option<Bytes>> {
    match consistency {
        ConsistencyModifier::Fork => Ok(tx.read_forked(STORE, cell).await?.value().cloned()),
        _ => Ok(tx
            .get_slice(STORE, &KeySliceQuery::cell(cell))
            .await?
            .into_iter()
            .next()
            .map(|e| e.value)),
    }
}

fn decode_counter(bytes: &[u8]) -> u64 {
    <[u8; 8]>::try_from(bytes).map(u64::from_be_bytes).unwrap_or(0)
}
