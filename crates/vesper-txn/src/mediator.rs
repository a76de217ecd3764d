//! Local lock mediator.
//!
//! Arbitrates lock ownership between transactions of the same process
//! before any claim reaches the backend:
//! - Exclusive, expiring grants per KeyColumn
//! - Re-entrant for the holding requester, extending (never shortening) the grant
//! - Expired grants are taken over by the next requester
//! - Sharded table so unrelated keys never contend

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use vesper_common::prelude::*;

/// Grant held on one KeyColumn.
#[derive(Debug, Clone)]
struct LockStatus {
    holder: RequesterId,
    acquired_at: Timestamp,
    expires_at: Timestamp,
}

impl LockStatus {
    fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at < now
    }
}

/// Mediator statistics.
#[derive(Debug, Clone, Default)]
pub struct MediatorStats {
    pub locks_granted: u64,
    pub locks_renewed: u64,
    pub locks_taken_over: u64,
    pub locks_denied: u64,
    pub locks_released: u64,
    pub locks_purged: u64,
}

/// Lock-free counters behind [`MediatorStats`].
#[derive(Debug, Default)]
struct StatCounters {
    granted: AtomicU64,
    renewed: AtomicU64,
    taken_over: AtomicU64,
    denied: AtomicU64,
    released: AtomicU64,
    purged: AtomicU64,
}

impl StatCounters {
    fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn snapshot(&self) -> MediatorStats {
        MediatorStats {
            locks_granted: self.granted.load(Ordering::Relaxed),
            locks_renewed: self.renewed.load(Ordering::Relaxed),
            locks_taken_over: self.taken_over.load(Ordering::Relaxed),
            locks_denied: self.denied.load(Ordering::Relaxed),
            locks_released: self.released.load(Ordering::Relaxed),
            locks_purged: self.purged.load(Ordering::Relaxed),
        }
    }
}

/// Process-local lock table for one lock namespace.
pub struct LocalLockMediator {
    /// Namespace, normally the lock store name
    name: String,
    clock: Arc<dyn TimestampProvider>,
    locks: DashMap<KeyColumn, LockStatus>,
    stats: StatCounters,
}

impl LocalLockMediator {
    pub fn new(name: impl Into<String>, clock: Arc<dyn TimestampProvider>) -> Self {
        Self {
            name: name.into(),
            clock,
            locks: DashMap::new(),
            stats: StatCounters::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Try to grant `kc` to `requester` until `expires_at`.
    ///
    /// Returns false only if another requester holds an unexpired grant.
    pub fn lock(&self, kc: &KeyColumn, requester: &RequesterId, expires_at: Timestamp) -> bool {
        let now = self.clock.now();
        match self.locks.entry(kc.clone()) {
            MapEntry::Vacant(vacant) => {
                vacant.insert(LockStatus {
                    holder: requester.clone(),
                    acquired_at: now,
                    expires_at,
                });
                StatCounters::bump(&self.stats.granted, 1);
                trace!(mediator = %self.name, %kc, %requester, "Local lock granted");
                true
            }
            MapEntry::Occupied(mut occupied) => {
                let status = occupied.get_mut();
                if status.holder == *requester {
                    status.expires_at = status.expires_at.max(expires_at);
                    StatCounters::bump(&self.stats.renewed, 1);
                    true
                } else if status.is_expired(now) {
                    debug!(
                        mediator = %self.name,
                        %kc,
                        previous = %status.holder,
                        %requester,
                        "Taking over expired local lock"
                    );
                    *status = LockStatus {
                        holder: requester.clone(),
                        acquired_at: now,
                        expires_at,
                    };
                    StatCounters::bump(&self.stats.taken_over, 1);
                    true
                } else {
                    trace!(
                        mediator = %self.name,
                        %kc,
                        holder = %status.holder,
                        %requester,
                        "Local lock denied"
                    );
                    StatCounters::bump(&self.stats.denied, 1);
                    false
                }
            }
        }
    }

    /// Release `kc` if `requester` holds it. Returns whether anything was
    /// released.
    pub fn unlock(&self, kc: &KeyColumn, requester: &RequesterId) -> bool {
        let released = self
            .locks
            .remove_if(kc, |_, status| status.holder == *requester)
            .is_some();
        if released {
            StatCounters::bump(&self.stats.released, 1);
            trace!(mediator = %self.name, %kc, %requester, "Local lock released");
        }
        released
    }

    /// Current holder of `kc` and its expiration, expired or not.
    pub fn holder(&self, kc: &KeyColumn) -> Option<(RequesterId, Timestamp)> {
        self.locks
            .get(kc)
            .map(|status| (status.holder.clone(), status.expires_at))
    }

    /// Whether `requester` holds an unexpired grant on `kc`.
    pub fn is_held_by(&self, kc: &KeyColumn, requester: &RequesterId) -> bool {
        let now = self.clock.now();
        self.locks
            .get(kc)
            .map_or(false, |status| status.holder == *requester && !status.is_expired(now))
    }

    /// How long `kc` has been held by its current holder.
    pub fn held_for(&self, kc: &KeyColumn) -> Option<Duration> {
        let now = self.clock.now();
        self.locks.get(kc).map(|status| now.duration_since(status.acquired_at))
    }

    /// Number of entries, including expired ones not yet purged
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Drop every expired entry. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut purged = 0;
        self.locks.retain(|_, status| {
            let keep = !status.is_expired(now);
            if !keep {
                purged += 1;
            }
            keep
        });
        if purged > 0 {
            StatCounters::bump(&self.stats.purged, purged as u64);
        }
        purged
    }

    /// Periodically purge expired entries until the mediator is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let mediator = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(mediator) = mediator.upgrade() else {
                    break;
                };
                let purged = mediator.purge_expired();
                if purged > 0 {
                    debug!(mediator = %mediator.name, purged, "Purged expired local locks");
                }
            }
        })
    }

    pub fn stats(&self) -> MediatorStats {
        self.stats.snapshot()
    }
}

impl std::fmt::Debug for LocalLockMediator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalLockMediator")
            .field("name", &self.name)
            .field("locks", &self.locks.len())
            .finish()
    }
}

/// One mediator per lock namespace.
///
/// Providers sharing a registry share local arbitration; a registry is
/// created explicitly and handed to every provider of the process.
pub struct MediatorRegistry {
    clock: Arc<dyn TimestampProvider>,
    mediators: DashMap<String, Arc<LocalLockMediator>>,
}

impl MediatorRegistry {
    pub fn new(clock: Arc<dyn TimestampProvider>) -> Self {
        Self {
            clock,
            mediators: DashMap::new(),
        }
    }

    /// Mediator for `namespace`, created on first use.
    pub fn get_or_create(&self, namespace: &str) -> Arc<LocalLockMediator> {
        self.mediators
            .entry(namespace.to_string())
            .or_insert_with(|| {
                debug!(namespace, "Creating local lock mediator");
                Arc::new(LocalLockMediator::new(namespace, self.clock.clone()))
            })
            .clone()
    }

    pub fn get(&self, namespace: &str) -> Option<Arc<LocalLockMediator>> {
        self.mediators.get(namespace).map(|m| m.clone())
    }

    pub fn remove(&self, namespace: &str) -> Option<Arc<LocalLockMediator>> {
        self.mediators.remove(namespace).map(|(_, m)| m)
    }

    pub fn namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self.mediators.iter().map(|m| m.key().clone()).collect();
        names.sort();
        names
    }

    /// Purge expired entries of every mediator.
    pub fn purge_expired(&self) -> usize {
        self.mediators.iter().map(|m| m.purge_expired()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vesper_common::testing::fixtures::{property_cell, requester};
    use vesper_common::testing::ManualClock;

    fn mediator() -> (Arc<ManualClock>, LocalLockMediator) {
        let clock = Arc::new(ManualClock::new(TimestampResolution::Milli));
        let mediator = LocalLockMediator::new("edgestore_lock_", clock.clone());
        (clock, mediator)
    }

    fn after(clock: &ManualClock, ms: u64) -> Timestamp {
        clock.now().saturating_add(Duration::from_millis(ms))
    }

    #[test]
    fn test_lock_exclusive() {
        let (clock, m) = mediator();
        let kc = property_cell(1, "name");
        assert!(m.lock(&kc, &requester(1), after(&clock, 1000)));
        assert!(!m.lock(&kc, &requester(2), after(&clock, 1000)));
        assert!(m.is_held_by(&kc, &requester(1)));
        assert!(!m.is_held_by(&kc, &requester(2)));

        let stats = m.stats();
        assert_eq!(stats.locks_granted, 1);
        assert_eq!(stats.locks_denied, 1);
    }

    #[test]
    fn test_relock_extends_never_shortens() {
        let (clock, m) = mediator();
        let kc = property_cell(1, "name");
        let long = after(&clock, 5000);
        assert!(m.lock(&kc, &requester(1), long));
        assert!(m.lock(&kc, &requester(1), after(&clock, 10)));
        assert_eq!(m.holder(&kc), Some((requester(1), long)));

        let longer = after(&clock, 9000);
        assert!(m.lock(&kc, &requester(1), longer));
        assert_eq!(m.holder(&kc).map(|(_, e)| e), Some(longer));
        assert_eq!(m.stats().locks_renewed, 2);
    }

    #[test]
    fn test_expired_lock_taken_over() {
        let (clock, m) = mediator();
        let kc = property_cell(1, "name");
        assert!(m.lock(&kc, &requester(1), after(&clock, 100)));

        clock.advance(Duration::from_millis(100));
        // Expiration is exclusive: still held at exactly expires_at
        assert!(!m.lock(&kc, &requester(2), after(&clock, 100)));

        clock.advance(Duration::from_millis(1));
        assert!(m.lock(&kc, &requester(2), after(&clock, 100)));
        assert_eq!(m.holder(&kc).map(|(h, _)| h), Some(requester(2)));
        assert_eq!(m.stats().locks_taken_over, 1);
    }

    #[test]
    fn test_unlock_only_by_holder() {
        let (clock, m) = mediator();
        let kc = property_cell(1, "name");
        assert!(m.lock(&kc, &requester(1), after(&clock, 1000)));
        assert!(!m.unlock(&kc, &requester(2)));
        assert!(m.is_held_by(&kc, &requester(1)));
        assert!(m.unlock(&kc, &requester(1)));
        assert!(m.is_empty());
        assert!(!m.unlock(&kc, &requester(1)));
        assert!(m.lock(&kc, &requester(2), after(&clock, 1000)));
    }

    #[test]
    fn test_unrelated_keys_independent() {
        let (clock, m) = mediator();
        assert!(m.lock(&property_cell(1, "name"), &requester(1), after(&clock, 1000)));
        assert!(m.lock(&property_cell(2, "name"), &requester(2), after(&clock, 1000)));
        assert!(m.lock(&property_cell(1, "age"), &requester(3), after(&clock, 1000)));
        assert_eq!(m.len(), 3);
    }

    #[test]
    fn test_purge_expired() {
        let (clock, m) = mediator();
        m.lock(&property_cell(1, "name"), &requester(1), after(&clock, 10));
        m.lock(&property_cell(2, "name"), &requester(1), after(&clock, 1000));
        clock.advance(Duration::from_millis(11));
        assert_eq!(m.purge_expired(), 1);
        assert_eq!(m.len(), 1);
        assert_eq!(m.stats().locks_purged, 1);
        assert_eq!(m.held_for(&property_cell(2, "name")), Some(Duration::from_millis(11)));
    }

    #[test]
    fn test_end_to_end_expiry_window() {
        let (clock, m) = mediator();
        let kc = KeyColumn::new("v1", "p_name");
        let t0 = clock.now();
        assert!(m.lock(&kc, &requester(b'A'), t0.saturating_add(Duration::from_millis(1000))));

        clock.set(t0.saturating_add(Duration::from_millis(10)));
        assert!(!m.lock(&kc, &requester(b'B'), after(&clock, 1000)));

        clock.set(t0.saturating_add(Duration::from_millis(1001)));
        assert!(m.lock(&kc, &requester(b'B'), after(&clock, 1000)));
    }

    #[test]
    fn test_concurrent_lock_single_winner() {
        let (clock, m) = mediator();
        let m = Arc::new(m);
        let kc = property_cell(7, "name");
        let expires = after(&clock, 60_000);

        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let (m, kc) = (m.clone(), kc.clone());
                std::thread::spawn(move || m.lock(&kc, &requester(i), expires))
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|granted| *granted)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_stats_under_parallel_distinct_keys() {
        let (clock, m) = mediator();
        let m = Arc::new(m);
        let expires = after(&clock, 60_000);

        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let m = m.clone();
                std::thread::spawn(move || {
                    for v in 0..250u64 {
                        let kc = property_cell(u64::from(i) * 1_000 + v, "name");
                        assert!(m.lock(&kc, &requester(i), expires));
                        assert!(m.unlock(&kc, &requester(i)));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let stats = m.stats();
        assert_eq!(stats.locks_granted, 2_000);
        assert_eq!(stats.locks_released, 2_000);
        assert_eq!(stats.locks_denied, 0);
        assert!(m.is_empty());
    }

    #[tokio::test]
    async fn test_sweeper_purges_and_stops() {
        let (clock, m) = mediator();
        let m = Arc::new(m);
        m.lock(&property_cell(1, "name"), &requester(1), after(&clock, 1));
        clock.advance(Duration::from_millis(5));

        let handle = m.spawn_sweeper(Duration::from_millis(1));
        for _ in 0..100 {
            if m.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(m.is_empty());

        drop(m);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_registry_one_mediator_per_namespace() {
        let clock: Arc<dyn TimestampProvider> = Arc::new(ManualClock::default());
        let registry = MediatorRegistry::new(clock);
        let a = registry.get_or_create("edgestore_lock_");
        let b = registry.get_or_create("edgestore_lock_");
        let c = registry.get_or_create("graphindex_lock_");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.namespaces(), vec!["edgestore_lock_", "graphindex_lock_"]);
        assert!(registry.remove("graphindex_lock_").is_some());
        assert!(registry.get("graphindex_lock_").is_none());
    }
}
