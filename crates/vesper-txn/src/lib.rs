//! # Vesper Transaction
//!
//! Transactions over non-transactional key-column-value backends:
//! - Local lock mediation between transactions of one process
//! - Claim-based distributed locks with a settle delay and expiration
//! - Expected-value checks before buffered mutations are flushed
//! - FORK consistency: versioned cells resolved at read time
//!
//! A [`TransactionProvider`] wraps a store manager; each
//! [`ExpectedValueCheckingTransaction`] it begins buffers mutations, locks
//! cells according to their [`ConsistencyModifier`](vesper_common::types::ConsistencyModifier)
//! and verifies every lock before anything reaches the backend.

pub mod claim;
pub mod consistency;
pub mod fork;
pub mod locker;
pub mod mediator;
pub mod provider;
pub mod transaction;

// Re-export key types for convenience
pub use claim::{AuditLockEntry, LockClaim};
pub use consistency::{ConsistencyResolver, SchemaConsistency};
pub use fork::{ForkColumn, ForkVersion, ForkedValue, VersionId};
pub use locker::ConsistentKeyLocker;
pub use mediator::{LocalLockMediator, MediatorRegistry, MediatorStats};
pub use provider::{ExpectedValueCheckingStore, TransactionProvider, TransactionProviderBuilder};
pub use transaction::{ExpectedValueCheckingTransaction, TransactionState};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(TransactionState::Open.to_string(), "OPEN");
        assert_eq!(TransactionState::RolledBack.to_string(), "ROLLED_BACK");
        assert!(TransactionState::Committed.is_terminal());
        assert!(!TransactionState::Verifying.is_terminal());
    }
}
