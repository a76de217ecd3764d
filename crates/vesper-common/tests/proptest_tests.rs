//! Property-based tests for Vesper common types
//!
//! Uses proptest to verify invariants across randomized inputs:
//! - Resolution conversions never move an instant forward or lose more than one unit
//! - Lock keys are unique per cell
//! - Prefix slices contain exactly the columns with that prefix
//! - Error codes are stable identifiers

use proptest::prelude::*;
use std::time::Duration;
use vesper_common::config::{TransactionConfig, VesperConfig};
use vesper_common::error::*;
use vesper_common::time::{Timestamp, TimestampResolution};
use vesper_common::types::{KeyColumn, SliceQuery};

fn arbitrary_resolution() -> impl Strategy<Value = TimestampResolution> {
    prop_oneof![
        Just(TimestampResolution::Nano),
        Just(TimestampResolution::Micro),
        Just(TimestampResolution::Milli),
    ]
}

fn arbitrary_error() -> impl Strategy<Value = Error> {
    prop_oneof![
        any::<String>().prop_map(|s| Error::Storage(StorageError::BackendUnavailable(s))),
        any::<String>().prop_map(|s| Error::Storage(StorageError::PermanentFailure(s))),
        any::<String>().prop_map(|s| Error::Storage(StorageError::Closed(s))),
        any::<String>().prop_map(|s| Error::Transaction(TransactionError::LocalLockContention(s))),
        any::<String>().prop_map(|s| Error::Transaction(TransactionError::LockConflict(s))),
        any::<String>().prop_map(|s| Error::Transaction(TransactionError::ExpirationRaceAborted(s))),
        any::<String>().prop_map(|s| Error::Transaction(TransactionError::ExpectedValueMismatch(s))),
        any::<String>().prop_map(Error::Internal),
        any::<String>().prop_map(Error::Config),
        any::<String>().prop_map(Error::Serialization),
        any::<String>().prop_map(Error::InvalidArgument),
        any::<String>().prop_map(Error::Timeout),
        any::<String>().prop_map(Error::Cancelled),
        (any::<String>(), any::<String>()).prop_map(|(a, b)| Error::NotFound(a, b)),
    ]
}

proptest! {
    /// Converting to native units and back truncates by less than one unit.
    #[test]
    fn native_round_trip_truncates(nanos in any::<u64>(), res in arbitrary_resolution()) {
        let ts = Timestamp::from_nanos(nanos);
        let back = res.from_native(res.to_native(ts));
        prop_assert!(back <= ts);
        prop_assert!(ts.duration_since(back) < res.unit());
        prop_assert_eq!(back, res.truncate(ts));
    }

    /// Truncation preserves order between instants.
    #[test]
    fn truncate_is_monotonic(a in any::<u64>(), b in any::<u64>(), res in arbitrary_resolution()) {
        let (a, b) = (Timestamp::from_nanos(a.min(b)), Timestamp::from_nanos(a.max(b)));
        prop_assert!(res.truncate(a) <= res.truncate(b));
    }

    /// Distinct cells never share a lock row.
    #[test]
    fn lock_keys_are_injective(
        k1 in proptest::collection::vec(any::<u8>(), 0..8),
        c1 in proptest::collection::vec(any::<u8>(), 0..8),
        k2 in proptest::collection::vec(any::<u8>(), 0..8),
        c2 in proptest::collection::vec(any::<u8>(), 0..8),
    ) {
        let a = KeyColumn::new(k1, c1);
        let b = KeyColumn::new(k2, c2);
        prop_assert_eq!(a == b, a.lock_key() == b.lock_key());
        prop_assert_eq!(KeyColumn::from_lock_key(&a.lock_key()), Some(a));
    }

    /// A prefix slice contains a column iff the column starts with the prefix.
    #[test]
    fn prefix_slice_matches_starts_with(
        prefix in proptest::collection::vec(any::<u8>(), 1..4),
        column in proptest::collection::vec(any::<u8>(), 0..6),
    ) {
        let q = SliceQuery::prefix(&prefix);
        prop_assert_eq!(q.contains(&column), column.starts_with(&prefix));
    }

    /// Error codes are non-empty upper-case identifiers.
    #[test]
    fn error_codes_are_identifiers(error in arbitrary_error()) {
        let code = error.code();
        prop_assert!(!code.is_empty());
        prop_assert!(code.chars().all(|c| c.is_ascii_uppercase() || c == '_'),
            "code '{}' for {:?} is not an identifier", code, error);
    }

    /// Lock failures are never classified as temporary.
    #[test]
    fn lock_failures_are_not_temporary(error in arbitrary_error()) {
        prop_assert!(!(error.is_lock_failure() && error.is_temporary()));
    }

    /// Transaction configs with lock_wait >= lock_expiration never validate.
    #[test]
    fn lock_wait_bound_enforced(wait_ms in 1u64..5_000, expiration_ms in 1u64..5_000) {
        let config = TransactionConfig {
            lock_wait: Duration::from_millis(wait_ms),
            lock_expiration: Duration::from_millis(expiration_ms),
            ..TransactionConfig::default()
        };
        prop_assert_eq!(config.validate().is_ok(), wait_ms < expiration_ms);
    }
}

#[test]
fn default_config_round_trips_through_toml() {
    let config = VesperConfig::default();
    let serialized = toml::to_string(&config).expect("Failed to serialize default config");
    let deserialized: VesperConfig =
        toml::from_str(&serialized).expect("Failed to deserialize default config");
    assert_eq!(config.node_name, deserialized.node_name);
    assert_eq!(config.transaction.lock_wait, deserialized.transaction.lock_wait);
    assert_eq!(
        config.transaction.timestamp_resolution,
        deserialized.transaction.timestamp_resolution
    );
    assert_eq!(config.storage.lock_store_suffix, deserialized.storage.lock_store_suffix);
}
