//! Testing utilities and fixtures

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::time::{Timestamp, TimestampProvider, TimestampResolution};

/// Virtual clock for deterministic tests.
///
/// Time only moves when a test calls [`ManualClock::advance`] or
/// [`ManualClock::set`], or when someone sleeps past a future instant, in
/// which case the clock jumps straight there.
#[derive(Debug)]
pub struct ManualClock {
    resolution: TimestampResolution,
    nanos: AtomicU64,
}

impl ManualClock {
    /// 2024-01-01T00:00:00Z
    pub const DEFAULT_START: Timestamp = Timestamp::from_nanos(1_704_067_200_000_000_000);

    pub fn new(resolution: TimestampResolution) -> Self {
        Self::starting_at(resolution, Self::DEFAULT_START)
    }

    pub fn starting_at(resolution: TimestampResolution, start: Timestamp) -> Self {
        Self {
            resolution,
            nanos: AtomicU64::new(start.as_nanos()),
        }
    }

    pub fn set(&self, ts: Timestamp) {
        self.nanos.store(ts.as_nanos(), Ordering::SeqCst);
    }

    pub fn advance(&self, d: Duration) -> Timestamp {
        let step = u64::try_from(d.as_nanos()).unwrap_or(u64::MAX);
        let prev = self.nanos.fetch_add(step, Ordering::SeqCst);
        Timestamp::from_nanos(prev.saturating_add(step))
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(TimestampResolution::Micro)
    }
}

#[async_trait]
impl TimestampProvider for ManualClock {
    fn resolution(&self) -> TimestampResolution {
        self.resolution
    }

    fn now(&self) -> Timestamp {
        self.resolution
            .truncate(Timestamp::from_nanos(self.nanos.load(Ordering::SeqCst)))
    }

    async fn sleep_past(&self, target: Timestamp) -> Timestamp {
        let wake = target.saturating_add(self.resolution.unit());
        self.nanos.fetch_max(wake.as_nanos(), Ordering::SeqCst);
        // Give racing tasks a chance to run, as a real sleep would.
        tokio::task::yield_now().await;
        self.now()
    }
}

/// Test fixtures for common scenarios
pub mod fixtures {
    use crate::types::{KeyColumn, RequesterId};

    /// Property cell of a vertex, e.g. `("v1", "p_name")`.
    pub fn property_cell(vertex: u64, property: &str) -> KeyColumn {
        KeyColumn::new(format!("v{}", vertex), format!("p_{}", property))
    }

    /// Requester id with a readable, ordered suffix.
    pub fn requester(n: u8) -> RequesterId {
        RequesterId::new(vec![b'r', b'q', n])
    }

    /// Cells of `count` vertices sharing one property.
    pub fn property_cells(count: u64, property: &str) -> Vec<KeyColumn> {
        (1..=count).map(|v| property_cell(v, property)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new(TimestampResolution::Milli);
        let t0 = clock.now();
        clock.advance(Duration::from_millis(10));
        assert_eq!(clock.now().duration_since(t0), Duration::from_millis(10));
    }

    #[test]
    fn test_manual_clock_truncates() {
        let clock = ManualClock::new(TimestampResolution::Milli);
        let t0 = clock.now();
        clock.advance(Duration::from_micros(999));
        assert_eq!(clock.now(), t0);
    }

    #[tokio::test]
    async fn test_manual_clock_sleep_past() {
        let clock = ManualClock::default();
        let target = clock.now().saturating_add(Duration::from_secs(5));
        let woke = clock.sleep_past(target).await;
        assert!(woke > target);

        // Sleeping past an instant already in the past does not rewind.
        let earlier = Timestamp::EPOCH;
        assert_eq!(clock.sleep_past(earlier).await, woke);
    }

    #[test]
    fn test_fixtures() {
        let kc = fixtures::property_cell(1, "name");
        assert_eq!(&kc.key()[..], b"v1");
        assert_eq!(&kc.column()[..], b"p_name");
        assert!(fixtures::requester(1) < fixtures::requester(2));
        assert_eq!(fixtures::property_cells(3, "age").len(), 3);
    }
}
