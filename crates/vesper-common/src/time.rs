//! Timestamp providers.
//!
//! All instants are kept as nanoseconds since the UNIX epoch. A provider's
//! resolution only decides how `now()` is truncated and how instants are
//! converted to the backend's native integer representation, so expiration
//! arithmetic never loses precision.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// An instant in time, in nanoseconds since the UNIX epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const EPOCH: Timestamp = Timestamp(0);
    pub const MAX: Timestamp = Timestamp(u64::MAX);

    pub const fn from_nanos(nanos: u64) -> Self {
        Timestamp(nanos)
    }

    pub fn from_millis(millis: u64) -> Self {
        Timestamp(millis.saturating_mul(1_000_000))
    }

    pub const fn as_nanos(&self) -> u64 {
        self.0
    }

    pub fn saturating_add(&self, d: Duration) -> Timestamp {
        let nanos = u64::try_from(d.as_nanos()).unwrap_or(u64::MAX);
        Timestamp(self.0.saturating_add(nanos))
    }

    pub fn saturating_sub(&self, d: Duration) -> Timestamp {
        let nanos = u64::try_from(d.as_nanos()).unwrap_or(u64::MAX);
        Timestamp(self.0.saturating_sub(nanos))
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is later.
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.0 / 1_000_000_000, self.0 % 1_000_000_000)
    }
}

/// Granularity of a timestamp provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TimestampResolution {
    Nano,
    #[default]
    Micro,
    Milli,
}

impl TimestampResolution {
    /// Length of one native unit in nanoseconds.
    pub const fn unit_nanos(&self) -> u64 {
        match self {
            TimestampResolution::Nano => 1,
            TimestampResolution::Micro => 1_000,
            TimestampResolution::Milli => 1_000_000,
        }
    }

    pub const fn unit(&self) -> Duration {
        Duration::from_nanos(self.unit_nanos())
    }

    /// Round an instant down to this resolution.
    pub const fn truncate(&self, ts: Timestamp) -> Timestamp {
        Timestamp(ts.0 - ts.0 % self.unit_nanos())
    }

    /// Convert an instant into an integer count of native units.
    pub const fn to_native(&self, ts: Timestamp) -> u64 {
        ts.0 / self.unit_nanos()
    }

    /// Convert a native unit count back into an instant, saturating at
    /// [`Timestamp::MAX`].
    pub fn from_native(&self, native: u64) -> Timestamp {
        Timestamp(native.saturating_mul(self.unit_nanos()))
    }
}

impl fmt::Display for TimestampResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimestampResolution::Nano => "nano",
            TimestampResolution::Micro => "micro",
            TimestampResolution::Milli => "milli",
        };
        f.write_str(s)
    }
}

/// Source of causally ordered instants.
#[async_trait]
pub trait TimestampProvider: Send + Sync + fmt::Debug {
    /// Resolution instants are truncated to.
    fn resolution(&self) -> TimestampResolution;

    /// Current instant. Never goes backwards within one provider.
    fn now(&self) -> Timestamp;

    /// Wait until `now()` is strictly after `target` and return that instant.
    async fn sleep_past(&self, target: Timestamp) -> Timestamp;

    fn to_native(&self, ts: Timestamp) -> u64 {
        self.resolution().to_native(ts)
    }

    fn from_native(&self, native: u64) -> Timestamp {
        self.resolution().from_native(native)
    }
}

/// Wall-clock provider, clamped so it never goes backwards.
#[derive(Debug)]
pub struct SystemTimestamps {
    resolution: TimestampResolution,
    last: AtomicU64,
}

impl SystemTimestamps {
    pub fn new(resolution: TimestampResolution) -> Self {
        Self {
            resolution,
            last: AtomicU64::new(0),
        }
    }

    fn wall_clock() -> Timestamp {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        Timestamp(nanos)
    }
}

impl Default for SystemTimestamps {
    fn default() -> Self {
        Self::new(TimestampResolution::default())
    }
}

#[async_trait]
impl TimestampProvider for SystemTimestamps {
    fn resolution(&self) -> TimestampResolution {
        self.resolution
    }

    fn now(&self) -> Timestamp {
        let wall = self.resolution.truncate(Self::wall_clock()).as_nanos();
        let prev = self.last.fetch_max(wall, Ordering::AcqRel);
        Timestamp(prev.max(wall))
    }

    async fn sleep_past(&self, target: Timestamp) -> Timestamp {
        loop {
            let now = self.now();
            if now > target {
                return now;
            }
            let wait = target.duration_since(now) + self.resolution.unit();
            tokio::time::sleep(wait).await;
        }
    }
}
