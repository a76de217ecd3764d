//! # Vesper Common
//!
//! Common types, errors, clocks and configuration shared across all Vesper
//! crates.

pub mod config;
pub mod error;
pub mod testing;
pub mod time;
pub mod types;
pub mod utils;

pub use config::*;
pub use error::{Error, Result};
pub use time::{SystemTimestamps, Timestamp, TimestampProvider, TimestampResolution};
pub use types::*;

/// Re-export commonly used external types
pub mod prelude {
    pub use super::config::*;
    pub use super::error::{Error, Result, StorageError, TransactionError};
    pub use super::time::{SystemTimestamps, Timestamp, TimestampProvider, TimestampResolution};
    pub use super::types::*;
    pub use async_trait::async_trait;
    pub use bytes::Bytes;
    pub use tracing::{debug, error, info, instrument, trace, warn};
}
