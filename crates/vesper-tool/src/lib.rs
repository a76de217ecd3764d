//! # Vesper Tool
//!
//! Operator tooling for Vesper:
//! - Configuration loading with command line and environment overrides
//! - A lock contention drill that exercises the transaction stack end to end

pub mod contend;
pub mod settings;

pub use contend::{ContendOptions, ContendReport};
pub use settings::{load_config, CliOverrides};
