//! Configuration loading: TOML file, then command line, then `VESPER_*`
//! environment variables.

use anyhow::Context;
use std::path::Path;
use vesper_common::config::VesperConfig;
use vesper_common::time::TimestampResolution;

/// Overrides given on the command line.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub node_name: Option<String>,
    pub log_level: Option<String>,
}

/// Load `path` (defaults if it does not exist) and apply overrides from the
/// command line and the process environment.
pub fn load_config(path: &Path, cli: &CliOverrides) -> anyhow::Result<VesperConfig> {
    load_config_with(path, cli, |key| std::env::var(key).ok())
}

/// [`load_config`] with an explicit environment lookup.
pub fn load_config_with<F>(path: &Path, cli: &CliOverrides, env: F) -> anyhow::Result<VesperConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing config file {}", path.display()))?
    } else {
        VesperConfig::default()
    };

    // Command line overrides
    if let Some(name) = &cli.node_name {
        config.node_name = name.clone();
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }

    // Environment variable overrides (highest priority)
    apply_env_overrides(&mut config, env)?;
    Ok(config)
}

fn apply_env_overrides<F>(config: &mut VesperConfig, env: F) -> anyhow::Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(val) = env("VESPER_NODE_NAME") {
        config.node_name = val;
    }
    if let Some(val) = env("VESPER_BACKEND") {
        config.storage.backend = val;
    }
    if let Some(val) = env("VESPER_LOCK_STORE_SUFFIX") {
        config.storage.lock_store_suffix = val;
    }
    if let Some(val) = env("VESPER_LOG_LEVEL") {
        config.logging.level = val;
    }
    if let Some(val) = env("VESPER_LOG_FORMAT") {
        config.logging.format = val;
    }
    if let Some(val) = env("VESPER_LOG_FILE") {
        config.logging.file = Some(val.into());
    }
    if let Some(val) = env("VESPER_TIMESTAMP_RESOLUTION") {
        config.transaction.timestamp_resolution = match val.to_ascii_lowercase().as_str() {
            "nano" => TimestampResolution::Nano,
            "micro" => TimestampResolution::Micro,
            "milli" => TimestampResolution::Milli,
            other => anyhow::bail!("VESPER_TIMESTAMP_RESOLUTION: unknown resolution {:?}", other),
        };
    }
    if let Some(val) = env("VESPER_LOCK_EXPIRATION") {
        config.transaction.lock_expiration =
            humantime::parse_duration(&val).context("VESPER_LOCK_EXPIRATION")?;
    }
    if let Some(val) = env("VESPER_LOCK_WAIT") {
        config.transaction.lock_wait = humantime::parse_duration(&val).context("VESPER_LOCK_WAIT")?;
    }
    if let Some(val) = env("VESPER_LOCK_RETRIES") {
        config.transaction.lock_retries = val.parse().context("VESPER_LOCK_RETRIES")?;
    }
    if let Some(val) = env("VESPER_MAX_RETRIES") {
        config.transaction.retry.max_retries = val.parse().context("VESPER_MAX_RETRIES")?;
    }
    Ok(())
}
