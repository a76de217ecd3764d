//! Vesper Tool
//!
//! Command line entry point: configuration checks and the lock contention
//! drill.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;
use vesper_common::config::{LoggingConfig, VesperConfig};
use vesper_common::types::ConsistencyModifier;
use vesper_tool::{contend, load_config, CliOverrides, ContendOptions};

/// Vesper - locking and consistency tooling for key-column-value backends
#[derive(Parser, Debug)]
#[command(name = "vesper-tool")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/vesper.toml")]
    config: PathBuf,

    /// Override node name
    #[arg(long)]
    node_name: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load and validate the configuration, then print it as TOML
    CheckConfig,

    /// Race read-increment-write transactions on one cell and report the outcome
    Contend {
        /// Simulated processes, each with its own lock mediators
        #[arg(long, default_value_t = 2)]
        processes: usize,

        /// Concurrent transactions per round
        #[arg(long, default_value_t = 4)]
        workers: usize,

        #[arg(long, default_value_t = 10)]
        rounds: usize,

        /// Consistency of the contended cell
        #[arg(long, value_enum, default_value_t = Consistency::Lock)]
        consistency: Consistency,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Consistency {
    Default,
    Lock,
    Fork,
}

impl From<Consistency> for ConsistencyModifier {
    fn from(c: Consistency) -> Self {
        match c {
            Consistency::Default => ConsistencyModifier::Default,
            Consistency::Lock => ConsistencyModifier::Lock,
            Consistency::Fork => ConsistencyModifier::Fork,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration first (needed for logging setup)
    let cli = CliOverrides {
        node_name: args.node_name.clone(),
        log_level: args.verbose.then(|| "debug".to_string()),
    };
    let config = load_config(&args.config, &cli)?;

    let _log_guard = init_logging(&config.logging);
    info!("Loaded configuration from {:?}", args.config);

    // Validate configuration
    if let Err(errors) = config.validate() {
        for err in &errors {
            tracing::error!("Config validation error: {}", err);
        }
        anyhow::bail!(
            "Configuration validation failed with {} error(s). \
             See log output above for details.",
            errors.len()
        );
    }

    match args.command {
        Command::CheckConfig => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Contend {
            processes,
            workers,
            rounds,
            consistency,
        } => run_contend(&config, processes, workers, rounds, consistency.into()).await,
    }
}

async fn run_contend(
    config: &VesperConfig,
    processes: usize,
    workers: usize,
    rounds: usize,
    consistency: ConsistencyModifier,
) -> anyhow::Result<()> {
    info!(node = %config.node_name, %consistency, processes, workers, rounds, "Starting contention drill");
    let options = ContendOptions {
        processes,
        workers,
        rounds,
        consistency,
    };
    let report = contend::run(config, &options).await?;

    println!("attempts:      {}", report.attempts);
    println!("committed:     {}", report.committed);
    println!("lock failures: {}", report.lock_failures);
    println!("errors:        {}", report.errors);
    println!("final value:   {}", report.final_value);
    println!("lost updates:  {}", report.lost_updates());
    println!("elapsed:       {}", humantime::format_duration(report.elapsed));

    if consistency.requires_lock() && report.lost_updates() > 0 {
        anyhow::bail!("{} committed increments were lost under LOCK consistency", report.lost_updates());
    }
    Ok(())
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `logging.level`. Events go to stderr and, when
/// `logging.file` is set, to a daily file next to it. The returned guard
/// flushes the file writer and must live until exit.
fn init_logging(logging: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let json = logging.format == "json";

    let (file_writer, guard) = match &logging.file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let name = path.file_name().unwrap_or_else(|| OsStr::new("vesper.log"));
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, name));
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(output_layer(std::io::stderr, json, true))
        .with(file_writer.map(|writer| output_layer(writer, json, false)))
        .init();
    guard
}

/// Formatting layer writing to `writer`, text or JSON.
fn output_layer<S, W>(writer: W, json: bool, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(true)
        .with_thread_ids(true);
    if json {
        Box::new(layer.json())
    } else {
        Box::new(layer)
    }
}
