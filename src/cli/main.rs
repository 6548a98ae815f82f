//! CLI host for tag-sql-sink
//!
//! Reads JSON Lines files, packs each file into one chunk and hands the chunks
//! to the output stage, the way a log router would.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer};

use tag_sql_sink::chunk::{Chunk, ChunkBuilder, EventTime};
use tag_sql_sink::config::{SinkConfig, sample_config};
use tag_sql_sink::{OutputCoordinator, SinkError, open_store};

#[derive(Parser)]
#[command(name = "tag-sql-sink")]
#[command(about = "Route tagged log records into SQL tables")]
#[command(version)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the configuration, bind every table and print the routes
    Check {
        /// Configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Import JSON Lines files, one chunk per file
    Import {
        /// Configuration file
        #[arg(short, long)]
        config: PathBuf,
        /// Tag given to every chunk
        #[arg(short, long)]
        tag: String,
        /// Input files
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Print a sample configuration file
    SampleConfig,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let layer = if json {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .with_target(true)
            .json()
            .with_filter(filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_filter(filter)
            .boxed()
    };

    tracing_subscriber::registry().with(layer).init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Commands::SampleConfig = cli.command {
        print!("{}", sample_config());
        return ExitCode::SUCCESS;
    }

    init_logging(cli.json_logs);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async {
        match cli.command {
            Commands::Check { config } => check(&config).await,
            Commands::Import { config, tag, files } => import(&config, &tag, &files).await,
            Commands::SampleConfig => Ok(()),
        }
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn start(config_path: &Path) -> anyhow::Result<OutputCoordinator> {
    let config = SinkConfig::load(config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    tracing::info!(target_db = %config.describe_target(), "Opening store");

    let store = open_store(&config)?;
    Ok(OutputCoordinator::start(&config, store).await?)
}

async fn check(config_path: &Path) -> anyhow::Result<()> {
    let coordinator = start(config_path).await?;

    let registry = coordinator.registry();
    for route in registry.routes() {
        println!(
            "{:<30} -> {} ({})",
            route.pattern_str(),
            route.table(),
            route.mapping()
        );
    }
    let default = registry.default_route();
    println!(
        "{:<30} -> {} ({})",
        default.pattern_str(),
        default.table(),
        default.mapping()
    );

    coordinator.shutdown().await;
    Ok(())
}

async fn import(config_path: &Path, tag: &str, files: &[PathBuf]) -> anyhow::Result<()> {
    let coordinator = start(config_path).await?;

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted; stopping after the current chunk");
            flag.store(true, Ordering::SeqCst);
        }
    });

    let mut failed = 0usize;
    for path in files {
        if interrupted.load(Ordering::SeqCst) {
            break;
        }

        let chunk = read_chunk(path, tag)?;
        match coordinator.handle(&chunk).await {
            Ok(report) => println!("{}: {}", path.display(), report),
            Err(SinkError::ShuttingDown) => break,
            Err(e) => {
                tracing::error!(file = %path.display(), error = %e, "Chunk not written");
                failed += 1;
            }
        }
    }

    coordinator.shutdown().await;

    if failed > 0 {
        anyhow::bail!("{} of {} chunks were not written", failed, files.len());
    }
    Ok(())
}

/// Pack a JSON Lines file into one chunk
///
/// Lines that are not JSON objects are kept as raw strings so the output
/// stage reports them as malformed records.
fn read_chunk(path: &Path, tag: &str) -> anyhow::Result<Chunk> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let mut builder = ChunkBuilder::new(tag);
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        match serde_json::from_str::<serde_json::Value>(line) {
            Ok(serde_json::Value::Object(record)) => builder.push(EventTime::now(), &record)?,
            _ => builder.push_value(&rmpv::Value::from(line))?,
        }
    }

    tracing::debug!(file = %path.display(), entries = builder.len(), "Read chunk");
    Ok(builder.build())
}
