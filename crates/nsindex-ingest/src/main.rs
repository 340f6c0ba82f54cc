//! Namespace indexing daemon.
//!
//! Consumes task completion events, maintains the namespace and indexed task
//! tables, and sweeps expired rows in the background.
//!
//! # Usage
//!
//! ```bash
//! # Index events piped in from a subscription bridge
//! bridge-subscribe 'route.index.#' | nsindex-ingest
//!
//! # Replay a directory of captured events
//! nsindex-ingest --input ./captured/
//!
//! # Run one expiration sweep and exit
//! nsindex-ingest --sweep-only
//! ```
//!
//! Settings come from `NSINDEX_*` environment variables, optionally loaded
//! from a `.env` file.
//!
//! # Graceful Shutdown
//!
//! On SIGINT or SIGTERM the daemon:
//! 1. Stops taking new deliveries
//! 2. Gives in-flight deliveries the grace period to finish
//! 3. Leaves everything else unacknowledged for redelivery
//! 4. Stops the sweeper and exits

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use metrics::gauge;
use nsindex_core::metrics::{init_metrics, start_metrics_server};
use nsindex_ingest::{
    Config, EventConsumer, ExpirationSweeper, Indexer, JsonlConfig, JsonlSource, Stores,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Namespace indexing daemon.
#[derive(Parser, Debug)]
#[command(name = "nsindex-ingest")]
#[command(about = "Indexes task completion events into a namespace hierarchy")]
#[command(version)]
struct Args {
    /// Event input: JSONL file, directory of JSONL files, or - for stdin
    #[arg(long, short, default_value = "-")]
    input: PathBuf,

    /// Path to .env file (loaded if it exists)
    #[arg(long, default_value = ".env")]
    dotenv: PathBuf,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, default_value = "9090")]
    metrics_port: u16,

    /// Run a single expiration sweep and exit
    #[arg(long)]
    sweep_only: bool,

    /// Redeliveries of a requeued event before it is dropped
    #[arg(long, default_value = "10")]
    max_redeliveries: u32,

    /// Seconds to wait before redelivering a requeued event
    #[arg(long, default_value = "1")]
    redelivery_delay_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load .env file if it exists
    if args.dotenv.exists() {
        dotenvy::from_path(&args.dotenv)
            .with_context(|| format!("Failed to load {}", args.dotenv.display()))?;
        eprintln!("Loaded environment from {}", args.dotenv.display());
    }

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,nsindex_ingest=debug")),
        )
        .init();

    tracing::info!("Namespace indexer starting...");

    let config = Config::from_env().context("Invalid configuration")?;

    // Initialize metrics
    if args.metrics_port > 0 {
        let metrics_handle = init_metrics().context("Failed to install metrics recorder")?;
        start_metrics_server(args.metrics_port, metrics_handle)
            .await
            .with_context(|| format!("Failed to bind metrics port {}", args.metrics_port))?;
        gauge!("indexer_running").set(1.0);
        tracing::info!("Metrics server listening on port {}", args.metrics_port);
    }

    tracing::info!("Opening tables under {}", config.data_dir.display());
    let stores = Stores::open_rocks(
        &config.data_dir,
        &config.namespace_table,
        &config.indexed_task_table,
    )
    .with_context(|| format!("Failed to open tables under {}", config.data_dir.display()))?;

    let sweeper = Arc::new(ExpirationSweeper::new(stores.clone(), config.sweeper()));

    if args.sweep_only {
        let report = sweeper.sweep_once(Utc::now());
        tracing::info!(
            "Sweep removed {} rows ({} failures)",
            report.deleted(),
            report.failed()
        );
        return Ok(());
    }

    // Set up graceful shutdown
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, stopping gracefully...");
        signal.cancel();
    })
    .context("Failed to set Ctrl+C handler")?;

    let sweeper_handle = tokio::spawn(Arc::clone(&sweeper).run(shutdown.clone()));

    let consumer_config = config.consumer();
    tracing::info!("Configuration:");
    tracing::info!("  Input: {}", args.input.display());
    tracing::info!("  Binding: {}", consumer_config.binding_pattern());
    tracing::info!("  Concurrency: {}", consumer_config.concurrency);
    tracing::info!("  Sweep interval: {:?}", config.sweep_interval);

    let consumer = Arc::new(EventConsumer::new(
        consumer_config,
        Indexer::new(stores, config.retry_policy()),
    ));
    let (tx, rx) = mpsc::channel(config.concurrency.saturating_mul(2).max(1));
    let consumer_handle = {
        let consumer = Arc::clone(&consumer);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { consumer.run(rx, shutdown).await })
    };

    let source = JsonlSource::new(JsonlConfig {
        input: args.input.clone(),
        max_redeliveries: args.max_redeliveries,
        redelivery_delay: Duration::from_secs(args.redelivery_delay_secs),
    });
    let replay = source.run(tx, shutdown.clone()).await;

    // Input finished or shutdown requested: the consumer drains what it has
    let consumer_stats = consumer_handle.await.context("Consumer task failed")?;
    shutdown.cancel();
    if let Err(e) = sweeper_handle.await {
        tracing::warn!("Sweeper task failed: {}", e);
    }

    gauge!("indexer_running").set(0.0);

    let replay = replay.context("Event input failed")?;

    // Print summary
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("SHUTDOWN COMPLETE");
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("Events received:      {}", consumer_stats.received);
    tracing::info!("Events indexed:       {}", consumer_stats.indexed);
    tracing::info!("Events ignored:       {}", consumer_stats.ignored);
    tracing::info!("Events malformed:     {}", consumer_stats.malformed);
    tracing::info!("Events rejected:      {}", consumer_stats.rejected);
    tracing::info!("Events failed:        {}", consumer_stats.failed);
    tracing::info!("Events aborted:       {}", consumer_stats.aborted);
    tracing::info!("Events abandoned:     {}", replay.abandoned);
    tracing::info!("Events unsettled:     {}", replay.unsettled);

    Ok(())
}
