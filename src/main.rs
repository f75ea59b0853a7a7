//! Doorway occupancy service
//!
//! Reads raw sensor lines from each configured doorway, turns A/B beam pairs
//! into ENTER/EXIT crossings and environmental readings into periodic
//! crowdiness snapshots, and publishes both to a document store.
//!
//! Module structure:
//! - `domain/` - Readings, crossings, snapshots and the line parser
//! - `io/` - Line sources, document stores, publisher, Prometheus
//! - `services/` - Crossing detector, aggregator, scorer, pipeline
//! - `infra/` - Configuration and metrics

use anyhow::Context;
use clap::{Parser, ValueEnum};
use doorway_occupancy::infra::{Config, Metrics};
use doorway_occupancy::io::dataset::DatasetWriter;
use doorway_occupancy::io::publisher::{PublishQueue, PublishWorker};
use doorway_occupancy::io::store::create_store;
use doorway_occupancy::services::{CrowdinessEstimator, DoorwayRunner};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// How long queued store writes may take to drain on shutdown
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Doorway occupancy and crowdiness service
#[derive(Parser, Debug)]
#[command(name = "doorway-occupancy", version, about)]
struct Args {
    /// Path to TOML configuration file (falls back to CONFIG_FILE, then config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    // Default: INFO, use RUST_LOG=debug for per-line visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    info!(version = env!("CARGO_PKG_VERSION"), git = env!("GIT_HASH"), "doorway-occupancy starting");

    let config_path = args.config.unwrap_or_else(|| Config::resolve_config_path(&[]));
    let config = Config::load_from_path(&config_path)
        .with_context(|| format!("loading configuration from {config_path}"))?;

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        doorways = %config.doorways().len(),
        scorer = ?config.scorer_strategy(),
        store = %config.store_backend().as_str(),
        backpressure = ?config.backpressure(),
        window_capacity = %config.aggregation_params().capacity(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    // Fatal before any doorway starts: a missing or invalid model must not run
    let scorer = Arc::new(CrowdinessEstimator::from_config(&config).context("initializing scorer")?);
    info!(strategy = %scorer.strategy(), "scorer_ready");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    let store = create_store(&config).context("creating document store")?;
    let queue = Arc::new(PublishQueue::new(
        config.publish_queue_capacity(),
        config.backpressure(),
        metrics.clone(),
    ));
    let dataset = config.dataset_file().map(DatasetWriter::new);
    let record_dataset = dataset.is_some();
    let worker = PublishWorker::new(
        queue.clone(),
        store,
        dataset,
        metrics.clone(),
        config.publish_max_retries(),
        config.publish_retry_backoff(),
    );
    let worker_handle = tokio::spawn(worker.run());

    // Start Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_shutdown = shutdown_rx.clone();
        let site_id = config.site_id().to_string();
        tokio::spawn(async move {
            if let Err(e) = doorway_occupancy::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                site_id,
                prom_shutdown,
            )
            .await
            {
                error!(error = %e, "prometheus_server_error");
            }
        });
    }

    // Periodic metrics summary
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        interval.tick().await;
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    // One isolated task per doorway
    let mut doorway_handles = Vec::with_capacity(config.doorways().len());
    for doorway in config.doorways() {
        let runner = DoorwayRunner::new(
            doorway.clone(),
            config.crossing_params(),
            config.aggregation_params(),
            scorer.clone(),
            metrics.clone(),
            queue.clone(),
            record_dataset,
        );
        doorway_handles.push(tokio::spawn(runner.run(shutdown_rx.clone())));
    }

    // Handle shutdown on Ctrl+C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    // Doorways finish on shutdown, or when a non-reconnecting source ends
    for handle in doorway_handles {
        if let Err(e) = handle.await {
            error!(error = %e, "doorway_task_failed");
        }
    }

    queue.close();
    if tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, worker_handle).await.is_err() {
        warn!(pending = %queue.len(), "publish_drain_timeout");
    }

    metrics.report().log();
    info!("doorway-occupancy shutdown complete");
    Ok(())
}
