//! Prometheus metrics helpers for the indexing service.
//!
//! # Usage
//!
//! ```rust,ignore
//! use nsindex_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let handle = init_metrics()?;
//!     start_metrics_server(9090, handle).await?;
//!
//!     metrics::counter!("index_events_total", "outcome" => "indexed").increment(1);
//!     Ok(())
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component (`index_`, `consumer_`, `sweeper_`)
//! - Suffix: unit or type (`_total`, `_seconds`)
//! - Labels: `outcome` and `table` only, both low-cardinality

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Install the Prometheus recorder and register metric descriptions.
///
/// Fails if a recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    register_index_metrics();
    Ok(handle)
}

/// Like [`init_metrics`] but returns `None` if a recorder is already installed.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    init_metrics().ok()
}

/// Serve `/metrics` on `port` in a background task.
///
/// The listener is bound before returning, so a port conflict is reported to
/// the caller rather than lost in the spawned task.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server stopped: {}", e);
        }
    });

    Ok(())
}

/// Register descriptions for every metric the service emits.
pub fn register_index_metrics() {
    // =========================================================================
    // Indexer
    // =========================================================================

    describe_counter!(
        "index_events_total",
        "Completion events handled, by outcome (indexed, malformed, ignored, rejected, failed)"
    );
    describe_counter!(
        "index_leaves_written_total",
        "Indexed task rows inserted or replaced"
    );
    describe_counter!(
        "index_rank_conflicts_total",
        "Leaf updates discarded because a higher rank is stored"
    );
    describe_counter!(
        "index_namespaces_written_total",
        "Namespace rows inserted or whose expiry was extended"
    );
    describe_counter!(
        "index_routes_skipped_total",
        "Index routes skipped because they do not form a valid path"
    );
    describe_counter!(
        "index_store_retries_total",
        "Store operations retried after a transient failure"
    );
    describe_histogram!(
        "index_event_duration_seconds",
        "Time spent indexing one event"
    );

    // =========================================================================
    // Consumer
    // =========================================================================

    describe_gauge!("indexer_running", "1 while the daemon is consuming events");
    describe_gauge!(
        "consumer_in_flight",
        "Deliveries currently being handled"
    );
    describe_counter!(
        "consumer_deliveries_total",
        "Deliveries received from the subscription"
    );

    // =========================================================================
    // Sweeper
    // =========================================================================

    describe_counter!(
        "sweeper_rows_deleted_total",
        "Expired rows deleted (label: table)"
    );
    describe_counter!(
        "sweeper_failures_total",
        "Scan or delete failures during a sweep (label: table)"
    );
    describe_histogram!(
        "sweeper_cycle_duration_seconds",
        "Time spent in one sweep cycle"
    );
    describe_gauge!(
        "sweeper_last_run_unix",
        "Unix timestamp of the last completed sweep"
    );
}
