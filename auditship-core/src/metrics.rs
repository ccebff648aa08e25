//! Prometheus metrics for the shipper and the pull endpoint exposing them.
//!
//! Metric handles are created against an explicit [MetricsRegistry] and injected into the
//! orchestrator, so several orchestrators can live in one process (tests) without sharing counts.

use crate::error::{Error, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::{Router, routing::get};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::{Registry, Unit};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub const DEFAULT_METRICS_PORT: u16 = 2112;

// Note: We do not add a suffix to the metric name, as the suffix is inferred through the metric type
// by the prometheus client library
// refer: https://github.com/prometheus/client_rust/blob/master/src/registry.rs#L102

// counters (exposed with the _total suffix)
const RECORDS_PROCESSED_TOTAL: &str = "audit_logs_processed";
const TICKS_TOTAL: &str = "audit_log_ticks";

// exposed with the _seconds suffix
const TICK_DURATION: &str = "audit_log_tick_duration";
const CHECKPOINT_TIMESTAMP: &str = "audit_log_checkpoint_timestamp";

const OUTCOME_LABEL: &str = "outcome";
const PHASE_LABEL: &str = "phase";

const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Shared handle on the registry the metrics are registered with and encoded from.
#[derive(Clone, Default)]
pub struct MetricsRegistry {
    // registration happens once at startup, after that the lock is only taken for encoding
    registry: Arc<parking_lot::Mutex<Registry>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encodes the current state of every registered metric in the OpenMetrics text format.
    pub fn encode(&self) -> Result<String> {
        let registry = self.registry.lock();
        let mut buffer = String::new();
        encode(&mut buffer, &registry)
            .map_err(|e| Error::Metrics(format!("Encoding metrics: {e}")))?;
        Ok(buffer)
    }
}

/// Metrics updated by the orchestrator. Cloning shares the underlying atomics.
#[derive(Clone)]
pub struct ShipperMetrics {
    /// Incremented once per emitted record, never reset.
    records_processed: Counter,
    ticks: Family<Vec<(String, String)>, Counter>,
    tick_duration: Histogram,
    checkpoint_timestamp: Gauge,
}

impl ShipperMetrics {
    pub fn new(registry: &MetricsRegistry) -> Self {
        let metrics = Self {
            records_processed: Counter::default(),
            ticks: Family::<Vec<(String, String)>, Counter>::default(),
            // 0.1s .. ~410s
            tick_duration: Histogram::new(exponential_buckets(0.1, 2.0, 13)),
            checkpoint_timestamp: Gauge::default(),
        };

        let mut registry = registry.registry.lock();
        registry.register(
            RECORDS_PROCESSED_TOTAL,
            "A Counter to keep track of the total number of audit log records emitted",
            metrics.records_processed.clone(),
        );
        registry.register(
            TICKS_TOTAL,
            "A Counter to keep track of the sync ticks by outcome",
            metrics.ticks.clone(),
        );
        registry.register_with_unit(
            TICK_DURATION,
            "A Histogram to keep track of the time taken by a sync tick",
            Unit::Seconds,
            metrics.tick_duration.clone(),
        );
        registry.register_with_unit(
            CHECKPOINT_TIMESTAMP,
            "A Gauge with the last committed watermark as a unix timestamp",
            Unit::Seconds,
            metrics.checkpoint_timestamp.clone(),
        );
        metrics
    }

    pub fn records_processed(&self) -> u64 {
        self.records_processed.get()
    }

    pub(crate) fn record_processed(&self) {
        self.records_processed.inc();
    }

    pub(crate) fn tick_succeeded(&self, outcome: &str, elapsed_secs: f64, watermark_secs: i64) {
        self.ticks
            .get_or_create(&vec![(OUTCOME_LABEL.to_string(), outcome.to_string())])
            .inc();
        self.tick_duration.observe(elapsed_secs);
        self.checkpoint_timestamp.set(watermark_secs);
    }

    pub(crate) fn tick_failed(&self, phase: &str, elapsed_secs: f64) {
        self.ticks
            .get_or_create(&vec![
                (OUTCOME_LABEL.to_string(), "failed".to_string()),
                (PHASE_LABEL.to_string(), phase.to_string()),
            ])
            .inc();
        self.tick_duration.observe(elapsed_secs);
    }
}

/// Binds `addr` and serves `/metrics` and `/livez` on a spawned task until the cancellation token
/// fires. A bind failure is returned here, before anything is spawned.
pub async fn start_metrics_http_server(
    addr: SocketAddr,
    registry: MetricsRegistry,
    cancel: CancellationToken,
) -> Result<JoinHandle<Result<()>>> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Metrics(format!("Creating listener on {addr:?}: {e}")))?;
    Ok(tokio::spawn(serve_metrics(listener, registry, cancel)))
}

async fn serve_metrics(
    listener: TcpListener,
    registry: MetricsRegistry,
    cancel: CancellationToken,
) -> Result<()> {
    info!(addr = ?listener.local_addr().ok(), "Metrics server started");

    axum::serve(listener, metrics_router(registry))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| Error::Metrics(format!("Starting web server for metrics: {e}")))
}

fn metrics_router(registry: MetricsRegistry) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/livez", get(livez))
        .with_state(registry)
}

async fn livez() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

async fn metrics_handler(State(registry): State<MetricsRegistry>) -> impl IntoResponse {
    match registry.encode() {
        Ok(buffer) => {
            debug!(bytes = buffer.len(), "Exposing metrics");
            (StatusCode::OK, [(CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)], buffer).into_response()
        }
        Err(e) => {
            error!(?e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
