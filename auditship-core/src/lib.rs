//! Incrementally ships an organization audit log to stdout as JSON lines.
//!
//! Every tick reads a persisted watermark, drains all audit-log pages at or after it, and advances
//! the watermark only once the whole drain succeeded. Records can be delivered more than once across
//! failed ticks, they are never skipped inside the max look-back window.

use crate::checkpoint::CheckpointBackend;
use crate::metrics::{MetricsRegistry, ShipperMetrics};
use crate::orchestrator::{Orchestrator, TickReport};
use crate::scheduler::Scheduler;
use crate::sink::JsonLinesSink;
use crate::source::CloudflareAuditLogs;
use crate::watermark::SystemClock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub use crate::config::Settings;
pub use crate::error::{Error, Result};

pub mod error;

/// Settings from the environment.
pub mod config;

/// Watermark type, the clock and the bounded look-back policy.
pub mod watermark;

/// Durable storage of the watermark between ticks.
pub mod checkpoint;

/// Paginated access to the remote audit-log feed.
pub mod source;

/// Downstream emission of fetched records.
pub mod sink;

pub mod metrics;

/// The per-tick state machine.
pub mod orchestrator;

pub mod scheduler;

#[cfg(test)]
mod testing;

type ShipperScheduler = Scheduler<CheckpointBackend, CloudflareAuditLogs, JsonLinesSink<tokio::io::Stdout>>;

/// Runs the shipper until the cancellation token fires. Only startup failures are returned, tick
/// failures are logged and retried on the next interval.
pub async fn run(settings: Settings, cancellation_token: CancellationToken) -> Result<()> {
    let registry = MetricsRegistry::new();
    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], settings.metrics_port));
    let metrics_cancel = cancellation_token.child_token();
    let metrics_server =
        metrics::start_metrics_http_server(metrics_addr, registry.clone(), metrics_cancel.clone())
            .await?;

    let scheduler = match build_scheduler(&settings, &registry).await {
        Ok(scheduler) => scheduler,
        Err(e) => {
            metrics_cancel.cancel();
            return Err(e);
        }
    };

    scheduler.run(cancellation_token).await;

    metrics_cancel.cancel();
    match metrics_server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(?e, "Metrics server failed"),
        Err(e) => error!(?e, "Metrics server task panicked"),
    }
    info!("Shipper stopped");
    Ok(())
}

/// Runs exactly one tick and exits. No metrics endpoint is served.
pub async fn run_once(settings: Settings) -> Result<TickReport> {
    let registry = MetricsRegistry::new();
    let scheduler = build_scheduler(&settings, &registry).await?;
    scheduler.run_once().await.map_err(|e| {
        error!(phase = %e.phase, records_emitted = e.records_emitted, "Tick failed");
        e.error
    })
}

async fn build_scheduler(settings: &Settings, registry: &MetricsRegistry) -> Result<ShipperScheduler> {
    let checkpoint = CheckpointBackend::from_settings(&settings.checkpoint).await?;
    let source = CloudflareAuditLogs::new(settings.cloudflare.clone())?;
    info!(
        checkpoint = checkpoint::CheckpointStore::key(&checkpoint),
        organization_id = %settings.cloudflare.organization_id,
        tick_interval = ?settings.look_back.tick_interval(),
        max_look_back = ?settings.look_back.max_look_back(),
        watermark_advance = ?settings.watermark_advance,
        "Shipper configured"
    );

    let orchestrator = Orchestrator::new(
        checkpoint,
        source,
        JsonLinesSink::stdout(),
        Arc::new(SystemClock),
        settings.look_back,
        ShipperMetrics::new(registry),
    )
    .with_watermark_advance(settings.watermark_advance);

    Ok(Scheduler::new(orchestrator))
}
