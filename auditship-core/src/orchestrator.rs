//! One tick of incremental synchronization: resolve the watermark, drain every page from the
//! source into the sink, then advance the checkpoint.
//!
//! ```text
//! Idle -> ResolvingWatermark -> Draining -> Checkpointing -> Idle
//!               |                   |              |
//!               +-------------------+--------------+--> Failed
//! ```
//!
//! The previously persisted watermark is only replaced after an error-free drain, so a failed tick
//! is retried from the same point by the next tick. Records emitted before the failure are emitted
//! again, delivery is at-least-once.

use crate::checkpoint::{self, CheckpointStore};
use crate::config::WatermarkAdvance;
use crate::error::{Error, Result};
use crate::metrics::ShipperMetrics;
use crate::sink::RecordSink;
use crate::source::AuditLogSource;
use crate::watermark::{Clock, LookBack, Watermark};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// The phase a tick was in, used to attribute failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickPhase {
    ResolvingWatermark,
    Draining,
    Checkpointing,
}

impl TickPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TickPhase::ResolvingWatermark => "resolving_watermark",
            TickPhase::Draining => "draining",
            TickPhase::Checkpointing => "checkpointing",
        }
    }
}

impl fmt::Display for TickPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed tick, the persisted watermark is unchanged.
#[derive(Debug, Clone)]
pub struct TickError {
    pub phase: TickPhase,
    /// Records emitted before the failure. They are not retracted and will be emitted again.
    pub records_emitted: u64,
    pub error: Error,
}

impl fmt::Display for TickError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tick failed while {} after emitting {} records: {}",
            self.phase, self.records_emitted, self.error
        )
    }
}

impl std::error::Error for TickError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Every page was fetched until an empty page.
    Drained,
    /// The principal is authenticated but has no usable identity, nothing was fetched.
    SkippedUnauthorized,
}

impl TickOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            TickOutcome::Drained => "drained",
            TickOutcome::SkippedUnauthorized => "skipped_unauthorized",
        }
    }
}

/// Summary of a successful tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub tick_start: Watermark,
    pub tick_end: Watermark,
    /// The watermark the drain queried from.
    pub since: Watermark,
    /// The watermark persisted at the end of the tick.
    pub next_watermark: Watermark,
    pub pages_fetched: u32,
    pub records_emitted: u64,
    pub outcome: TickOutcome,
}

/// Drives ticks against injected collaborators. Holds no watermark between ticks, the checkpoint
/// store is the only source of truth.
pub struct Orchestrator<C, S, K> {
    checkpoint: C,
    source: S,
    sink: K,
    clock: Arc<dyn Clock>,
    look_back: LookBack,
    advance: WatermarkAdvance,
    metrics: ShipperMetrics,
}

impl<C, S, K> Orchestrator<C, S, K>
where
    C: CheckpointStore,
    S: AuditLogSource,
    K: RecordSink,
{
    pub fn new(
        checkpoint: C,
        source: S,
        sink: K,
        clock: Arc<dyn Clock>,
        look_back: LookBack,
        metrics: ShipperMetrics,
    ) -> Self {
        Orchestrator {
            checkpoint,
            source,
            sink,
            clock,
            look_back,
            advance: WatermarkAdvance::default(),
            metrics,
        }
    }

    pub fn with_watermark_advance(mut self, advance: WatermarkAdvance) -> Self {
        self.advance = advance;
        self
    }

    pub fn look_back(&self) -> &LookBack {
        &self.look_back
    }

    /// Runs one tick to completion. Takes `&mut self`, two ticks of the same orchestrator can never
    /// overlap.
    pub async fn tick(&mut self) -> std::result::Result<TickReport, TickError> {
        let started = Instant::now();
        let result = self.run_tick().await;
        let elapsed = started.elapsed().as_secs_f64();

        match &result {
            Ok(report) => {
                self.metrics.tick_succeeded(
                    report.outcome.as_str(),
                    elapsed,
                    report.next_watermark.timestamp(),
                );
                info!(
                    since = %report.since,
                    next_watermark = %report.next_watermark,
                    pages = report.pages_fetched,
                    records = report.records_emitted,
                    outcome = report.outcome.as_str(),
                    elapsed_secs = elapsed,
                    "Tick completed"
                );
            }
            Err(e) => {
                self.metrics.tick_failed(e.phase.as_str(), elapsed);
            }
        }
        result
    }

    async fn run_tick(&mut self) -> std::result::Result<TickReport, TickError> {
        let tick_start = Watermark::new(self.clock.now());

        let since = checkpoint::load(&self.checkpoint, &self.look_back, tick_start)
            .await
            .map_err(|error| TickError {
                phase: TickPhase::ResolvingWatermark,
                records_emitted: 0,
                error,
            })?;
        debug!(key = self.checkpoint.key(), %since, %tick_start, "Resolved watermark");

        let mut pages_fetched = 0;
        let mut records_emitted = 0;
        let outcome = self
            .drain(since, &mut pages_fetched, &mut records_emitted)
            .await
            .map_err(|error| TickError {
                phase: TickPhase::Draining,
                records_emitted,
                error,
            })?;

        let tick_end = Watermark::new(self.clock.now());
        let next_watermark = match self.advance {
            WatermarkAdvance::TickEnd => tick_end,
            WatermarkAdvance::TickStart => tick_start,
        };

        self.checkpoint
            .store(next_watermark)
            .await
            .map_err(|error| TickError {
                phase: TickPhase::Checkpointing,
                records_emitted,
                error,
            })?;

        Ok(TickReport {
            tick_start,
            tick_end,
            since,
            next_watermark,
            pages_fetched,
            records_emitted,
            outcome,
        })
    }

    /// Fetches pages 1, 2, .. until an empty page, emitting every record of a page before the next
    /// page is requested. Progress is written through the counters so a failure can report it.
    async fn drain(
        &mut self,
        since: Watermark,
        pages_fetched: &mut u32,
        records_emitted: &mut u64,
    ) -> Result<TickOutcome> {
        match self.source.identity().await? {
            Some(identity) if !identity.trim().is_empty() => {
                debug!(%identity, "Identity confirmed");
            }
            _ => {
                warn!("Identity check returned no usable identity, skipping fetch for this tick");
                return Ok(TickOutcome::SkippedUnauthorized);
            }
        }

        let mut page_number = 1;
        loop {
            let page = self.source.fetch_page(since, page_number).await?;
            *pages_fetched += 1;

            if page.is_empty() {
                debug!(page = page_number, "Empty page, drain complete");
                return Ok(TickOutcome::Drained);
            }

            debug!(page = page_number, records = page.records.len(), "Emitting page");
            for record in &page.records {
                self.sink.emit(record).await?;
                self.metrics.record_processed();
                *records_emitted += 1;
            }
            page_number += 1;
        }
    }
}
