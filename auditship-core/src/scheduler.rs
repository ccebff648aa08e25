//! Fires orchestrator ticks on a fixed interval until cancelled.

use crate::checkpoint::CheckpointStore;
use crate::orchestrator::{Orchestrator, TickError, TickReport};
use crate::sink::RecordSink;
use crate::source::AuditLogSource;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Owns the orchestrator and drives it. The first tick fires immediately, later ticks fire every
/// `interval`. A tick that overruns the interval delays the next one instead of stacking up ticks.
pub struct Scheduler<C, S, K> {
    orchestrator: Orchestrator<C, S, K>,
    interval: Duration,
}

impl<C, S, K> Scheduler<C, S, K>
where
    C: CheckpointStore,
    S: AuditLogSource,
    K: RecordSink,
{
    pub fn new(orchestrator: Orchestrator<C, S, K>) -> Self {
        let interval = orchestrator.look_back().tick_interval();
        Self {
            orchestrator,
            interval,
        }
    }

    /// Runs ticks until `cancel` fires. A failed tick is logged and the loop keeps going, the next
    /// tick retries from the unchanged checkpoint. Cancellation is observed between ticks, an
    /// in-flight tick always runs to completion.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(interval = ?self.interval, "Starting scheduler");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Cancellation received, stopping scheduler");
                    return;
                }
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.orchestrator.tick().await {
                warn!(
                    phase = %e.phase,
                    records_emitted = e.records_emitted,
                    error = %e.error,
                    "Tick failed, retrying on the next interval"
                );
            }
        }
    }

    /// Runs a single tick and returns its result.
    pub async fn run_once(mut self) -> Result<TickReport, TickError> {
        self.orchestrator.tick().await
    }
}
