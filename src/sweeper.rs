//! # Retry Sweeper
//!
//! Background task that periodically drains the cache gateway's pending
//! table. The first sweep runs at start-up, then one per interval until the
//! cancellation token fires. A sweep that is already running finishes before
//! the task exits.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::CacheGateway;

/// Outcome of one sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Periodic flusher of pending points
#[derive(Debug)]
pub struct RetrySweeper {
    gateway: Arc<CacheGateway>,
    interval: Duration,
}

impl RetrySweeper {
    pub fn new(gateway: Arc<CacheGateway>, interval: Duration) -> Self {
        Self { gateway, interval }
    }

    /// Try every pending point once.
    ///
    /// Works on a snapshot, so points cached while the sweep runs wait for the
    /// next one. Successful points are removed, failed ones stay.
    pub async fn sweep(&self) -> SweepReport {
        let pending = self.gateway.pending_points();
        if pending.is_empty() {
            return SweepReport::default();
        }

        let mut report = SweepReport {
            attempted: pending.len(),
            ..SweepReport::default()
        };

        for (key, point) in pending {
            match self.gateway.flush_pending(key, &point).await {
                Ok(()) => report.succeeded += 1,
                Err(e) => {
                    debug!("Retry of {} failed: {}", key, e);
                    report.failed += 1;
                }
            }
        }

        info!(
            "Retry sweep finished: {} written, {} still pending",
            report.succeeded, report.failed
        );
        report
    }

    /// Run until `token` is cancelled
    pub async fn run(self, token: CancellationToken) {
        info!("Retry sweeper started (interval {:?})", self.interval);

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }

        info!("Retry sweeper stopped");
    }
}
