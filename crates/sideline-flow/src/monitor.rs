//! Timeout monitor.
//!
//! Events stop arriving when processors crash or never start, and then the
//! inline evaluation in ingress never runs again. The monitor sweeps every
//! open phase on an interval, resolves it at sweep time through the same
//! transition path ingress uses, and then reconciles outstanding publishes.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sideline_core::Clock;
use tokio::sync::watch;

use crate::error::Result;
use crate::metrics::{EngineMetrics, time_sweep};
use crate::state::PhaseStatus;
use crate::store::PhaseStateStore;
use crate::trigger::{ReconcileReport, Resolution, TransitionTrigger};

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Phase states read.
    pub scanned: usize,
    /// Phase states that were pending or in progress.
    pub open: usize,
    /// Phases this sweep advanced.
    pub transitioned: usize,
    /// Phases this sweep failed.
    pub failed: usize,
    /// Phases that could not be evaluated.
    pub errors: usize,
    /// Publish reconciliation results.
    pub reconcile: ReconcileReport,
}

/// Periodic sweep over open phases.
#[derive(Clone)]
pub struct TimeoutMonitor {
    store: PhaseStateStore,
    trigger: TransitionTrigger,
    clock: Arc<dyn Clock>,
    interval: Duration,
    metrics: EngineMetrics,
}

impl fmt::Debug for TimeoutMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutMonitor")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl TimeoutMonitor {
    /// Creates a monitor.
    #[must_use]
    pub fn new(
        store: PhaseStateStore,
        trigger: TransitionTrigger,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            trigger,
            clock,
            interval,
            metrics: EngineMetrics::new(),
        }
    }

    /// Sweeps at the current time.
    ///
    /// # Errors
    ///
    /// Returns an error if phase states cannot be listed.
    pub async fn sweep(&self) -> Result<SweepReport> {
        self.sweep_at(self.clock.now()).await
    }

    /// Sweeps with `now` as the evaluation time.
    ///
    /// A failure on one phase is logged and counted; the sweep carries on
    /// with the rest.
    ///
    /// # Errors
    ///
    /// Returns an error if phase states cannot be listed.
    #[tracing::instrument(skip(self))]
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let _timer = time_sweep();
        let mut report = SweepReport::default();

        for key in self.store.keys().await? {
            report.scanned += 1;
            let state = match self.store.get(key).await {
                Ok(Some(state)) => state,
                Ok(None) => continue,
                Err(err) => {
                    report.errors += 1;
                    tracing::warn!(%key, error = %err, "sweep could not read phase state");
                    continue;
                }
            };
            if !matches!(state.status, PhaseStatus::Pending | PhaseStatus::InProgress) {
                continue;
            }
            report.open += 1;

            match self.trigger.resolve(key, now).await {
                Ok(Resolution::Transitioned { .. }) => report.transitioned += 1,
                Ok(Resolution::Failed) => report.failed += 1,
                Ok(Resolution::Open { .. } | Resolution::Closed { .. }) => {}
                Err(err) => {
                    report.errors += 1;
                    tracing::warn!(%key, error = %err, "sweep could not resolve phase");
                }
            }
        }
        self.metrics
            .set_open_phases(report.open.saturating_sub(report.transitioned + report.failed));

        report.reconcile = self.trigger.reconcile(now).await?;
        tracing::info!(
            scanned = report.scanned,
            open = report.open,
            transitioned = report.transitioned,
            failed = report.failed,
            errors = report.errors,
            republished = report.reconcile.published,
            "sweep complete"
        );
        Ok(report)
    }

    /// Sweeps every interval until `shutdown` turns true or its sender drops.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_secs = self.interval.as_secs(), "timeout monitor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep().await {
                        tracing::error!(error = %err, "sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("timeout monitor stopped");
    }
}
