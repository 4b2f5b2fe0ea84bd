//! Engine assembly and operator surface.
//!
//! [`PhaseEngine`] wires the store, trigger, ingress and monitor from one set
//! of settings and exposes the read-only status queries and operator
//! overrides (force-fail, rerun of a failed phase, manual re-trigger,
//! retention purge).

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use sideline_core::{Clock, DocumentStore};

use crate::alert::{Alert, AlertSink};
use crate::config::{EngineSettings, PhaseRegistry};
use crate::coordinator::{ResumptionPolicy, StoreCoordinator};
use crate::error::Result;
use crate::event::CompletionEvent;
use crate::ingress::{AcceptOutcome, EventIngress};
use crate::metrics::EngineMetrics;
use crate::monitor::{SweepReport, TimeoutMonitor};
use crate::pipeline::Phase;
use crate::schedule::RunSchedule;
use crate::state::{PhaseState, PhaseStatus, PhaseStatusView};
use crate::store::{Change, PhaseKey, PhaseStateStore};
use crate::trigger::{TransitionTrigger, Transport};

/// The assembled orchestration engine.
#[derive(Clone)]
pub struct PhaseEngine {
    settings: EngineSettings,
    registry: Arc<PhaseRegistry>,
    documents: Arc<dyn DocumentStore>,
    store: PhaseStateStore,
    trigger: TransitionTrigger,
    ingress: EventIngress,
    monitor: TimeoutMonitor,
    alerts: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    metrics: EngineMetrics,
}

impl fmt::Debug for PhaseEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhaseEngine")
            .field("settings", &self.settings)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl PhaseEngine {
    /// Assembles an engine.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`](crate::error::Error::Config) if the settings
    /// are inconsistent.
    pub fn new(
        settings: EngineSettings,
        registry: Arc<PhaseRegistry>,
        documents: Arc<dyn DocumentStore>,
        transport: Arc<dyn Transport>,
        schedule: Arc<dyn RunSchedule>,
        alerts: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        settings.validate()?;

        let store = PhaseStateStore::new(
            Arc::clone(&documents),
            Arc::clone(&alerts),
            settings.store_timeout,
            settings.store_retry,
        );
        let trigger = TransitionTrigger::new(
            store.clone(),
            Arc::clone(&registry),
            transport,
            Arc::clone(&alerts),
            Arc::clone(&clock),
            &settings,
        );
        let ingress = EventIngress::new(
            store.clone(),
            Arc::clone(&registry),
            schedule,
            trigger.clone(),
            Arc::clone(&clock),
        );
        let monitor = TimeoutMonitor::new(
            store.clone(),
            trigger.clone(),
            Arc::clone(&clock),
            settings.sweep_interval,
        );

        Ok(Self {
            settings,
            registry,
            documents,
            store,
            trigger,
            ingress,
            monitor,
            alerts,
            clock,
            metrics: EngineMetrics::new(),
        })
    }

    /// Engine settings.
    #[must_use]
    pub const fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Phase configuration.
    #[must_use]
    pub fn registry(&self) -> &PhaseRegistry {
        &self.registry
    }

    /// Event ingress.
    #[must_use]
    pub const fn ingress(&self) -> &EventIngress {
        &self.ingress
    }

    /// Timeout monitor, for running the sweep loop.
    #[must_use]
    pub const fn monitor(&self) -> &TimeoutMonitor {
        &self.monitor
    }

    /// Transition trigger.
    #[must_use]
    pub const fn trigger(&self) -> &TransitionTrigger {
        &self.trigger
    }

    /// A lease coordinator sharing the engine's document store.
    #[must_use]
    pub fn coordinator(&self, resumption: ResumptionPolicy) -> StoreCoordinator {
        StoreCoordinator::new(
            Arc::clone(&self.documents),
            Arc::clone(&self.clock),
            Arc::clone(&self.alerts),
            resumption,
            self.settings.store_timeout,
            self.settings.store_retry,
        )
    }

    /// Accepts a completion event. See [`EventIngress::accept`].
    ///
    /// # Errors
    ///
    /// Returns an error if the schedule or store fails.
    pub async fn accept(&self, event: &CompletionEvent) -> Result<AcceptOutcome> {
        self.ingress.accept(event).await
    }

    /// Runs one timeout sweep. See [`TimeoutMonitor::sweep`].
    ///
    /// # Errors
    ///
    /// Returns an error if phase states cannot be listed.
    pub async fn sweep(&self) -> Result<SweepReport> {
        self.monitor.sweep().await
    }

    /// Current status of one phase.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn status(
        &self,
        pipeline_date: NaiveDate,
        phase: Phase,
    ) -> Result<Option<PhaseStatusView>> {
        let state = self.store.get(PhaseKey::new(pipeline_date, phase)).await?;
        Ok(state.as_ref().map(PhaseStatusView::from))
    }

    /// Status of every phase stored for a date, in pipeline order.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn run_status(&self, pipeline_date: NaiveDate) -> Result<Vec<PhaseStatusView>> {
        let mut views = Vec::new();
        for key in self.store.keys_for_date(pipeline_date).await? {
            if let Some(state) = self.store.get(key).await? {
                views.push(PhaseStatusView::from(&state));
            }
        }
        Ok(views)
    }

    /// Forces an open phase to FAILED.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PhaseStateNotFound`](crate::error::Error::PhaseStateNotFound)
    /// if the phase has no state, or a validation error if it is already
    /// terminal.
    #[tracing::instrument(skip(self), fields(date = %pipeline_date, phase = %phase))]
    pub async fn force_fail(
        &self,
        pipeline_date: NaiveDate,
        phase: Phase,
        reason: &str,
    ) -> Result<PhaseStatusView> {
        let now = self.clock.now();
        let reason = format!("forced by operator: {reason}");
        let updated = self
            .store
            .update(PhaseKey::new(pipeline_date, phase), |state| {
                state.fail(reason.clone(), now)?;
                Ok(Change::Commit(()))
            })
            .await?;

        self.metrics
            .record_transition(phase.as_str(), PhaseStatus::Failed.to_string().as_str());
        tracing::warn!(%reason, "phase forced to failed");
        self.alerts
            .raise(Alert::PhaseFailed {
                pipeline_date,
                phase,
                reason,
            })
            .await;
        Ok(PhaseStatusView::from(&updated.state))
    }

    /// Clears the trigger of an advanced phase so the next reconciliation
    /// publishes its transition again under a new trigger id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PhaseStateNotFound`](crate::error::Error::PhaseStateNotFound)
    /// if the phase has no state, or a validation error if it has not
    /// advanced.
    #[tracing::instrument(skip(self), fields(date = %pipeline_date, phase = %phase))]
    pub async fn clear_trigger(
        &self,
        pipeline_date: NaiveDate,
        phase: Phase,
    ) -> Result<PhaseStatusView> {
        let updated = self
            .store
            .update(PhaseKey::new(pipeline_date, phase), |state| {
                state.clear_trigger()?;
                Ok(Change::Commit(()))
            })
            .await?;
        tracing::info!(
            retriggers = updated.state.retriggers,
            "trigger cleared, transition will be republished"
        );
        Ok(PhaseStatusView::from(&updated.state))
    }

    /// Reopens a FAILED phase for a manual rerun.
    ///
    /// Events already applied stay applied; the rerun's resubmitted events
    /// merge as usual and the phase is evaluated again, with its timeout
    /// clock restarted now.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PhaseStateNotFound`](crate::error::Error::PhaseStateNotFound)
    /// if the phase has no state, or a validation error if it is not FAILED.
    #[tracing::instrument(skip(self), fields(date = %pipeline_date, phase = %phase))]
    pub async fn rerun(&self, pipeline_date: NaiveDate, phase: Phase) -> Result<PhaseStatusView> {
        let now = self.clock.now();
        let updated = self
            .store
            .update(PhaseKey::new(pipeline_date, phase), |state| {
                state.reopen(now)?;
                Ok(Change::Commit(()))
            })
            .await?;
        tracing::info!(
            reruns = updated.state.reruns,
            status = %updated.state.status,
            "failed phase reopened for rerun"
        );
        Ok(PhaseStatusView::from(&updated.state))
    }

    /// Deletes closed phase states decided more than the retention period
    /// before `now`. States with an outstanding publish are kept.
    ///
    /// Returns how many states were deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if phase states cannot be listed.
    #[tracing::instrument(skip(self))]
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - self.settings.retention;
        let mut purged = 0;

        for key in self.store.keys().await? {
            let state = match self.store.get(key).await {
                Ok(Some(state)) => state,
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(%key, error = %err, "purge could not read phase state");
                    continue;
                }
            };
            if !purgeable(&state, cutoff) {
                continue;
            }
            match self.store.delete(key, state.revision).await {
                Ok(true) => purged += 1,
                Ok(false) => tracing::debug!(%key, "phase state changed during purge, kept"),
                Err(err) => tracing::warn!(%key, error = %err, "purge could not delete phase state"),
            }
        }
        tracing::info!(purged, %cutoff, "retention purge complete");
        Ok(purged)
    }
}

/// A state is purgeable once it is closed, delivered or given up on, and was
/// decided before `cutoff`.
fn purgeable(state: &PhaseState, cutoff: DateTime<Utc>) -> bool {
    if !state.status.is_terminal() || state.publish_outstanding() {
        return false;
    }
    let decided_at = state
        .transition
        .as_ref()
        .map(|t| t.decided_at)
        .or(state.failed_at);
    decided_at.is_some_and(|at| at < cutoff)
}
