//! Completion event ingress.
//!
//! Admits events, merges each distinct `message_id` into its phase state
//! exactly once, and evaluates the phase inline through the shared transition
//! path.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sideline_core::Clock;
use sideline_core::observability::phase_span;
use tracing::Instrument;

use crate::config::PhaseRegistry;
use crate::error::Result;
use crate::event::CompletionEvent;
use crate::metrics::EngineMetrics;
use crate::pipeline::Phase;
use crate::schedule::RunSchedule;
use crate::state::{MergeOutcome, PhaseState, PhaseStatus};
use crate::store::{Change, PhaseKey, PhaseStateStore};
use crate::trigger::{Resolution, TransitionTrigger};

/// Why an event was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// A required field is blank or malformed.
    Malformed(String),
    /// No run is scheduled for the event's date.
    UnscheduledDate,
    /// The processor is not registered for any phase.
    UnregisteredProcessor,
    /// The phase already transitioned or failed.
    PhaseClosed {
        /// Status of the closed phase.
        status: PhaseStatus,
    },
}

impl RejectReason {
    /// Stable name for metrics and logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::UnscheduledDate => "unscheduled_date",
            Self::UnregisteredProcessor => "unregistered_processor",
            Self::PhaseClosed { .. } => "phase_closed",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(reason) => write!(f, "malformed event: {reason}"),
            Self::UnscheduledDate => f.write_str("no run scheduled for pipeline date"),
            Self::UnregisteredProcessor => f.write_str("processor is not registered"),
            Self::PhaseClosed { status } => write!(f, "phase is closed ({status})"),
        }
    }
}

/// Result of accepting an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// The event was merged.
    Applied {
        /// Outcome of the inline evaluation. `None` if it could not run; the
        /// timeout monitor picks the phase up on its next sweep.
        resolution: Option<Resolution>,
    },
    /// The event's `message_id` was applied before.
    DuplicateIgnored,
    /// The event was not admitted.
    Rejected(RejectReason),
}

impl AcceptOutcome {
    /// Stable name for metrics and logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Applied { .. } => "applied",
            Self::DuplicateIgnored => "duplicate",
            Self::Rejected(_) => "rejected",
        }
    }
}

enum Merge {
    Applied,
    Duplicate,
    Closed(PhaseStatus),
}

/// Admits completion events.
#[derive(Clone)]
pub struct EventIngress {
    store: PhaseStateStore,
    registry: Arc<PhaseRegistry>,
    schedule: Arc<dyn RunSchedule>,
    trigger: TransitionTrigger,
    clock: Arc<dyn Clock>,
    metrics: EngineMetrics,
}

impl fmt::Debug for EventIngress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventIngress")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl EventIngress {
    /// Creates an ingress.
    #[must_use]
    pub fn new(
        store: PhaseStateStore,
        registry: Arc<PhaseRegistry>,
        schedule: Arc<dyn RunSchedule>,
        trigger: TransitionTrigger,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            registry,
            schedule,
            trigger,
            clock,
            metrics: EngineMetrics::new(),
        }
    }

    /// Accepts an event, evaluating at the current time.
    ///
    /// # Errors
    ///
    /// Returns an error if the schedule or store fails. The event is then
    /// not applied and should be redelivered.
    pub async fn accept(&self, event: &CompletionEvent) -> Result<AcceptOutcome> {
        self.accept_at(event, self.clock.now()).await
    }

    /// Accepts an event, evaluating at `now`.
    ///
    /// # Errors
    ///
    /// Returns an error if the schedule or store fails.
    pub async fn accept_at(
        &self,
        event: &CompletionEvent,
        now: DateTime<Utc>,
    ) -> Result<AcceptOutcome> {
        if let Err(err) = event.validate() {
            return Ok(self.reject(event, None, RejectReason::Malformed(err.to_string())));
        }
        let Some(phase) = self.registry.phase_of(&event.processor_name) else {
            return Ok(self.reject(event, None, RejectReason::UnregisteredProcessor));
        };

        let span = phase_span(
            "accept",
            &event.pipeline_date.to_string(),
            phase.as_str(),
        );
        self.apply(event, phase, now).instrument(span).await
    }

    async fn apply(
        &self,
        event: &CompletionEvent,
        phase: Phase,
        now: DateTime<Utc>,
    ) -> Result<AcceptOutcome> {
        let Some(run) = self.schedule.run_for(event.pipeline_date).await? else {
            return Ok(self.reject(event, Some(phase), RejectReason::UnscheduledDate));
        };
        if let Some(correlation_id) = &event.correlation_id {
            if *correlation_id != run.correlation_id {
                tracing::debug!(
                    event_correlation_id = %correlation_id,
                    run_correlation_id = %run.correlation_id,
                    "event correlation id differs from the scheduled run"
                );
            }
        }
        let critical = self
            .registry
            .get(phase)
            .map(|config| config.critical())
            .unwrap_or_default();

        let key = PhaseKey::new(event.pipeline_date, phase);
        let updated = self
            .store
            .update_or_init(
                key,
                || PhaseState::new(&run, phase, critical.clone(), now),
                |state| {
                    if state.applied_message_ids.contains(&event.message_id) {
                        return Ok(Change::Keep(Merge::Duplicate));
                    }
                    if state.is_closed() {
                        return Ok(Change::Keep(Merge::Closed(state.status)));
                    }
                    Ok(match state.merge(event) {
                        MergeOutcome::Applied => Change::Commit(Merge::Applied),
                        MergeOutcome::Duplicate => Change::Keep(Merge::Duplicate),
                    })
                },
            )
            .await?;

        match updated.value {
            Merge::Duplicate => {
                self.metrics.record_event(phase.as_str(), "duplicate");
                tracing::debug!(message_id = %event.message_id, "duplicate completion event ignored");
                Ok(AcceptOutcome::DuplicateIgnored)
            }
            Merge::Closed(status) => Ok(self.reject(
                event,
                Some(phase),
                RejectReason::PhaseClosed { status },
            )),
            Merge::Applied => {
                self.metrics.record_event(phase.as_str(), "applied");
                tracing::info!(
                    processor = %event.processor_name,
                    status = ?event.status,
                    message_id = %event.message_id,
                    revision = updated.state.revision,
                    "completion event applied"
                );
                let resolution = match self.trigger.resolve(key, now).await {
                    Ok(resolution) => Some(resolution),
                    Err(err) => {
                        tracing::warn!(error = %err, "inline evaluation failed, deferring to sweep");
                        None
                    }
                };
                Ok(AcceptOutcome::Applied { resolution })
            }
        }
    }

    fn reject(
        &self,
        event: &CompletionEvent,
        phase: Option<Phase>,
        reason: RejectReason,
    ) -> AcceptOutcome {
        self.metrics
            .record_event(phase.map_or("unknown", |p| p.as_str()), "rejected");
        tracing::warn!(
            processor = %event.processor_name,
            date = %event.pipeline_date,
            message_id = %event.message_id,
            reason = reason.name(),
            "completion event rejected: {reason}"
        );
        AcceptOutcome::Rejected(reason)
    }
}
