//! Per-run phase completion state.
//!
//! A [`PhaseState`] is the single document tracking one `(pipeline_date,
//! phase)`. It is mutated only through compare-and-set on its revision, and
//! every mutation here is written so the result depends on the *set* of
//! applied events rather than their order or delivery count:
//!
//! - collections only grow (set union)
//! - timestamps are merged with `min`/`max`
//! - a processor's latest report is the one with the greatest
//!   `(emitted_at, message_id)`
//! - status only moves forward (see [`PhaseStatus::can_transition_to`])

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::event::{CompletionEvent, ProcessorStatus};
use crate::pipeline::{Phase, PipelineRun, RunMode};

/// Phase lifecycle status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseStatus {
    /// Expected but no completion event applied yet.
    #[default]
    Pending,
    /// At least one completion event applied.
    InProgress,
    /// Advanced with full coverage.
    Ready,
    /// Advanced with known-partial coverage.
    Degraded,
    /// Advanced with partial data after the final timeout tier.
    TimedOut,
    /// Blocked pending manual rerun.
    Failed,
}

impl PhaseStatus {
    /// Returns true if no further automatic transition can happen.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Ready | Self::Degraded | Self::TimedOut | Self::Failed
        )
    }

    /// Returns true if the status advances the pipeline to the next phase.
    #[must_use]
    pub const fn is_proceed(&self) -> bool {
        matches!(self, Self::Ready | Self::Degraded | Self::TimedOut)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub const fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Pending => matches!(
                target,
                Self::InProgress | Self::Ready | Self::Degraded | Self::TimedOut | Self::Failed
            ),
            Self::InProgress => matches!(
                target,
                Self::Ready | Self::Degraded | Self::TimedOut | Self::Failed
            ),
            Self::Ready | Self::Degraded | Self::TimedOut | Self::Failed => false,
        }
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Ready => "READY",
            Self::Degraded => "DEGRADED",
            Self::TimedOut => "TIMED_OUT",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Whether a transition carried full or partial coverage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    /// Every threshold for full completion was met.
    Full,
    /// Downstream consumers must treat the data as partial.
    Partial,
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => f.write_str("full"),
            Self::Partial => f.write_str("partial"),
        }
    }
}

/// The latest report seen from one processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorReport {
    /// Reported status.
    pub status: ProcessorStatus,
    /// Message that carried the report.
    pub message_id: String,
    /// When the processor emitted it.
    pub emitted_at: DateTime<Utc>,
}

impl ProcessorReport {
    fn supersedes(&self, other: &Self) -> bool {
        (self.emitted_at, &self.message_id) > (other.emitted_at, &other.message_id)
    }
}

/// Record of the transition that closed the phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// Full or partial coverage.
    pub kind: TransitionKind,
    /// Status the phase moved to.
    pub status: PhaseStatus,
    /// Evaluation time that produced the decision.
    pub decided_at: DateTime<Utc>,
    /// Revision of the state the decision was computed from.
    pub source_revision: u64,
}

/// Delivery bookkeeping for the transition message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishState {
    /// Publish attempts made so far, inline and swept.
    pub attempts: u32,
    /// When the last attempt was claimed.
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// When the message was acknowledged by the transport.
    pub published_at: Option<DateTime<Utc>>,
    /// Last publish error, if any.
    pub last_error: Option<String>,
    /// Attempts ran out; an alert was raised and the sweep stops retrying.
    pub exhausted: bool,
}

/// Result of merging a completion event into a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The event changed the state.
    Applied,
    /// The event's message id was already recorded.
    Duplicate,
}

/// Completion state for one `(pipeline_date, phase)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseState {
    /// Pipeline date.
    pub pipeline_date: NaiveDate,
    /// Phase.
    pub phase: Phase,
    /// Run mode.
    pub mode: RunMode,
    /// Correlation id of the run.
    pub correlation_id: String,
    /// Lifecycle status.
    pub status: PhaseStatus,
    /// Processors whose success is mandatory, captured from configuration.
    pub critical: BTreeSet<String>,
    /// Processors that have reported success or partial at least once.
    pub completed: BTreeSet<String>,
    /// Latest report per processor.
    pub reports: BTreeMap<String, ProcessorReport>,
    /// Union of entities changed by all applied events.
    pub entities_changed: BTreeSet<String>,
    /// Dedup record of applied message ids.
    pub applied_message_ids: BTreeSet<String>,
    /// When the state document was created.
    pub created_at: DateTime<Utc>,
    /// Earliest `emitted_at` among applied events.
    pub first_event_at: Option<DateTime<Utc>>,
    /// Latest `emitted_at` among applied events.
    pub last_event_at: Option<DateTime<Utc>>,
    /// Latest `emitted_at` of a critical processor's completion.
    pub last_critical_completion_at: Option<DateTime<Utc>>,
    /// A critical processor's latest report is a failure.
    pub circuit_open: bool,
    /// Highest timeout tier an alert was raised for.
    pub notified_tier: Option<u32>,
    /// Set together with the proceed status; at most once per state.
    pub triggered: bool,
    /// The transition that closed the phase.
    pub transition: Option<TransitionRecord>,
    /// Transition message delivery bookkeeping.
    #[serde(default)]
    pub publish: PublishState,
    /// Why the phase failed, if it did.
    pub failure_reason: Option<String>,
    /// When the phase failed.
    pub failed_at: Option<DateTime<Utc>>,
    /// Operator re-triggers so far.
    #[serde(default)]
    pub retriggers: u32,
    /// Manual reruns of a failed phase so far.
    #[serde(default)]
    pub reruns: u32,
    /// When the last manual rerun reopened the phase.
    #[serde(default)]
    pub reopened_at: Option<DateTime<Utc>>,
    /// Store revision this state was read at. Not part of the document.
    #[serde(skip)]
    pub revision: u64,
}

impl PhaseState {
    /// Creates a pending state for a phase of a run.
    #[must_use]
    pub fn new(
        run: &PipelineRun,
        phase: Phase,
        critical: BTreeSet<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            pipeline_date: run.pipeline_date,
            phase,
            mode: run.mode,
            correlation_id: run.correlation_id.clone(),
            status: PhaseStatus::Pending,
            critical,
            completed: BTreeSet::new(),
            reports: BTreeMap::new(),
            entities_changed: BTreeSet::new(),
            applied_message_ids: BTreeSet::new(),
            created_at,
            first_event_at: None,
            last_event_at: None,
            last_critical_completion_at: None,
            circuit_open: false,
            notified_tier: None,
            triggered: false,
            transition: None,
            publish: PublishState::default(),
            failure_reason: None,
            failed_at: None,
            retriggers: 0,
            reruns: 0,
            reopened_at: None,
            revision: 0,
        }
    }

    /// Merges a completion event.
    ///
    /// Re-merging an event whose message id is already recorded is a no-op.
    pub fn merge(&mut self, event: &CompletionEvent) -> MergeOutcome {
        if !self.applied_message_ids.insert(event.message_id.clone()) {
            return MergeOutcome::Duplicate;
        }

        let report = ProcessorReport {
            status: event.status,
            message_id: event.message_id.clone(),
            emitted_at: event.emitted_at,
        };
        match self.reports.get(&event.processor_name) {
            Some(existing) if !report.supersedes(existing) => {}
            _ => {
                self.reports.insert(event.processor_name.clone(), report);
            }
        }

        if event.status.is_completion() {
            self.completed.insert(event.processor_name.clone());
            if self.critical.contains(&event.processor_name) {
                self.last_critical_completion_at =
                    max_time(self.last_critical_completion_at, event.emitted_at);
            }
        }

        self.entities_changed
            .extend(event.entities_changed.iter().cloned());
        self.first_event_at = Some(
            self.first_event_at
                .map_or(event.emitted_at, |t| t.min(event.emitted_at)),
        );
        self.last_event_at = max_time(self.last_event_at, event.emitted_at);

        if self.status == PhaseStatus::Pending {
            self.status = PhaseStatus::InProgress;
        }
        MergeOutcome::Applied
    }

    /// Returns true if the state accepts no more events.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.triggered || self.status.is_terminal()
    }

    /// Returns true if every critical processor has completed.
    #[must_use]
    pub fn critical_satisfied(&self) -> bool {
        self.critical.is_subset(&self.completed)
    }

    /// Critical processors whose latest report is a failure.
    #[must_use]
    pub fn failed_critical(&self) -> Vec<String> {
        self.critical
            .iter()
            .filter(|name| {
                self.reports
                    .get(*name)
                    .is_some_and(|r| r.status == ProcessorStatus::Failed)
            })
            .cloned()
            .collect()
    }

    /// Instant the phase's timeout clock started. A rerun restarts it.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.reopened_at
            .or(self.first_event_at)
            .unwrap_or(self.created_at)
    }

    /// Moves the state to a proceed status and claims the trigger.
    ///
    /// Status and `triggered` change together so one compare-and-set commits
    /// both.
    ///
    /// # Errors
    ///
    /// Returns an error if the state was already triggered or the status
    /// transition is not allowed.
    pub fn begin_transition(
        &mut self,
        status: PhaseStatus,
        kind: TransitionKind,
        decided_at: DateTime<Utc>,
    ) -> Result<()> {
        if self.triggered {
            return Err(self.invalid(status, "transition already triggered"));
        }
        if !status.is_proceed() || !self.status.can_transition_to(status) {
            return Err(self.invalid(status, "status may only move forward to a proceed status"));
        }
        self.status = status;
        self.triggered = true;
        self.circuit_open = false;
        self.transition = Some(TransitionRecord {
            kind,
            status,
            decided_at,
            source_revision: self.revision,
        });
        self.publish = PublishState {
            attempts: 1,
            last_attempt_at: Some(decided_at),
            ..PublishState::default()
        };
        Ok(())
    }

    /// Moves the state to FAILED.
    ///
    /// # Errors
    ///
    /// Returns an error if the state is already terminal.
    pub fn fail(&mut self, reason: impl Into<String>, decided_at: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(PhaseStatus::Failed) {
            return Err(self.invalid(PhaseStatus::Failed, "phase is already terminal"));
        }
        self.status = PhaseStatus::Failed;
        self.failure_reason = Some(reason.into());
        self.failed_at = Some(decided_at);
        Ok(())
    }

    /// Reopens a FAILED phase for a manual rerun.
    ///
    /// Applied events, completions and entities are kept, so the rerun only
    /// has to resubmit what was missing. The failure, the circuit and the
    /// tier notifications are cleared and the timeout clock restarts at `now`.
    ///
    /// # Errors
    ///
    /// Returns a validation error unless the phase is FAILED.
    pub fn reopen(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != PhaseStatus::Failed {
            return Err(Error::validation(format!(
                "{}/{} is {} and cannot be rerun",
                self.pipeline_date, self.phase, self.status
            )));
        }
        self.status = if self.applied_message_ids.is_empty() {
            PhaseStatus::Pending
        } else {
            PhaseStatus::InProgress
        };
        self.failure_reason = None;
        self.failed_at = None;
        self.circuit_open = false;
        self.notified_tier = None;
        self.reopened_at = Some(now);
        self.reruns += 1;
        Ok(())
    }

    /// Returns true if the transition message still has to be delivered.
    #[must_use]
    pub const fn publish_outstanding(&self) -> bool {
        self.status.is_proceed() && self.publish.published_at.is_none() && !self.publish.exhausted
    }

    /// Returns true if a publish attempt may be claimed at `now`.
    #[must_use]
    pub fn publish_due(&self, now: DateTime<Utc>, retry_interval: Duration) -> bool {
        self.publish_outstanding()
            && self
                .publish
                .last_attempt_at
                .is_none_or(|last| now - last >= retry_interval)
    }

    /// Claims the next publish attempt.
    ///
    /// Re-arms `triggered` after an operator re-trigger. Returns false if
    /// nothing is outstanding.
    pub fn claim_publish(&mut self, now: DateTime<Utc>) -> bool {
        if !self.publish_outstanding() {
            return false;
        }
        self.triggered = true;
        self.publish.attempts += 1;
        self.publish.last_attempt_at = Some(now);
        true
    }

    /// Records a successful publish.
    pub fn mark_published(&mut self, now: DateTime<Utc>) {
        if self.publish.published_at.is_none() {
            self.publish.published_at = Some(now);
            self.publish.last_error = None;
        }
    }

    /// Records a failed publish attempt.
    ///
    /// Returns true if this failure used up the last allowed attempt.
    pub fn record_publish_failure(&mut self, error: impl Into<String>, max_attempts: u32) -> bool {
        if self.publish.published_at.is_some() || self.publish.exhausted {
            return false;
        }
        self.publish.last_error = Some(error.into());
        if self.publish.attempts >= max_attempts {
            self.publish.exhausted = true;
            return true;
        }
        false
    }

    /// Clears `triggered` so reconciliation publishes the transition again.
    ///
    /// # Errors
    ///
    /// Returns an error unless the phase has advanced.
    pub fn clear_trigger(&mut self) -> Result<()> {
        if !self.status.is_proceed() {
            return Err(Error::validation(format!(
                "{}/{} is {} and has no transition to re-trigger",
                self.pipeline_date, self.phase, self.status
            )));
        }
        self.triggered = false;
        self.retriggers += 1;
        self.publish = PublishState::default();
        Ok(())
    }

    /// Deterministic id of the transition message.
    ///
    /// Stable across redeliveries of the same transition; changes on each
    /// operator re-trigger.
    #[must_use]
    pub fn trigger_id(&self) -> Option<String> {
        self.transition.as_ref().map(|t| {
            format!(
                "{}/{}/{}/{}",
                self.pipeline_date, self.phase, t.source_revision, self.retriggers
            )
        })
    }

    fn invalid(&self, to: PhaseStatus, reason: &str) -> Error {
        Error::validation(format!(
            "invalid phase transition for {}/{}: {} -> {to} ({reason})",
            self.pipeline_date, self.phase, self.status
        ))
    }
}

fn max_time(current: Option<DateTime<Utc>>, candidate: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Some(current.map_or(candidate, |t| t.max(candidate)))
}

/// Read-only projection of a phase state for status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseStatusView {
    /// Pipeline date.
    pub pipeline_date: NaiveDate,
    /// Phase.
    pub phase: Phase,
    /// Run mode.
    pub mode: RunMode,
    /// Lifecycle status.
    pub status: PhaseStatus,
    /// Whether the transition was triggered.
    pub triggered: bool,
    /// Whether a critical processor failure blocks progress.
    pub circuit_open: bool,
    /// Critical processors not yet completed.
    pub missing_critical: Vec<String>,
    /// Number of processors that completed.
    pub completed: usize,
    /// Number of distinct entities changed.
    pub entities_changed: usize,
    /// Transition kind, once triggered.
    pub transition: Option<TransitionKind>,
    /// When the transition message was delivered.
    pub published_at: Option<DateTime<Utc>>,
    /// Why the phase failed.
    pub failure_reason: Option<String>,
    /// Manual reruns so far.
    pub reruns: u32,
    /// Store revision.
    pub revision: u64,
}

impl From<&PhaseState> for PhaseStatusView {
    fn from(state: &PhaseState) -> Self {
        Self {
            pipeline_date: state.pipeline_date,
            phase: state.phase,
            mode: state.mode,
            status: state.status,
            triggered: state.triggered,
            circuit_open: state.circuit_open,
            missing_critical: state
                .critical
                .difference(&state.completed)
                .cloned()
                .collect(),
            completed: state.completed.len(),
            entities_changed: state.entities_changed.len(),
            transition: state.transition.as_ref().map(|t| t.kind),
            published_at: state.publish.published_at,
            failure_reason: state.failure_reason.clone(),
            reruns: state.reruns,
            revision: state.revision,
        }
    }
}
