//! Phase transitions and their delivery.
//!
//! [`TransitionTrigger::resolve`] is the one path through which an evaluation
//! turns into a state change. Ingress calls it after applying an event, the
//! timeout monitor calls it on every sweep. The decision is recomputed inside
//! the compare-and-set closure, so whichever caller commits first wins and
//! every other caller observes a closed phase: at most one transition, and
//! therefore at most one transition message, per phase state.
//!
//! Publishing happens after the transition commits. A failed publish never
//! rolls the transition back. It is retried inline with backoff and then
//! picked up by [`TransitionTrigger::reconcile`] once the retry interval has
//! passed, until the attempt budget is spent and an alert is raised.

pub mod memory;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sideline_core::Clock;

use crate::alert::{Alert, AlertSink};
use crate::config::{EngineSettings, PhaseRegistry};
use crate::error::{Error, Result};
use crate::evaluator::{Decision, evaluate};
use crate::metrics::EngineMetrics;
use crate::pipeline::{Phase, PipelineRun, RunMode};
use crate::retry::RetryPolicy;
use crate::state::{PhaseState, PhaseStatus, TransitionKind};
use crate::store::{Change, PhaseKey, PhaseStateStore};

pub use memory::InMemoryTransport;

/// Acknowledgement returned by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    /// Transport-assigned message id.
    pub message_id: String,
}

/// Messaging backend the transition messages are published to.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publishes a payload to a topic.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<PublishAck>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<PublishAck> {
        (**self).publish(topic, payload).await
    }
}

/// Message announcing that a phase advanced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionMessage {
    /// Deterministic id consumers dedup redeliveries on.
    pub trigger_id: String,
    /// Pipeline date.
    pub pipeline_date: NaiveDate,
    /// Run mode.
    pub mode: RunMode,
    /// Phase that completed.
    pub phase: Phase,
    /// Phase to start, `None` when the pipeline finished.
    pub next_phase: Option<Phase>,
    /// Full or partial coverage.
    pub decision: TransitionKind,
    /// Status the completed phase moved to.
    pub status: PhaseStatus,
    /// Union of entities changed during the phase.
    pub entities_changed: BTreeSet<String>,
    /// Correlation id of the run.
    pub correlation_id: String,
    /// Revision of the state the decision was computed from.
    pub source_revision: u64,
}

impl TransitionMessage {
    /// Builds the message for a transitioned state.
    ///
    /// Returns `None` if the state has no transition.
    #[must_use]
    pub fn from_state(state: &PhaseState) -> Option<Self> {
        let transition = state.transition.as_ref()?;
        Some(Self {
            trigger_id: state.trigger_id()?,
            pipeline_date: state.pipeline_date,
            mode: state.mode,
            phase: state.phase,
            next_phase: state.phase.next(),
            decision: transition.kind,
            status: transition.status,
            entities_changed: state.entities_changed.clone(),
            correlation_id: state.correlation_id.clone(),
            source_revision: transition.source_revision,
        })
    }

    /// Destination topic.
    #[must_use]
    pub fn topic(&self) -> String {
        self.phase.transition_topic()
    }

    /// Encodes the message as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_payload(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

/// What a call to [`TransitionTrigger::resolve`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The phase was already closed; nothing changed.
    Closed {
        /// Current status.
        status: PhaseStatus,
    },
    /// The phase stays open.
    Open {
        /// The evaluation result.
        decision: Decision,
    },
    /// This call committed the transition.
    Transitioned {
        /// New status.
        status: PhaseStatus,
        /// Coverage.
        kind: TransitionKind,
        /// Whether the inline publish succeeded.
        published: bool,
    },
    /// This call failed the phase.
    Failed,
}

/// Outcome of a reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Publish attempts made.
    pub attempted: usize,
    /// Messages delivered.
    pub published: usize,
    /// Phases whose attempt budget ran out during this pass.
    pub exhausted: usize,
}

/// Effect an update closure committed, acted upon after the commit.
enum Effect {
    None,
    CircuitOpened(Vec<String>),
    TierNotified(u32),
    Transitioned(PhaseStatus, TransitionKind),
    Failed,
}

/// Drives phase transitions and delivers transition messages.
#[derive(Clone)]
pub struct TransitionTrigger {
    store: PhaseStateStore,
    registry: Arc<PhaseRegistry>,
    transport: Arc<dyn Transport>,
    alerts: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    publish_timeout: StdDuration,
    publish_retry: RetryPolicy,
    publish_retry_interval: Duration,
    max_publish_attempts: u32,
    metrics: EngineMetrics,
}

impl fmt::Debug for TransitionTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransitionTrigger")
            .field("publish_timeout", &self.publish_timeout)
            .field("publish_retry", &self.publish_retry)
            .field("max_publish_attempts", &self.max_publish_attempts)
            .finish_non_exhaustive()
    }
}

impl TransitionTrigger {
    /// Creates a trigger.
    #[must_use]
    pub fn new(
        store: PhaseStateStore,
        registry: Arc<PhaseRegistry>,
        transport: Arc<dyn Transport>,
        alerts: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
        settings: &EngineSettings,
    ) -> Self {
        Self {
            store,
            registry,
            transport,
            alerts,
            clock,
            publish_timeout: settings.publish_timeout,
            publish_retry: settings.publish_retry,
            publish_retry_interval: settings.publish_retry_interval,
            max_publish_attempts: settings.max_publish_attempts,
            metrics: EngineMetrics::new(),
        }
    }

    /// Evaluates a phase at `now` and applies the decision.
    ///
    /// # Errors
    ///
    /// Returns an error if the phase is not configured, the state does not
    /// exist, or the store gives up.
    #[tracing::instrument(skip(self), fields(date = %key.pipeline_date, phase = %key.phase))]
    pub async fn resolve(&self, key: PhaseKey, now: DateTime<Utc>) -> Result<Resolution> {
        let config = self
            .registry
            .get(key.phase)
            .ok_or_else(|| Error::config(format!("phase {} is not configured", key.phase)))?;

        let updated = self
            .store
            .update(key, |state| {
                if state.is_closed() {
                    return Ok(Change::Keep((None, Effect::None)));
                }
                let decision = evaluate(state, config, state.mode, now);
                let change = match &decision {
                    Decision::CircuitOpen { processors } => {
                        if state.circuit_open {
                            Change::Keep(Effect::None)
                        } else {
                            state.circuit_open = true;
                            Change::Commit(Effect::CircuitOpened(processors.clone()))
                        }
                    }
                    Decision::Wait { tier } => {
                        let notify = tier.filter(|t| {
                            t.notify && state.notified_tier.is_none_or(|n| t.index > n)
                        });
                        if let Some(tier) = notify {
                            state.notified_tier = Some(tier.index);
                            state.circuit_open = false;
                            Change::Commit(Effect::TierNotified(tier.index))
                        } else if state.circuit_open {
                            state.circuit_open = false;
                            Change::Commit(Effect::None)
                        } else {
                            Change::Keep(Effect::None)
                        }
                    }
                    Decision::Ready | Decision::Degraded | Decision::TimedOut { .. } => {
                        if let Some((status, kind)) = decision.proceed() {
                            state.begin_transition(status, kind, now)?;
                            Change::Commit(Effect::Transitioned(status, kind))
                        } else {
                            state.fail(
                                "final timeout tier elapsed before the critical set completed",
                                now,
                            )?;
                            Change::Commit(Effect::Failed)
                        }
                    }
                };
                Ok(match change {
                    Change::Commit(effect) => Change::Commit((Some(decision), effect)),
                    Change::Keep(effect) => Change::Keep((Some(decision), effect)),
                })
            })
            .await?;

        let state = updated.state;
        let (decision, effect) = updated.value;
        let Some(decision) = decision else {
            return Ok(Resolution::Closed {
                status: state.status,
            });
        };
        self.metrics.record_decision(key.phase.as_str(), decision.name());

        match effect {
            Effect::None => Ok(Resolution::Open { decision }),
            Effect::CircuitOpened(processors) => {
                tracing::error!(?processors, "critical processor failure, phase blocked");
                self.alerts
                    .raise(Alert::CircuitOpen {
                        pipeline_date: key.pipeline_date,
                        phase: key.phase,
                        processors,
                    })
                    .await;
                Ok(Resolution::Open { decision })
            }
            Effect::TierNotified(tier) => {
                let elapsed = now - state.started_at();
                tracing::warn!(tier, elapsed_secs = elapsed.num_seconds(), "timeout tier reached");
                self.alerts
                    .raise(Alert::TimeoutTierReached {
                        pipeline_date: key.pipeline_date,
                        phase: key.phase,
                        tier,
                        elapsed_secs: elapsed.num_seconds(),
                    })
                    .await;
                Ok(Resolution::Open { decision })
            }
            Effect::Failed => {
                self.metrics.record_transition(
                    key.phase.as_str(),
                    PhaseStatus::Failed.to_string().as_str(),
                );
                let reason = state.failure_reason.clone().unwrap_or_default();
                tracing::error!(%reason, "phase failed");
                self.alerts
                    .raise(Alert::PhaseFailed {
                        pipeline_date: key.pipeline_date,
                        phase: key.phase,
                        reason,
                    })
                    .await;
                Ok(Resolution::Failed)
            }
            Effect::Transitioned(status, kind) => {
                self.metrics
                    .record_transition(key.phase.as_str(), status.to_string().as_str());
                tracing::info!(
                    %status,
                    %kind,
                    source_revision = state.transition.as_ref().map_or(0, |t| t.source_revision),
                    entities = state.entities_changed.len(),
                    "phase transition committed"
                );
                self.create_next_placeholder(&state, now).await;
                let published = self.publish_inline(&state).await;
                Ok(Resolution::Transitioned {
                    status,
                    kind,
                    published,
                })
            }
        }
    }

    /// Publishes a freshly committed transition, retrying inline.
    ///
    /// The first attempt was claimed by the transition commit itself.
    async fn publish_inline(&self, state: &PhaseState) -> bool {
        let key = PhaseKey::from(state);
        let mut current = state.clone();
        let mut attempt = 1;
        loop {
            match self.attempt_publish(&current).await {
                Ok(true) => return true,
                Ok(false) => return false,
                Err(err) => {
                    tracing::warn!(%key, attempt, error = %err, "transition publish failed");
                }
            }
            if !self.publish_retry.allows_another(attempt) {
                return false;
            }
            self.publish_retry.wait(attempt).await;
            attempt += 1;
            match self.claim(key, self.clock.now(), false).await {
                Ok(Some(claimed)) => current = claimed,
                Ok(None) => return false,
                Err(err) => {
                    tracing::warn!(%key, error = %err, "could not claim publish attempt");
                    return false;
                }
            }
        }
    }

    /// Makes one publish attempt for a claimed state and records the result.
    ///
    /// Returns `Ok(true)` on delivery, `Ok(false)` if the budget is spent, and
    /// the transport error otherwise.
    async fn attempt_publish(&self, state: &PhaseState) -> Result<bool> {
        let key = PhaseKey::from(state);
        let message = TransitionMessage::from_state(state).ok_or_else(|| {
            Error::validation(format!("{key} has no transition to publish"))
        })?;
        let topic = message.topic();
        let payload = message.to_payload()?;

        let sent = match tokio::time::timeout(
            self.publish_timeout,
            self.transport.publish(&topic, payload),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::transport(&topic, "publish timed out")),
        };

        match sent {
            Ok(ack) => {
                self.metrics.record_publish(key.phase.as_str(), "ok");
                let now = self.clock.now();
                self.store
                    .update(key, |s| {
                        s.mark_published(now);
                        Ok(Change::Commit(()))
                    })
                    .await?;
                tracing::info!(
                    %key,
                    %topic,
                    trigger_id = %message.trigger_id,
                    transport_message_id = %ack.message_id,
                    "transition published"
                );
                Ok(true)
            }
            Err(err) => {
                self.metrics.record_publish(key.phase.as_str(), "error");
                let error_text = err.to_string();
                let max = self.max_publish_attempts;
                let updated = self
                    .store
                    .update(key, |s| {
                        if s.record_publish_failure(error_text.clone(), max) {
                            Ok(Change::Commit(true))
                        } else if s.publish.published_at.is_none() {
                            Ok(Change::Commit(false))
                        } else {
                            Ok(Change::Keep(false))
                        }
                    })
                    .await?;
                if updated.value {
                    self.raise_exhausted(&updated.state).await;
                    return Ok(false);
                }
                Err(err)
            }
        }
    }

    async fn raise_exhausted(&self, state: &PhaseState) {
        tracing::error!(
            date = %state.pipeline_date,
            phase = %state.phase,
            attempts = state.publish.attempts,
            "transition publish attempts exhausted"
        );
        self.alerts
            .raise(Alert::PublishExhausted {
                pipeline_date: state.pipeline_date,
                phase: state.phase,
                attempts: state.publish.attempts,
                last_error: state.publish.last_error.clone(),
            })
            .await;
    }

    /// Claims a publish attempt. With `due_only`, only claims if the retry
    /// interval has passed since the last attempt.
    async fn claim(
        &self,
        key: PhaseKey,
        now: DateTime<Utc>,
        due_only: bool,
    ) -> Result<Option<PhaseState>> {
        let interval = self.publish_retry_interval;
        let updated = self
            .store
            .update(key, |state| {
                if due_only && !state.publish_due(now, interval) {
                    return Ok(Change::Keep(false));
                }
                Ok(if state.claim_publish(now) {
                    Change::Commit(true)
                } else {
                    Change::Keep(false)
                })
            })
            .await?;
        Ok(updated.value.then_some(updated.state))
    }

    /// Re-attempts delivery for every advanced phase with an outstanding
    /// publish whose last attempt is older than the retry interval.
    ///
    /// # Errors
    ///
    /// Returns an error if the phase states cannot be listed. Failures on
    /// individual phases are logged and counted, not returned.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile(&self, now: DateTime<Utc>) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        for key in self.store.keys().await? {
            let state = match self.store.get(key).await {
                Ok(Some(state)) => state,
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(%key, error = %err, "reconcile could not read phase state");
                    continue;
                }
            };
            if !state.publish_due(now, self.publish_retry_interval) {
                continue;
            }
            let claimed = match self.claim(key, now, true).await {
                Ok(Some(claimed)) => claimed,
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(%key, error = %err, "reconcile could not claim publish");
                    continue;
                }
            };
            report.attempted += 1;
            tracing::info!(
                %key,
                attempt = claimed.publish.attempts,
                "re-attempting transition publish"
            );
            match self.attempt_publish(&claimed).await {
                Ok(true) => report.published += 1,
                Ok(false) => report.exhausted += 1,
                Err(err) => tracing::warn!(%key, error = %err, "reconcile publish failed"),
            }
        }
        Ok(report)
    }

    /// Creates the next phase's state as a pending placeholder.
    async fn create_next_placeholder(&self, state: &PhaseState, now: DateTime<Utc>) {
        let Some(next) = state.phase.next() else {
            return;
        };
        let Some(config) = self.registry.get(next) else {
            return;
        };
        let run = PipelineRun {
            pipeline_date: state.pipeline_date,
            mode: state.mode,
            correlation_id: state.correlation_id.clone(),
        };
        let placeholder = PhaseState::new(&run, next, config.critical(), now);
        match self.store.create(&placeholder).await {
            Ok(true) => tracing::debug!(phase = %next, "created pending placeholder"),
            Ok(false) => {}
            Err(err) => tracing::warn!(phase = %next, error = %err, "could not create placeholder"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn message_carries_transition_fields() {
        let date = NaiveDate::from_ymd_opt(2026, 2, 28).unwrap();
        let at = Utc.with_ymd_and_hms(2026, 2, 28, 23, 0, 0).unwrap();
        let run = PipelineRun::new(date, RunMode::SameDay).with_correlation_id("corr-9");
        let mut state = PhaseState::new(&run, Phase::Analytics, BTreeSet::new(), at);
        assert!(TransitionMessage::from_state(&state).is_none());

        state.entities_changed.insert("g1".into());
        state.revision = 3;
        state
            .begin_transition(PhaseStatus::Degraded, TransitionKind::Partial, at)
            .unwrap();

        let message = TransitionMessage::from_state(&state).unwrap();
        assert_eq!(message.topic(), "phase.precompute.trigger");
        assert_eq!(message.next_phase, Some(Phase::Precompute));
        assert_eq!(message.source_revision, 3);
        assert_eq!(message.trigger_id, "2026-02-28/analytics/3/0");

        let json: serde_json::Value = serde_json::from_slice(&message.to_payload().unwrap()).unwrap();
        assert_eq!(json["decision"], "partial");
        assert_eq!(json["mode"], "same_day");
        assert_eq!(json["correlation_id"], "corr-9");
        assert_eq!(json["entities_changed"][0], "g1");
    }
}
