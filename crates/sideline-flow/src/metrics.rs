//! Engine metrics.
//!
//! Recorded through the `metrics` crate facade; installing an exporter is the
//! host process's business. Without a recorder every call is a no-op.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `sideline_events_total` | Counter | `phase`, `outcome` |
//! | `sideline_decisions_total` | Counter | `phase`, `decision` |
//! | `sideline_transitions_total` | Counter | `phase`, `status` |
//! | `sideline_publish_total` | Counter | `phase`, `result` |
//! | `sideline_cas_conflicts_total` | Counter | `operation` |
//! | `sideline_alerts_total` | Counter | `alert` |
//! | `sideline_sweep_duration_seconds` | Histogram | - |
//! | `sideline_open_phases` | Gauge | - |
//! | `sideline_lease_operations_total` | Counter | `operation`, `result` |

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

/// Metric names.
pub mod names {
    /// Counter: completion events by ingress outcome.
    pub const EVENTS_TOTAL: &str = "sideline_events_total";
    /// Counter: evaluator decisions.
    pub const DECISIONS_TOTAL: &str = "sideline_decisions_total";
    /// Counter: committed phase transitions.
    pub const TRANSITIONS_TOTAL: &str = "sideline_transitions_total";
    /// Counter: transition publish attempts.
    pub const PUBLISH_TOTAL: &str = "sideline_publish_total";
    /// Counter: compare-and-set conflicts.
    pub const CAS_CONFLICTS_TOTAL: &str = "sideline_cas_conflicts_total";
    /// Counter: alerts raised.
    pub const ALERTS_TOTAL: &str = "sideline_alerts_total";
    /// Histogram: timeout monitor sweep duration in seconds.
    pub const SWEEP_DURATION_SECONDS: &str = "sideline_sweep_duration_seconds";
    /// Gauge: phases still pending or in progress at the last sweep.
    pub const OPEN_PHASES: &str = "sideline_open_phases";
    /// Counter: coordinator lease operations.
    pub const LEASE_OPERATIONS_TOTAL: &str = "sideline_lease_operations_total";
}

/// Label keys.
pub mod labels {
    /// Pipeline phase.
    pub const PHASE: &str = "phase";
    /// Ingress outcome (applied, duplicate, rejected).
    pub const OUTCOME: &str = "outcome";
    /// Evaluator decision.
    pub const DECISION: &str = "decision";
    /// Phase status.
    pub const STATUS: &str = "status";
    /// Result (ok, error, lost, held).
    pub const RESULT: &str = "result";
    /// Operation name.
    pub const OPERATION: &str = "operation";
    /// Alert name.
    pub const ALERT: &str = "alert";
}

/// Recorder for engine metrics. Cheap to clone.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineMetrics;

impl EngineMetrics {
    /// Creates a recorder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Records an ingress outcome.
    pub fn record_event(&self, phase: &str, outcome: &'static str) {
        counter!(
            names::EVENTS_TOTAL,
            labels::PHASE => phase.to_string(),
            labels::OUTCOME => outcome,
        )
        .increment(1);
    }

    /// Records an evaluator decision.
    pub fn record_decision(&self, phase: &str, decision: &'static str) {
        counter!(
            names::DECISIONS_TOTAL,
            labels::PHASE => phase.to_string(),
            labels::DECISION => decision,
        )
        .increment(1);
    }

    /// Records a committed transition.
    pub fn record_transition(&self, phase: &str, status: &str) {
        counter!(
            names::TRANSITIONS_TOTAL,
            labels::PHASE => phase.to_string(),
            labels::STATUS => status.to_string(),
        )
        .increment(1);
    }

    /// Records a publish attempt result.
    pub fn record_publish(&self, phase: &str, result: &'static str) {
        counter!(
            names::PUBLISH_TOTAL,
            labels::PHASE => phase.to_string(),
            labels::RESULT => result,
        )
        .increment(1);
    }

    /// Records a compare-and-set conflict.
    pub fn record_cas_conflict(&self, operation: &'static str) {
        counter!(names::CAS_CONFLICTS_TOTAL, labels::OPERATION => operation).increment(1);
    }

    /// Records a raised alert.
    pub fn record_alert(&self, alert: &'static str) {
        counter!(names::ALERTS_TOTAL, labels::ALERT => alert).increment(1);
    }

    /// Records a sweep duration.
    pub fn observe_sweep_duration(&self, duration: Duration) {
        histogram!(names::SWEEP_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    /// Sets the number of open phases seen by the last sweep.
    #[allow(clippy::cast_precision_loss)] // Gauge values are small
    pub fn set_open_phases(&self, count: usize) {
        gauge!(names::OPEN_PHASES).set(count as f64);
    }

    /// Records a lease operation.
    pub fn record_lease(&self, operation: &'static str, result: &'static str) {
        counter!(
            names::LEASE_OPERATIONS_TOTAL,
            labels::OPERATION => operation,
            labels::RESULT => result,
        )
        .increment(1);
    }
}

/// RAII guard that reports elapsed time when dropped.
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Starts timing.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Time since the guard was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}

/// Times a monitor sweep.
#[must_use]
pub fn time_sweep() -> TimingGuard<impl FnOnce(Duration)> {
    TimingGuard::new(|duration| EngineMetrics::new().observe_sweep_duration(duration))
}
