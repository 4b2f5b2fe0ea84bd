//! Operator alerts.
//!
//! The engine raises alerts into an [`AlertSink`]; delivering them (pager,
//! chat, email) is the sink's concern.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::metrics::EngineMetrics;
use crate::pipeline::Phase;

/// An operator-facing alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "alert", rename_all = "snake_case")]
pub enum Alert {
    /// A critical processor failed and the phase is blocked.
    CircuitOpen {
        /// Pipeline date.
        pipeline_date: NaiveDate,
        /// Blocked phase.
        phase: Phase,
        /// Failed critical processors.
        processors: Vec<String>,
    },
    /// A phase moved to FAILED.
    PhaseFailed {
        /// Pipeline date.
        pipeline_date: NaiveDate,
        /// Failed phase.
        phase: Phase,
        /// Why it failed.
        reason: String,
    },
    /// The transition message could not be delivered.
    PublishExhausted {
        /// Pipeline date.
        pipeline_date: NaiveDate,
        /// Phase whose transition is undelivered.
        phase: Phase,
        /// Attempts made.
        attempts: u32,
        /// Last transport error.
        last_error: Option<String>,
    },
    /// A timeout tier flagged for notification was reached.
    TimeoutTierReached {
        /// Pipeline date.
        pipeline_date: NaiveDate,
        /// Waiting phase.
        phase: Phase,
        /// Index of the tier on the ladder.
        tier: u32,
        /// Seconds since the phase started.
        elapsed_secs: i64,
    },
    /// A store operation kept conflicting or failing.
    StoreRetriesExhausted {
        /// Store key.
        key: String,
        /// Attempts made.
        attempts: u32,
    },
}

impl Alert {
    /// Stable alert name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::CircuitOpen { .. } => "circuit_open",
            Self::PhaseFailed { .. } => "phase_failed",
            Self::PublishExhausted { .. } => "publish_exhausted",
            Self::TimeoutTierReached { .. } => "timeout_tier_reached",
            Self::StoreRetriesExhausted { .. } => "store_retries_exhausted",
        }
    }

    /// Returns true for alerts that block the pipeline.
    #[must_use]
    pub const fn is_blocking(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. } | Self::PhaseFailed { .. } | Self::PublishExhausted { .. }
        )
    }
}

/// Destination for alerts.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Raises an alert. Delivery failures are the sink's to handle.
    async fn raise(&self, alert: Alert);
}

#[async_trait]
impl<S: AlertSink + ?Sized> AlertSink for Arc<S> {
    async fn raise(&self, alert: Alert) {
        (**self).raise(alert).await;
    }
}

/// Sink that writes alerts to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn raise(&self, alert: Alert) {
        EngineMetrics::new().record_alert(alert.name());
        let payload = serde_json::to_string(&alert).unwrap_or_default();
        if alert.is_blocking() {
            tracing::error!(alert = alert.name(), %payload, "operator alert");
        } else {
            tracing::warn!(alert = alert.name(), %payload, "operator alert");
        }
    }
}

/// Sink that keeps alerts in memory. Useful in tests.
#[derive(Debug, Default)]
pub struct MemoryAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl MemoryAlertSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every alert raised so far.
    #[must_use]
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Counts raised alerts with the given name.
    #[must_use]
    pub fn count(&self, name: &str) -> usize {
        self.alerts().iter().filter(|a| a.name() == name).count()
    }
}

#[async_trait]
impl AlertSink for MemoryAlertSink {
    async fn raise(&self, alert: Alert) {
        EngineMetrics::new().record_alert(alert.name());
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(alert);
    }
}
