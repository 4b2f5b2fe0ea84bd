//! Completion evaluation.
//!
//! [`evaluate`] is a pure function of the phase state, its configuration, the
//! run mode, and the evaluation time. Ingress calls it inline after every
//! applied event and the timeout monitor calls it on each sweep, so both paths
//! reach the same decision for the same inputs.
//!
//! Rules, in priority order:
//!
//! 1. `CircuitOpen` if any critical processor's latest report is a failure.
//! 2. `Ready` if every critical processor completed and the non-critical
//!    completion fraction reaches the full threshold.
//! 3. `Degraded` if every critical processor completed, the fraction reaches
//!    the degraded threshold in force, and the grace period since the last
//!    critical completion has elapsed.
//! 4. `Wait` while the final timeout tier has not been reached.
//! 5. `TimedOut` otherwise.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{ModePolicy, PhaseConfig};
use crate::pipeline::RunMode;
use crate::state::{PhaseState, PhaseStatus, TransitionKind};

/// A timeout tier the phase has reached while waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierReached {
    /// Position on the timeout ladder.
    pub index: u32,
    /// Whether the tier asks for an operator notification.
    pub notify: bool,
}

/// Outcome of evaluating a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    /// Keep waiting.
    Wait {
        /// Highest tier reached so far.
        tier: Option<TierReached>,
    },
    /// Full completion.
    Ready,
    /// Proceed with known-partial coverage.
    Degraded,
    /// Blocked by failed critical processors.
    CircuitOpen {
        /// Critical processors whose latest report is a failure.
        processors: Vec<String>,
    },
    /// The final tier elapsed.
    TimedOut {
        /// Whether every critical processor completed.
        critical_satisfied: bool,
    },
}

impl Decision {
    /// Stable name, used for metrics and logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Wait { .. } => "wait",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::TimedOut { .. } => "timed_out",
        }
    }

    /// Status and coverage a proceed decision moves the phase to.
    #[must_use]
    pub const fn proceed(&self) -> Option<(PhaseStatus, TransitionKind)> {
        match self {
            Self::Ready => Some((PhaseStatus::Ready, TransitionKind::Full)),
            Self::Degraded => Some((PhaseStatus::Degraded, TransitionKind::Partial)),
            Self::TimedOut {
                critical_satisfied: true,
            } => Some((PhaseStatus::TimedOut, TransitionKind::Partial)),
            _ => None,
        }
    }

    /// Returns true if the decision fails the phase.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::TimedOut {
                critical_satisfied: false
            }
        )
    }
}

/// Evaluates a phase.
#[must_use]
pub fn evaluate(
    state: &PhaseState,
    config: &PhaseConfig,
    mode: RunMode,
    now: DateTime<Utc>,
) -> Decision {
    let failed = state.failed_critical();
    if !failed.is_empty() {
        return Decision::CircuitOpen { processors: failed };
    }

    let policy = config.policy(mode);
    let elapsed = now - state.started_at();
    let critical_satisfied = state.critical_satisfied();
    let fraction = non_critical_fraction(state, config);

    if critical_satisfied {
        if fraction >= policy.full_threshold {
            return Decision::Ready;
        }
        if fraction >= policy.degraded_threshold_at(elapsed) && grace_elapsed(state, policy, now) {
            return Decision::Degraded;
        }
    }

    if elapsed < policy.final_timeout() {
        let tier = policy.tier_reached(elapsed).map(|(index, tier)| TierReached {
            index: u32::try_from(index).unwrap_or(u32::MAX),
            notify: tier.notify,
        });
        return Decision::Wait { tier };
    }

    Decision::TimedOut { critical_satisfied }
}

/// Fraction of registered non-critical processors that completed.
///
/// A phase without non-critical processors is fully covered.
#[must_use]
pub fn non_critical_fraction(state: &PhaseState, config: &PhaseConfig) -> f64 {
    let non_critical = config.non_critical();
    if non_critical.is_empty() {
        return 1.0;
    }
    let done = non_critical.intersection(&state.completed).count();
    ratio(done, non_critical.len())
}

#[allow(clippy::cast_precision_loss)] // processor counts are tiny
fn ratio(done: usize, total: usize) -> f64 {
    done as f64 / total as f64
}

fn grace_elapsed(state: &PhaseState, policy: &ModePolicy, now: DateTime<Utc>) -> bool {
    let since = state
        .last_critical_completion_at
        .unwrap_or_else(|| state.started_at());
    now - since >= policy.grace_period()
}
