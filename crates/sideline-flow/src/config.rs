//! Engine configuration.
//!
//! Two layers:
//!
//! - [`PhaseRegistry`]: static per-phase processor registry with mode-keyed
//!   threshold and timeout tables. Parsed once at startup, validated, and
//!   shared as an immutable `Arc` with every component that evaluates phases.
//! - [`EngineSettings`]: operational knobs (timeouts, retry bounds, sweep
//!   interval, retention) read from `SIDELINE_*` environment variables.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration as StdDuration;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use sideline_core::observability::LogFormat;

use crate::error::{Error, Result};
use crate::pipeline::{ModeTable, Phase, RunMode};
use crate::retry::RetryPolicy;

/// A processor registered for a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorSpec {
    /// Processor name as it appears in completion events.
    pub name: String,
    /// Whether the processor's success is mandatory for any completion.
    #[serde(default)]
    pub critical: bool,
}

/// An escalation point on the timeout ladder.
///
/// Reaching a tier never causes a transition by itself; only the final tier
/// does (see [`crate::evaluator`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutTier {
    /// Seconds since the phase started at which the tier is reached.
    pub after_secs: u64,
    /// Replaces the mode's degraded threshold once this tier is reached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded_threshold: Option<f64>,
    /// Raise an operator notification when the tier is first reached.
    #[serde(default)]
    pub notify: bool,
}

impl TimeoutTier {
    /// Returns the tier offset as a duration.
    #[must_use]
    pub fn after(&self) -> Duration {
        secs(self.after_secs)
    }
}

/// Completion policy for one phase under one run mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModePolicy {
    /// Non-critical completion fraction required for READY.
    pub full_threshold: f64,
    /// Non-critical completion fraction required for DEGRADED.
    pub degraded_threshold: f64,
    /// Seconds to wait after the last critical completion before DEGRADED.
    pub grace_period_secs: u64,
    /// Escalation ladder, ascending by `after_secs`. The last tier is final.
    pub timeout_tiers: Vec<TimeoutTier>,
}

impl ModePolicy {
    /// Returns the grace period.
    #[must_use]
    pub fn grace_period(&self) -> Duration {
        secs(self.grace_period_secs)
    }

    /// Returns the final timeout, after which the phase is forced to resolve.
    #[must_use]
    pub fn final_timeout(&self) -> Duration {
        self.timeout_tiers
            .last()
            .map_or_else(|| secs(u64::from(u32::MAX)), TimeoutTier::after)
    }

    /// Returns the index and tier of the highest tier reached after `elapsed`.
    #[must_use]
    pub fn tier_reached(&self, elapsed: Duration) -> Option<(usize, &TimeoutTier)> {
        self.timeout_tiers
            .iter()
            .enumerate()
            .rev()
            .find(|(_, tier)| elapsed >= tier.after())
    }

    /// Degraded threshold in force after `elapsed`, honoring tier overrides.
    ///
    /// The most recently reached tier that sets an override wins.
    #[must_use]
    pub fn degraded_threshold_at(&self, elapsed: Duration) -> f64 {
        self.timeout_tiers
            .iter()
            .rev()
            .filter(|tier| elapsed >= tier.after())
            .find_map(|tier| tier.degraded_threshold)
            .unwrap_or(self.degraded_threshold)
    }

    fn validate(&self, phase: Phase, mode: RunMode) -> Result<()> {
        let ctx = format!("{phase}/{mode}");
        check_fraction(&ctx, "full_threshold", self.full_threshold)?;
        check_fraction(&ctx, "degraded_threshold", self.degraded_threshold)?;
        if self.degraded_threshold > self.full_threshold {
            return Err(Error::config(format!(
                "{ctx}: degraded_threshold {} exceeds full_threshold {}",
                self.degraded_threshold, self.full_threshold
            )));
        }
        if self.timeout_tiers.is_empty() {
            return Err(Error::config(format!(
                "{ctx}: at least one timeout tier is required"
            )));
        }
        let mut previous = None;
        for tier in &self.timeout_tiers {
            if previous.is_some_and(|p| tier.after_secs <= p) {
                return Err(Error::config(format!(
                    "{ctx}: timeout tiers must be strictly ascending"
                )));
            }
            if let Some(threshold) = tier.degraded_threshold {
                check_fraction(&ctx, "tier degraded_threshold", threshold)?;
            }
            previous = Some(tier.after_secs);
        }
        Ok(())
    }
}

/// Configuration of a single phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseConfig {
    /// The phase being configured.
    pub phase: Phase,
    /// Processors that report completion for this phase.
    pub processors: Vec<ProcessorSpec>,
    /// Mode-keyed completion policy.
    pub modes: ModeTable<ModePolicy>,
}

impl PhaseConfig {
    /// Returns the policy for a run mode.
    #[must_use]
    pub const fn policy(&self, mode: RunMode) -> &ModePolicy {
        self.modes.get(mode)
    }

    /// Returns true if `name` is registered for this phase.
    #[must_use]
    pub fn is_registered(&self, name: &str) -> bool {
        self.processors.iter().any(|p| p.name == name)
    }

    /// Returns the names of critical processors.
    #[must_use]
    pub fn critical(&self) -> BTreeSet<String> {
        self.processors
            .iter()
            .filter(|p| p.critical)
            .map(|p| p.name.clone())
            .collect()
    }

    /// Returns the names of non-critical processors.
    #[must_use]
    pub fn non_critical(&self) -> BTreeSet<String> {
        self.processors
            .iter()
            .filter(|p| !p.critical)
            .map(|p| p.name.clone())
            .collect()
    }
}

/// Registry of all phase configurations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawRegistry", into = "RawRegistry")]
pub struct PhaseRegistry {
    phases: BTreeMap<Phase, PhaseConfig>,
    owners: BTreeMap<String, Phase>,
}

#[derive(Serialize, Deserialize)]
struct RawRegistry {
    phases: Vec<PhaseConfig>,
}

impl TryFrom<RawRegistry> for PhaseRegistry {
    type Error = Error;

    fn try_from(raw: RawRegistry) -> Result<Self> {
        Self::new(raw.phases)
    }
}

impl From<PhaseRegistry> for RawRegistry {
    fn from(registry: PhaseRegistry) -> Self {
        Self {
            phases: registry.phases.into_values().collect(),
        }
    }
}

impl PhaseRegistry {
    /// Builds and validates a registry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a phase is configured twice, a processor
    /// name is registered more than once, or a mode policy is inconsistent.
    pub fn new(configs: impl IntoIterator<Item = PhaseConfig>) -> Result<Self> {
        let mut phases = BTreeMap::new();
        let mut owners = BTreeMap::new();

        for config in configs {
            for (mode, policy) in config.modes.iter() {
                policy.validate(config.phase, mode)?;
            }
            for processor in &config.processors {
                if processor.name.trim().is_empty() {
                    return Err(Error::config(format!(
                        "{}: processor names must not be blank",
                        config.phase
                    )));
                }
                if let Some(existing) = owners.insert(processor.name.clone(), config.phase) {
                    return Err(Error::config(format!(
                        "processor '{}' registered for both {existing} and {}",
                        processor.name, config.phase
                    )));
                }
            }
            let phase = config.phase;
            if phases.insert(phase, config).is_some() {
                return Err(Error::config(format!("phase {phase} configured twice")));
            }
        }

        Ok(Self { phases, owners })
    }

    /// Parses a registry from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed or fails validation.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::config(format!("phase registry: {e}")))
    }

    /// Returns the configuration of a phase.
    #[must_use]
    pub fn get(&self, phase: Phase) -> Option<&PhaseConfig> {
        self.phases.get(&phase)
    }

    /// Returns the phase a processor is registered for.
    #[must_use]
    pub fn phase_of(&self, processor_name: &str) -> Option<Phase> {
        self.owners.get(processor_name).copied()
    }

    /// Iterates configured phases in pipeline order.
    pub fn phases(&self) -> impl Iterator<Item = &PhaseConfig> {
        self.phases.values()
    }
}

/// Operational settings for engine components.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// Interval between timeout monitor sweeps.
    pub sweep_interval: StdDuration,
    /// Deadline for a single store call.
    pub store_timeout: StdDuration,
    /// Retry bound for store calls and CAS conflicts.
    pub store_retry: RetryPolicy,
    /// Deadline for a single publish call.
    pub publish_timeout: StdDuration,
    /// Inline publish retries right after a transition commits.
    pub publish_retry: RetryPolicy,
    /// Minimum age of the last publish attempt before the sweep retries it.
    pub publish_retry_interval: Duration,
    /// Total publish attempts (inline and swept) before alerting.
    pub max_publish_attempts: u32,
    /// How long closed phase states are retained. Also the dedup window.
    pub retention: Duration,
    /// Longest delay after which the transport may redeliver a message.
    pub max_redelivery_delay: Duration,
    /// Default lease duration for the instance coordinator.
    pub lease_duration: StdDuration,
    /// Heartbeat interval for held leases.
    pub heartbeat_interval: StdDuration,
    /// Log output format.
    pub log_format: LogFormat,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            sweep_interval: StdDuration::from_secs(120),
            store_timeout: StdDuration::from_secs(5),
            store_retry: RetryPolicy::default(),
            publish_timeout: StdDuration::from_secs(10),
            publish_retry: RetryPolicy::new(
                3,
                StdDuration::from_millis(200),
                StdDuration::from_secs(2),
            ),
            publish_retry_interval: Duration::minutes(5),
            max_publish_attempts: 10,
            retention: Duration::days(14),
            max_redelivery_delay: Duration::days(7),
            lease_duration: StdDuration::from_secs(300),
            heartbeat_interval: StdDuration::from_secs(60),
            log_format: LogFormat::Json,
        }
    }
}

impl EngineSettings {
    /// Loads settings from `SIDELINE_*` environment variables.
    ///
    /// Unset variables keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a variable cannot be parsed or the
    /// resulting settings are inconsistent.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads settings through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a value cannot be parsed or the resulting
    /// settings are inconsistent.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let vars = Vars { lookup };
        let mut settings = Self::default();

        if let Some(v) = vars.u64("SIDELINE_SWEEP_INTERVAL_SECS")? {
            settings.sweep_interval = StdDuration::from_secs(v);
        }
        if let Some(v) = vars.u64("SIDELINE_STORE_TIMEOUT_MS")? {
            settings.store_timeout = StdDuration::from_millis(v);
        }
        if let Some(v) = vars.u32("SIDELINE_STORE_MAX_ATTEMPTS")? {
            settings.store_retry.max_attempts = v;
        }
        if let Some(v) = vars.u64("SIDELINE_PUBLISH_TIMEOUT_MS")? {
            settings.publish_timeout = StdDuration::from_millis(v);
        }
        if let Some(v) = vars.u32("SIDELINE_PUBLISH_INLINE_ATTEMPTS")? {
            settings.publish_retry.max_attempts = v;
        }
        if let Some(v) = vars.u64("SIDELINE_PUBLISH_RETRY_INTERVAL_SECS")? {
            settings.publish_retry_interval = secs(v);
        }
        if let Some(v) = vars.u32("SIDELINE_MAX_PUBLISH_ATTEMPTS")? {
            settings.max_publish_attempts = v;
        }
        if let Some(v) = vars.u64("SIDELINE_RETENTION_DAYS")? {
            settings.retention = i64::try_from(v)
                .ok()
                .and_then(Duration::try_days)
                .ok_or_else(|| Error::config("SIDELINE_RETENTION_DAYS is out of range"))?;
        }
        if let Some(v) = vars.u64("SIDELINE_MAX_REDELIVERY_DELAY_SECS")? {
            settings.max_redelivery_delay = secs(v);
        }
        if let Some(v) = vars.u64("SIDELINE_LEASE_DURATION_SECS")? {
            settings.lease_duration = StdDuration::from_secs(v);
        }
        if let Some(v) = vars.u64("SIDELINE_HEARTBEAT_INTERVAL_SECS")? {
            settings.heartbeat_interval = StdDuration::from_secs(v);
        }
        if let Some(v) = vars.string("SIDELINE_LOG_FORMAT") {
            settings.log_format = v
                .parse()
                .map_err(|e: sideline_core::Error| Error::config(e.to_string()))?;
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Checks cross-field invariants.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first violated invariant.
    pub fn validate(&self) -> Result<()> {
        if self.retention < self.max_redelivery_delay {
            return Err(Error::config(
                "SIDELINE_RETENTION_DAYS must cover SIDELINE_MAX_REDELIVERY_DELAY_SECS: \
                 the dedup record would expire before redeliveries stop",
            ));
        }
        if self.heartbeat_interval >= self.lease_duration {
            return Err(Error::config(
                "SIDELINE_HEARTBEAT_INTERVAL_SECS must be shorter than SIDELINE_LEASE_DURATION_SECS",
            ));
        }
        if self.store_retry.max_attempts == 0 || self.publish_retry.max_attempts == 0 {
            return Err(Error::config("retry policies need at least one attempt"));
        }
        if self.max_publish_attempts < self.publish_retry.max_attempts {
            return Err(Error::config(
                "SIDELINE_MAX_PUBLISH_ATTEMPTS must be at least SIDELINE_PUBLISH_INLINE_ATTEMPTS",
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(Error::config("SIDELINE_SWEEP_INTERVAL_SECS must be positive"));
        }
        Ok(())
    }
}

struct Vars<F: Fn(&str) -> Option<String>> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    fn u64(&self, name: &str) -> Result<Option<u64>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u64>()
            .map(Some)
            .map_err(|e| Error::config(format!("{name} must be a u64: {e}")))
    }

    fn u32(&self, name: &str) -> Result<Option<u32>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u32>()
            .map(Some)
            .map_err(|e| Error::config(format!("{name} must be a u32: {e}")))
    }
}

fn secs(value: u64) -> Duration {
    i64::try_from(value)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}

fn check_fraction(ctx: &str, field: &str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(Error::config(format!(
            "{ctx}: {field} must be within [0, 1], got {value}"
        )))
    }
}
