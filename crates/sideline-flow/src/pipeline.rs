//! Pipeline model: phases, run modes, and runs.
//!
//! The pipeline advances through a fixed chain of phases. Each pipeline run is
//! identified by `(pipeline_date, mode)` and owns one phase state per phase.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// One stage of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Raw data ingestion (scrapers, feeds).
    Ingestion,
    /// Analytics over ingested data.
    Analytics,
    /// Feature precompute.
    Precompute,
    /// Model predictions.
    Predictions,
    /// Export to consumers.
    Export,
}

impl Phase {
    /// All phases in pipeline order.
    pub const ALL: [Self; 5] = [
        Self::Ingestion,
        Self::Analytics,
        Self::Precompute,
        Self::Predictions,
        Self::Export,
    ];

    /// Returns the stable lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ingestion => "ingestion",
            Self::Analytics => "analytics",
            Self::Precompute => "precompute",
            Self::Predictions => "predictions",
            Self::Export => "export",
        }
    }

    /// Returns the phase that follows this one, if any.
    #[must_use]
    pub const fn next(&self) -> Option<Self> {
        match self {
            Self::Ingestion => Some(Self::Analytics),
            Self::Analytics => Some(Self::Precompute),
            Self::Precompute => Some(Self::Predictions),
            Self::Predictions => Some(Self::Export),
            Self::Export => None,
        }
    }

    /// Topic the transition message for this phase's completion goes to.
    ///
    /// Intermediate phases publish to the next phase's trigger topic; the last
    /// phase publishes a pipeline completion notice.
    #[must_use]
    pub fn transition_topic(&self) -> String {
        self.next().map_or_else(
            || "pipeline.complete".to_string(),
            |next| format!("phase.{next}.trigger"),
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|phase| phase.as_str() == s)
            .ok_or_else(|| Error::validation(format!("unknown phase '{s}'")))
    }
}

/// Scheduling mode of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Full run after all games of the date have finished.
    Overnight,
    /// Intra-day refresh while games are in progress.
    SameDay,
    /// Forward-looking run for the next day's slate.
    Tomorrow,
}

impl RunMode {
    /// Returns the stable snake_case name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Overnight => "overnight",
            Self::SameDay => "same_day",
            Self::Tomorrow => "tomorrow",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lookup table keyed by run mode.
///
/// Mode-dependent settings live in one of these rather than in branches
/// scattered across components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeTable<T> {
    /// Value for overnight runs.
    pub overnight: T,
    /// Value for same-day runs.
    pub same_day: T,
    /// Value for tomorrow runs.
    pub tomorrow: T,
}

impl<T> ModeTable<T> {
    /// Creates a table with the same value for every mode.
    #[must_use]
    pub fn uniform(value: T) -> Self
    where
        T: Clone,
    {
        Self {
            overnight: value.clone(),
            same_day: value.clone(),
            tomorrow: value,
        }
    }

    /// Returns the value for a mode.
    #[must_use]
    pub const fn get(&self, mode: RunMode) -> &T {
        match mode {
            RunMode::Overnight => &self.overnight,
            RunMode::SameDay => &self.same_day,
            RunMode::Tomorrow => &self.tomorrow,
        }
    }

    /// Iterates `(mode, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (RunMode, &T)> {
        [
            (RunMode::Overnight, &self.overnight),
            (RunMode::SameDay, &self.same_day),
            (RunMode::Tomorrow, &self.tomorrow),
        ]
        .into_iter()
    }
}

/// A scheduled pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRun {
    /// The sporting date the run processes.
    pub pipeline_date: NaiveDate,
    /// Scheduling mode.
    pub mode: RunMode,
    /// Identifier propagated across every message of the run.
    pub correlation_id: String,
}

impl PipelineRun {
    /// Creates a run with a freshly generated correlation id.
    #[must_use]
    pub fn new(pipeline_date: NaiveDate, mode: RunMode) -> Self {
        Self {
            pipeline_date,
            mode,
            correlation_id: ulid::Ulid::new().to_string(),
        }
    }

    /// Sets an explicit correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }
}
