//! Run schedule lookup.
//!
//! The schedule says which pipeline dates expect a run, in which mode, and
//! under which correlation id. A date without a run is not an error: events
//! for it are rejected as unexpected.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::{Error, Result};
use crate::pipeline::PipelineRun;

/// Source of scheduled runs.
#[async_trait]
pub trait RunSchedule: Send + Sync {
    /// Returns the run expected for a date, if any.
    async fn run_for(&self, pipeline_date: NaiveDate) -> Result<Option<PipelineRun>>;
}

/// Schedule held in memory.
#[derive(Debug, Default)]
pub struct StaticSchedule {
    runs: RwLock<BTreeMap<NaiveDate, PipelineRun>>,
}

impl StaticSchedule {
    /// Creates a schedule from a set of runs. A later run for the same date
    /// replaces an earlier one.
    #[must_use]
    pub fn new(runs: impl IntoIterator<Item = PipelineRun>) -> Self {
        Self {
            runs: RwLock::new(runs.into_iter().map(|r| (r.pipeline_date, r)).collect()),
        }
    }

    /// Adds or replaces the run for its date.
    ///
    /// # Errors
    ///
    /// Returns an error if the schedule lock is poisoned.
    pub fn insert(&self, run: PipelineRun) -> Result<()> {
        self.runs
            .write()
            .map_err(|_| Error::config("schedule lock poisoned"))?
            .insert(run.pipeline_date, run);
        Ok(())
    }
}

#[async_trait]
impl RunSchedule for StaticSchedule {
    async fn run_for(&self, pipeline_date: NaiveDate) -> Result<Option<PipelineRun>> {
        let runs = self
            .runs
            .read()
            .map_err(|_| Error::config("schedule lock poisoned"))?;
        Ok(runs.get(&pipeline_date).cloned())
    }
}
