//! Inbound completion events.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Status a processor reports for its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorStatus {
    /// Processor finished and produced all of its output.
    Success,
    /// Processor finished with incomplete output.
    Partial,
    /// Processor failed.
    Failed,
}

impl ProcessorStatus {
    /// Returns true if the processor counts as completed.
    #[must_use]
    pub const fn is_completion(&self) -> bool {
        matches!(self, Self::Success | Self::Partial)
    }
}

/// A processor's completion report, consumed from the messaging layer.
///
/// Delivery is at-least-once and unordered; `message_id` is the dedup token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionEvent {
    /// Reporting processor.
    pub processor_name: String,
    /// Pipeline date the report belongs to.
    pub pipeline_date: NaiveDate,
    /// Reported status.
    pub status: ProcessorStatus,
    /// Entities (games, teams, players) the processor changed.
    #[serde(default)]
    pub entities_changed: BTreeSet<String>,
    /// Opaque dedup token.
    pub message_id: String,
    /// When the processor emitted the report.
    pub emitted_at: DateTime<Utc>,
    /// Correlation id stamped by the run origin, when the processor forwards it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl CompletionEvent {
    /// Creates an event with a fresh message id and no changed entities.
    #[must_use]
    pub fn new(
        processor_name: impl Into<String>,
        pipeline_date: NaiveDate,
        status: ProcessorStatus,
        emitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            processor_name: processor_name.into(),
            pipeline_date,
            status,
            entities_changed: BTreeSet::new(),
            message_id: ulid::Ulid::new().to_string(),
            emitted_at,
            correlation_id: None,
        }
    }

    /// Sets the message id.
    #[must_use]
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    /// Adds changed entities.
    #[must_use]
    pub fn with_entities<I, S>(mut self, entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entities_changed
            .extend(entities.into_iter().map(Into::into));
        self
    }

    /// Decodes an event from a JSON payload.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the payload is not a well-formed event.
    pub fn from_json(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| Error::validation(format!("malformed completion event: {e}")))
    }

    /// Checks fields that deserialization alone cannot.
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.processor_name.trim().is_empty() {
            return Err(Error::validation("processor_name must not be blank"));
        }
        if self.message_id.trim().is_empty() {
            return Err(Error::validation("message_id must not be blank"));
        }
        if self.entities_changed.iter().any(|e| e.trim().is_empty()) {
            return Err(Error::validation("entities_changed contains a blank id"));
        }
        Ok(())
    }
}
