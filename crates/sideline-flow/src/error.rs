//! Error types for the orchestration engine.
//!
//! Every variant maps onto an [`ErrorKind`] that tells the caller how the
//! failure is handled: rejected outright, retried, or escalated to an operator.

use chrono::NaiveDate;

use crate::pipeline::Phase;

/// The result type used throughout sideline-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Handling class of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or unregistered input. Never retried.
    Validation,
    /// Store conflict or unavailability. Retried with bounded backoff.
    TransientStore,
    /// Publish failure. Retried, then reconciled by the sweep.
    TransientTransport,
    /// A critical processor failed. Requires an operator-driven rerun.
    CriticalProcessorFailure,
    /// The final timeout tier elapsed.
    TimeoutExhausted,
    /// Configuration could not be loaded or is inconsistent.
    Config,
}

/// Errors that can occur in engine operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An event or request failed validation.
    #[error("validation failed: {message}")]
    Validation {
        /// Why the input was rejected.
        message: String,
    },

    /// A phase state does not exist.
    #[error("phase state not found: {pipeline_date}/{phase}")]
    PhaseStateNotFound {
        /// Pipeline date of the missing state.
        pipeline_date: NaiveDate,
        /// Phase of the missing state.
        phase: Phase,
    },

    /// A compare-and-set loop gave up after repeated conflicts.
    #[error("store contention on {key}: gave up after {attempts} attempts")]
    StoreContention {
        /// The contended key.
        key: String,
        /// How many swaps were attempted.
        attempts: u32,
    },

    /// Publishing to the transport failed.
    #[error("publish to {topic} failed: {message}")]
    Transport {
        /// Destination topic.
        topic: String,
        /// Description of the failure.
        message: String,
    },

    /// A critical processor reported failure, blocking progress.
    #[error("critical processor failure in {phase} for {pipeline_date}: {processors:?}")]
    CriticalProcessorFailure {
        /// Pipeline date of the blocked phase.
        pipeline_date: NaiveDate,
        /// The blocked phase.
        phase: Phase,
        /// Critical processors whose latest report is a failure.
        processors: Vec<String>,
    },

    /// The final timeout tier elapsed without the critical set completing.
    #[error("timeout exhausted in {phase} for {pipeline_date}")]
    TimeoutExhausted {
        /// Pipeline date of the failed phase.
        pipeline_date: NaiveDate,
        /// The failed phase.
        phase: Phase,
    },

    /// Configuration is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// What is wrong with the configuration.
        message: String,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An error from sideline-core.
    #[error("core error: {0}")]
    Core(#[from] sideline_core::Error),
}

impl Error {
    /// Creates a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a transport error.
    #[must_use]
    pub fn transport(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            topic: topic.into(),
            message: message.into(),
        }
    }

    /// Classifies the error for retry and alerting decisions.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } | Self::PhaseStateNotFound { .. } => ErrorKind::Validation,
            Self::StoreContention { .. } => ErrorKind::TransientStore,
            Self::Transport { .. } => ErrorKind::TransientTransport,
            Self::CriticalProcessorFailure { .. } => ErrorKind::CriticalProcessorFailure,
            Self::TimeoutExhausted { .. } => ErrorKind::TimeoutExhausted,
            Self::Config { .. } => ErrorKind::Config,
            Self::Serialization { .. } => ErrorKind::Validation,
            Self::Core(inner) if inner.is_transient() => ErrorKind::TransientStore,
            Self::Core(_) => ErrorKind::Validation,
        }
    }

    /// Returns true if a bounded retry may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::TransientStore | ErrorKind::TransientTransport
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}
