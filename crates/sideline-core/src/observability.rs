//! Observability infrastructure.
//!
//! Structured logging with consistent spans across engine components.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl std::str::FromStr for LogFormat {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            other => Err(crate::error::Error::InvalidInput(format!(
                "unknown log format '{other}' (expected json or pretty)"
            ))),
        }
    }
}

/// Initializes the logging subsystem.
///
/// Call once at startup. Subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `sideline_flow=debug`)
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for phase state operations.
///
/// ```rust
/// use sideline_core::observability::phase_span;
///
/// let span = phase_span("accept", "2026-02-28", "analytics");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn phase_span(operation: &str, pipeline_date: &str, phase: &str) -> Span {
    tracing::info_span!(
        "phase",
        op = operation,
        pipeline_date = pipeline_date,
        phase = phase,
    )
}

/// Creates a span for coordinator lease operations.
#[must_use]
pub fn coordinator_span(operation: &str, partition_key: &str, instance_id: &str) -> Span {
    tracing::info_span!(
        "coordinator",
        op = operation,
        partition_key = partition_key,
        instance_id = instance_id,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Json);
    }

    #[test]
    fn log_format_parses_case_insensitively() {
        assert_eq!("JSON".parse::<LogFormat>().ok(), Some(LogFormat::Json));
        assert_eq!(" pretty ".parse::<LogFormat>().ok(), Some(LogFormat::Pretty));
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn span_helpers_create_spans() {
        let span = phase_span("sweep", "2026-02-28", "precompute");
        let _guard = span.enter();
        tracing::info!("inside phase span");

        let span = coordinator_span("acquire", "2026-02-28", "inst-A");
        let _guard = span.enter();
        tracing::info!("inside coordinator span");
    }
}
