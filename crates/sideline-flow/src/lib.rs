//! # sideline-flow
//!
//! Phase orchestration for the sideline sporting-data pipeline.
//!
//! A nightly run moves through ordered phases (ingestion, analytics,
//! precompute, predictions, export). Each phase fans out to independent
//! processors that report completion over an at-least-once, unordered
//! messaging layer. This crate decides when a phase may advance and makes sure
//! the transition is announced exactly once.
//!
//! - **Ingress**: deduplicates completion events and merges them into the
//!   phase state with a compare-and-set on its revision
//! - **Evaluator**: a pure decision over the merged state (`READY`,
//!   `DEGRADED`, `CIRCUIT_OPEN`, `WAIT`, `TIMED_OUT`)
//! - **Trigger**: commits the transition and claims the publish in one swap,
//!   then delivers the message with retry and reconciliation
//! - **Monitor**: sweeps open phases so timeouts fire when events stop
//! - **Coordinator**: leases that give one instance at a time ownership of a
//!   unit of downstream work
//!
//! ## Guarantees
//!
//! - **Idempotent**: replaying an event never changes the state again
//! - **Order-independent**: the state depends only on the set of events
//!   applied, not their arrival order
//! - **Monotonic**: a phase never moves backwards out of a terminal status
//! - **At most one trigger**: concurrent evaluations commit one transition
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use chrono::{NaiveDate, Utc};
//! use sideline_core::{MemoryStore, SystemClock};
//! use sideline_flow::prelude::*;
//!
//! # async fn run(registry_json: &str) -> Result<()> {
//! let date = NaiveDate::from_ymd_opt(2026, 2, 28).unwrap_or_default();
//! let engine = PhaseEngine::new(
//!     EngineSettings::default(),
//!     Arc::new(PhaseRegistry::from_json_str(registry_json)?),
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(InMemoryTransport::new()),
//!     Arc::new(StaticSchedule::new([PipelineRun::new(date, RunMode::Overnight)])),
//!     Arc::new(TracingAlertSink),
//!     Arc::new(SystemClock),
//! )?;
//!
//! let event = CompletionEvent::new("boxscore", date, ProcessorStatus::Success, Utc::now());
//! let outcome = engine.accept(&event).await?;
//! println!("{}", outcome.name());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod alert;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod event;
pub mod ingress;
pub mod metrics;
pub mod monitor;
pub mod pipeline;
pub mod retry;
pub mod schedule;
pub mod state;
pub mod store;
pub mod trigger;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::alert::{Alert, AlertSink, MemoryAlertSink, TracingAlertSink};
    pub use crate::config::{EngineSettings, PhaseConfig, PhaseRegistry};
    pub use crate::coordinator::{
        AcquireOutcome, HeartbeatKeeper, HeartbeatOutcome, InstanceCoordinator, Lease,
        LeaseState, ResumptionPolicy, StoreCoordinator,
    };
    pub use crate::engine::PhaseEngine;
    pub use crate::error::{Error, Result};
    pub use crate::evaluator::{Decision, evaluate};
    pub use crate::event::{CompletionEvent, ProcessorStatus};
    pub use crate::ingress::{AcceptOutcome, EventIngress, RejectReason};
    pub use crate::metrics::EngineMetrics;
    pub use crate::monitor::{SweepReport, TimeoutMonitor};
    pub use crate::pipeline::{Phase, PipelineRun, RunMode};
    pub use crate::schedule::{RunSchedule, StaticSchedule};
    pub use crate::state::{PhaseState, PhaseStatus, PhaseStatusView, TransitionKind};
    pub use crate::store::{PhaseKey, PhaseStateStore};
    pub use crate::trigger::{InMemoryTransport, Resolution, TransitionMessage, Transport};
}
