//! Shared fixtures for sideline-flow integration tests.

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use sideline_core::{
    CasOutcome, DocumentStore, ManualClock, MemoryStore, Precondition, VersionedDoc,
};
use sideline_flow::config::{ModePolicy, ProcessorSpec, TimeoutTier};
use sideline_flow::pipeline::ModeTable;
use sideline_flow::prelude::*;
use sideline_flow::retry::RetryPolicy;

pub fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 2, 28).unwrap()
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 28, 22, 0, 0).unwrap()
}

pub fn minutes(n: i64) -> DateTime<Utc> {
    t0() + Duration::minutes(n)
}

/// Policy with a one-hour notifying tier and a two-hour final tier.
pub fn policy(full: f64, degraded: f64, grace_secs: u64) -> ModePolicy {
    ModePolicy {
        full_threshold: full,
        degraded_threshold: degraded,
        grace_period_secs: grace_secs,
        timeout_tiers: vec![
            TimeoutTier {
                after_secs: 3_600,
                degraded_threshold: None,
                notify: true,
            },
            TimeoutTier {
                after_secs: 7_200,
                degraded_threshold: None,
                notify: true,
            },
        ],
    }
}

fn processor_spec(name: &str, critical: bool) -> ProcessorSpec {
    ProcessorSpec {
        name: name.to_string(),
        critical,
    }
}

fn single(phase: Phase, processor: &str) -> PhaseConfig {
    PhaseConfig {
        phase,
        processors: vec![processor_spec(processor, true)],
        modes: ModeTable::uniform(policy(1.0, 0.5, 600)),
    }
}

/// Ingestion has two critical and two optional processors. Same-day runs
/// accept a degraded ingestion with no optional coverage at all.
pub fn registry() -> PhaseRegistry {
    let ingestion = PhaseConfig {
        phase: Phase::Ingestion,
        processors: vec![
            processor_spec("raw_ingest", true),
            processor_spec("boxscore", true),
            processor_spec("odds_feed", false),
            processor_spec("injuries", false),
        ],
        modes: ModeTable {
            overnight: policy(1.0, 0.5, 600),
            same_day: policy(1.0, 0.0, 600),
            tomorrow: policy(1.0, 0.5, 600),
        },
    };
    PhaseRegistry::new([
        ingestion,
        single(Phase::Analytics, "team_stats"),
        single(Phase::Precompute, "features"),
        single(Phase::Predictions, "model"),
        single(Phase::Export, "exporter"),
    ])
    .unwrap()
}

pub fn settings() -> EngineSettings {
    EngineSettings {
        store_retry: RetryPolicy::immediate(16),
        publish_retry: RetryPolicy::immediate(2),
        max_publish_attempts: 4,
        publish_retry_interval: Duration::minutes(5),
        ..EngineSettings::default()
    }
}

pub fn event(
    processor: &str,
    status: ProcessorStatus,
    message_id: &str,
    emitted_at: DateTime<Utc>,
) -> CompletionEvent {
    CompletionEvent::new(processor, date(), status, emitted_at).with_message_id(message_id)
}

pub fn success(processor: &str, message_id: &str, minute: i64) -> CompletionEvent {
    event(processor, ProcessorStatus::Success, message_id, minutes(minute))
}

/// An engine over in-memory collaborators and a manual clock.
pub struct Harness {
    pub engine: PhaseEngine,
    pub clock: ManualClock,
    pub documents: Arc<MemoryStore>,
    pub transport: Arc<InMemoryTransport>,
    pub alerts: Arc<MemoryAlertSink>,
}

impl Harness {
    pub fn new(mode: RunMode) -> Self {
        Self::with_settings(mode, settings())
    }

    pub fn with_settings(mode: RunMode, settings: EngineSettings) -> Self {
        let clock = ManualClock::new(t0());
        let documents = Arc::new(MemoryStore::new());
        let transport = Arc::new(InMemoryTransport::new());
        let alerts = Arc::new(MemoryAlertSink::new());
        let schedule = StaticSchedule::new([
            PipelineRun::new(date(), mode).with_correlation_id("run-2026-02-28")
        ]);
        let engine = PhaseEngine::new(
            settings,
            Arc::new(registry()),
            documents.clone(),
            transport.clone(),
            Arc::new(schedule),
            alerts.clone(),
            Arc::new(clock.clone()),
        )
        .unwrap();
        Self {
            engine,
            clock,
            documents,
            transport,
            alerts,
        }
    }

    /// Moves the clock to `minute` minutes after t0.
    pub fn at(&self, minute: i64) {
        self.clock.set(minutes(minute));
    }

    pub fn published(&self) -> Vec<TransitionMessage> {
        self.transport
            .published()
            .unwrap()
            .iter()
            .map(|m| m.transition().unwrap())
            .collect()
    }

    pub async fn status(&self, phase: Phase) -> PhaseStatusView {
        self.engine.status(date(), phase).await.unwrap().unwrap()
    }
}

/// Store wrapper that injects conflicts and outages into compare-and-set.
#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    conflicts: AtomicU32,
    outages: AtomicU32,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports a conflict on the next `n` swaps without writing.
    pub fn conflict_next(&self, n: u32) {
        self.conflicts.store(n, Ordering::SeqCst);
    }

    /// Fails the next `n` swaps as unavailable.
    pub fn fail_next(&self, n: u32) {
        self.outages.store(n, Ordering::SeqCst);
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl DocumentStore for FlakyStore {
    async fn get(&self, key: &str) -> sideline_core::Result<Option<VersionedDoc>> {
        self.inner.get(key).await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        precondition: Precondition,
        data: Bytes,
    ) -> sideline_core::Result<CasOutcome> {
        if Self::take(&self.outages) {
            return Err(sideline_core::Error::storage("store unavailable"));
        }
        if Self::take(&self.conflicts) {
            let current = self.inner.get(key).await?.map(|doc| doc.revision);
            return Ok(CasOutcome::Conflict { current });
        }
        self.inner.compare_and_set(key, precondition, data).await
    }

    async fn delete_if(&self, key: &str, revision: u64) -> sideline_core::Result<bool> {
        self.inner.delete_if(key, revision).await
    }

    async fn list(&self, prefix: &str) -> sideline_core::Result<Vec<String>> {
        self.inner.list(prefix).await
    }
}
