//! Operator overrides, retention purge, and store fault handling.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use std::sync::Arc;

use chrono::Duration;
use common::{FlakyStore, Harness, date, minutes, registry, settings, success, t0};
use sideline_core::ManualClock;
use sideline_flow::error::{Error, ErrorKind};
use sideline_flow::prelude::*;

async fn complete_ingestion(h: &Harness) {
    for (name, id) in [
        ("raw_ingest", "m1"),
        ("boxscore", "m2"),
        ("odds_feed", "m3"),
        ("injuries", "m4"),
    ] {
        h.engine.accept(&success(name, id, 0)).await.unwrap();
    }
}

#[tokio::test]
async fn force_fail_closes_an_open_phase() {
    let h = Harness::new(RunMode::Overnight);
    h.engine.accept(&success("raw_ingest", "m1", 0)).await.unwrap();

    let view = h
        .engine
        .force_fail(date(), Phase::Ingestion, "feed outage")
        .await
        .unwrap();
    assert_eq!(view.status, PhaseStatus::Failed);
    assert!(view.failure_reason.unwrap().contains("feed outage"));
    assert_eq!(h.alerts.count("phase_failed"), 1);

    let again = h
        .engine
        .force_fail(date(), Phase::Ingestion, "again")
        .await
        .unwrap_err();
    assert_eq!(again.kind(), ErrorKind::Validation);

    let late = h.engine.accept(&success("boxscore", "m2", 1)).await.unwrap();
    assert_eq!(
        late,
        AcceptOutcome::Rejected(RejectReason::PhaseClosed {
            status: PhaseStatus::Failed
        })
    );
}

#[tokio::test]
async fn overrides_on_missing_phase_report_not_found() {
    let h = Harness::new(RunMode::Overnight);
    let err = h
        .engine
        .force_fail(date(), Phase::Predictions, "no run")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::PhaseStateNotFound {
            phase: Phase::Predictions,
            ..
        }
    ));
    assert!(h.engine.status(date(), Phase::Predictions).await.unwrap().is_none());
}

#[tokio::test]
async fn rerun_reopens_a_failed_phase_and_lets_it_trigger() {
    let h = Harness::new(RunMode::Overnight);
    h.engine.accept(&success("raw_ingest", "m1", 0)).await.unwrap();
    h.at(121);
    h.engine.sweep().await.unwrap();
    assert_eq!(h.status(Phase::Ingestion).await.status, PhaseStatus::Failed);

    let rejected = h.engine.accept(&success("boxscore", "m2", 121)).await.unwrap();
    assert!(matches!(rejected, AcceptOutcome::Rejected(RejectReason::PhaseClosed { .. })));

    h.at(125);
    let view = h.engine.rerun(date(), Phase::Ingestion).await.unwrap();
    assert_eq!(view.status, PhaseStatus::InProgress);
    assert_eq!(view.reruns, 1);
    assert_eq!(view.completed, 1);

    // The restarted timeout clock keeps the next sweep from failing it again.
    h.engine.sweep().await.unwrap();
    assert_eq!(h.status(Phase::Ingestion).await.status, PhaseStatus::InProgress);

    for (name, id) in [("boxscore", "m3"), ("odds_feed", "m4"), ("injuries", "m5")] {
        let outcome = h.engine.accept(&success(name, id, 125)).await.unwrap();
        assert!(matches!(outcome, AcceptOutcome::Applied { .. }));
    }

    let view = h.status(Phase::Ingestion).await;
    assert_eq!(view.status, PhaseStatus::Ready);
    assert_eq!(view.failure_reason, None);
    let published = h.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].phase, Phase::Ingestion);
}

#[tokio::test]
async fn rerun_requires_a_failed_phase() {
    let h = Harness::new(RunMode::Overnight);
    h.engine.accept(&success("raw_ingest", "m1", 0)).await.unwrap();

    let err = h.engine.rerun(date(), Phase::Ingestion).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = h.engine.rerun(date(), Phase::Export).await.unwrap_err();
    assert!(matches!(err, Error::PhaseStateNotFound { .. }));
}

#[tokio::test]
async fn clear_trigger_requires_an_advanced_phase() {
    let h = Harness::new(RunMode::Overnight);
    h.engine.accept(&success("raw_ingest", "m1", 0)).await.unwrap();

    let err = h
        .engine
        .clear_trigger(date(), Phase::Ingestion)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn retrigger_republishes_under_a_new_trigger_id() {
    let h = Harness::new(RunMode::Overnight);
    complete_ingestion(&h).await;
    let original = h.published()[0].trigger_id.clone();
    assert!(original.ends_with("/0"));

    h.engine.clear_trigger(date(), Phase::Ingestion).await.unwrap();
    h.at(1);
    h.engine.sweep().await.unwrap();

    let published = h.published();
    assert_eq!(published.len(), 2);
    assert_ne!(published[1].trigger_id, original);
    assert_eq!(published[1].source_revision, published[0].source_revision);
}

#[tokio::test]
async fn purge_removes_only_expired_closed_states() {
    let h = Harness::new(RunMode::Overnight);
    complete_ingestion(&h).await;

    assert_eq!(h.engine.purge_expired(t0() + Duration::days(13)).await.unwrap(), 0);

    let purged = h
        .engine
        .purge_expired(t0() + Duration::days(15))
        .await
        .unwrap();
    assert_eq!(purged, 1);
    assert!(
        h.engine
            .status(date(), Phase::Ingestion)
            .await
            .unwrap()
            .is_none()
    );
    // The pending analytics placeholder is still open and survives.
    assert_eq!(h.status(Phase::Analytics).await.status, PhaseStatus::Pending);
}

fn flaky_engine() -> (PhaseEngine, Arc<FlakyStore>, Arc<MemoryAlertSink>) {
    let store = Arc::new(FlakyStore::new());
    let alerts = Arc::new(MemoryAlertSink::new());
    let engine = PhaseEngine::new(
        settings(),
        Arc::new(registry()),
        store.clone(),
        Arc::new(InMemoryTransport::new()),
        Arc::new(StaticSchedule::new([PipelineRun::new(
            date(),
            RunMode::Overnight,
        )])),
        alerts.clone(),
        Arc::new(ManualClock::new(minutes(0))),
    )
    .unwrap();
    (engine, store, alerts)
}

#[tokio::test]
async fn transient_store_faults_are_retried() {
    let (engine, store, alerts) = flaky_engine();
    store.conflict_next(3);
    store.fail_next(2);

    let outcome = engine.accept(&success("raw_ingest", "m1", 0)).await.unwrap();
    assert!(matches!(outcome, AcceptOutcome::Applied { .. }));
    assert_eq!(alerts.count("store_retries_exhausted"), 0);

    let view = engine.status(date(), Phase::Ingestion).await.unwrap().unwrap();
    assert_eq!(view.completed, 1);
}

#[tokio::test]
async fn persistent_contention_surfaces_error_and_alert() {
    let (engine, store, alerts) = flaky_engine();
    store.conflict_next(1_000);

    let err = engine
        .accept(&success("raw_ingest", "m1", 0))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::StoreContention { attempts: 16, .. }));
    assert!(err.is_retryable());
    assert_eq!(alerts.count("store_retries_exhausted"), 1);
    assert!(engine.status(date(), Phase::Ingestion).await.unwrap().is_none());
}
