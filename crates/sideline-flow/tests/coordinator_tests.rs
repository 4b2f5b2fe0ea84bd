//! Lease exclusivity, handover, and resumption across coordinator instances.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use common::{FlakyStore, Harness, minutes};
use sideline_core::{Clock, DocumentStore, ManualClock, MemoryStore};
use sideline_flow::prelude::*;
use sideline_flow::retry::RetryPolicy;

const LEASE: StdDuration = StdDuration::from_secs(300);

fn coordinator(
    store: &Arc<MemoryStore>,
    clock: &ManualClock,
    policy: ResumptionPolicy,
) -> StoreCoordinator {
    coordinator_with(store.clone(), clock, Arc::new(MemoryAlertSink::new()), policy)
}

fn coordinator_with(
    store: Arc<dyn DocumentStore>,
    clock: &ManualClock,
    alerts: Arc<MemoryAlertSink>,
    policy: ResumptionPolicy,
) -> StoreCoordinator {
    StoreCoordinator::new(
        store,
        Arc::new(clock.clone()),
        alerts,
        policy,
        StdDuration::from_secs(1),
        RetryPolicy::immediate(32),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acquire_grants_exactly_one_lease() {
    let store = Arc::new(MemoryStore::new());
    let clock = ManualClock::new(minutes(0));

    let tasks: Vec<_> = ["inst-A", "inst-B"]
        .into_iter()
        .map(|instance| {
            // Separate coordinators model separate processes sharing a store.
            let coordinator = coordinator(&store, &clock, ResumptionPolicy::Restart);
            tokio::spawn(async move { coordinator.acquire("2026-02-28", instance, LEASE).await })
        })
        .collect();

    let mut acquired = 0;
    let mut held = 0;
    for task in tasks {
        match task.await.unwrap().unwrap() {
            AcquireOutcome::Acquired { lease, .. } => {
                acquired += 1;
                assert_eq!(lease.epoch, 1);
            }
            AcquireOutcome::AlreadyHeld { .. } => held += 1,
        }
    }
    assert_eq!((acquired, held), (1, 1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_contenders_never_overlap() {
    let store = Arc::new(MemoryStore::new());
    let clock = ManualClock::new(minutes(0));

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let coordinator = coordinator(&store, &clock, ResumptionPolicy::Restart);
            tokio::spawn(async move {
                coordinator
                    .acquire("2026-02-28", &format!("inst-{i}"), LEASE)
                    .await
            })
        })
        .collect();

    let mut owners = Vec::new();
    for joined in futures::future::join_all(tasks).await {
        if let AcquireOutcome::Acquired { lease, .. } = joined.unwrap().unwrap() {
            owners.push(lease.owner);
        }
    }
    assert_eq!(owners.len(), 1);

    let observer = coordinator(&store, &clock, ResumptionPolicy::Restart);
    assert_eq!(
        observer.inspect("2026-02-28").await.unwrap(),
        LeaseState::Held {
            owner: owners[0].clone(),
            expires_at: minutes(5),
        }
    );
}

#[tokio::test]
async fn handover_gap_is_bounded_by_remaining_lease_time() {
    let store = Arc::new(MemoryStore::new());
    let clock = ManualClock::new(minutes(0));
    let a = coordinator(&store, &clock, ResumptionPolicy::Restart);
    let b = coordinator(&store, &clock, ResumptionPolicy::Restart);

    let lease = a
        .acquire("2026-02-28", "inst-A", LEASE)
        .await
        .unwrap()
        .lease()
        .cloned()
        .unwrap();

    // Last heartbeat two minutes in, then inst-A dies.
    clock.advance(Duration::minutes(2));
    let HeartbeatOutcome::Ok(lease) = a.heartbeat(&lease).await.unwrap() else {
        panic!("heartbeat should hold the lease");
    };
    let died_at = clock.now();
    let bound = lease.handover_gap_bound(died_at);
    assert_eq!(bound, Duration::minutes(5));

    clock.advance(bound - Duration::seconds(1));
    assert!(!b.acquire("2026-02-28", "inst-B", LEASE).await.unwrap().is_acquired());
    assert!(matches!(
        b.inspect("2026-02-28").await.unwrap(),
        LeaseState::Held { .. }
    ));

    clock.set(died_at + bound);
    assert!(matches!(
        b.inspect("2026-02-28").await.unwrap(),
        LeaseState::Expired { .. }
    ));
    let takeover = b.acquire("2026-02-28", "inst-B", LEASE).await.unwrap();
    let new_lease = takeover.lease().unwrap();
    assert_eq!(new_lease.owner, "inst-B");
    assert_eq!(new_lease.epoch, 2);
    assert!(clock.now() - died_at <= bound);

    // The stale holder is fenced off.
    assert_eq!(a.heartbeat(&lease).await.unwrap(), HeartbeatOutcome::LeaseLost);
    assert!(!a.release(&lease).await.unwrap());
}

#[tokio::test]
async fn resumption_policy_decides_what_the_next_holder_sees() {
    let store = Arc::new(MemoryStore::new());
    let clock = ManualClock::new(minutes(0));
    let resuming = coordinator(&store, &clock, ResumptionPolicy::FromCheckpoint);

    let lease = resuming
        .acquire("2026-02-28", "inst-A", LEASE)
        .await
        .unwrap()
        .lease()
        .cloned()
        .unwrap();
    let progress = serde_json::json!({ "games_done": ["g1", "g2"] });
    assert!(matches!(
        resuming.checkpoint(&lease, progress.clone()).await.unwrap(),
        HeartbeatOutcome::Ok(_)
    ));
    assert!(resuming.release(&lease).await.unwrap());

    let AcquireOutcome::Acquired { resume_from, .. } =
        resuming.acquire("2026-02-28", "inst-B", LEASE).await.unwrap()
    else {
        panic!("released key should be free");
    };
    assert_eq!(resume_from, Some(progress));

    let restarting = coordinator(&store, &clock, ResumptionPolicy::Restart);
    clock.advance(Duration::minutes(6));
    let AcquireOutcome::Acquired { resume_from, .. } =
        restarting.acquire("2026-02-28", "inst-C", LEASE).await.unwrap()
    else {
        panic!("expired key should be free");
    };
    assert_eq!(resume_from, None);
}

#[tokio::test]
async fn engine_coordinator_shares_the_engine_store() {
    let h = Harness::new(RunMode::Overnight);
    let coordinator = h.engine.coordinator(ResumptionPolicy::default());
    let outcome = coordinator
        .acquire("2026-02-28", "inst-A", h.engine.settings().lease_duration)
        .await
        .unwrap();
    assert!(outcome.is_acquired());

    let keys = h.documents.list("leases/").await.unwrap();
    assert_eq!(keys, vec!["leases/2026-02-28".to_string()]);
}

#[tokio::test]
async fn lease_operations_ride_out_store_blips() {
    let store = Arc::new(FlakyStore::new());
    let clock = ManualClock::new(minutes(0));
    let alerts = Arc::new(MemoryAlertSink::new());
    let coordinator = coordinator_with(
        store.clone(),
        &clock,
        alerts.clone(),
        ResumptionPolicy::Restart,
    );

    store.fail_next(2);
    let lease = coordinator
        .acquire("2026-02-28", "inst-A", LEASE)
        .await
        .unwrap()
        .lease()
        .cloned()
        .unwrap();
    assert_eq!(lease.epoch, 1);

    clock.advance(Duration::minutes(1));
    store.fail_next(1);
    assert!(matches!(
        coordinator.heartbeat(&lease).await.unwrap(),
        HeartbeatOutcome::Ok(_)
    ));

    store.fail_next(1);
    assert!(coordinator.release(&lease).await.unwrap());
    assert_eq!(alerts.count("store_retries_exhausted"), 0);
}

#[tokio::test]
async fn persistent_lease_store_outage_surfaces_error_and_alert() {
    let store = Arc::new(FlakyStore::new());
    let clock = ManualClock::new(minutes(0));
    let alerts = Arc::new(MemoryAlertSink::new());
    let coordinator = coordinator_with(
        store.clone(),
        &clock,
        alerts.clone(),
        ResumptionPolicy::Restart,
    );

    store.fail_next(1_000);
    let err = coordinator
        .acquire("2026-02-28", "inst-A", LEASE)
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(alerts.count("store_retries_exhausted"), 1);
    assert_eq!(
        coordinator.inspect("2026-02-28").await.unwrap(),
        LeaseState::Free
    );
}
