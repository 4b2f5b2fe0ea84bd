//! Lease coordinator over a [`DocumentStore`].
//!
//! One JSON record per partition key under `leases/{partition_key}`. Every
//! state change is a compare-and-set on the record's revision, so two
//! instances racing for the same key cannot both win: the loser's swap
//! conflicts, it re-reads, and sees the winner's unexpired lease.

use std::fmt;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sideline_core::observability::coordinator_span;
use sideline_core::{CasOutcome, Clock, DocumentStore, Precondition, VersionedDoc};
use tracing::Instrument;
use ulid::Ulid;

use super::{
    AcquireOutcome, HeartbeatOutcome, InstanceCoordinator, Lease, LeaseState, ResumptionPolicy,
};
use crate::alert::{Alert, AlertSink};
use crate::error::{Error, Result};
use crate::metrics::EngineMetrics;
use crate::retry::RetryPolicy;
use crate::store::with_deadline;

/// Key prefix for lease records.
pub const LEASE_PREFIX: &str = "leases/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum RecordState {
    Held,
    Released,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeaseRecord {
    partition_key: String,
    owner: String,
    token: String,
    epoch: u64,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    heartbeat_at: DateTime<Utc>,
    duration_ms: i64,
    state: RecordState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    checkpoint: Option<serde_json::Value>,
}

impl LeaseRecord {
    fn lease(&self) -> Lease {
        Lease {
            partition_key: self.partition_key.clone(),
            owner: self.owner.clone(),
            token: self.token.clone(),
            epoch: self.epoch,
            acquired_at: self.acquired_at,
            expires_at: self.expires_at,
            heartbeat_at: self.heartbeat_at,
        }
    }

    fn is_held_at(&self, now: DateTime<Utc>) -> bool {
        self.state == RecordState::Held && now < self.expires_at
    }

    fn is_held_by(&self, lease: &Lease, now: DateTime<Utc>) -> bool {
        self.is_held_at(now) && self.token == lease.token && self.epoch == lease.epoch
    }

    fn duration(&self) -> Duration {
        Duration::milliseconds(self.duration_ms)
    }
}

/// Lease coordinator backed by a document store.
#[derive(Clone)]
pub struct StoreCoordinator {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    alerts: Arc<dyn AlertSink>,
    resumption: ResumptionPolicy,
    timeout: StdDuration,
    retry: RetryPolicy,
    metrics: EngineMetrics,
}

impl fmt::Debug for StoreCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreCoordinator")
            .field("resumption", &self.resumption)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl StoreCoordinator {
    /// Creates a coordinator.
    #[must_use]
    pub fn new(
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        alerts: Arc<dyn AlertSink>,
        resumption: ResumptionPolicy,
        timeout: StdDuration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            clock,
            alerts,
            resumption,
            timeout,
            retry,
            metrics: EngineMetrics::new(),
        }
    }

    /// The configured resumption policy.
    #[must_use]
    pub const fn resumption(&self) -> ResumptionPolicy {
        self.resumption
    }

    fn key(partition_key: &str) -> String {
        format!("{LEASE_PREFIX}{partition_key}")
    }

    async fn read(&self, partition_key: &str) -> Result<Option<(LeaseRecord, u64)>> {
        let key = Self::key(partition_key);
        let doc: Option<VersionedDoc> =
            with_deadline("lease_get", self.timeout, self.store.get(&key)).await?;
        doc.map(|doc| Ok((serde_json::from_slice(&doc.data)?, doc.revision)))
            .transpose()
    }

    async fn write(&self, record: &LeaseRecord, precondition: Precondition) -> Result<CasOutcome> {
        let key = Self::key(&record.partition_key);
        let data = Bytes::from(serde_json::to_vec(record)?);
        with_deadline(
            "lease_compare_and_set",
            self.timeout,
            self.store.compare_and_set(&key, precondition, data),
        )
        .await
    }

    /// Runs `step` until it produces an answer, retrying swap conflicts and
    /// transient store errors under the retry policy. Running out of attempts
    /// raises [`Alert::StoreRetriesExhausted`].
    async fn with_retries<T, F, Fut>(
        &self,
        partition_key: &str,
        operation: &'static str,
        mut step: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: std::future::Future<Output = Result<Option<T>>> + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match step().await {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => {
                    self.metrics.record_cas_conflict(operation);
                    if !self.retry.allows_another(attempt) {
                        let key = Self::key(partition_key);
                        self.raise_exhausted(&key, attempt).await;
                        return Err(Error::StoreContention {
                            key,
                            attempts: attempt,
                        });
                    }
                }
                Err(err) if err.is_retryable() => {
                    tracing::warn!(operation, attempt, error = %err, "lease store error");
                    if !self.retry.allows_another(attempt) {
                        self.raise_exhausted(&Self::key(partition_key), attempt).await;
                        return Err(err);
                    }
                }
                Err(err) => return Err(err),
            }
            self.retry.wait(attempt).await;
        }
    }

    async fn raise_exhausted(&self, key: &str, attempts: u32) {
        tracing::error!(key, attempts, "lease store retries exhausted");
        self.alerts
            .raise(Alert::StoreRetriesExhausted {
                key: key.to_string(),
                attempts,
            })
            .await;
    }

    async fn try_acquire(
        &self,
        partition_key: &str,
        instance_id: &str,
        duration: Duration,
    ) -> Result<Option<AcquireOutcome>> {
        let now = self.clock.now();
        let current = self.read(partition_key).await?;

        let (epoch, inherited, precondition) = match &current {
            Some((record, _)) if record.is_held_at(now) => {
                if record.owner == instance_id {
                    return Ok(Some(AcquireOutcome::Acquired {
                        lease: record.lease(),
                        resume_from: None,
                    }));
                }
                return Ok(Some(AcquireOutcome::AlreadyHeld {
                    owner: record.owner.clone(),
                    expires_at: record.expires_at,
                }));
            }
            Some((record, revision)) => {
                if record.state == RecordState::Held {
                    tracing::info!(
                        previous_owner = %record.owner,
                        expired_at = %record.expires_at,
                        "taking over expired lease"
                    );
                }
                let inherited = match self.resumption {
                    ResumptionPolicy::FromCheckpoint => record.checkpoint.clone(),
                    ResumptionPolicy::Restart => None,
                };
                (record.epoch + 1, inherited, Precondition::Revision(*revision))
            }
            None => (1, None, Precondition::Absent),
        };

        let record = LeaseRecord {
            partition_key: partition_key.to_string(),
            owner: instance_id.to_string(),
            token: Ulid::new().to_string(),
            epoch,
            acquired_at: now,
            expires_at: now + duration,
            heartbeat_at: now,
            duration_ms: duration.num_milliseconds(),
            state: RecordState::Held,
            checkpoint: inherited.clone(),
        };
        match self.write(&record, precondition).await? {
            CasOutcome::Committed { .. } => Ok(Some(AcquireOutcome::Acquired {
                lease: record.lease(),
                resume_from: inherited,
            })),
            CasOutcome::Conflict { .. } => Ok(None),
        }
    }

    /// Applies `mutate` to the record if `lease` still holds it.
    async fn try_update_held(
        &self,
        lease: &Lease,
        mutate: impl Fn(&mut LeaseRecord, DateTime<Utc>) + Send + Sync,
    ) -> Result<Option<HeartbeatOutcome>> {
        let now = self.clock.now();
        let Some((mut record, revision)) = self.read(&lease.partition_key).await? else {
            return Ok(Some(HeartbeatOutcome::LeaseLost));
        };
        if !record.is_held_by(lease, now) {
            return Ok(Some(HeartbeatOutcome::LeaseLost));
        }
        mutate(&mut record, now);
        match self.write(&record, Precondition::Revision(revision)).await? {
            CasOutcome::Committed { .. } => Ok(Some(HeartbeatOutcome::Ok(record.lease()))),
            CasOutcome::Conflict { .. } => Ok(None),
        }
    }

    async fn update_held(
        &self,
        lease: &Lease,
        operation: &'static str,
        mutate: impl Fn(&mut LeaseRecord, DateTime<Utc>) + Send + Sync + Copy,
    ) -> Result<HeartbeatOutcome> {
        let outcome = self
            .with_retries(&lease.partition_key, operation, || {
                self.try_update_held(lease, mutate)
            })
            .await?;
        let result = match outcome {
            HeartbeatOutcome::Ok(_) => "ok",
            HeartbeatOutcome::LeaseLost => "lost",
        };
        self.metrics.record_lease(operation, result);
        if matches!(outcome, HeartbeatOutcome::LeaseLost) {
            tracing::warn!(epoch = lease.epoch, "lease lost");
        }
        Ok(outcome)
    }
}

#[async_trait]
impl InstanceCoordinator for StoreCoordinator {
    async fn acquire(
        &self,
        partition_key: &str,
        instance_id: &str,
        lease_duration: StdDuration,
    ) -> Result<AcquireOutcome> {
        if partition_key.trim().is_empty() || instance_id.trim().is_empty() {
            return Err(Error::validation(
                "partition key and instance id must not be blank",
            ));
        }
        let duration = Duration::from_std(lease_duration)
            .ok()
            .filter(|d| *d > Duration::zero())
            .ok_or_else(|| Error::validation("lease duration must be positive and in range"))?;

        let span = coordinator_span("acquire", partition_key, instance_id);
        async {
            let outcome = self
                .with_retries(partition_key, "lease_acquire", || {
                    self.try_acquire(partition_key, instance_id, duration)
                })
                .await?;
            match &outcome {
                AcquireOutcome::Acquired { lease, resume_from } => {
                    self.metrics.record_lease("acquire", "acquired");
                    tracing::info!(
                        epoch = lease.epoch,
                        expires_at = %lease.expires_at,
                        resuming = resume_from.is_some(),
                        "lease acquired"
                    );
                }
                AcquireOutcome::AlreadyHeld { owner, expires_at } => {
                    self.metrics.record_lease("acquire", "held");
                    tracing::debug!(%owner, %expires_at, "lease already held");
                }
            }
            Ok(outcome)
        }
        .instrument(span)
        .await
    }

    async fn heartbeat(&self, lease: &Lease) -> Result<HeartbeatOutcome> {
        let span = coordinator_span("heartbeat", &lease.partition_key, &lease.owner);
        self.update_held(lease, "heartbeat", |record, now| {
            record.heartbeat_at = now;
            record.expires_at = now + record.duration();
        })
        .instrument(span)
        .await
    }

    async fn release(&self, lease: &Lease) -> Result<bool> {
        let span = coordinator_span("release", &lease.partition_key, &lease.owner);
        let outcome = self
            .update_held(lease, "release", |record, now| {
                record.state = RecordState::Released;
                record.expires_at = now;
            })
            .instrument(span)
            .await?;
        let released = matches!(outcome, HeartbeatOutcome::Ok(_));
        if released {
            tracing::info!(
                partition_key = %lease.partition_key,
                owner = %lease.owner,
                "lease released"
            );
        }
        Ok(released)
    }

    async fn checkpoint(
        &self,
        lease: &Lease,
        progress: serde_json::Value,
    ) -> Result<HeartbeatOutcome> {
        let span = coordinator_span("checkpoint", &lease.partition_key, &lease.owner);
        let progress = &progress;
        self.update_held(lease, "checkpoint", move |record, _| {
            record.checkpoint = Some(progress.clone());
        })
        .instrument(span)
        .await
    }

    async fn inspect(&self, partition_key: &str) -> Result<LeaseState> {
        let now = self.clock.now();
        Ok(match self.read(partition_key).await? {
            None => LeaseState::Free,
            Some((record, _)) if record.state == RecordState::Released => LeaseState::Released {
                owner: record.owner,
            },
            Some((record, _)) if record.is_held_at(now) => LeaseState::Held {
                owner: record.owner,
                expires_at: record.expires_at,
            },
            Some((record, _)) => LeaseState::Expired {
                owner: record.owner,
                expired_at: record.expires_at,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use sideline_core::{ManualClock, MemoryStore};

    use crate::alert::MemoryAlertSink;

    fn setup(policy: ResumptionPolicy) -> (StoreCoordinator, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 2, 28, 12, 0, 0).unwrap());
        let coordinator = StoreCoordinator::new(
            Arc::new(MemoryStore::new()),
            Arc::new(clock.clone()),
            Arc::new(MemoryAlertSink::new()),
            policy,
            StdDuration::from_secs(1),
            RetryPolicy::immediate(5),
        );
        (coordinator, clock)
    }

    const LEASE: StdDuration = StdDuration::from_secs(300);

    #[tokio::test]
    async fn second_instance_sees_already_held() -> Result<()> {
        let (coordinator, _) = setup(ResumptionPolicy::Restart);
        let first = coordinator.acquire("2026-02-28", "inst-A", LEASE).await?;
        let second = coordinator.acquire("2026-02-28", "inst-B", LEASE).await?;

        assert!(first.is_acquired());
        assert!(matches!(second, AcquireOutcome::AlreadyHeld { ref owner, .. } if owner == "inst-A"));
        Ok(())
    }

    #[tokio::test]
    async fn reacquire_by_owner_returns_existing_lease() -> Result<()> {
        let (coordinator, _) = setup(ResumptionPolicy::Restart);
        let first = coordinator.acquire("k", "inst-A", LEASE).await?;
        let again = coordinator.acquire("k", "inst-A", LEASE).await?;
        assert_eq!(first.lease(), again.lease());
        Ok(())
    }

    #[tokio::test]
    async fn heartbeat_extends_and_expiry_allows_takeover() -> Result<()> {
        let (coordinator, clock) = setup(ResumptionPolicy::Restart);
        let lease = coordinator
            .acquire("k", "inst-A", LEASE)
            .await?
            .lease()
            .cloned()
            .ok_or_else(|| Error::validation("not acquired"))?;

        clock.advance(Duration::seconds(200));
        let HeartbeatOutcome::Ok(renewed) = coordinator.heartbeat(&lease).await? else {
            panic!("heartbeat should succeed");
        };
        assert_eq!(renewed.expires_at, clock.now() + Duration::seconds(300));

        clock.advance(Duration::seconds(299));
        assert!(!coordinator.acquire("k", "inst-B", LEASE).await?.is_acquired());

        clock.advance(Duration::seconds(1));
        let takeover = coordinator.acquire("k", "inst-B", LEASE).await?;
        assert_eq!(takeover.lease().map(|l| l.epoch), Some(2));
        assert_eq!(coordinator.heartbeat(&renewed).await?, HeartbeatOutcome::LeaseLost);
        Ok(())
    }

    #[tokio::test]
    async fn release_frees_immediately() -> Result<()> {
        let (coordinator, _) = setup(ResumptionPolicy::Restart);
        let outcome = coordinator.acquire("k", "inst-A", LEASE).await?;
        let lease = outcome.lease().cloned().ok_or_else(|| Error::validation("not acquired"))?;

        assert!(coordinator.release(&lease).await?);
        assert!(!coordinator.release(&lease).await?);
        assert_eq!(
            coordinator.inspect("k").await?,
            LeaseState::Released {
                owner: "inst-A".into()
            }
        );
        assert!(coordinator.acquire("k", "inst-B", LEASE).await?.is_acquired());
        Ok(())
    }

    #[tokio::test]
    async fn checkpoint_is_handed_over_only_when_resuming() -> Result<()> {
        for (policy, expected) in [
            (ResumptionPolicy::FromCheckpoint, Some(serde_json::json!({"games_done": 7}))),
            (ResumptionPolicy::Restart, None),
        ] {
            let (coordinator, clock) = setup(policy);
            let outcome = coordinator.acquire("k", "inst-A", LEASE).await?;
            let lease = outcome.lease().cloned().ok_or_else(|| Error::validation("not acquired"))?;
            coordinator
                .checkpoint(&lease, serde_json::json!({"games_done": 7}))
                .await?;

            clock.advance(Duration::seconds(301));
            let AcquireOutcome::Acquired { resume_from, .. } =
                coordinator.acquire("k", "inst-B", LEASE).await?
            else {
                panic!("expired lease should be taken over");
            };
            assert_eq!(resume_from, expected);
        }
        Ok(())
    }

    #[tokio::test]
    async fn rejects_zero_duration() {
        let (coordinator, _) = setup(ResumptionPolicy::Restart);
        let err = coordinator
            .acquire("k", "inst-A", StdDuration::ZERO)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }
}
