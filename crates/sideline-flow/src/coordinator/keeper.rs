//! Background heartbeats for a held lease.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{HeartbeatOutcome, InstanceCoordinator, Lease};

/// What the keeper last observed about its lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeeperStatus {
    /// The lease is held; carries the latest refreshed lease.
    Held(Lease),
    /// A heartbeat found the lease gone. The holder must stop working.
    Lost,
    /// The keeper was stopped.
    Stopped,
}

/// Heartbeats a lease on an interval until stopped or the lease is lost.
///
/// Heartbeat errors (store unavailable) are logged and retried on the next
/// tick; only an explicit [`HeartbeatOutcome::LeaseLost`] ends the keeper.
#[derive(Debug)]
pub struct HeartbeatKeeper {
    status: watch::Receiver<KeeperStatus>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl HeartbeatKeeper {
    /// Starts heartbeating `lease` every `interval`.
    #[must_use]
    pub fn spawn(
        coordinator: Arc<dyn InstanceCoordinator>,
        lease: Lease,
        interval: Duration,
    ) -> Self {
        let (status_tx, status) = watch::channel(KeeperStatus::Held(lease.clone()));
        let (stop, mut stop_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut lease = lease;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match coordinator.heartbeat(&lease).await {
                            Ok(HeartbeatOutcome::Ok(renewed)) => {
                                lease = renewed;
                                status_tx.send_replace(KeeperStatus::Held(lease.clone()));
                            }
                            Ok(HeartbeatOutcome::LeaseLost) => {
                                tracing::warn!(
                                    partition_key = %lease.partition_key,
                                    owner = %lease.owner,
                                    "heartbeat found lease lost"
                                );
                                status_tx.send_replace(KeeperStatus::Lost);
                                return;
                            }
                            Err(err) => {
                                tracing::warn!(
                                    partition_key = %lease.partition_key,
                                    error = %err,
                                    "heartbeat failed, retrying next tick"
                                );
                            }
                        }
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            status_tx.send_replace(KeeperStatus::Stopped);
                            return;
                        }
                    }
                }
            }
        });

        Self { status, stop, task }
    }

    /// Latest status.
    #[must_use]
    pub fn status(&self) -> KeeperStatus {
        self.status.borrow().clone()
    }

    /// The latest refreshed lease, if still held.
    #[must_use]
    pub fn current(&self) -> Option<Lease> {
        match &*self.status.borrow() {
            KeeperStatus::Held(lease) => Some(lease.clone()),
            KeeperStatus::Lost | KeeperStatus::Stopped => None,
        }
    }

    /// Subscribes to status changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<KeeperStatus> {
        self.status.clone()
    }

    /// Stops heartbeating and returns the last held lease, ready for release.
    ///
    /// Returns `None` if the lease was lost first.
    pub async fn stop(self) -> Option<Lease> {
        let last = self.current();
        let _ = self.stop.send(true);
        if let Err(err) = self.task.await {
            tracing::warn!(error = %err, "heartbeat task ended abnormally");
        }
        match &*self.status.borrow() {
            KeeperStatus::Lost => None,
            KeeperStatus::Held(_) | KeeperStatus::Stopped => last,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::MemoryAlertSink;
    use crate::coordinator::{AcquireOutcome, ResumptionPolicy, StoreCoordinator};
    use crate::retry::RetryPolicy;
    use chrono::{TimeZone, Utc};
    use sideline_core::{ManualClock, MemoryStore};

    async fn acquired(coordinator: &StoreCoordinator, owner: &str) -> Lease {
        match coordinator
            .acquire("2026-02-28", owner, Duration::from_secs(60))
            .await
            .unwrap()
        {
            AcquireOutcome::Acquired { lease, .. } => lease,
            AcquireOutcome::AlreadyHeld { .. } => panic!("expected to acquire"),
        }
    }

    fn coordinator(clock: &ManualClock) -> StoreCoordinator {
        StoreCoordinator::new(
            Arc::new(MemoryStore::new()),
            Arc::new(clock.clone()),
            Arc::new(MemoryAlertSink::new()),
            ResumptionPolicy::Restart,
            Duration::from_secs(1),
            RetryPolicy::immediate(3),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_lease_alive_until_stopped() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 2, 28, 12, 0, 0).unwrap());
        let coordinator = coordinator(&clock);
        let lease = acquired(&coordinator, "inst-A").await;
        let first_expiry = lease.expires_at;

        let keeper = HeartbeatKeeper::spawn(
            Arc::new(coordinator.clone()),
            lease,
            Duration::from_secs(10),
        );
        let mut updates = keeper.subscribe();
        clock.advance(chrono::Duration::seconds(10));
        tokio::time::advance(Duration::from_secs(10)).await;
        updates.changed().await.unwrap();

        let current = keeper.current().unwrap();
        assert!(current.expires_at > first_expiry);

        let last = keeper.stop().await.unwrap();
        assert!(coordinator.release(&last).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn reports_lost_lease() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 2, 28, 12, 0, 0).unwrap());
        let coordinator = coordinator(&clock);
        let lease = acquired(&coordinator, "inst-A").await;

        // Expire the lease and let another instance take it over.
        clock.advance(chrono::Duration::seconds(61));
        let _ = acquired(&coordinator, "inst-B").await;

        let keeper = HeartbeatKeeper::spawn(
            Arc::new(coordinator.clone()),
            lease,
            Duration::from_secs(10),
        );
        let mut updates = keeper.subscribe();
        tokio::time::advance(Duration::from_secs(10)).await;
        updates.changed().await.unwrap();

        assert_eq!(keeper.status(), KeeperStatus::Lost);
        assert!(keeper.stop().await.is_none());
    }
}
