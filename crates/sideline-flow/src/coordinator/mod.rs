//! Instance coordination through leases.
//!
//! Downstream stages run several instances at once. Before working on a unit
//! of work (a partition key, usually a pipeline date), an instance acquires a
//! time-bounded lease on it; the lease is kept alive by heartbeats and ends on
//! release or expiry.
//!
//! ```text
//! FREE --acquire--> HELD(owner) --heartbeat--> HELD(owner)
//!                        |--release-----> RELEASED --> FREE
//!                        '--no heartbeat-> EXPIRED  --> FREE
//! ```
//!
//! For any partition key at most one lease is unexpired at any instant. When a
//! holder dies, nobody can acquire until its lease expires: the handover gap is
//! bounded by the time the lease had left at its last heartbeat, see
//! [`Lease::handover_gap_bound`].
//!
//! Whether the next holder resumes from the previous holder's checkpoint or
//! starts over is an explicit [`ResumptionPolicy`].

pub mod keeper;
pub mod lease_store;

use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use keeper::{HeartbeatKeeper, KeeperStatus};
pub use lease_store::StoreCoordinator;

/// A lease held by one instance on one partition key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// The unit of work the lease covers.
    pub partition_key: String,
    /// Instance holding the lease.
    pub owner: String,
    /// Token proving ownership of this particular grant.
    pub token: String,
    /// Fencing epoch. Increases with every new grant on the key.
    pub epoch: u64,
    /// When the grant was made.
    pub acquired_at: DateTime<Utc>,
    /// When the lease lapses without a heartbeat.
    pub expires_at: DateTime<Utc>,
    /// Last heartbeat.
    pub heartbeat_at: DateTime<Utc>,
}

impl Lease {
    /// Returns true if the lease has lapsed at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Lease time left at `now`, never negative.
    #[must_use]
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).max(Duration::zero())
    }

    /// Upper bound on how long the key stays unavailable if the holder dies
    /// at `now`.
    ///
    /// Equals the lease duration minus the age of the last heartbeat.
    #[must_use]
    pub fn handover_gap_bound(&self, now: DateTime<Utc>) -> Duration {
        self.remaining_at(now)
    }
}

/// Result of an acquire attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The caller holds the lease.
    Acquired {
        /// The lease.
        lease: Lease,
        /// Checkpoint left by the previous holder, when the resumption policy
        /// asks for it.
        resume_from: Option<serde_json::Value>,
    },
    /// Another instance holds an unexpired lease.
    AlreadyHeld {
        /// Current holder.
        owner: String,
        /// When its lease lapses without a heartbeat.
        expires_at: DateTime<Utc>,
    },
}

impl AcquireOutcome {
    /// Returns the lease if acquired.
    #[must_use]
    pub const fn lease(&self) -> Option<&Lease> {
        match self {
            Self::Acquired { lease, .. } => Some(lease),
            Self::AlreadyHeld { .. } => None,
        }
    }

    /// Returns true if the lease was acquired.
    #[must_use]
    pub const fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired { .. })
    }
}

/// Result of a heartbeat or checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// The lease is still held; carries the refreshed lease.
    Ok(Lease),
    /// The lease expired, was released, or was taken over.
    LeaseLost,
}

/// Observed state of a partition key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseState {
    /// Never leased.
    Free,
    /// Held by an instance.
    Held {
        /// Holder.
        owner: String,
        /// Expiry.
        expires_at: DateTime<Utc>,
    },
    /// The last holder's lease lapsed.
    Expired {
        /// Last holder.
        owner: String,
        /// When it lapsed.
        expired_at: DateTime<Utc>,
    },
    /// The last holder released the key.
    Released {
        /// Last holder.
        owner: String,
    },
}

impl LeaseState {
    /// Returns true if an acquire would succeed for any instance.
    #[must_use]
    pub const fn is_available(&self) -> bool {
        !matches!(self, Self::Held { .. })
    }
}

/// What a new holder does with the previous holder's progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumptionPolicy {
    /// Discard checkpoints; every grant starts the work from scratch.
    #[default]
    Restart,
    /// Hand the last checkpoint to the next holder.
    FromCheckpoint,
}

/// Lease-based mutual exclusion over partition keys.
#[async_trait]
pub trait InstanceCoordinator: Send + Sync {
    /// Acquires the lease on a key if it is free, released, or expired.
    ///
    /// Re-acquiring a key the caller already holds returns its existing lease.
    async fn acquire(
        &self,
        partition_key: &str,
        instance_id: &str,
        lease_duration: StdDuration,
    ) -> Result<AcquireOutcome>;

    /// Extends a held lease by its duration, measured from now.
    async fn heartbeat(&self, lease: &Lease) -> Result<HeartbeatOutcome>;

    /// Releases a held lease. Returns false if it was no longer held.
    async fn release(&self, lease: &Lease) -> Result<bool>;

    /// Stores resumable progress on a held lease.
    async fn checkpoint(&self, lease: &Lease, progress: serde_json::Value)
    -> Result<HeartbeatOutcome>;

    /// Reports the state of a key.
    async fn inspect(&self, partition_key: &str) -> Result<LeaseState>;
}
