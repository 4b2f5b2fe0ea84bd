//! Typed access to phase states over a [`DocumentStore`].
//!
//! All mutation goes through [`PhaseStateStore::update`], a read-modify-write
//! loop that commits with compare-and-set on the revision it read. Conflicts
//! and transient store failures are retried under the configured
//! [`RetryPolicy`]; each store call runs under a deadline. When the budget is
//! spent the store raises an alert and returns the failure, so nothing is
//! dropped silently.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::NaiveDate;
use sideline_core::{CasOutcome, DocumentStore, Precondition};

use crate::alert::{Alert, AlertSink};
use crate::error::{Error, Result};
use crate::metrics::EngineMetrics;
use crate::pipeline::Phase;
use crate::retry::RetryPolicy;
use crate::state::PhaseState;

/// Key prefix for phase state documents.
pub const PHASE_STATE_PREFIX: &str = "phase-state/";

/// Identity of a phase state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhaseKey {
    /// Pipeline date.
    pub pipeline_date: NaiveDate,
    /// Phase.
    pub phase: Phase,
}

impl PhaseKey {
    /// Creates a key.
    #[must_use]
    pub const fn new(pipeline_date: NaiveDate, phase: Phase) -> Self {
        Self {
            pipeline_date,
            phase,
        }
    }

    /// Store key: `phase-state/{date}/{phase}`.
    #[must_use]
    pub fn storage_key(&self) -> String {
        format!("{PHASE_STATE_PREFIX}{}/{}", self.pipeline_date, self.phase)
    }

    /// Store prefix of every phase of a date.
    #[must_use]
    pub fn date_prefix(pipeline_date: NaiveDate) -> String {
        format!("{PHASE_STATE_PREFIX}{pipeline_date}/")
    }

    /// Parses a store key back into a phase key.
    #[must_use]
    pub fn parse(key: &str) -> Option<Self> {
        let rest = key.strip_prefix(PHASE_STATE_PREFIX)?;
        let (date, phase) = rest.split_once('/')?;
        Some(Self {
            pipeline_date: date.parse().ok()?,
            phase: phase.parse().ok()?,
        })
    }
}

impl fmt::Display for PhaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pipeline_date, self.phase)
    }
}

impl From<&PhaseState> for PhaseKey {
    fn from(state: &PhaseState) -> Self {
        Self::new(state.pipeline_date, state.phase)
    }
}

/// What an update closure decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change<T> {
    /// Commit the mutated state.
    Commit(T),
    /// Leave the stored state as it is.
    Keep(T),
}

/// Result of [`PhaseStateStore::update`].
#[derive(Debug, Clone)]
pub struct Updated<T> {
    /// The state as stored after the update, with its current revision.
    pub state: PhaseState,
    /// Value returned by the closure.
    pub value: T,
    /// Whether a new revision was written.
    pub committed: bool,
}

/// Phase state persistence.
#[derive(Clone)]
pub struct PhaseStateStore {
    store: Arc<dyn DocumentStore>,
    alerts: Arc<dyn AlertSink>,
    timeout: Duration,
    retry: RetryPolicy,
    metrics: EngineMetrics,
}

impl fmt::Debug for PhaseStateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhaseStateStore")
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl PhaseStateStore {
    /// Creates a store.
    #[must_use]
    pub fn new(
        store: Arc<dyn DocumentStore>,
        alerts: Arc<dyn AlertSink>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            alerts,
            timeout,
            retry,
            metrics: EngineMetrics::new(),
        }
    }

    /// Reads a phase state.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails or the document is corrupt.
    pub async fn get(&self, key: PhaseKey) -> Result<Option<PhaseState>> {
        let storage_key = key.storage_key();
        let doc = with_deadline("get", self.timeout, self.store.get(&storage_key)).await?;
        doc.map(|doc| decode(&doc.data, doc.revision)).transpose()
    }

    /// Creates a state if none exists.
    ///
    /// Returns `true` if this call created it.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn create(&self, state: &PhaseState) -> Result<bool> {
        let storage_key = PhaseKey::from(state).storage_key();
        let data = encode(state)?;
        let outcome = with_deadline(
            "create",
            self.timeout,
            self.store
                .compare_and_set(&storage_key, Precondition::Absent, data),
        )
        .await?;
        Ok(outcome.is_committed())
    }

    /// Applies `f` to the stored state and commits the result.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PhaseStateNotFound`] if the state does not exist, the
    /// closure's error, or a store error once retries are exhausted.
    pub async fn update<T, F>(&self, key: PhaseKey, f: F) -> Result<Updated<T>>
    where
        F: FnMut(&mut PhaseState) -> Result<Change<T>> + Send,
        T: Send,
    {
        self.mutate(key, None::<fn() -> PhaseState>, f).await
    }

    /// Like [`Self::update`], but starts from `init()` if the state is absent.
    ///
    /// # Errors
    ///
    /// Returns the closure's error, or a store error once retries are
    /// exhausted.
    pub async fn update_or_init<T, I, F>(&self, key: PhaseKey, init: I, f: F) -> Result<Updated<T>>
    where
        I: Fn() -> PhaseState + Send + Sync,
        F: FnMut(&mut PhaseState) -> Result<Change<T>> + Send,
        T: Send,
    {
        self.mutate(key, Some(init), f).await
    }

    async fn mutate<T, I, F>(&self, key: PhaseKey, init: Option<I>, mut f: F) -> Result<Updated<T>>
    where
        I: Fn() -> PhaseState + Send + Sync,
        F: FnMut(&mut PhaseState) -> Result<Change<T>> + Send,
        T: Send,
    {
        let storage_key = key.storage_key();
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.try_mutate(key, &storage_key, init.as_ref(), &mut f).await {
                Ok(Some(updated)) => return Ok(updated),
                Ok(None) => {
                    self.metrics.record_cas_conflict("phase_update");
                    tracing::debug!(key = %storage_key, attempt, "phase state CAS conflict");
                    if !self.retry.allows_another(attempt) {
                        return Err(self.exhausted(storage_key, attempt).await);
                    }
                }
                Err(err) if err.is_retryable() => {
                    tracing::warn!(key = %storage_key, attempt, error = %err, "phase state store error");
                    if !self.retry.allows_another(attempt) {
                        self.raise_exhausted(&storage_key, attempt).await;
                        return Err(err);
                    }
                }
                Err(err) => return Err(err),
            }
            self.retry.wait(attempt).await;
        }
    }

    /// One read-modify-write pass. `Ok(None)` means the swap conflicted.
    async fn try_mutate<T, I, F>(
        &self,
        key: PhaseKey,
        storage_key: &str,
        init: Option<&I>,
        f: &mut F,
    ) -> Result<Option<Updated<T>>>
    where
        I: Fn() -> PhaseState + Send + Sync,
        F: FnMut(&mut PhaseState) -> Result<Change<T>> + Send,
    {
        let (mut state, precondition) = match self.get(key).await? {
            Some(state) => {
                let revision = state.revision;
                (state, Precondition::Revision(revision))
            }
            None => match init {
                Some(init) => (init(), Precondition::Absent),
                None => {
                    return Err(Error::PhaseStateNotFound {
                        pipeline_date: key.pipeline_date,
                        phase: key.phase,
                    });
                }
            },
        };

        let value = match f(&mut state)? {
            Change::Keep(value) if precondition != Precondition::Absent => {
                return Ok(Some(Updated {
                    state,
                    value,
                    committed: false,
                }));
            }
            Change::Keep(value) | Change::Commit(value) => value,
        };

        let data = encode(&state)?;
        let outcome = with_deadline(
            "compare_and_set",
            self.timeout,
            self.store.compare_and_set(storage_key, precondition, data),
        )
        .await?;

        match outcome {
            CasOutcome::Committed { revision } => {
                state.revision = revision;
                Ok(Some(Updated {
                    state,
                    value,
                    committed: true,
                }))
            }
            CasOutcome::Conflict { .. } => Ok(None),
        }
    }

    async fn exhausted(&self, key: String, attempts: u32) -> Error {
        self.raise_exhausted(&key, attempts).await;
        Error::StoreContention { key, attempts }
    }

    async fn raise_exhausted(&self, key: &str, attempts: u32) {
        tracing::error!(key, attempts, "phase state store retries exhausted");
        self.alerts
            .raise(Alert::StoreRetriesExhausted {
                key: key.to_string(),
                attempts,
            })
            .await;
    }

    /// Lists every stored phase key, ordered by date then phase.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn keys(&self) -> Result<Vec<PhaseKey>> {
        self.keys_under(PHASE_STATE_PREFIX).await
    }

    /// Lists the phase keys stored for one date.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn keys_for_date(&self, pipeline_date: NaiveDate) -> Result<Vec<PhaseKey>> {
        self.keys_under(&PhaseKey::date_prefix(pipeline_date)).await
    }

    async fn keys_under(&self, prefix: &str) -> Result<Vec<PhaseKey>> {
        let raw = with_deadline("list", self.timeout, self.store.list(prefix)).await?;
        let mut keys: Vec<PhaseKey> = raw
            .iter()
            .filter_map(|key| {
                let parsed = PhaseKey::parse(key);
                if parsed.is_none() {
                    tracing::warn!(key = %key, "skipping unrecognized phase state key");
                }
                parsed
            })
            .collect();
        keys.sort();
        Ok(keys)
    }

    /// Deletes a state if it is still at `revision`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn delete(&self, key: PhaseKey, revision: u64) -> Result<bool> {
        let storage_key = key.storage_key();
        with_deadline(
            "delete_if",
            self.timeout,
            self.store.delete_if(&storage_key, revision),
        )
        .await
    }
}

fn encode(state: &PhaseState) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(state)?))
}

fn decode(data: &[u8], revision: u64) -> Result<PhaseState> {
    let mut state: PhaseState = serde_json::from_slice(data)?;
    state.revision = revision;
    Ok(state)
}

/// Runs a store call under a deadline.
pub(crate) async fn with_deadline<T>(
    operation: &str,
    timeout: Duration,
    fut: impl Future<Output = sideline_core::Result<T>> + Send,
) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(Error::from),
        Err(_) => Err(Error::from(sideline_core::Error::StorageTimeout {
            operation: operation.to_string(),
            elapsed_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::MemoryAlertSink;
    use crate::pipeline::{PipelineRun, RunMode};
    use chrono::{TimeZone, Utc};
    use sideline_core::MemoryStore;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 2, 28).unwrap()
    }

    fn fresh(phase: Phase) -> PhaseState {
        let run = PipelineRun::new(date(), RunMode::Overnight).with_correlation_id("corr");
        PhaseState::new(
            &run,
            phase,
            ["raw_ingest".to_string()].into(),
            Utc.with_ymd_and_hms(2026, 2, 28, 22, 0, 0).unwrap(),
        )
    }

    fn store(alerts: Arc<MemoryAlertSink>) -> PhaseStateStore {
        PhaseStateStore::new(
            Arc::new(MemoryStore::new()),
            alerts,
            Duration::from_secs(1),
            RetryPolicy::immediate(3),
        )
    }

    #[test]
    fn keys_round_trip() {
        let key = PhaseKey::new(date(), Phase::Predictions);
        assert_eq!(key.storage_key(), "phase-state/2026-02-28/predictions");
        assert_eq!(PhaseKey::parse(&key.storage_key()), Some(key));
        assert_eq!(PhaseKey::parse("leases/2026-02-28"), None);
        assert_eq!(PhaseKey::parse("phase-state/2026-02-28/unknown"), None);
    }

    #[tokio::test]
    async fn create_is_first_writer_wins() -> Result<()> {
        let store = store(Arc::new(MemoryAlertSink::new()));
        assert!(store.create(&fresh(Phase::Ingestion)).await?);
        assert!(!store.create(&fresh(Phase::Ingestion)).await?);

        let read = store
            .get(PhaseKey::new(date(), Phase::Ingestion))
            .await?
            .ok_or_else(|| Error::validation("missing"))?;
        assert_eq!(read.revision, 1);
        Ok(())
    }

    #[tokio::test]
    async fn update_commits_and_bumps_revision() -> Result<()> {
        let store = store(Arc::new(MemoryAlertSink::new()));
        store.create(&fresh(Phase::Ingestion)).await?;

        let key = PhaseKey::new(date(), Phase::Ingestion);
        let updated = store
            .update(key, |state| {
                state.entities_changed.insert("g1".into());
                Ok(Change::Commit(()))
            })
            .await?;
        assert!(updated.committed);
        assert_eq!(updated.state.revision, 2);

        let kept = store.update(key, |_| Ok(Change::Keep(7))).await?;
        assert!(!kept.committed);
        assert_eq!(kept.value, 7);
        assert_eq!(kept.state.revision, 2);
        Ok(())
    }

    #[tokio::test]
    async fn update_of_missing_state_is_not_found() {
        let store = store(Arc::new(MemoryAlertSink::new()));
        let err = store
            .update(PhaseKey::new(date(), Phase::Export), |_| Ok(Change::Commit(())))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PhaseStateNotFound { .. }));
    }

    #[tokio::test]
    async fn update_or_init_creates_with_absent_precondition() -> Result<()> {
        let store = store(Arc::new(MemoryAlertSink::new()));
        let key = PhaseKey::new(date(), Phase::Analytics);
        let updated = store
            .update_or_init(key, || fresh(Phase::Analytics), |_| Ok(Change::Keep(())))
            .await?;
        assert!(updated.committed);
        assert_eq!(updated.state.revision, 1);
        Ok(())
    }

    #[tokio::test]
    async fn closure_errors_abort_without_retry() {
        let store = store(Arc::new(MemoryAlertSink::new()));
        store.create(&fresh(Phase::Ingestion)).await.unwrap();
        let mut calls = 0;
        let err = store
            .update(PhaseKey::new(date(), Phase::Ingestion), |_| {
                calls += 1;
                Err::<Change<()>, _>(Error::validation("nope"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn keys_are_listed_per_date() -> Result<()> {
        let store = store(Arc::new(MemoryAlertSink::new()));
        store.create(&fresh(Phase::Analytics)).await?;
        store.create(&fresh(Phase::Ingestion)).await?;

        let keys = store.keys_for_date(date()).await?;
        assert_eq!(
            keys,
            vec![
                PhaseKey::new(date(), Phase::Ingestion),
                PhaseKey::new(date(), Phase::Analytics)
            ]
        );
        Ok(())
    }
}
