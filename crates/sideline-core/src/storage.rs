//! Versioned document storage with single-key optimistic concurrency.
//!
//! Every document carries a monotonically increasing revision. Writers read a
//! document, compute the next value, and commit it with
//! [`DocumentStore::compare_and_set`] conditioned on the revision they read.
//! A conflict is a normal result, never an error: the caller re-reads and
//! retries.
//!
//! The contract maps onto any backend offering conditional writes (object
//! stores with generation preconditions, key-value stores with version
//! checks, SQL rows with a version column).

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

/// Condition a write must satisfy to be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// Write only if no document exists under the key.
    Absent,
    /// Write only if the current document has exactly this revision.
    Revision(u64),
}

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The write was applied.
    Committed {
        /// Revision of the newly written document.
        revision: u64,
    },
    /// The precondition did not hold.
    Conflict {
        /// Revision currently stored, or `None` if the key is absent.
        current: Option<u64>,
    },
}

impl CasOutcome {
    /// Returns true if the write was applied.
    #[must_use]
    pub const fn is_committed(&self) -> bool {
        matches!(self, Self::Committed { .. })
    }
}

/// A document together with the revision it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedDoc {
    /// Raw document bytes.
    pub data: Bytes,
    /// Revision of this document. Starts at 1 and only increases.
    pub revision: u64,
    /// When the revision was written.
    pub updated_at: DateTime<Utc>,
}

/// Storage backend offering single-key compare-and-set.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Reads a document.
    ///
    /// Returns `None` if the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<VersionedDoc>>;

    /// Writes a document if the precondition holds.
    ///
    /// Never returns an error for a failed precondition; that is reported as
    /// [`CasOutcome::Conflict`].
    async fn compare_and_set(
        &self,
        key: &str,
        precondition: Precondition,
        data: Bytes,
    ) -> Result<CasOutcome>;

    /// Deletes a document if it is still at the given revision.
    ///
    /// Returns `false` if the key is absent or at another revision.
    async fn delete_if(&self, key: &str, revision: u64) -> Result<bool>;

    /// Lists keys under a prefix, sorted ascending.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

#[async_trait]
impl<S: DocumentStore + ?Sized> DocumentStore for Arc<S> {
    async fn get(&self, key: &str) -> Result<Option<VersionedDoc>> {
        (**self).get(key).await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        precondition: Precondition,
        data: Bytes,
    ) -> Result<CasOutcome> {
        (**self).compare_and_set(key, precondition, data).await
    }

    async fn delete_if(&self, key: &str, revision: u64) -> Result<bool> {
        (**self).delete_if(key, revision).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        (**self).list(prefix).await
    }
}

/// In-memory document store for tests and local runs.
///
/// Thread-safe via `RwLock`. Not suitable for production: state is neither
/// durable nor shared across processes.
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: RwLock<BTreeMap<String, VersionedDoc>>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::Internal {
        message: "memory store lock poisoned".into(),
    }
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored documents.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self.docs.read().map_err(poison_err)?.len())
    }

    /// Returns true if the store holds no documents.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<VersionedDoc>> {
        let docs = self.docs.read().map_err(poison_err)?;
        Ok(docs.get(key).cloned())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        precondition: Precondition,
        data: Bytes,
    ) -> Result<CasOutcome> {
        let mut docs = self.docs.write().map_err(poison_err)?;
        let current = docs.get(key).map(|doc| doc.revision);

        let holds = match precondition {
            Precondition::Absent => current.is_none(),
            Precondition::Revision(expected) => current == Some(expected),
        };
        if !holds {
            drop(docs);
            return Ok(CasOutcome::Conflict { current });
        }

        let revision = current.map_or(1, |r| r + 1);
        docs.insert(
            key.to_string(),
            VersionedDoc {
                data,
                revision,
                updated_at: Utc::now(),
            },
        );
        drop(docs);

        Ok(CasOutcome::Committed { revision })
    }

    async fn delete_if(&self, key: &str, revision: u64) -> Result<bool> {
        let mut docs = self.docs.write().map_err(poison_err)?;
        let matches = docs.get(key).is_some_and(|doc| doc.revision == revision);
        if matches {
            docs.remove(key);
        }
        drop(docs);
        Ok(matches)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let docs = self.docs.read().map_err(poison_err)?;
        Ok(docs
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn absent_precondition_creates_once() -> Result<()> {
        let store = MemoryStore::new();

        let first = store
            .compare_and_set("k", Precondition::Absent, Bytes::from_static(b"a"))
            .await?;
        assert_eq!(first, CasOutcome::Committed { revision: 1 });

        let second = store
            .compare_and_set("k", Precondition::Absent, Bytes::from_static(b"b"))
            .await?;
        assert_eq!(second, CasOutcome::Conflict { current: Some(1) });

        let doc = store.get("k").await?.ok_or_else(|| Error::storage("missing"))?;
        assert_eq!(doc.data, Bytes::from_static(b"a"));
        Ok(())
    }

    #[tokio::test]
    async fn revision_precondition_rejects_stale_writer() -> Result<()> {
        let store = MemoryStore::new();
        store
            .compare_and_set("k", Precondition::Absent, Bytes::from_static(b"v1"))
            .await?;

        let ok = store
            .compare_and_set("k", Precondition::Revision(1), Bytes::from_static(b"v2"))
            .await?;
        assert_eq!(ok, CasOutcome::Committed { revision: 2 });

        let stale = store
            .compare_and_set("k", Precondition::Revision(1), Bytes::from_static(b"v3"))
            .await?;
        assert_eq!(stale, CasOutcome::Conflict { current: Some(2) });
        Ok(())
    }

    #[tokio::test]
    async fn revision_precondition_on_missing_key_conflicts() -> Result<()> {
        let store = MemoryStore::new();
        let outcome = store
            .compare_and_set("missing", Precondition::Revision(3), Bytes::new())
            .await?;
        assert_eq!(outcome, CasOutcome::Conflict { current: None });
        assert!(store.is_empty()?);
        Ok(())
    }

    #[tokio::test]
    async fn delete_if_checks_revision() -> Result<()> {
        let store = MemoryStore::new();
        store
            .compare_and_set("k", Precondition::Absent, Bytes::new())
            .await?;

        assert!(!store.delete_if("k", 7).await?);
        assert!(store.delete_if("k", 1).await?);
        assert!(store.get("k").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn list_is_prefix_scoped_and_sorted() -> Result<()> {
        let store = MemoryStore::new();
        for key in ["b/2", "a/1", "b/1", "c/1"] {
            store
                .compare_and_set(key, Precondition::Absent, Bytes::new())
                .await?;
        }
        assert_eq!(store.list("b/").await?, vec!["b/1", "b/2"]);
        assert_eq!(store.list("").await?.len(), 4);
        Ok(())
    }
}
