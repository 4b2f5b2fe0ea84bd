//! In-memory transport for tests and local runs.
//!
//! Records every published message and can be told to fail, so publish
//! retries and reconciliation can be exercised without a broker.

use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use ulid::Ulid;

use super::{PublishAck, Transport, TransitionMessage};
use crate::error::{Error, Result};

/// A message accepted by [`InMemoryTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Transport-assigned id.
    pub message_id: String,
    /// Topic it was published to.
    pub topic: String,
    /// Raw payload.
    pub payload: Bytes,
}

impl PublishedMessage {
    /// Decodes the payload as a transition message.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not a transition message.
    pub fn transition(&self) -> Result<TransitionMessage> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

#[derive(Debug, Default)]
struct TransportState {
    published: Vec<PublishedMessage>,
    fail_next: u32,
    failing: bool,
    attempts: u32,
}

/// Transport that keeps messages in memory.
#[derive(Debug, Default)]
pub struct InMemoryTransport {
    state: RwLock<TransportState>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::transport("memory", "transport lock poisoned")
}

impl InMemoryTransport {
    /// Creates a transport that accepts every message.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `n` publish calls.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn fail_next(&self, n: u32) -> Result<()> {
        self.state.write().map_err(poison_err)?.fail_next = n;
        Ok(())
    }

    /// Fails every publish call until switched off.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn set_failing(&self, failing: bool) -> Result<()> {
        self.state.write().map_err(poison_err)?.failing = failing;
        Ok(())
    }

    /// Messages accepted so far, in publish order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn published(&self) -> Result<Vec<PublishedMessage>> {
        Ok(self.state.read().map_err(poison_err)?.published.clone())
    }

    /// Publish calls received so far, failed ones included.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn attempts(&self) -> Result<u32> {
        Ok(self.state.read().map_err(poison_err)?.attempts)
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<PublishAck> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.attempts += 1;
        if state.failing {
            return Err(Error::transport(topic, "broker unavailable"));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(Error::transport(topic, "broker unavailable"));
        }
        let message_id = Ulid::new().to_string();
        state.published.push(PublishedMessage {
            message_id: message_id.clone(),
            topic: topic.to_string(),
            payload,
        });
        drop(state);
        Ok(PublishAck { message_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn injected_failures_are_consumed() -> Result<()> {
        let transport = InMemoryTransport::new();
        transport.fail_next(2)?;

        assert!(transport.publish("t", Bytes::new()).await.is_err());
        assert!(transport.publish("t", Bytes::new()).await.is_err());
        transport.publish("t", Bytes::from_static(b"{}")).await?;

        assert_eq!(transport.attempts()?, 3);
        assert_eq!(transport.published()?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn failing_mode_rejects_until_cleared() -> Result<()> {
        let transport = InMemoryTransport::new();
        transport.set_failing(true)?;
        let err = transport.publish("phase.analytics.trigger", Bytes::new()).await.unwrap_err();
        assert!(err.is_retryable());

        transport.set_failing(false)?;
        transport.publish("phase.analytics.trigger", Bytes::new()).await?;
        assert_eq!(transport.published()?[0].topic, "phase.analytics.trigger");
        Ok(())
    }
}
