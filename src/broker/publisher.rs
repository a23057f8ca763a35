//! Confirmed publishing of event envelopes.
//!
//! Publishing is split in two steps. [`Publisher::publish`] returns as soon as
//! the message has been handed to the live channel (bounded by the handoff
//! timeout). The broker's confirmation arrives later and is reported through the
//! returned [`PublishReceipt`]; a background task logs it either way. Nothing is
//! republished automatically: a nack or a lost confirmation is terminal for that
//! attempt.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use tracing::{debug, info_span, warn, Instrument};

use super::{BrokerError, BrokerSession, Confirmation, MessageProperties};
use crate::envelope::{Envelope, EnvelopeError};

/// Default bound on handing a message to the channel.
pub const DEFAULT_HANDOFF_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors that prevent a message from reaching the channel.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("No broker channel available")]
    NotConnected,

    #[error("Handoff to broker timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to encode envelope: {0}")]
    Encode(#[from] EnvelopeError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Final broker answer for one published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// Broker took responsibility for the message.
    Acked,
    /// Broker refused the message.
    Nacked,
    /// The channel went away before a confirmation arrived.
    Lost(String),
}

/// Handle on a message that reached the channel.
#[derive(Debug)]
pub struct PublishReceipt {
    pub event_id: String,
    /// Session generation of the channel the message went out on.
    pub generation: u64,
    outcome: oneshot::Receiver<ConfirmOutcome>,
}

impl PublishReceipt {
    /// Wait for the broker's confirmation.
    pub async fn confirmed(self) -> ConfirmOutcome {
        self.outcome
            .await
            .unwrap_or_else(|_| ConfirmOutcome::Lost("confirmation task dropped".to_string()))
    }
}

/// Publishes envelopes to one durable queue.
#[derive(Clone)]
pub struct Publisher {
    session: BrokerSession,
    queue: String,
    handoff_timeout: Duration,
}

impl Publisher {
    pub fn new(session: BrokerSession, queue: impl Into<String>) -> Self {
        Self {
            session,
            queue: queue.into(),
            handoff_timeout: DEFAULT_HANDOFF_TIMEOUT,
        }
    }

    pub fn with_handoff_timeout(mut self, timeout: Duration) -> Self {
        self.handoff_timeout = timeout;
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Hand `envelope` to the broker as a persistent JSON message.
    ///
    /// Never waits for a reconnect: with no live channel this fails with
    /// [`PublishError::NotConnected`] straight away.
    pub async fn publish(&self, envelope: &Envelope) -> Result<PublishReceipt, PublishError> {
        let span = info_span!(
            "bus.publish",
            queue = %self.queue,
            event_id = %envelope.event_id,
            subject_id = %envelope.subject_id,
            trace_id = envelope.trace_id.as_deref().unwrap_or(""),
        );

        async {
            let channel = self
                .session
                .current_channel()
                .ok_or(PublishError::NotConnected)?;
            let generation = self.session.generation();

            let payload = envelope.to_vec()?;
            let timestamp = envelope.created_at.unwrap_or_else(Utc::now).timestamp();
            let properties = MessageProperties::persistent_json()
                .with_message_id(envelope.event_id.clone())
                .with_correlation_id(envelope.trace_id.clone())
                .with_timestamp(u64::try_from(timestamp).unwrap_or_default());

            let confirm = tokio::time::timeout(
                self.handoff_timeout,
                channel.publish(&self.queue, payload, properties),
            )
            .await
            .map_err(|_| PublishError::Timeout(self.handoff_timeout))??;

            debug!(generation, "Message handed to broker");

            let (tx, rx) = oneshot::channel();
            tokio::spawn(
                async move {
                    let outcome = match confirm.await {
                        Ok(Confirmation::Ack) => {
                            debug!("Publish confirmed");
                            ConfirmOutcome::Acked
                        }
                        Ok(Confirmation::Nack) => {
                            warn!("Broker nacked published message; event not delivered");
                            ConfirmOutcome::Nacked
                        }
                        Err(e) => {
                            warn!(error = %e, "Publish confirmation lost; event may not be delivered");
                            ConfirmOutcome::Lost(e.to_string())
                        }
                    };
                    let _ = tx.send(outcome);
                }
                .in_current_span(),
            );

            Ok(PublishReceipt {
                event_id: envelope.event_id.clone(),
                generation,
                outcome: rx,
            })
        }
        .instrument(span)
        .await
    }

    /// Publish without failing the caller.
    ///
    /// For request paths whose own durable write already committed: a
    /// messaging failure is logged and swallowed.
    pub async fn publish_best_effort(&self, envelope: &Envelope) -> Option<PublishReceipt> {
        match self.publish(envelope).await {
            Ok(receipt) => Some(receipt),
            Err(e) => {
                warn!(
                    error = %e,
                    queue = %self.queue,
                    event_id = %envelope.event_id,
                    subject_id = %envelope.subject_id,
                    "Failed to publish event; continuing without it"
                );
                None
            }
        }
    }
}
