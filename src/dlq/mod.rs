//! Dead Letter Queue (DLQ) infrastructure.
//!
//! Messages that can never be processed are parked in a dead letter queue for
//! manual review and replay instead of cycling through redelivery forever.
//!
//! ## Queue Naming
//!
//! The DLQ for a queue is `{queue}.dead-letter`, declared durable next to the
//! queue it serves.
//!
//! ## Message Format
//!
//! A JSON [`DeadLetter`] record carrying:
//! - Routing info (source queue, event/subject/trace ids when known)
//! - The original message body
//! - Rejection details (poison message, or delivery limit reached)
//! - Metadata (source component, timestamp, delivery count)

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::broker::{BrokerSession, Confirmation, MessageProperties};
use crate::envelope::Envelope;

/// Suffix appended to a queue name to form its DLQ.
pub const DEAD_LETTER_SUFFIX: &str = ".dead-letter";

/// Header naming the queue a dead letter came from.
pub const SOURCE_QUEUE_HEADER: &str = "x-source-queue";

/// Build the DLQ name for a queue.
pub fn dead_letter_queue_for(queue: &str) -> String {
    format!("{}{}", queue, DEAD_LETTER_SUFFIX)
}

/// Errors that can occur during DLQ operations.
#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("Failed to serialize dead letter: {0}")]
    Serialization(String),

    #[error("No broker channel available for DLQ")]
    NotConnected,

    #[error("Failed to publish to DLQ: {0}")]
    PublishFailed(String),

    #[error("DLQ publish was nacked by the broker")]
    Nacked,
}

/// Why a message was dead-lettered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectionDetails {
    /// The body could not be decoded into an envelope.
    Poison { error: String },
    /// The handler kept failing until the delivery limit.
    DeliveryLimit {
        error: String,
        delivery_count: u32,
        max_deliveries: u32,
    },
}

/// Dead letter queue entry for a failed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub source_queue: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// Original message body (lossy UTF-8).
    pub payload: String,
    /// Human-readable reason for rejection.
    pub rejection_reason: String,
    pub rejection_details: RejectionDetails,
    pub occurred_at: DateTime<Utc>,
    /// Which component sent to DLQ.
    pub source_component: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl DeadLetter {
    /// Create a dead letter for a body that is not a valid envelope.
    pub fn from_poison(
        source_queue: &str,
        body: &[u8],
        error: &str,
        source_component: &str,
    ) -> Self {
        Self {
            source_queue: source_queue.to_string(),
            event_id: None,
            subject_id: None,
            trace_id: None,
            payload: String::from_utf8_lossy(body).into_owned(),
            rejection_reason: format!("Undecodable message: {}", error),
            rejection_details: RejectionDetails::Poison {
                error: error.to_string(),
            },
            occurred_at: Utc::now(),
            source_component: source_component.to_string(),
            metadata: BTreeMap::new(),
        }
    }

    /// Create a dead letter for an envelope whose handler failed too often.
    pub fn from_processing_failure(
        source_queue: &str,
        envelope: &Envelope,
        body: &[u8],
        error: &str,
        delivery_count: u32,
        max_deliveries: u32,
        source_component: &str,
    ) -> Self {
        Self {
            source_queue: source_queue.to_string(),
            event_id: Some(envelope.event_id.clone()),
            subject_id: Some(envelope.subject_id.clone()),
            trace_id: envelope.trace_id.clone(),
            payload: String::from_utf8_lossy(body).into_owned(),
            rejection_reason: format!(
                "Event processing failed after {} deliveries: {}",
                delivery_count, error
            ),
            rejection_details: RejectionDetails::DeliveryLimit {
                error: error.to_string(),
                delivery_count,
                max_deliveries,
            },
            occurred_at: Utc::now(),
            source_component: source_component.to_string(),
            metadata: BTreeMap::new(),
        }
    }

    /// Add metadata to the dead letter.
    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, DlqError> {
        serde_json::to_vec(self).map_err(|e| DlqError::Serialization(e.to_string()))
    }
}

/// Destination for dead letters.
///
/// Implementations handle the actual transport (broker queue, in-memory, etc.).
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Store a dead letter durably.
    ///
    /// Returns Ok(()) only once the dead letter is safe; callers settle the
    /// original message based on this.
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError>;

    /// Check if the sink is configured and ready.
    fn is_configured(&self) -> bool {
        true
    }
}

/// No-op DLQ sink that logs but doesn't actually send anywhere.
///
/// Used when DLQ is not configured. Dead letters are dropped after logging.
pub struct NoopDeadLetterSink;

#[async_trait]
impl DeadLetterSink for NoopDeadLetterSink {
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError> {
        warn!(
            source_queue = %dead_letter.source_queue,
            reason = %dead_letter.rejection_reason,
            event_id = dead_letter.event_id.as_deref().unwrap_or(""),
            source = %dead_letter.source_component,
            "DLQ not configured, dropping dead letter"
        );
        Ok(())
    }

    fn is_configured(&self) -> bool {
        false
    }
}

/// In-memory DLQ sink using a channel.
///
/// Used for standalone runs and testing.
pub struct ChannelDeadLetterSink {
    sender: mpsc::UnboundedSender<DeadLetter>,
}

impl ChannelDeadLetterSink {
    /// Create a new channel-based DLQ sink.
    ///
    /// Returns the sink and a receiver for consuming dead letters.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DeadLetter>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl DeadLetterSink for ChannelDeadLetterSink {
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError> {
        info!(
            source_queue = %dead_letter.source_queue,
            reason = %dead_letter.rejection_reason,
            "Publishing to channel DLQ"
        );
        self.sender
            .send(dead_letter)
            .map_err(|e| DlqError::PublishFailed(e.to_string()))
    }
}

/// Broker-backed DLQ sink.
///
/// Publishes to a durable queue on the session's current channel and waits for
/// the broker's confirmation. Never waits for a reconnect.
pub struct QueueDeadLetterSink {
    session: BrokerSession,
    queue: String,
}

impl QueueDeadLetterSink {
    pub fn new(session: BrokerSession, queue: impl Into<String>) -> Self {
        Self {
            session,
            queue: queue.into(),
        }
    }
}

#[async_trait]
impl DeadLetterSink for QueueDeadLetterSink {
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError> {
        let channel = self
            .session
            .current_channel()
            .ok_or(DlqError::NotConnected)?;

        let body = dead_letter.to_vec()?;
        let mut properties = MessageProperties::persistent_json()
            .with_correlation_id(dead_letter.trace_id.clone())
            .with_header(SOURCE_QUEUE_HEADER, dead_letter.source_queue.clone());
        if let Some(event_id) = &dead_letter.event_id {
            properties = properties.with_message_id(event_id.clone());
        }

        let confirm = channel
            .publish(&self.queue, body, properties)
            .await
            .map_err(|e| DlqError::PublishFailed(e.to_string()))?;

        match confirm.await {
            Ok(Confirmation::Ack) => {
                debug!(
                    queue = %self.queue,
                    reason = %dead_letter.rejection_reason,
                    "Dead letter stored"
                );
                Ok(())
            }
            Ok(Confirmation::Nack) => {
                warn!(queue = %self.queue, "Dead letter nacked by the broker");
                Err(DlqError::Nacked)
            }
            Err(e) => Err(DlqError::PublishFailed(e.to_string())),
        }
    }
}

/// Create a DLQ sink for the given queue.
///
/// Returns [`NoopDeadLetterSink`] if no queue is configured.
pub fn create_sink(
    session: &BrokerSession,
    dead_letter_queue: Option<&str>,
) -> std::sync::Arc<dyn DeadLetterSink> {
    match dead_letter_queue.filter(|q| !q.is_empty()) {
        Some(queue) => {
            debug!(queue = %queue, "Using broker DLQ");
            std::sync::Arc::new(QueueDeadLetterSink::new(session.clone(), queue))
        }
        None => {
            warn!("No DLQ configured, dead letters will be logged and dropped");
            std::sync::Arc::new(NoopDeadLetterSink)
        }
    }
}
