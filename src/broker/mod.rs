//! Broker seam for event propagation.
//!
//! This module contains:
//! - `Connector` / `BrokerChannel` traits: the only surface the rest of the
//!   crate sees of the message broker
//! - `Delivery` and `Acker`: one consumed message and its acknowledgement handle
//! - [`session`]: the connection supervisor that owns the live channel
//! - [`publisher`] / [`consumer`]: confirmed publish and acknowledged consume
//! - Implementations: AMQP (RabbitMQ, feature `amqp`) and an in-process broker

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod consumer;
pub mod memory;
pub mod publisher;
pub mod session;

#[cfg(feature = "amqp")]
pub use amqp::AmqpConnector;
pub use consumer::{Consumer, ConsumerConfig, ConsumerHandle, EnvelopeHandler, HandlerError};
pub use memory::{MemoryBroker, MemoryConnector};
pub use publisher::{ConfirmOutcome, PublishError, PublishReceipt, Publisher};
pub use session::{BrokerSession, ConnectionState, SessionConfig, SessionHealth};

/// Header carrying the broker-side delivery count (RabbitMQ quorum queues).
pub const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur while talking to the broker.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Queue declaration failed: {0}")]
    Declare(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Consume failed: {0}")]
    Consume(String),

    #[error("Acknowledgement failed: {0}")]
    Ack(String),

    #[error("Broker session is shut down")]
    ShutDown,
}

/// Broker answer to a confirmed publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack,
}

/// Pending broker confirmation for one published message.
pub type ConfirmFuture = BoxFuture<'static, Result<Confirmation>>;

/// Stream of deliveries for one subscription.
///
/// Ends (or yields an error) when the underlying channel goes away.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Message metadata carried alongside the body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    /// Survive a broker restart.
    pub persistent: bool,
    /// Seconds since the Unix epoch.
    pub timestamp: Option<u64>,
    pub headers: BTreeMap<String, String>,
}

impl MessageProperties {
    /// Persistent JSON message.
    pub fn persistent_json() -> Self {
        Self {
            content_type: Some("application/json".to_string()),
            persistent: true,
            ..Default::default()
        }
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_correlation_id(mut self, id: Option<String>) -> Self {
        self.correlation_id = id;
        self
    }

    pub fn with_timestamp(mut self, secs: u64) -> Self {
        self.timestamp = Some(secs);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// One message handed to a consumer.
pub struct Delivery {
    pub data: Vec<u8>,
    pub properties: MessageProperties,
    /// Broker flag: this message was delivered before and not acknowledged.
    pub redelivered: bool,
    /// Broker-side delivery count, when the queue type tracks one.
    pub delivery_count: Option<u32>,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(
        data: Vec<u8>,
        properties: MessageProperties,
        redelivered: bool,
        acker: Box<dyn Acker>,
    ) -> Self {
        let delivery_count = properties
            .headers
            .get(DELIVERY_COUNT_HEADER)
            .and_then(|v| v.parse().ok());
        Self {
            data,
            properties,
            redelivered,
            delivery_count,
            acker,
        }
    }

    /// Remove the message from the queue permanently.
    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    /// Reject the message; `requeue` hands it back to the broker for redelivery.
    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("len", &self.data.len())
            .field("properties", &self.properties)
            .field("redelivered", &self.redelivered)
            .field("delivery_count", &self.delivery_count)
            .finish()
    }
}

/// Durable queue declaration parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
        }
    }
}

/// A live channel to the broker.
///
/// Handles go stale after a reconnect: every operation on a dead channel fails
/// fast with [`BrokerError::ChannelClosed`] or a connection error.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a queue. Repeating an identical declaration is a no-op.
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()>;

    /// Hand a message to the broker for `queue`.
    ///
    /// Returns once the message is written to the channel; the returned future
    /// resolves with the broker's confirmation.
    async fn publish(
        &self,
        queue: &str,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<ConfirmFuture>;

    /// Start a manual-ack subscription with at most `prefetch` unacked deliveries.
    async fn consume(&self, queue: &str, consumer_tag: &str, prefetch: u16)
        -> Result<DeliveryStream>;

    fn is_open(&self) -> bool;

    /// Resolves once the channel or its connection has closed for any reason.
    async fn closed(&self);

    async fn close(&self) -> Result<()>;
}

/// Opens channels to the broker.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a connection and return a channel in publisher-confirm mode.
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>>;

    /// Human-readable target for logs (credentials stripped).
    fn describe(&self) -> String;
}

/// Strip `user:password@` from a broker URL.
pub fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}{}", &url[..scheme_end + 3], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}
