//! Broker and event propagation configuration types.

use std::time::Duration;

use serde::Deserialize;

use crate::broker::{ConsumerConfig, QueueSpec, SessionConfig};
use crate::dlq::dead_letter_queue_for;
use crate::envelope::USER_REGISTERED;

/// Broker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// AMQP connection URL. Required.
    pub url: Option<String>,
    /// Durable queue carrying `UserRegistered` events.
    pub queue: String,
    /// Dead letter queue. Empty disables dead-lettering (dead letters are logged and dropped).
    pub dead_letter_queue: Option<String>,
    /// Consumer tag; defaults to the service name.
    pub consumer_tag: Option<String>,
    /// Unacknowledged deliveries per consumer.
    pub prefetch: u16,
    /// Delivery attempts before a message is dead-lettered. 0 disables the limit.
    pub max_deliveries: u32,
    pub reconnect: ReconnectConfig,
    pub publish: PublishConfig,
    /// How long messaging may be down before `/ready` reports 503.
    pub readiness_grace_ms: u64,
    /// How long shutdown waits for in-flight handlers.
    pub drain_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: None,
            queue: USER_REGISTERED.to_string(),
            dead_letter_queue: Some(dead_letter_queue_for(USER_REGISTERED)),
            consumer_tag: None,
            prefetch: 16,
            max_deliveries: 5,
            reconnect: ReconnectConfig::default(),
            publish: PublishConfig::default(),
            readiness_grace_ms: 30_000,
            drain_timeout_ms: 30_000,
        }
    }
}

/// Reconnect backoff.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }
}

/// Publisher settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// Upper bound on handing a message to the channel.
    pub handoff_timeout_ms: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            handoff_timeout_ms: 2_000,
        }
    }
}

impl BrokerConfig {
    /// Configured DLQ name, if dead-lettering is enabled.
    pub fn dead_letter_queue(&self) -> Option<&str> {
        self.dead_letter_queue.as_deref().filter(|q| !q.is_empty())
    }

    /// Supervisor settings: declares the event queue and the DLQ.
    pub fn session_config(&self) -> SessionConfig {
        let mut config = SessionConfig {
            queues: Vec::new(),
            initial_delay: Duration::from_millis(self.reconnect.initial_delay_ms),
            max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
            jitter: self.reconnect.jitter,
        }
        .with_queue(QueueSpec::durable(self.queue.clone()));
        if let Some(dlq) = self.dead_letter_queue() {
            config = config.with_queue(QueueSpec::durable(dlq));
        }
        config
    }

    /// Consumer settings for a component.
    pub fn consumer_config(&self, component: &str) -> ConsumerConfig {
        ConsumerConfig {
            queue: self.queue.clone(),
            consumer_tag: self
                .consumer_tag
                .clone()
                .unwrap_or_else(|| component.to_string()),
            prefetch: self.prefetch,
            max_deliveries: self.max_deliveries,
            source_component: component.to_string(),
            retry_initial_delay: Duration::from_millis(self.reconnect.initial_delay_ms),
            retry_max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
            ..Default::default()
        }
    }

    pub fn handoff_timeout(&self) -> Duration {
        Duration::from_millis(self.publish.handoff_timeout_ms)
    }

    pub fn readiness_grace(&self) -> Duration {
        Duration::from_millis(self.readiness_grace_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}
