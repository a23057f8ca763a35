use super::*;
use crate::broker::{ConfirmFuture, DeliveryStream, MemoryBroker, MessageProperties};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

const QUEUE: &str = "UserRegistered";

fn fast_config() -> SessionConfig {
    SessionConfig {
        queues: vec![QueueSpec::durable(QUEUE)],
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        jitter: false,
    }
}

fn session_for(broker: &MemoryBroker) -> BrokerSession {
    BrokerSession::new(Arc::new(broker.connector()), fast_config())
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_not_connected_before_start() {
    let broker = MemoryBroker::new();
    let session = session_for(&broker);

    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert!(session.current_channel().is_none());
    assert_eq!(broker.connect_attempts(), 0);
}

#[tokio::test]
async fn test_converges_after_connect_failures() {
    let broker = MemoryBroker::new();
    broker.refuse_next_connects(5);
    let session = session_for(&broker);
    session.start().await;

    let channel = tokio::time::timeout(Duration::from_secs(2), session.ensure_connected())
        .await
        .expect("session never connected")
        .unwrap();

    assert!(channel.is_open());
    assert_eq!(session.state(), ConnectionState::Connected);
    assert_eq!(session.generation(), 1);
    assert_eq!(broker.connect_attempts(), 6);
    assert_eq!(broker.declare_count(), 1);
    assert_eq!(broker.queue_names(), vec![QUEUE.to_string()]);
}

#[tokio::test]
async fn test_reconnects_and_redeclares_after_drop() {
    let broker = MemoryBroker::new();
    let session = session_for(&broker);
    session.start().await;
    let first = session.ensure_connected().await.unwrap();

    broker.drop_connections();
    wait_until(|| session.generation() == 2).await;

    let second = session.ensure_connected().await.unwrap();
    assert!(!first.is_open());
    assert!(second.is_open());
    // Declared once per connection, still a single queue.
    assert_eq!(broker.declare_count(), 2);
    assert_eq!(broker.queue_names(), vec![QUEUE.to_string()]);
}

#[tokio::test]
async fn test_stale_channel_fails_fast() {
    let broker = MemoryBroker::new();
    let session = session_for(&broker);
    session.start().await;
    let stale = session.ensure_connected().await.unwrap();

    broker.set_unavailable(true);
    broker.drop_connections();

    let result = tokio::time::timeout(
        Duration::from_millis(100),
        stale.publish(QUEUE, b"x".to_vec(), MessageProperties::default()),
    )
    .await
    .expect("publish on a dead channel must not hang");
    assert!(result.is_err());

    wait_until(|| session.current_channel().is_none()).await;
}

#[tokio::test]
async fn test_ensure_connected_waits_for_broker() {
    let broker = MemoryBroker::new();
    broker.set_unavailable(true);
    let session = session_for(&broker);
    session.start().await;

    let pending = tokio::time::timeout(Duration::from_millis(30), session.ensure_connected()).await;
    assert!(pending.is_err(), "must keep waiting while the broker is down");

    let health = session.health();
    assert!(health.consecutive_failures > 0);
    assert!(health.last_error.is_some());
    assert!(health.unavailable_ms.is_some());

    broker.set_unavailable(false);
    let channel = tokio::time::timeout(Duration::from_secs(2), session.ensure_connected())
        .await
        .expect("session never connected")
        .unwrap();
    assert!(channel.is_open());
    assert_eq!(session.health().consecutive_failures, 0);
    assert!(session.health().unavailable_ms.is_none());
}

#[tokio::test]
async fn test_readiness_reflects_prolonged_unavailability() {
    let broker = MemoryBroker::new();
    broker.set_unavailable(true);
    let session = session_for(&broker);
    session.start().await;

    let grace = Duration::from_millis(40);
    assert!(session.is_ready(grace));

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(!session.is_ready(grace));

    broker.set_unavailable(false);
    session.ensure_connected().await.unwrap();
    assert!(session.is_ready(grace));
}

#[tokio::test]
async fn test_on_reconnect_runs_for_every_generation() {
    let broker = MemoryBroker::new();
    let session = session_for(&broker);

    let calls = Arc::new(AtomicUsize::new(0));
    let last_generation = Arc::new(AtomicU64::new(0));
    {
        let calls = calls.clone();
        let last_generation = last_generation.clone();
        session
            .on_reconnect(move |_channel, generation| {
                calls.fetch_add(1, Ordering::SeqCst);
                last_generation.store(generation, Ordering::SeqCst);
            })
            .await;
    }

    session.start().await;
    session.ensure_connected().await.unwrap();
    wait_until(|| calls.load(Ordering::SeqCst) == 1).await;

    broker.drop_connections();
    wait_until(|| calls.load(Ordering::SeqCst) == 2).await;
    assert_eq!(last_generation.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_on_reconnect_fires_immediately_when_connected() {
    let broker = MemoryBroker::new();
    let session = session_for(&broker);
    session.start().await;
    session.ensure_connected().await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    session
        .on_reconnect(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_shutdown_closes_channel_and_stops_retrying() {
    let broker = MemoryBroker::new();
    let session = session_for(&broker);
    session.start().await;
    session.ensure_connected().await.unwrap();
    assert_eq!(broker.open_channels(), 1);

    session.shutdown().await;

    assert_eq!(session.state(), ConnectionState::ShutDown);
    assert_eq!(broker.open_channels(), 0);
    assert!(session.current_channel().is_none());
    assert!(matches!(
        session.ensure_connected().await,
        Err(BrokerError::ShutDown)
    ));
    assert!(!session.is_ready(Duration::from_secs(60)));

    let attempts = broker.connect_attempts();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(broker.connect_attempts(), attempts);
}

// ============================================================================
// Flapping broker
// ============================================================================

/// A channel the broker drops as soon as it is handed out.
struct DroppedChannel;

#[async_trait]
impl BrokerChannel for DroppedChannel {
    async fn declare_queue(&self, _spec: &QueueSpec) -> Result<()> {
        Ok(())
    }

    async fn publish(
        &self,
        _queue: &str,
        _payload: Vec<u8>,
        _properties: MessageProperties,
    ) -> Result<ConfirmFuture> {
        Err(BrokerError::ChannelClosed)
    }

    async fn consume(
        &self,
        _queue: &str,
        _consumer_tag: &str,
        _prefetch: u16,
    ) -> Result<DeliveryStream> {
        Ok(futures::stream::empty().boxed())
    }

    fn is_open(&self) -> bool {
        false
    }

    async fn closed(&self) {}

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Accepts every connect, then loses the connection immediately.
#[derive(Default)]
struct FlappingConnector {
    attempts: AtomicUsize,
}

#[async_trait]
impl Connector for FlappingConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(DroppedChannel))
    }

    fn describe(&self) -> String {
        "flapping://".to_string()
    }
}

#[tokio::test]
async fn test_flapping_connection_waits_between_reconnects() {
    let connector = Arc::new(FlappingConnector::default());
    let config = SessionConfig {
        queues: vec![QueueSpec::durable(QUEUE)],
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(1),
        jitter: false,
    };
    let session = BrokerSession::new(connector.clone(), config);

    let hook_calls = Arc::new(AtomicUsize::new(0));
    {
        let hook_calls = hook_calls.clone();
        session
            .on_reconnect(move |_, _| {
                hook_calls.fetch_add(1, Ordering::SeqCst);
            })
            .await;
    }

    session.start().await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    session.shutdown().await;

    // Connects at 0ms, ~100ms and ~300ms: each closed connection backs off
    // further instead of reconnecting at once.
    let attempts = connector.attempts.load(Ordering::SeqCst);
    assert!(attempts >= 2, "expected reconnects, got {}", attempts);
    assert!(attempts <= 4, "reconnected {} times in 300ms", attempts);
    let hook_calls = hook_calls.load(Ordering::SeqCst);
    assert!(hook_calls + 1 >= attempts && hook_calls <= attempts);
}

#[tokio::test]
async fn test_backoff_restarts_after_stable_connection() {
    let broker = MemoryBroker::new();
    let config = SessionConfig {
        queues: vec![QueueSpec::durable(QUEUE)],
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(40),
        jitter: false,
    };
    let session = BrokerSession::new(Arc::new(broker.connector()), config);
    session.start().await;
    session.ensure_connected().await.unwrap();

    // Short-lived connections walk the backoff up to its cap.
    for generation in 2..=4 {
        broker.drop_connections();
        wait_until(|| session.generation() == generation).await;
    }

    // A connection that outlives the cap earns the initial delay again.
    tokio::time::sleep(Duration::from_millis(60)).await;
    let dropped_at = Instant::now();
    broker.drop_connections();
    wait_until(|| session.generation() == 5).await;
    assert!(dropped_at.elapsed() < Duration::from_millis(35));

    session.shutdown().await;
}

#[test]
fn test_backoff_is_capped() {
    let config = SessionConfig {
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_millis(400),
        jitter: false,
        ..Default::default()
    };
    let delays: Vec<Duration> = config.backoff().build().take(6).collect();

    assert_eq!(delays.len(), 6, "backoff must not run out");
    assert_eq!(delays[0], Duration::from_millis(100));
    assert_eq!(delays[1], Duration::from_millis(200));
    assert!(delays.iter().all(|d| *d <= Duration::from_millis(400)));
    assert_eq!(delays[5], Duration::from_millis(400));
}
