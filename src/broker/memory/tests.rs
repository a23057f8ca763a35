use super::*;
use std::time::Duration;

async fn connected(broker: &MemoryBroker, queue: &str) -> Arc<dyn BrokerChannel> {
    let channel = broker.connector().connect().await.unwrap();
    channel.declare_queue(&QueueSpec::durable(queue)).await.unwrap();
    channel
}

async fn next(stream: &mut DeliveryStream) -> Delivery {
    tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("timed out waiting for delivery")
        .expect("stream ended")
        .expect("delivery error")
}

#[tokio::test]
async fn test_declare_is_idempotent() {
    let broker = MemoryBroker::new();
    let channel = connected(&broker, "q").await;
    channel.declare_queue(&QueueSpec::durable("q")).await.unwrap();

    assert_eq!(broker.declare_count(), 2);
    assert_eq!(broker.queue_names(), vec!["q".to_string()]);
}

#[tokio::test]
async fn test_declare_with_different_durability_fails() {
    let broker = MemoryBroker::new();
    let channel = connected(&broker, "q").await;
    let spec = QueueSpec {
        name: "q".to_string(),
        durable: false,
    };
    let result = channel.declare_queue(&spec).await;
    assert!(matches!(result, Err(BrokerError::Declare(_))));
}

#[tokio::test]
async fn test_publish_confirm_and_consume_ack() {
    let broker = MemoryBroker::new();
    let channel = connected(&broker, "q").await;

    let confirm = channel
        .publish("q", b"hello".to_vec(), MessageProperties::persistent_json())
        .await
        .unwrap();
    assert_eq!(confirm.await.unwrap(), Confirmation::Ack);
    assert_eq!(broker.ready_count("q"), 1);

    let mut stream = channel.consume("q", "test", 10).await.unwrap();
    let delivery = next(&mut stream).await;
    assert_eq!(delivery.data, b"hello");
    assert!(!delivery.redelivered);
    assert_eq!(broker.unacked_count("q"), 1);

    delivery.ack().await.unwrap();
    assert_eq!(broker.unacked_count("q"), 0);
    assert_eq!(broker.ready_count("q"), 0);
}

#[tokio::test]
async fn test_nack_requeue_redelivers() {
    let broker = MemoryBroker::new();
    let channel = connected(&broker, "q").await;
    broker.inject("q", b"m1".to_vec());

    let mut stream = channel.consume("q", "test", 1).await.unwrap();
    let first = next(&mut stream).await;
    first.nack(true).await.unwrap();

    let second = next(&mut stream).await;
    assert_eq!(second.data, b"m1");
    assert!(second.redelivered);
}

#[tokio::test]
async fn test_prefetch_limits_in_flight() {
    let broker = MemoryBroker::new();
    let channel = connected(&broker, "q").await;
    for i in 0..3 {
        broker.inject("q", vec![i]);
    }

    let mut stream = channel.consume("q", "test", 1).await.unwrap();
    let first = next(&mut stream).await;

    let blocked = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
    assert!(blocked.is_err(), "second delivery should wait for the first ack");

    first.ack().await.unwrap();
    let second = next(&mut stream).await;
    assert_eq!(second.data, vec![1]);
}

#[tokio::test]
async fn test_drop_connections_requeues_unacked() {
    let broker = MemoryBroker::new();
    let channel = connected(&broker, "q").await;
    broker.inject("q", b"m1".to_vec());

    let mut stream = channel.consume("q", "test", 10).await.unwrap();
    let delivery = next(&mut stream).await;

    assert_eq!(broker.drop_connections(), 1);
    assert!(!channel.is_open());
    assert_eq!(broker.ready_count("q"), 1);

    // Settling on the dead channel fails fast.
    assert!(matches!(delivery.ack().await, Err(BrokerError::ChannelClosed)));

    // The stream reports the closure.
    let end = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .unwrap();
    assert!(matches!(end, Some(Err(BrokerError::ChannelClosed)) | None));

    // A new channel sees the message again, flagged as redelivered.
    let channel = broker.connector().connect().await.unwrap();
    let mut stream = channel.consume("q", "test", 10).await.unwrap();
    let again = next(&mut stream).await;
    assert_eq!(again.data, b"m1");
    assert!(again.redelivered);
}

#[tokio::test]
async fn test_operations_on_closed_channel_fail_fast() {
    let broker = MemoryBroker::new();
    let channel = connected(&broker, "q").await;
    channel.close().await.unwrap();

    let publish = channel
        .publish("q", vec![], MessageProperties::default())
        .await;
    assert!(matches!(publish, Err(BrokerError::ChannelClosed)));
    assert!(matches!(
        channel.consume("q", "test", 1).await,
        Err(BrokerError::ChannelClosed)
    ));

    tokio::time::timeout(Duration::from_millis(100), channel.closed())
        .await
        .expect("closed() should resolve");
}

#[tokio::test]
async fn test_refused_connects() {
    let broker = MemoryBroker::new();
    broker.refuse_next_connects(2);
    let connector = broker.connector();

    assert!(connector.connect().await.is_err());
    assert!(connector.connect().await.is_err());
    assert!(connector.connect().await.is_ok());
    assert_eq!(broker.connect_attempts(), 3);
}

#[tokio::test]
async fn test_forced_nack_does_not_enqueue() {
    let broker = MemoryBroker::new();
    let channel = connected(&broker, "q").await;
    broker.nack_next_publishes(1);

    let confirm = channel
        .publish("q", b"x".to_vec(), MessageProperties::default())
        .await
        .unwrap();
    assert_eq!(confirm.await.unwrap(), Confirmation::Nack);
    assert_eq!(broker.ready_count("q"), 0);
}

#[tokio::test]
async fn test_delivery_count_header() {
    let broker = MemoryBroker::new().with_delivery_count_header();
    let channel = connected(&broker, "q").await;
    broker.inject("q", b"m1".to_vec());

    let mut stream = channel.consume("q", "test", 1).await.unwrap();
    let first = next(&mut stream).await;
    assert_eq!(first.delivery_count, Some(0));
    first.nack(true).await.unwrap();

    let second = next(&mut stream).await;
    assert_eq!(second.delivery_count, Some(1));
}
