//! In-process broker for standalone runs and tests.
//!
//! Models the parts of RabbitMQ the event core relies on: durable queue
//! declaration, publisher confirms, manual acknowledgement with prefetch, and
//! requeue of unacknowledged messages when a channel dies. Faults can be
//! injected to exercise the supervisor and consumer:
//! - refuse the next N connection attempts, or all of them
//! - drop every live connection
//! - nack the next N publishes

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use tokio::sync::{mpsc, watch, Notify};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use super::{
    Acker, BrokerChannel, BrokerError, ConfirmFuture, Confirmation, Connector, Delivery,
    DeliveryStream, MessageProperties, QueueSpec, Result, DELIVERY_COUNT_HEADER,
};

#[derive(Clone)]
struct StoredMessage {
    data: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
    deliveries: u32,
}

struct Unacked {
    channel: u64,
    consumer: u64,
    message: StoredMessage,
}

struct QueueState {
    durable: bool,
    ready: VecDeque<StoredMessage>,
    unacked: BTreeMap<u64, Unacked>,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, QueueState>,
    channels: HashMap<u64, watch::Sender<bool>>,
    next_id: u64,
    declarations: usize,
    connect_attempts: usize,
    refuse_connects: usize,
    unavailable: bool,
    nack_publishes: usize,
    delivery_count_header: bool,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

struct Inner {
    state: Mutex<State>,
    notify: Notify,
}

/// Shared handle to one in-process broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Stamp deliveries with `x-delivery-count`, like a quorum queue.
    pub fn with_delivery_count_header(self) -> Self {
        self.state().delivery_count_header = true;
        self
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------------

    /// Refuse the next `n` connection attempts.
    pub fn refuse_next_connects(&self, n: usize) {
        self.state().refuse_connects = n;
    }

    /// Refuse every connection attempt until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    /// Nack the next `n` publishes without enqueueing them.
    pub fn nack_next_publishes(&self, n: usize) {
        self.state().nack_publishes = n;
    }

    /// Close every live channel, as if the broker connection had dropped.
    ///
    /// Unacknowledged messages go back to the head of their queue flagged as
    /// redelivered. Returns how many channels were closed.
    pub fn drop_connections(&self) -> usize {
        let ids: Vec<u64> = self.state().channels.keys().copied().collect();
        for id in &ids {
            self.close_channel(*id);
        }
        ids.len()
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    /// Total number of queue declarations received, including repeats.
    pub fn declare_count(&self) -> usize {
        self.state().declarations
    }

    /// Names of the queues that exist.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn connect_attempts(&self) -> usize {
        self.state().connect_attempts
    }

    pub fn open_channels(&self) -> usize {
        self.state().channels.len()
    }

    /// Messages waiting for delivery.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Messages delivered but not yet settled.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    /// Bodies of the messages waiting in `queue`, head first.
    pub fn ready_messages(&self, queue: &str) -> Vec<Vec<u8>> {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.data.clone()).collect())
            .unwrap_or_default()
    }

    /// Enqueue a message directly, bypassing channels (foreign producer).
    pub fn inject(&self, queue: &str, data: Vec<u8>) {
        {
            let mut state = self.state();
            state
                .queues
                .entry(queue.to_string())
                .or_insert_with(|| QueueState {
                    durable: true,
                    ready: VecDeque::new(),
                    unacked: BTreeMap::new(),
                })
                .ready
                .push_back(StoredMessage {
                    data,
                    properties: MessageProperties::default(),
                    redelivered: false,
                    deliveries: 0,
                });
        }
        self.inner.notify.notify_waiters();
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn open_channel(&self) -> Result<MemoryChannel> {
        let mut state = self.state();
        state.connect_attempts += 1;

        if state.unavailable {
            return Err(BrokerError::Connection("connection refused".to_string()));
        }
        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(BrokerError::Connection("connection refused".to_string()));
        }

        let id = state.next_id();
        let (closed_tx, closed_rx) = watch::channel(false);
        state.channels.insert(id, closed_tx);

        Ok(MemoryChannel {
            id,
            broker: self.clone(),
            closed_rx,
        })
    }

    fn close_channel(&self, id: u64) {
        {
            let mut state = self.state();
            let Some(closed_tx) = state.channels.remove(&id) else {
                return;
            };
            let _ = closed_tx.send(true);

            for queue in state.queues.values_mut() {
                let tags: Vec<u64> = queue
                    .unacked
                    .iter()
                    .filter(|(_, u)| u.channel == id)
                    .map(|(tag, _)| *tag)
                    .collect();
                // Newest first so the oldest ends up at the head.
                for tag in tags.into_iter().rev() {
                    if let Some(unacked) = queue.unacked.remove(&tag) {
                        let mut message = unacked.message;
                        message.redelivered = true;
                        queue.ready.push_front(message);
                    }
                }
            }
        }
        debug!(channel = id, "memory channel closed");
        self.inner.notify.notify_waiters();
    }

    fn channel_open(&self, id: u64) -> bool {
        self.state().channels.contains_key(&id)
    }

    fn take_next(&self, queue: &str, channel: u64, consumer: u64, prefetch: u16) -> Option<Delivery> {
        let mut state = self.state();
        if !state.channels.contains_key(&channel) {
            return None;
        }
        let tag = state.next_id();
        let header = state.delivery_count_header;
        let q = state.queues.get_mut(queue)?;

        let in_flight = q.unacked.values().filter(|u| u.consumer == consumer).count();
        if prefetch > 0 && in_flight >= usize::from(prefetch) {
            return None;
        }

        let mut message = q.ready.pop_front()?;
        message.deliveries += 1;

        let mut properties = message.properties.clone();
        if header {
            properties.headers.insert(
                DELIVERY_COUNT_HEADER.to_string(),
                (message.deliveries - 1).to_string(),
            );
        }
        let delivery = Delivery::new(
            message.data.clone(),
            properties,
            message.redelivered,
            Box::new(MemoryAcker {
                broker: self.clone(),
                queue: queue.to_string(),
                channel,
                tag,
            }),
        );

        q.unacked.insert(
            tag,
            Unacked {
                channel,
                consumer,
                message,
            },
        );
        Some(delivery)
    }

    fn settle(&self, queue: &str, channel: u64, tag: u64, requeue: Option<bool>) -> Result<()> {
        {
            let mut state = self.state();
            if !state.channels.contains_key(&channel) {
                return Err(BrokerError::ChannelClosed);
            }
            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::Ack(format!("unknown queue {}", queue)))?;
            let unacked = q
                .unacked
                .remove(&tag)
                .ok_or_else(|| BrokerError::Ack(format!("unknown delivery tag {}", tag)))?;

            if requeue == Some(true) {
                let mut message = unacked.message;
                message.redelivered = true;
                q.ready.push_front(message);
            }
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }
}

/// [`Connector`] for a [`MemoryBroker`].
#[derive(Clone)]
pub struct MemoryConnector {
    broker: MemoryBroker,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self.broker.open_channel()?;
        Ok(Arc::new(channel))
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

/// Channel into a [`MemoryBroker`].
pub struct MemoryChannel {
    id: u64,
    broker: MemoryBroker,
    closed_rx: watch::Receiver<bool>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }
}

async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    // A dropped sender also means the channel is gone.
    let _ = rx.wait_for(|closed| *closed).await;
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        state.declarations += 1;

        let queue = state
            .queues
            .entry(spec.name.clone())
            .or_insert_with(|| QueueState {
                durable: spec.durable,
                ready: VecDeque::new(),
                unacked: BTreeMap::new(),
            });
        if queue.durable != spec.durable {
            return Err(BrokerError::Declare(format!(
                "PRECONDITION_FAILED - inequivalent arg 'durable' for queue '{}'",
                spec.name
            )));
        }
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<ConfirmFuture> {
        self.ensure_open()?;
        let confirmation = {
            let mut state = self.broker.state();
            if state.nack_publishes > 0 {
                state.nack_publishes -= 1;
                Confirmation::Nack
            } else {
                // Unroutable messages are dropped and still acked, as RabbitMQ does
                // for non-mandatory publishes to the default exchange.
                if let Some(q) = state.queues.get_mut(queue) {
                    q.ready.push_back(StoredMessage {
                        data: payload,
                        properties,
                        redelivered: false,
                        deliveries: 0,
                    });
                }
                Confirmation::Ack
            }
        };
        self.broker.inner.notify.notify_waiters();
        Ok(futures::future::ready(Ok(confirmation)).boxed())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream> {
        self.ensure_open()?;
        let consumer = {
            let mut state = self.broker.state();
            if !state.queues.contains_key(queue) {
                return Err(BrokerError::Consume(format!(
                    "NOT_FOUND - no queue '{}'",
                    queue
                )));
            }
            state.next_id()
        };

        let (tx, rx) = mpsc::channel(usize::from(prefetch.max(1)));
        let broker = self.broker.clone();
        let channel = self.id;
        let queue = queue.to_string();
        let mut closed_rx = self.closed_rx.clone();

        debug!(queue = %queue, consumer_tag = %consumer_tag, "memory consumer started");

        tokio::spawn(async move {
            loop {
                let notified = broker.inner.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if !broker.channel_open(channel) {
                    let _ = tx.send(Err(BrokerError::ChannelClosed)).await;
                    break;
                }

                match broker.take_next(&queue, channel, consumer, prefetch) {
                    Some(delivery) => {
                        if let Err(mpsc::error::SendError(returned)) = tx.send(Ok(delivery)).await {
                            // Subscriber went away: hand the message back.
                            if let Ok(delivery) = returned {
                                let _ = delivery.nack(true).await;
                            }
                            break;
                        }
                    }
                    None => {
                        tokio::select! {
                            _ = &mut notified => {}
                            _ = wait_closed(&mut closed_rx) => {}
                            _ = tx.closed() => break,
                        }
                    }
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    fn is_open(&self) -> bool {
        !*self.closed_rx.borrow()
    }

    async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        wait_closed(&mut rx).await;
    }

    async fn close(&self) -> Result<()> {
        self.broker.close_channel(self.id);
        Ok(())
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    queue: String,
    channel: u64,
    tag: u64,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.broker.settle(&self.queue, self.channel, self.tag, None)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.broker
            .settle(&self.queue, self.channel, self.tag, Some(requeue))
    }
}

#[cfg(test)]
mod tests;
