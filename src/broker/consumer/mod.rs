//! Acknowledged consumption of event envelopes.
//!
//! The consumer subscribes to one durable queue on whatever channel the
//! session currently holds and re-subscribes after every reconnect. Each
//! delivery is decoded and handed to an [`EnvelopeHandler`]; the message is
//! acknowledged only after the handler succeeds.
//!
//! ## Outcomes per delivery
//! - handler succeeds: ack
//! - handler fails, delivery count below `max_deliveries`: nack with requeue
//! - handler fails at `max_deliveries`: dead-letter, then ack
//! - body does not decode, or handler reports the event invalid: dead-letter
//!   on first sight, then ack
//! - dead-letter write fails: nack with requeue
//!
//! The delivery count is the largest of a local per-event tracker, the
//! broker's `x-delivery-count` header and the redelivered flag, so it survives
//! redelivery to another channel or process as far as the broker allows.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use backon::BackoffBuilder;
use backon::ExponentialBuilder;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::{BrokerSession, Delivery};
use crate::dlq::{DeadLetter, DeadLetterSink};
use crate::envelope::{Envelope, USER_REGISTERED};

/// Default number of unacknowledged deliveries per consumer.
pub const DEFAULT_PREFETCH: u16 = 16;

/// Default delivery attempts before a message is dead-lettered.
pub const DEFAULT_MAX_DELIVERIES: u32 = 5;

/// Errors a handler reports back to the consumer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    /// The event can never be processed. Dead-lettered immediately.
    #[error("Invalid event: {0}")]
    Invalid(String),

    /// Processing failed; a redelivery may succeed.
    #[error("Handler failed: {0}")]
    Failed(String),
}

/// Processes decoded envelopes.
///
/// Must be idempotent: the same `event_id` can arrive more than once.
pub trait EnvelopeHandler: Send + Sync {
    fn handle(&self, envelope: Arc<Envelope>) -> BoxFuture<'static, Result<(), HandlerError>>;
}

/// Consumer settings.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub queue: String,
    pub consumer_tag: String,
    /// Upper bound on unacknowledged deliveries, broker-side and locally.
    pub prefetch: u16,
    /// Delivery attempts before dead-lettering. `0` disables the limit.
    pub max_deliveries: u32,
    /// Event ids remembered by the local delivery tracker.
    pub tracker_capacity: usize,
    /// Component name recorded on dead letters.
    pub source_component: String,
    /// Backoff bounds for re-subscribing after a failed `consume`.
    pub retry_initial_delay: Duration,
    pub retry_max_delay: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            queue: USER_REGISTERED.to_string(),
            consumer_tag: "usermesh-consumer".to_string(),
            prefetch: DEFAULT_PREFETCH,
            max_deliveries: DEFAULT_MAX_DELIVERIES,
            tracker_capacity: 10_000,
            source_component: "usermesh".to_string(),
            retry_initial_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(30),
        }
    }
}

/// Bounded per-event delivery counter.
///
/// Forgets the oldest entries once full.
#[derive(Debug)]
pub struct DeliveryTracker {
    counts: HashMap<String, u32>,
    order: VecDeque<String>,
    capacity: usize,
}

impl DeliveryTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            counts: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Count one more delivery of `event_id` and return the total seen locally.
    pub fn record(&mut self, event_id: &str) -> u32 {
        if let Some(count) = self.counts.get_mut(event_id) {
            *count += 1;
            return *count;
        }
        while self.counts.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.counts.remove(&oldest);
                }
                None => break,
            }
        }
        self.counts.insert(event_id.to_string(), 1);
        self.order.push_back(event_id.to_string());
        1
    }

    /// Drop the entry for a settled event.
    pub fn forget(&mut self, event_id: &str) {
        if self.counts.remove(event_id).is_some() {
            self.order.retain(|id| id != event_id);
        }
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// Delivery count from broker metadata alone.
///
/// `x-delivery-count` counts previous deliveries, so the current one is `+1`.
fn broker_delivery_count(delivery: &Delivery) -> u32 {
    let from_header = delivery
        .delivery_count
        .map(|previous| previous.saturating_add(1))
        .unwrap_or(1);
    let from_flag = if delivery.redelivered { 2 } else { 1 };
    from_header.max(from_flag)
}

struct ConsumerContext {
    session: BrokerSession,
    config: ConsumerConfig,
    handler: Arc<dyn EnvelopeHandler>,
    dead_letters: Arc<dyn DeadLetterSink>,
    tracker: Mutex<DeliveryTracker>,
}

impl ConsumerContext {
    fn record_delivery(&self, event_id: &str) -> u32 {
        self.tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(event_id)
    }

    fn forget(&self, event_id: &str) {
        self.tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .forget(event_id);
    }

    async fn ack(&self, delivery: &Delivery) {
        if let Err(e) = delivery.ack().await {
            warn!(error = %e, "Failed to ack message; broker will redeliver");
        }
    }

    async fn requeue(&self, delivery: &Delivery) {
        if let Err(e) = delivery.nack(true).await {
            warn!(error = %e, "Failed to nack message; broker will redeliver");
        }
    }

    /// Park a message in the DLQ and ack it, or requeue it if that fails.
    async fn dead_letter(&self, delivery: &Delivery, dead_letter: DeadLetter) -> bool {
        let dead_letter = dead_letter
            .with_metadata("consumer_tag", &self.config.consumer_tag)
            .with_metadata("redelivered", &delivery.redelivered.to_string());
        let reason = dead_letter.rejection_reason.clone();
        match self.dead_letters.publish(dead_letter).await {
            Ok(()) => {
                warn!(reason = %reason, "Message dead-lettered");
                self.ack(delivery).await;
                true
            }
            Err(e) => {
                error!(
                    error = %e,
                    reason = %reason,
                    "Failed to dead-letter message, requeueing"
                );
                self.requeue(delivery).await;
                false
            }
        }
    }

    async fn process(&self, delivery: Delivery) {
        let queue = self.config.queue.as_str();
        let component = self.config.source_component.as_str();

        let envelope = match Envelope::from_slice(&delivery.data) {
            Ok(envelope) => Arc::new(envelope),
            Err(e) => {
                warn!(queue = %queue, error = %e, "Undecodable message");
                let dead_letter =
                    DeadLetter::from_poison(queue, &delivery.data, &e.to_string(), component);
                self.dead_letter(&delivery, dead_letter).await;
                return;
            }
        };

        let delivery_count = self
            .record_delivery(&envelope.event_id)
            .max(broker_delivery_count(&delivery));

        let span = info_span!(
            "bus.consume",
            queue = %queue,
            event_id = %envelope.event_id,
            subject_id = %envelope.subject_id,
            trace_id = envelope.trace_id.as_deref().unwrap_or(""),
            delivery_count,
        );

        async {
            debug!("Received event");
            let outcome = AssertUnwindSafe(self.handler.handle(Arc::clone(&envelope)))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(HandlerError::Failed("handler panicked".to_string())));

            match outcome {
                Ok(()) => {
                    self.ack(&delivery).await;
                    self.forget(&envelope.event_id);
                    debug!("Event processed");
                }
                Err(HandlerError::Invalid(reason)) => {
                    let dead_letter = DeadLetter::from_processing_failure(
                        queue,
                        &envelope,
                        &delivery.data,
                        &reason,
                        delivery_count,
                        self.config.max_deliveries,
                        component,
                    );
                    if self.dead_letter(&delivery, dead_letter).await {
                        self.forget(&envelope.event_id);
                    }
                }
                Err(HandlerError::Failed(reason))
                    if self.config.max_deliveries > 0
                        && delivery_count >= self.config.max_deliveries =>
                {
                    let dead_letter = DeadLetter::from_processing_failure(
                        queue,
                        &envelope,
                        &delivery.data,
                        &reason,
                        delivery_count,
                        self.config.max_deliveries,
                        component,
                    );
                    if self.dead_letter(&delivery, dead_letter).await {
                        self.forget(&envelope.event_id);
                    }
                }
                Err(HandlerError::Failed(reason)) => {
                    warn!(error = %reason, "Handler failed, requeueing for redelivery");
                    self.requeue(&delivery).await;
                }
            }
        }
        .instrument(span)
        .await
    }
}

/// Subscribes an [`EnvelopeHandler`] to a queue.
pub struct Consumer {
    context: Arc<ConsumerContext>,
}

impl Consumer {
    pub fn new(
        session: BrokerSession,
        config: ConsumerConfig,
        handler: Arc<dyn EnvelopeHandler>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        let tracker = Mutex::new(DeliveryTracker::new(config.tracker_capacity));
        Self {
            context: Arc::new(ConsumerContext {
                session,
                config,
                handler,
                dead_letters,
                tracker,
            }),
        }
    }

    /// Start consuming in the background.
    pub fn subscribe(self) -> ConsumerHandle {
        let (stop, stop_rx) = watch::channel(false);
        let queue = self.context.config.queue.clone();
        let task = tokio::spawn(run(self.context, stop_rx));
        ConsumerHandle { queue, stop, task }
    }
}

/// Control handle for a running consumer.
pub struct ConsumerHandle {
    queue: String,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop taking deliveries and wait up to `timeout` for in-flight handlers.
    ///
    /// Returns false if handlers had to be aborted; their messages stay
    /// unacknowledged and are redelivered by the broker.
    pub async fn shutdown(self, timeout: Duration) -> bool {
        let _ = self.stop.send(true);
        let mut task = self.task;
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(_) => {
                info!(queue = %self.queue, "Consumer drained");
                true
            }
            Err(_) => {
                warn!(
                    queue = %self.queue,
                    timeout_ms = timeout.as_millis() as u64,
                    "Consumer drain timed out, aborting in-flight handlers"
                );
                task.abort();
                false
            }
        }
    }
}

async fn wait_stop(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

fn reap(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.try_join_next() {
        if let Err(e) = result {
            error!(error = %e, "Delivery task failed");
        }
    }
}

/// Subscription loop: one subscription per live channel until stopped.
async fn run(context: Arc<ConsumerContext>, mut stop_rx: watch::Receiver<bool>) {
    let config = &context.config;
    let semaphore = Arc::new(Semaphore::new(usize::from(config.prefetch.max(1))));
    let mut tasks = JoinSet::new();

    let backoff_builder = ExponentialBuilder::default()
        .with_min_delay(config.retry_initial_delay)
        .with_max_delay(config.retry_max_delay)
        .with_jitter()
        .without_max_times();
    let mut backoff = backoff_builder.build();

    'subscription: loop {
        let channel = tokio::select! {
            _ = wait_stop(&mut stop_rx) => break 'subscription,
            channel = context.session.ensure_connected() => match channel {
                Ok(channel) => channel,
                Err(e) => {
                    info!(error = %e, "Broker session ended, consumer stopping");
                    break 'subscription;
                }
            },
        };

        let mut stream = match channel
            .consume(&config.queue, &config.consumer_tag, config.prefetch)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                let delay = backoff.next().unwrap_or(config.retry_max_delay);
                error!(
                    error = %e,
                    queue = %config.queue,
                    backoff_ms = delay.as_millis() as u64,
                    "Failed to subscribe, retrying after backoff"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => continue 'subscription,
                    _ = wait_stop(&mut stop_rx) => break 'subscription,
                }
            }
        };

        backoff = backoff_builder.build();
        info!(
            queue = %config.queue,
            consumer_tag = %config.consumer_tag,
            prefetch = config.prefetch,
            generation = context.session.generation(),
            "Consumer subscribed, processing messages"
        );

        loop {
            let permit: OwnedSemaphorePermit = tokio::select! {
                _ = wait_stop(&mut stop_rx) => break 'subscription,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break 'subscription,
                },
            };

            let next = tokio::select! {
                _ = wait_stop(&mut stop_rx) => break 'subscription,
                next = stream.next() => next,
            };
            reap(&mut tasks);

            match next {
                Some(Ok(delivery)) => {
                    let context = Arc::clone(&context);
                    tasks.spawn(async move {
                        context.process(delivery).await;
                        drop(permit);
                    });
                }
                Some(Err(e)) => {
                    warn!(error = %e, queue = %config.queue, "Subscription lost, re-subscribing");
                    break;
                }
                None => {
                    info!(queue = %config.queue, "Consumer stream ended, re-subscribing");
                    break;
                }
            }
        }
    }

    let in_flight = tasks.len();
    if in_flight > 0 {
        info!(in_flight, queue = %config.queue, "Waiting for in-flight handlers");
    }
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "Delivery task failed");
        }
    }
    debug!(queue = %config.queue, "Consumer stopped");
}
