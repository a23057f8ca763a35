//! Connection supervisor.
//!
//! A [`BrokerSession`] owns the process-wide broker connection. Its background
//! task connects, declares the durable queues, publishes the live channel, and
//! reconnects forever with jittered exponential backoff whenever the channel
//! dies. Callers never see broker-down conditions as errors: they either take
//! the current channel if there is one ([`BrokerSession::current_channel`]) or
//! wait for the next one ([`BrokerSession::ensure_connected`]).
//!
//! ## Lifecycle
//! ```text
//! Disconnected -> Connecting -> Connected -> Closed --(backoff)--> Connecting -> ...
//!                     |                                              ^
//!                     +----------> Failed --(backoff)----------------+
//! ```
//! `ShutDown` is terminal.

use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{BrokerChannel, BrokerError, Connector, QueueSpec, Result};

/// Callback run after every successful (re)connect with the new channel and its generation.
pub type ReconnectHook = Box<dyn Fn(Arc<dyn BrokerChannel>, u64) + Send + Sync>;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not started yet.
    Disconnected,
    Connecting,
    Connected,
    /// Last connection attempt failed; waiting out the backoff.
    Failed,
    /// The live connection went away.
    Closed,
    ShutDown,
}

/// Supervisor settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Queues declared on every successful connect.
    pub queues: Vec<QueueSpec>,
    /// First retry delay.
    pub initial_delay: Duration,
    /// Backoff cap.
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queues: Vec::new(),
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl SessionConfig {
    pub fn with_queue(mut self, spec: QueueSpec) -> Self {
        self.queues.push(spec);
        self
    }

    fn backoff(&self) -> ExponentialBuilder {
        let builder = ExponentialBuilder::default()
            .with_min_delay(self.initial_delay)
            .with_max_delay(self.max_delay)
            .without_max_times();
        if self.jitter {
            builder.with_jitter()
        } else {
            builder
        }
    }
}

/// Point-in-time view of the session, for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct SessionHealth {
    pub state: ConnectionState,
    /// Number of connections established so far.
    pub generation: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    /// How long messaging has been unavailable, if it is.
    pub unavailable_ms: Option<u64>,
}

#[derive(Clone)]
struct Snapshot {
    state: ConnectionState,
    channel: Option<Arc<dyn BrokerChannel>>,
    generation: u64,
    consecutive_failures: u32,
    last_error: Option<String>,
    unavailable_since: Option<Instant>,
}

impl Snapshot {
    fn usable_channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        match (&self.state, &self.channel) {
            (ConnectionState::Connected, Some(channel)) if channel.is_open() => {
                Some(Arc::clone(channel))
            }
            _ => None,
        }
    }
}

struct SessionInner {
    connector: Arc<dyn Connector>,
    config: SessionConfig,
    snapshot: watch::Sender<Snapshot>,
    hooks: RwLock<Vec<ReconnectHook>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Shared handle to the supervised broker connection.
#[derive(Clone)]
pub struct BrokerSession {
    inner: Arc<SessionInner>,
}

impl BrokerSession {
    pub fn new(connector: Arc<dyn Connector>, config: SessionConfig) -> Self {
        let (snapshot, _) = watch::channel(Snapshot {
            state: ConnectionState::Disconnected,
            channel: None,
            generation: 0,
            consecutive_failures: 0,
            last_error: None,
            unavailable_since: Some(Instant::now()),
        });
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(SessionInner {
                connector,
                config,
                snapshot,
                hooks: RwLock::new(Vec::new()),
                shutdown,
                task: Mutex::new(None),
            }),
        }
    }

    /// Launch the supervisor task. Calling it again is a no-op.
    pub async fn start(&self) {
        let mut task = self.inner.task.lock().await;
        if task.is_some() || *self.inner.shutdown.borrow() {
            return;
        }
        info!(
            broker = %self.inner.connector.describe(),
            queues = self.inner.config.queues.len(),
            "Starting broker session"
        );
        *task = Some(tokio::spawn(supervise(Arc::clone(&self.inner))));
    }

    /// The live channel, if there is one right now. Never waits.
    pub fn current_channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.inner.snapshot.borrow().usable_channel()
    }

    /// Wait until a live channel is available.
    ///
    /// Broker unavailability is never reported: this only returns an error once
    /// the session has been shut down.
    pub async fn ensure_connected(&self) -> Result<Arc<dyn BrokerChannel>> {
        let mut rx = self.inner.snapshot.subscribe();
        let snapshot = rx
            .wait_for(|s| s.usable_channel().is_some() || s.state == ConnectionState::ShutDown)
            .await
            .map_err(|_| BrokerError::ShutDown)?;
        snapshot.usable_channel().ok_or(BrokerError::ShutDown)
    }

    /// Register a callback for every new channel.
    ///
    /// If the session is connected already, the hook runs immediately with the
    /// current channel.
    pub async fn on_reconnect<F>(&self, hook: F)
    where
        F: Fn(Arc<dyn BrokerChannel>, u64) + Send + Sync + 'static,
    {
        let mut hooks = self.inner.hooks.write().await;
        let current = {
            let snapshot = self.inner.snapshot.borrow();
            snapshot
                .usable_channel()
                .map(|channel| (channel, snapshot.generation))
        };
        if let Some((channel, generation)) = current {
            hook(channel, generation);
        }
        hooks.push(Box::new(hook));
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.snapshot.borrow().state
    }

    pub fn generation(&self) -> u64 {
        self.inner.snapshot.borrow().generation
    }

    pub fn health(&self) -> SessionHealth {
        let snapshot = self.inner.snapshot.borrow();
        SessionHealth {
            state: snapshot.state,
            generation: snapshot.generation,
            consecutive_failures: snapshot.consecutive_failures,
            last_error: snapshot.last_error.clone(),
            unavailable_ms: snapshot
                .unavailable_since
                .map(|since| since.elapsed().as_millis() as u64),
        }
    }

    /// False once messaging has been unavailable for longer than `grace`.
    pub fn is_ready(&self, grace: Duration) -> bool {
        let snapshot = self.inner.snapshot.borrow();
        match snapshot.state {
            ConnectionState::Connected => true,
            ConnectionState::ShutDown => false,
            _ => snapshot
                .unavailable_since
                .map_or(true, |since| since.elapsed() < grace),
        }
    }

    /// Stop reconnecting and close the live channel.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown.send_replace(true);
        let task = self.inner.task.lock().await.take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.inner.set_state(ConnectionState::ShutDown);
    }
}

impl SessionInner {
    fn set_state(&self, state: ConnectionState) {
        self.snapshot.send_modify(|s| {
            if s.state != state {
                debug!(from = ?s.state, to = ?state, "Broker session state change");
            }
            if state != ConnectionState::Connected {
                s.channel = None;
                s.unavailable_since.get_or_insert_with(Instant::now);
            }
            s.state = state;
        });
    }

    fn mark_connected(&self, channel: Arc<dyn BrokerChannel>) -> u64 {
        let mut generation = 0;
        self.snapshot.send_modify(|s| {
            s.generation += 1;
            generation = s.generation;
            s.state = ConnectionState::Connected;
            s.channel = Some(channel);
            s.consecutive_failures = 0;
            s.last_error = None;
            s.unavailable_since = None;
        });
        generation
    }

    fn mark_failed(&self, error: &BrokerError) -> u32 {
        self.set_state(ConnectionState::Failed);
        let mut failures = 0;
        self.snapshot.send_modify(|s| {
            s.consecutive_failures += 1;
            failures = s.consecutive_failures;
            s.last_error = Some(error.to_string());
        });
        failures
    }

    async fn connect_and_declare(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self.connector.connect().await?;
        for spec in &self.config.queues {
            if let Err(e) = channel.declare_queue(spec).await {
                let _ = channel.close().await;
                return Err(e);
            }
            debug!(queue = %spec.name, durable = spec.durable, "Declared queue");
        }
        Ok(channel)
    }

    async fn run_hooks(&self, channel: &Arc<dyn BrokerChannel>, generation: u64) {
        let hooks = self.hooks.read().await;
        for hook in hooks.iter() {
            hook(Arc::clone(channel), generation);
        }
    }
}

async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Supervisor loop: runs until shutdown, never gives up on the broker.
///
/// Every lost connection waits out the next backoff delay before reconnecting.
/// The backoff only starts over once a connection has stayed up for at least
/// `max_delay`.
async fn supervise(inner: Arc<SessionInner>) {
    let mut shutdown_rx = inner.shutdown.subscribe();
    let builder = inner.config.backoff();
    let mut backoff = builder.build();

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        inner.set_state(ConnectionState::Connecting);

        let attempt = tokio::select! {
            result = inner.connect_and_declare() => result,
            _ = wait_shutdown(&mut shutdown_rx) => break,
        };

        let delay = match attempt {
            Ok(channel) => {
                let connected_at = Instant::now();
                let generation = inner.mark_connected(Arc::clone(&channel));
                info!(
                    generation,
                    broker = %inner.connector.describe(),
                    "Broker connected"
                );
                inner.run_hooks(&channel, generation).await;

                tokio::select! {
                    _ = channel.closed() => {
                        inner.set_state(ConnectionState::Closed);
                    }
                    _ = wait_shutdown(&mut shutdown_rx) => {
                        let _ = channel.close().await;
                        break;
                    }
                }

                let uptime = connected_at.elapsed();
                if uptime >= inner.config.max_delay {
                    backoff = builder.build();
                }
                let delay = backoff.next().unwrap_or(inner.config.max_delay);
                warn!(
                    generation,
                    uptime_ms = uptime.as_millis() as u64,
                    retry_in_ms = delay.as_millis() as u64,
                    "Broker connection closed, reconnecting after backoff"
                );
                delay
            }
            Err(e) => {
                let failures = inner.mark_failed(&e);
                let delay = backoff.next().unwrap_or(inner.config.max_delay);
                warn!(
                    error = %e,
                    attempt = failures,
                    retry_in_ms = delay.as_millis() as u64,
                    "Broker connection failed, retrying after backoff"
                );
                delay
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = wait_shutdown(&mut shutdown_rx) => break,
        }
    }

    inner.set_state(ConnectionState::ShutDown);
    info!("Broker session stopped");
}

#[cfg(test)]
mod tests;
