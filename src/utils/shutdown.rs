//! Graceful shutdown coordination.
//!
//! A [`ShutdownSignal`] is triggered once, by SIGTERM/SIGINT or by hand, and
//! every clone observes it: the HTTP server stops accepting connections, the
//! consumer drains, and the broker session closes.

use tokio::sync::watch;
use tracing::{info, warn};

/// A signal for coordinating graceful shutdown across components.
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: watch::Sender<bool>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self { sender }
    }

    /// Notify every holder of this signal.
    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolves once the signal has been triggered.
    pub async fn recv(&self) {
        let mut rx = self.sender.subscribe();
        let _ = rx.wait_for(|triggered| *triggered).await;
    }

    /// Wait for SIGTERM or SIGINT, then trigger.
    pub async fn listen_for_os_signals(&self) {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, starting graceful shutdown"),
            _ = terminate => info!("Received SIGTERM, starting graceful shutdown"),
            _ = self.recv() => return,
        }
        self.trigger();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_reaches_all_clones() {
        let signal = ShutdownSignal::new();
        let clone = signal.clone();
        let waiter = tokio::spawn(async move { clone.recv().await });

        assert!(!signal.is_triggered());
        signal.trigger();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("clone never saw the signal")
            .unwrap();
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn test_recv_after_trigger_returns_immediately() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        tokio::time::timeout(Duration::from_millis(100), signal.recv())
            .await
            .expect("already triggered");
    }

    #[tokio::test]
    async fn test_os_listener_returns_on_manual_trigger() {
        let signal = ShutdownSignal::new();
        let listener = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.listen_for_os_signals().await })
        };
        signal.trigger();
        tokio::time::timeout(Duration::from_secs(1), listener)
            .await
            .expect("listener should stop")
            .unwrap();
    }
}
