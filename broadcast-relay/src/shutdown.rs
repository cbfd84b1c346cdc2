//! Process-wide shutdown coordination.

use std::{future::Future, sync::Arc};

use tokio::sync::watch;
use tracing::{info, warn};

/// Shared shutdown switch. Cloning is cheap; every clone flips the same
/// switch, and it can only be flipped once.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Returns `true` only for the call that actually started shutdown.
    pub fn trigger(&self) -> bool {
        self.tx.send_if_modified(|triggered| {
            if *triggered {
                false
            } else {
                *triggered = true;
                true
            }
        })
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
        }
    }
}

#[derive(Debug)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownListener {
    /// Resolves once shutdown has been triggered, immediately if it already
    /// was. Cancel safe.
    pub async fn wait(&mut self) {
        let _ = self.rx.wait_for(|triggered| *triggered).await;
    }
}

/// Installs SIGINT and SIGTERM handlers (ctrl-c off unix) and returns a
/// future that resolves on the first of them. Handlers are installed before
/// the future is polled, so a signal arriving early is not lost. Once
/// installed they stay installed, so a later signal cannot kill the process.
pub fn wait_for_signal() -> impl Future<Output = ()> + Send + 'static {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let signals = signal(SignalKind::interrupt())
            .and_then(|sigint| Ok((sigint, signal(SignalKind::terminate())?)));

        async move {
            let (mut sigint, mut sigterm) = match signals {
                Ok(signals) => signals,
                Err(err) => {
                    warn!(error = ?err, "failed to install signal handlers, falling back to ctrl-c");
                    wait_for_ctrl_c().await;
                    return;
                }
            };

            tokio::select! {
                _ = sigint.recv() => info!("received SIGINT, shutting down"),
                _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            }
        }
    }

    #[cfg(not(unix))]
    {
        wait_for_ctrl_c()
    }
}

async fn wait_for_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received ctrl-c, shutting down"),
        Err(err) => warn!(error = ?err, "failed to install ctrl-c handler"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn trigger_is_idempotent() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_triggered());

        assert!(shutdown.trigger());
        assert!(!shutdown.trigger());
        assert!(!shutdown.clone().trigger());
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn listeners_wake_on_trigger() {
        let shutdown = Shutdown::new();
        let mut listener = shutdown.subscribe();

        let waiter = tokio::spawn(async move { listener.wait().await });
        shutdown.trigger();

        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("listener should wake")
            .expect("waiter task");
    }

    #[tokio::test]
    async fn late_listener_sees_earlier_trigger() {
        let shutdown = Shutdown::new();
        shutdown.trigger();

        let mut listener = shutdown.subscribe();
        timeout(Duration::from_millis(100), listener.wait())
            .await
            .expect("already triggered");
    }
}
