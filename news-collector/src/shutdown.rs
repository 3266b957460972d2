//! The single cancellation signal shared by every pipeline task.

use std::fmt;
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why the pipeline was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Signal,
    ErrorThreshold,
    WriteFailure,
    Requested,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            ShutdownReason::Signal => "os signal",
            ShutdownReason::ErrorThreshold => "error threshold exceeded",
            ShutdownReason::WriteFailure => "storage write failures",
            ShutdownReason::Requested => "requested",
        };
        f.write_str(reason)
    }
}

/// Owns the shared cancellation token. Cloning shares the same signal.
#[derive(Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
    reason: Arc<OnceLock<ShutdownReason>>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token handed to tasks that only need to observe the signal.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Fires the signal. Only the first call has an effect; its reason is kept.
    pub fn trigger(&self, reason: ShutdownReason) {
        if self.reason.set(reason).is_ok() {
            info!(%reason, "Shutting down pipeline");
            self.token.cancel();
        } else {
            debug!(%reason, "Shutdown already in progress");
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.get().copied()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Fires the signal on SIGINT, SIGTERM, SIGQUIT or SIGHUP. The listener
    /// ends quietly if the pipeline stops first.
    pub fn listen_for_signals(&self) -> tokio::task::JoinHandle<()> {
        let shutdown = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                received = shutdown_signal() => {
                    if received {
                        shutdown.trigger(ShutdownReason::Signal);
                    }
                }
            }
        })
    }
}

/// Waits for a termination signal. Returns `false` if no handler could be
/// installed.
#[cfg(unix)]
async fn shutdown_signal() -> bool {
    use tokio::signal::unix::{signal, SignalKind};

    let handlers = (|| {
        Ok::<_, std::io::Error>((
            signal(SignalKind::interrupt())?,
            signal(SignalKind::terminate())?,
            signal(SignalKind::quit())?,
            signal(SignalKind::hangup())?,
        ))
    })();
    let (mut sigint, mut sigterm, mut sigquit, mut sighup) = match handlers {
        Ok(handlers) => handlers,
        Err(e) => {
            warn!("Failed to install signal handlers: {}", e);
            return false;
        }
    };

    tokio::select! {
        _ = sigint.recv() => info!(signal = "SIGINT", "Signal received"),
        _ = sigterm.recv() => info!(signal = "SIGTERM", "Signal received"),
        _ = sigquit.recv() => info!(signal = "SIGQUIT", "Signal received"),
        _ = sighup.recv() => info!(signal = "SIGHUP", "Signal received"),
    }
    true
}

#[cfg(not(unix))]
async fn shutdown_signal() -> bool {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!(signal = "ctrl-c", "Signal received");
            true
        }
        Err(e) => {
            warn!("Failed to listen for ctrl-c: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn clones_share_the_signal() {
        let shutdown = Shutdown::new();
        let token = shutdown.token();
        let clone = shutdown.clone();

        assert!(!token.is_cancelled());
        clone.trigger(ShutdownReason::Requested);

        assert!(token.is_cancelled());
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn first_reason_wins() {
        let shutdown = Shutdown::new();
        shutdown.trigger(ShutdownReason::ErrorThreshold);
        shutdown.trigger(ShutdownReason::WriteFailure);
        shutdown.trigger(ShutdownReason::Signal);

        assert_eq!(shutdown.reason(), Some(ShutdownReason::ErrorThreshold));
    }

    #[tokio::test]
    async fn waiters_wake_promptly() {
        let shutdown = Shutdown::new();
        let waiter = shutdown.clone();

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = waiter.cancelled() => "cancelled",
                _ = tokio::time::sleep(Duration::from_secs(10)) => "timeout",
            }
        });

        shutdown.trigger(ShutdownReason::Requested);

        let result = tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .expect("task should complete quickly")
            .expect("task should not panic");
        assert_eq!(result, "cancelled");
    }

    #[tokio::test]
    async fn signal_listener_exits_with_the_pipeline() {
        let shutdown = Shutdown::new();
        let listener = shutdown.listen_for_signals();
        shutdown.trigger(ShutdownReason::Requested);

        tokio::time::timeout(Duration::from_secs(1), listener)
            .await
            .expect("listener should stop")
            .expect("listener should not panic");
        assert_eq!(shutdown.reason(), Some(ShutdownReason::Requested));
    }
}
