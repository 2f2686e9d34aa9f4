//! Graceful shutdown coordination.
//!
//! A [`ShutdownSignal`] is a sticky, process-wide stop flag. The first
//! [`ShutdownCause`] to arrive wins; everything waiting on
//! [`ShutdownSignal::notified`] wakes, including waiters created after the
//! fact.
//!
//! ```rust,ignore
//! let shutdown = ShutdownSignal::new();
//! let consumer = tokio::spawn(consumer.run(shutdown.notified()));
//!
//! let cause = shutdown.wait().await;
//! tokio::time::timeout(shutdown.timeout(), consumer).await;
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

/// Time allowed for in-flight deliveries to finish after the signal.
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Why the process is stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownCause {
    /// SIGINT / Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
    /// The queue consumer ended on its own
    ConsumerStopped,
}

#[derive(Clone)]
pub struct ShutdownSignal {
    state: Arc<watch::Sender<Option<ShutdownCause>>>,
    timeout: Duration,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_DRAIN_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let (state, _) = watch::channel(None);
        Self {
            state: Arc::new(state),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The cause recorded so far, if any.
    pub fn cause(&self) -> Option<ShutdownCause> {
        *self.state.borrow()
    }

    /// Record `cause` unless shutdown is already under way.
    pub fn trigger(&self, cause: ShutdownCause) {
        let first = self.state.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(cause);
            true
        });
        if first {
            info!(cause = ?cause, "Shutdown requested");
        }
    }

    /// Resolves once any cause has been recorded. Suitable for
    /// `axum::serve(..).with_graceful_shutdown` and [`QueueConsumer::run`].
    ///
    /// [`QueueConsumer::run`]: crate::broker::QueueConsumer::run
    pub fn notified(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut receiver = self.state.subscribe();
        async move {
            loop {
                let stopped = receiver.borrow_and_update().is_some();
                if stopped || receiver.changed().await.is_err() {
                    return;
                }
            }
        }
    }

    /// Wait for SIGINT, SIGTERM or a programmatic trigger and return the
    /// cause that won.
    pub async fn wait(&self) -> ShutdownCause {
        tokio::select! {
            cause = os_signal() => self.trigger(cause),
            _ = self.notified() => {}
        }
        self.cause().unwrap_or(ShutdownCause::Interrupt)
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// First termination signal delivered to the process. A handler that cannot
/// be installed leaves its branch pending.
async fn os_signal() -> ShutdownCause {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => ShutdownCause::Interrupt,
        _ = terminate => ShutdownCause::Terminate,
    }
}
