use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// Lets a request handler take the server down when the store is unusable.
#[derive(Debug, Default)]
pub struct Shutdown {
    notify: Notify,
    fatal: AtomicBool,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger_fatal(&self) {
        self.fatal.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::SeqCst)
    }

    /// Resolves on a fatal trigger or a termination signal. Pass to
    /// `with_graceful_shutdown`.
    pub async fn signal(&self) {
        tokio::select! {
            _ = self.notify.notified() => {
                tracing::error!("Fatal store error, shutting down");
            }
            _ = terminated() => {}
        }
    }
}

/// Resolves on Ctrl-C, or on SIGTERM where there is one (how Knative and
/// Kubernetes stop a pod).
pub async fn terminated() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
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
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl-C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
