//! Operator interruption (SIGINT / SIGTERM).
//!
//! A signal cancels the shared token. The deposit loop checks it between
//! assets and races it against the in-flight transfer, so an interrupted
//! asset never gets a results row.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Shutdown coordinator
#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled once a shutdown signal arrives.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Waits for SIGINT or SIGTERM, then cancels the token.
    ///
    /// Returns early without cancelling if the handlers cannot be installed.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C), stopping after the current step");
            }
            _ = terminate => {
                info!("Received SIGTERM, stopping after the current step");
            }
            _ = self.token.cancelled() => return,
        }

        self.token.cancel();
    }

    /// Cancels the token without a signal.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }
}
