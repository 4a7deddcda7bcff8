//! SIGTERM / SIGINT handling.
//!
//! The signal unloads the engine, which aborts whatever operation is in
//! flight, then the server is asked to stop.

use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

pub struct ShutdownCoordinator {
    shutdown_tx: broadcast::Sender<()>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self { shutdown_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Resolve on SIGINT or SIGTERM and tell every subscriber
    pub async fn wait_for_signal(&self) -> anyhow::Result<()> {
        #[cfg(unix)]
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;

        #[cfg(unix)]
        let terminated = terminate.recv();

        #[cfg(not(unix))]
        let terminated = std::future::pending::<Option<()>>();

        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                info!("Received SIGINT, shutting down");
            }
            _ = terminated => info!("Received SIGTERM, shutting down"),
        }

        self.trigger();
        Ok(())
    }

    /// Tell every subscriber to shut down
    pub fn trigger(&self) {
        if self.shutdown_tx.send(()).is_err() {
            warn!("No task is listening for shutdown");
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
