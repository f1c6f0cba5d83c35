//! Shutdown coordination.

use crate::error::Result;
use crate::types::Event;
use std::sync::atomic::Ordering;

use super::UploadQueue;

impl UploadQueue {
    /// Gracefully shut down the queue
    ///
    /// This method performs a graceful shutdown sequence:
    /// 1. Stops accepting new uploads
    /// 2. Stops the reconciliation loop and any pending retry alarm
    /// 3. Interrupts running attempts; each persists its own outcome
    ///    (an interrupted upload is retried on the next start)
    /// 4. Waits for those attempts with the configured timeout
    ///
    /// Records left `Running` by an attempt that missed the timeout are picked
    /// up again by the startup pass of the next [`UploadQueue::new`].
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Initiating graceful shutdown");

        // 1. Stop accepting new uploads
        self.accepting_new.store(false, Ordering::SeqCst);
        tracing::info!("Stopped accepting new uploads");

        // 2-3. Stop the loop and signal active attempts
        let workers = self.orchestrator.stop().await;
        self.orchestrator.context().permits.close();
        tracing::info!(active = workers.len(), "Signaled shutdown to active uploads");

        // 4. Wait for active attempts to persist their final state
        let shutdown_timeout = self.config.queue.shutdown_timeout;
        let wait_result =
            tokio::time::timeout(shutdown_timeout, futures::future::join_all(workers)).await;

        match wait_result {
            Ok(results) => {
                let panicked = results.iter().filter(|r| r.is_err()).count();
                if panicked > 0 {
                    tracing::warn!(panicked, "Some upload workers ended abnormally");
                } else {
                    tracing::info!("All active uploads stopped gracefully");
                }
            }
            Err(_) => {
                tracing::warn!("Timeout waiting for uploads to stop, proceeding with shutdown");
            }
        }

        // 5. Emit shutdown event
        self.events.emit_shutdown();

        tracing::info!("Graceful shutdown complete");
        Ok(())
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    pub fn is_shutting_down(&self) -> bool {
        !self.accepting_new.load(Ordering::SeqCst)
    }
}
