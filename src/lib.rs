//! # upload-queue
//!
//! Durable background queue for HTTP multipart uploads.
//!
//! ## Design Philosophy
//!
//! upload-queue is designed to be:
//! - **Crash-resilient** - Every upload lives in SQLite; a restart resumes where the last run stopped
//! - **Self-healing** - Transient failures back off and retry, network loss parks uploads until it returns
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Event-driven** - Consumers subscribe to events, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use upload_queue::{UploadQueue, Config};
//! use upload_queue::types::NewUpload;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::default();
//!     config.persistence.database_path = "./uploads.db".into();
//!
//!     let queue = UploadQueue::new(config).await?;
//!
//!     // Subscribe to events
//!     let mut events = queue.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     queue
//!         .enqueue(NewUpload::new("https://example.com/upload", "/data/photo.jpg"))
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Database persistence layer
pub mod db;
/// Error types
pub mod error;
/// Presentation of upload state
pub mod notifier;
/// Upload queue implementation (decomposed into focused submodules)
pub mod queue;
/// Retry classification and backoff timing
pub mod retry;
/// File reference resolution
pub mod source;
/// Host connectivity and wake locks
pub mod system;
/// HTTP transport
pub mod transport;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use db::Database;
pub use error::{DatabaseError, Error, Result, TransferError, UploadError};
pub use notifier::{BroadcastNotifier, FanoutNotifier, Notifier};
pub use queue::{Collaborators, UploadQueue};
pub use types::{Event, NewUpload, Status, TaskId, TaskQuery, TaskRecord, TaskView};

/// Helper function to run the queue with graceful signal handling.
///
/// Waits for a termination signal and then calls the queue's `shutdown()` method.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use upload_queue::{UploadQueue, Config, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let queue = UploadQueue::new(Config::default()).await?;
///
///     // Run with automatic signal handling
///     run_with_shutdown(queue).await?;
///
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(queue: UploadQueue) -> Result<()> {
    wait_for_signal().await;
    queue.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
