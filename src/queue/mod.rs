//! The upload queue handle and the machinery behind it
//!
//! [`UploadQueue`] is the public entry point. Control operations only write
//! the store and wake the reconciliation loop; the loop (see `orchestrator`)
//! decides what runs, and workers (see `worker`) perform single attempts.

mod control;
mod controller;
mod lifecycle;
mod orchestrator;
mod worker;

use crate::config::Config;
use crate::db::Database;
use crate::error::Result;
use crate::notifier::{BroadcastNotifier, FanoutNotifier, Notifier};
use crate::source::{FileResolver, LocalFileResolver};
use crate::system::{Connectivity, NoopWakeLock, StaticConnectivity, WakeLock};
use crate::transport::{ReqwestTransport, Transport};
use crate::types::Event;
use orchestrator::{Orchestrator, Trigger};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tokio_stream::Stream;
use worker::WorkerContext;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

/// Pluggable host integrations
///
/// [`Collaborators::defaults`] gives a production setup for an always-online
/// host: reqwest over HTTP, local files, no wake lock. Replace individual
/// fields to integrate with the embedding application.
pub struct Collaborators {
    /// Performs the HTTP requests
    pub transport: Arc<dyn Transport>,
    /// Opens file references
    pub resolver: Arc<dyn FileResolver>,
    /// Reports the active network
    pub connectivity: Arc<dyn Connectivity>,
    /// Keeps the host awake during transfers
    pub wake_lock: Arc<dyn WakeLock>,
    /// Extra presentation target, called alongside the built-in event channel
    pub notifier: Option<Arc<dyn Notifier>>,
}

impl Collaborators {
    /// Production collaborators for `config`
    pub fn defaults(config: &Config) -> Result<Self> {
        Ok(Self {
            transport: Arc::new(ReqwestTransport::new(&config.http)?),
            resolver: Arc::new(LocalFileResolver),
            connectivity: Arc::new(StaticConnectivity::default()),
            wake_lock: Arc::new(NoopWakeLock),
            notifier: None,
        })
    }
}

/// Main upload queue instance (cloneable - all fields are Arc-wrapped)
#[derive(Clone)]
pub struct UploadQueue {
    /// Database instance for persistence
    /// Public for integration tests to inspect stored records
    pub db: Arc<Database>,
    /// Configuration (wrapped in Arc for sharing across tasks)
    pub(crate) config: Arc<Config>,
    /// Reconciliation loop handle
    pub(crate) orchestrator: Orchestrator,
    /// Built-in notifier backing [`subscribe`](Self::subscribe)
    pub(crate) events: Arc<BroadcastNotifier>,
    /// Flag to indicate whether new uploads are accepted (set to false during shutdown)
    pub(crate) accepting_new: Arc<AtomicBool>,
}

impl UploadQueue {
    /// Create a queue with the default collaborators
    ///
    /// This will:
    /// - Validate the configuration
    /// - Open or create the SQLite database and run migrations
    /// - Start a reconciliation pass that resumes uploads left over from a
    ///   previous run
    pub async fn new(config: Config) -> Result<Self> {
        let collaborators = Collaborators::defaults(&config)?;
        Self::with_collaborators(config, collaborators).await
    }

    /// Create a queue with custom host integrations
    pub async fn with_collaborators(config: Config, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let db = Arc::new(Database::new(&config.persistence.database_path).await?);
        let config = Arc::new(config);

        let events = Arc::new(BroadcastNotifier::default());
        let notifier: Arc<dyn Notifier> = match collaborators.notifier {
            Some(extra) => Arc::new(FanoutNotifier::new(vec![
                events.clone() as Arc<dyn Notifier>,
                extra,
            ])),
            None => events.clone(),
        };

        let permits = Arc::new(tokio::sync::Semaphore::new(
            config.queue.max_concurrent_uploads,
        ));

        let ctx = Arc::new(WorkerContext {
            db: db.clone(),
            config: config.clone(),
            transport: collaborators.transport,
            resolver: collaborators.resolver,
            connectivity: collaborators.connectivity,
            wake_lock: collaborators.wake_lock,
            notifier,
            permits,
        });

        let queue = Self {
            db,
            config,
            orchestrator: Orchestrator::new(ctx),
            events,
            accepting_new: Arc::new(AtomicBool::new(true)),
        };

        tracing::info!(
            database = %queue.config.persistence.database_path.display(),
            max_concurrent_uploads = queue.config.queue.max_concurrent_uploads,
            "Upload queue started"
        );

        // Pick up whatever a previous run left behind
        queue.orchestrator.wake(Trigger::Startup);

        Ok(queue)
    }

    /// Configuration in use
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Subscribe to upload events
    ///
    /// Multiple subscribers are supported. Each subscriber receives all events independently.
    /// Events are buffered, but if a subscriber falls behind by more than 1000 events,
    /// it will receive a `RecvError::Lagged` error.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Upload events as a stream, skipping any a slow consumer missed
    pub fn events(&self) -> impl Stream<Item = Event> + Send + 'static {
        self.events.stream()
    }

    /// Last reported transfer rate of a running upload
    pub fn transfer_rate(&self, id: crate::types::TaskId) -> Option<u64> {
        self.events.rate(id)
    }
}
