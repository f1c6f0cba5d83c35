//! Shared test helpers for creating UploadQueue instances in tests.

use crate::config::Config;
use crate::db::{Database, TaskUpdate};
use crate::error::TransferError;
use crate::queue::{Collaborators, UploadQueue};
use crate::source::LocalFileResolver;
use crate::system::{StaticConnectivity, WakeGuard, WakeLock};
use crate::transport::{ProgressSink, Transport, TransportResponse, UploadRequest};
use crate::types::{Event, NewUpload, Status, TaskId};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::sync::{Notify, broadcast};

/// What the scripted transport does for one request
#[derive(Debug, Clone)]
pub(crate) enum Step {
    /// Read the whole body, then answer with this status
    Respond {
        status: u16,
        body: &'static str,
        retry_after: Option<&'static str>,
    },
    /// Answer without reading anything
    RespondEarly { status: u16 },
    /// Fail without reading anything
    Fail(TransferError),
    /// Read the whole body, then report more bytes than were sent
    OverReport { extra: u64, status: u16 },
    /// Read `bytes`, then keep reporting progress until dropped
    Stall { bytes: usize },
    /// Read the whole body, mark the upload deleted in the store, then answer
    DeleteThenRespond { status: u16 },
}

impl Step {
    pub(crate) fn ok() -> Self {
        Step::Respond {
            status: 200,
            body: "ok",
            retry_after: None,
        }
    }
}

/// Transport that plays back a script; answers 200 once the script is exhausted
pub(crate) struct ScriptedTransport {
    steps: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
    running: AtomicUsize,
    max_running: AtomicUsize,
    /// Notified whenever a stalled request is in flight
    pub(crate) stalled: Notify,
    /// Multipart field names and file names seen, in order
    pub(crate) seen: Mutex<Vec<(String, String)>>,
    /// Store the queue writes to, for steps that act like a concurrent caller
    db: Mutex<Option<Arc<Database>>>,
}

impl ScriptedTransport {
    pub(crate) fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            calls: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            stalled: Notify::new(),
            seen: Mutex::new(Vec::new()),
            db: Mutex::new(None),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> Step {
        self.steps.lock().unwrap().pop_front().unwrap_or_else(Step::ok)
    }
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn drain(request: &mut UploadRequest, progress: &ProgressSink, limit: Option<usize>) -> u64 {
    let mut sent = 0u64;
    let mut buf = [0u8; 4];
    loop {
        if let Some(limit) = limit
            && sent as usize >= limit
        {
            break;
        }
        let n = request.source.reader.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        sent += n as u64;
        progress.report(sent);
    }
    sent
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn upload(
        &self,
        mut request: UploadRequest,
        progress: ProgressSink,
    ) -> Result<TransportResponse, TransferError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now_running, Ordering::SeqCst);
        let _running = RunningGuard(&self.running);

        self.seen
            .lock()
            .unwrap()
            .push((request.field_name.clone(), request.source.file_name.clone()));

        let response = |status: u16, body: &str, retry_after: Option<&str>| TransportResponse {
            status,
            reason: String::new(),
            body: body.to_string(),
            retry_after: retry_after.map(str::to_string),
        };

        match self.next_step() {
            Step::Respond {
                status,
                body,
                retry_after,
            } => {
                drain(&mut request, &progress, None).await;
                Ok(response(status, body, retry_after))
            }
            Step::RespondEarly { status } => Ok(response(status, "", None)),
            Step::Fail(e) => Err(e),
            Step::OverReport { extra, status } => {
                let sent = drain(&mut request, &progress, None).await;
                progress.report(sent + extra);
                Ok(response(status, "", None))
            }
            Step::DeleteThenRespond { status } => {
                drain(&mut request, &progress, None).await;
                let db = self.db.lock().unwrap().clone().unwrap();
                db.update_task(
                    request.id,
                    &TaskUpdate {
                        deleted: Some(true),
                        ..TaskUpdate::default()
                    },
                )
                .await
                .unwrap();
                Ok(response(status, "stored", None))
            }
            Step::Stall { bytes } => {
                let sent = drain(&mut request, &progress, Some(bytes)).await;
                self.stalled.notify_one();
                loop {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    progress.report(sent);
                }
            }
        }
    }
}

/// Wake lock that counts how many guards are held
#[derive(Default)]
pub(crate) struct CountingWakeLock {
    pub(crate) held: Arc<AtomicUsize>,
    pub(crate) acquired: AtomicUsize,
}

impl WakeLock for CountingWakeLock {
    fn acquire(&self, _id: TaskId) -> WakeGuard {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        self.held.fetch_add(1, Ordering::SeqCst);
        let held = Arc::clone(&self.held);
        WakeGuard::new(move || {
            held.fetch_sub(1, Ordering::SeqCst);
        })
    }
}

/// A queue wired to test collaborators, plus handles to drive them
pub(crate) struct TestQueue {
    pub(crate) queue: UploadQueue,
    pub(crate) transport: Arc<ScriptedTransport>,
    pub(crate) connectivity: Arc<StaticConnectivity>,
    pub(crate) wake_lock: Arc<CountingWakeLock>,
    /// Keeps the database and upload files alive
    pub(crate) dir: TempDir,
}

impl TestQueue {
    /// Write a file of `len` bytes into the temp dir and return its path
    pub(crate) fn file(&self, name: &str, len: usize) -> String {
        write_file(self.dir.path(), name, len)
    }

    /// An upload of a fresh `len`-byte file
    pub(crate) fn upload(&self, name: &str, len: usize) -> NewUpload {
        NewUpload::new("https://uploads.example.com/files", self.file(name, len))
    }
}

pub(crate) fn write_file(dir: &Path, name: &str, len: usize) -> String {
    let path = dir.join(name);
    let content: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    std::fs::write(&path, content).unwrap();
    path.to_str().unwrap().to_string()
}

/// Config with fast retries and no jitter, rooted in `dir`
pub(crate) fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.persistence.database_path = dir.join("uploads.db");
    config.queue.max_concurrent_uploads = 2;
    config.queue.shutdown_timeout = Duration::from_secs(5);
    config.retry.first_delay = Duration::from_millis(20);
    config.retry.jitter = false;
    config.progress.min_step_bytes = 0;
    config.progress.min_interval = Duration::ZERO;
    config
}

/// Helper to create a test UploadQueue with a scripted transport.
/// The returned TestQueue owns the tempdir, which must be kept alive.
pub(crate) async fn create_test_queue(steps: Vec<Step>) -> TestQueue {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    create_test_queue_with(dir, config, steps).await
}

pub(crate) async fn create_test_queue_with(dir: TempDir, config: Config, steps: Vec<Step>) -> TestQueue {
    let transport = Arc::new(ScriptedTransport::new(steps));
    let connectivity = Arc::new(StaticConnectivity::default());
    let wake_lock = Arc::new(CountingWakeLock::default());

    let queue = UploadQueue::with_collaborators(
        config,
        Collaborators {
            transport: transport.clone(),
            resolver: Arc::new(LocalFileResolver),
            connectivity: connectivity.clone(),
            wake_lock: wake_lock.clone(),
            notifier: None,
        },
    )
    .await
    .unwrap();
    *transport.db.lock().unwrap() = Some(queue.db.clone());

    TestQueue {
        queue,
        transport,
        connectivity,
        wake_lock,
        dir,
    }
}

/// Next `AttemptFinished` for `id`, failing the test after 10 seconds
pub(crate) async fn next_attempt(events: &mut broadcast::Receiver<Event>, id: TaskId) -> (Status, u32) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(Event::AttemptFinished {
                    id: finished,
                    status,
                    num_failed,
                }) if finished == id => return (status, num_failed),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for an attempt to finish")
}

/// Poll until `check` holds for the stored record, failing after 10 seconds
pub(crate) async fn wait_for<F>(queue: &UploadQueue, id: TaskId, check: F)
where
    F: Fn(Option<&crate::types::TaskRecord>) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let record = queue.db.get_task(id).await.unwrap();
            if check(record.as_ref()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for the upload to reach the expected state")
}
