//! Per-upload state kept by the orchestrator between passes
//!
//! A [`TaskController`] mirrors the last stored record of one upload and owns
//! the handle of its worker, if one is running. It answers the two questions a
//! reconciliation pass asks: is this upload ready to start, and when should
//! the loop look at it again.

use super::orchestrator::Orchestrator;
use super::worker;
use crate::config::RetryConfig;
use crate::db::TaskUpdate;
use crate::error::{Result, TransferError};
use crate::retry::restart_time;
use crate::types::{Control, NetworkInfo, NetworkState, Status, TaskId, TaskRecord, TaskView};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Why a running attempt was asked to stop
///
/// When several stops race, the strongest one wins: a cancel always
/// overrides a pause or a shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub(crate) enum StopReason {
    Paused = 1,
    Shutdown = 2,
    Canceled = 3,
}

impl StopReason {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(StopReason::Paused),
            2 => Some(StopReason::Shutdown),
            3 => Some(StopReason::Canceled),
            _ => None,
        }
    }

    /// The transfer error an attempt stopped for this reason ends with
    pub(crate) fn into_error(self) -> TransferError {
        match self {
            StopReason::Shutdown => TransferError::Interrupted,
            StopReason::Paused | StopReason::Canceled => TransferError::Canceled,
        }
    }
}

/// Stop flag shared between a controller and the worker of one attempt
#[derive(Debug, Clone, Default)]
pub(crate) struct TaskSignal {
    token: CancellationToken,
    reason: Arc<AtomicU8>,
}

impl TaskSignal {
    pub(crate) fn stop(&self, reason: StopReason) {
        self.reason.fetch_max(reason as u8, Ordering::SeqCst);
        self.token.cancel();
    }

    pub(crate) fn reason(&self) -> Option<StopReason> {
        StopReason::from_u8(self.reason.load(Ordering::SeqCst))
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once [`stop`](Self::stop) has been called
    pub(crate) async fn stopped(&self) {
        self.token.cancelled().await
    }
}

/// Whether `record` may start an attempt right now
pub(crate) fn is_ready(
    record: &TaskRecord,
    now_ms: i64,
    network: &NetworkInfo,
    retry: &RetryConfig,
) -> bool {
    if record.deleted || record.control == Control::Paused {
        return false;
    }
    match record.status {
        Status::Pending | Status::Running => true,
        Status::WaitingForNetwork => network.connected,
        Status::WaitingForWifi => record.check_network(network) == NetworkState::Ok,
        Status::WaitingToRetry => now_ms >= restart_time(record, now_ms, retry),
        Status::Success
        | Status::Canceled
        | Status::FileNotFound
        | Status::CannotResume
        | Status::UnknownError => false,
    }
}

/// How long until `record` next needs attention
///
/// `None` for terminal uploads, zero for anything not waiting on a timer.
pub(crate) fn next_action(record: &TaskRecord, now_ms: i64, retry: &RetryConfig) -> Option<Duration> {
    if record.status.is_terminal() {
        return None;
    }
    if record.status != Status::WaitingToRetry {
        return Some(Duration::ZERO);
    }
    let wait_ms = restart_time(record, now_ms, retry).saturating_sub(now_ms).max(0);
    Some(Duration::from_millis(wait_ms as u64))
}

struct ControllerState {
    record: TaskRecord,
    signal: TaskSignal,
    worker: Option<JoinHandle<()>>,
    running: bool,
}

impl ControllerState {
    fn is_active(&self) -> bool {
        self.running
            && self
                .worker
                .as_ref()
                .is_some_and(|handle| !handle.is_finished())
    }
}

/// In-memory companion of one tracked upload
pub(crate) struct TaskController {
    id: TaskId,
    state: Mutex<ControllerState>,
}

impl TaskController {
    pub(crate) fn new(record: TaskRecord) -> Self {
        Self {
            id: record.id,
            state: Mutex::new(ControllerState {
                record,
                signal: TaskSignal::default(),
                worker: None,
                running: false,
            }),
        }
    }

    /// Replace the mirrored record with a fresh read from the store
    ///
    /// A running attempt is told to stop if the new record is deleted or paused.
    pub(crate) async fn refresh(&self, record: TaskRecord) {
        let mut state = self.state.lock().await;
        if state.is_active() {
            if record.deleted {
                state.signal.stop(StopReason::Canceled);
            } else if record.control == Control::Paused {
                state.signal.stop(StopReason::Paused);
            }
        }
        state.record = record;
    }

    pub(crate) async fn is_active(&self) -> bool {
        self.state.lock().await.is_active()
    }

    pub(crate) async fn next_action(&self, now_ms: i64, retry: &RetryConfig) -> Option<Duration> {
        let state = self.state.lock().await;
        next_action(&state.record, now_ms, retry)
    }

    /// Snapshot for the notifier; `None` once the upload is marked deleted
    pub(crate) async fn view(&self) -> Option<TaskView> {
        let state = self.state.lock().await;
        (!state.record.deleted).then(|| TaskView::from(&state.record))
    }

    /// Start an attempt if the upload is ready and no worker is running
    ///
    /// Returns whether the upload is ready, whether or not it was started by
    /// this call.
    pub(crate) async fn start_if_ready(
        self: &Arc<Self>,
        orchestrator: &Orchestrator,
        now_ms: i64,
        network: &NetworkInfo,
    ) -> Result<bool> {
        let ctx = orchestrator.context();
        let mut state = self.state.lock().await;

        if !is_ready(&state.record, now_ms, network, &ctx.config.retry) {
            return Ok(false);
        }
        if state.is_active() {
            return Ok(true);
        }

        if state.record.status != Status::Running {
            ctx.db
                .update_task(self.id, &TaskUpdate::status(Status::Running))
                .await?;
            state.record.status = Status::Running;
        }

        let signal = TaskSignal::default();
        state.signal = signal.clone();
        state.running = true;

        let id = self.id;
        let controller = Arc::clone(self);
        let orchestrator = orchestrator.clone();
        tracing::debug!(upload_id = id.0, "Submitting upload attempt");

        state.worker = Some(tokio::spawn(async move {
            let ctx = orchestrator.context();
            let latest = match Arc::clone(&ctx.permits).acquire_owned().await {
                Ok(_permit) => match worker::run_attempt(&ctx, id, &signal).await {
                    Ok(latest) => latest,
                    Err(e) => {
                        tracing::error!(upload_id = id.0, error = %e, "Upload attempt failed");
                        None
                    }
                },
                Err(_) => {
                    tracing::debug!(upload_id = id.0, "Worker pool closed, attempt dropped");
                    None
                }
            };
            controller.worker_finished(latest).await;
            orchestrator.wake(super::orchestrator::Trigger::WorkerFinished);
        }));

        Ok(true)
    }

    async fn worker_finished(&self, latest: Option<TaskRecord>) {
        let mut state = self.state.lock().await;
        state.running = false;
        if let Some(record) = latest {
            state.record = record;
        }
    }

    /// The upload disappeared from the store scan
    ///
    /// An in-flight attempt is told to stop; its final write will find no row.
    pub(crate) async fn forget(&self) {
        let mut state = self.state.lock().await;
        if state.record.status == Status::Running {
            state.record.status = Status::Canceled;
        }
        if state.is_active() {
            state.signal.stop(StopReason::Canceled);
        }
    }

    /// Ask a running attempt to stop and hand back its handle for joining
    pub(crate) async fn stop(&self, reason: StopReason) -> Option<JoinHandle<()>> {
        let mut state = self.state.lock().await;
        if state.is_active() {
            state.signal.stop(reason);
        }
        state.worker.take()
    }
}
