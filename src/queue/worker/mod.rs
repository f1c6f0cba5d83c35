//! One upload attempt, from reading the record to persisting its outcome

mod classify;
mod progress;

use self::classify::{AttemptFacts, Verdict, classify, retry_hint};
use self::progress::{ProgressThrottle, RateEstimator};
use super::controller::{StopReason, TaskSignal};
use crate::config::Config;
use crate::db::{Database, TaskUpdate};
use crate::error::{Result, TransferError};
use crate::notifier::Notifier;
use crate::source::FileResolver;
use crate::system::{Connectivity, WakeLock};
use crate::transport::{ProgressSink, Transport, TransportResponse, UploadRequest, validate_target_url};
use crate::types::{NetworkState, Status, TaskId, TaskRecord, TaskView, Visibility};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;

/// Everything a worker shares with the rest of the queue
pub(crate) struct WorkerContext {
    pub(crate) db: Arc<Database>,
    pub(crate) config: Arc<Config>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) resolver: Arc<dyn FileResolver>,
    pub(crate) connectivity: Arc<dyn Connectivity>,
    pub(crate) wake_lock: Arc<dyn WakeLock>,
    pub(crate) notifier: Arc<dyn Notifier>,
    /// Bounds the number of attempts transferring at once
    pub(crate) permits: Arc<Semaphore>,
}

/// Run one attempt of upload `id`
///
/// Returns the record as stored after the attempt, or `None` if it vanished.
/// Attempts for uploads that already succeeded, or that are no longer
/// `Running`, do nothing.
pub(crate) async fn run_attempt(
    ctx: &WorkerContext,
    id: TaskId,
    signal: &TaskSignal,
) -> Result<Option<TaskRecord>> {
    let Some(record) = ctx.db.get_task(id).await? else {
        tracing::debug!(upload_id = id.0, "Upload vanished before its attempt");
        return Ok(None);
    };

    if record.status == Status::Success {
        tracing::debug!(upload_id = id.0, "Upload already succeeded, skipping attempt");
        return Ok(Some(record));
    }
    if record.status != Status::Running && !record.deleted && !signal.is_stopped() {
        tracing::debug!(
            upload_id = id.0,
            status = %record.status,
            "Upload no longer running, skipping stale attempt"
        );
        return Ok(Some(record));
    }
    if signal.reason() == Some(StopReason::Shutdown) && !record.deleted {
        // Never started; the next startup pass picks it up as it is
        tracing::debug!(upload_id = id.0, "Shutdown before the attempt started");
        return Ok(Some(record));
    }

    let _wake = ctx.wake_lock.acquire(id);
    let baseline = ctx.connectivity.active_network();
    let mut attempt = Attempt::new(ctx, record, signal.clone());

    let outcome = if attempt.record.deleted {
        Err(TransferError::Canceled)
    } else if let Some(reason) = signal.reason() {
        Err(reason.into_error())
    } else {
        attempt.execute().await
    };

    // A cancel written while the request was in flight wins over its outcome
    if signal.reason() != Some(StopReason::Canceled) && attempt.deleted_in_store().await? {
        signal.stop(StopReason::Canceled);
    }

    let facts = AttemptFacts {
        num_failed: attempt.record.num_failed,
        made_progress: attempt.made_progress,
        baseline,
        current: ctx.connectivity.active_network(),
    };
    let verdict = classify(&outcome, signal.reason(), &facts, &ctx.config.retry);
    attempt.finish(verdict).await?;

    ctx.db.get_task(id).await
}

struct Attempt<'a> {
    ctx: &'a WorkerContext,
    record: TaskRecord,
    signal: TaskSignal,
    throttle: ProgressThrottle,
    rate: RateEstimator,
    made_progress: bool,
}

impl<'a> Attempt<'a> {
    fn new(ctx: &'a WorkerContext, record: TaskRecord, signal: TaskSignal) -> Self {
        let now = Instant::now();
        let progress = &ctx.config.progress;
        Self {
            throttle: ProgressThrottle::new(progress, record.current_bytes, now),
            rate: RateEstimator::new(progress.rate_sample_interval, record.current_bytes, now),
            ctx,
            record,
            signal,
            made_progress: false,
        }
    }

    fn id(&self) -> TaskId {
        self.record.id
    }

    /// Best-effort write during the transfer; the final write reports errors
    async fn persist(&self, update: TaskUpdate) {
        if let Err(e) = self.ctx.db.update_task(self.id(), &update).await {
            tracing::warn!(upload_id = self.id().0, error = %e, "Failed to persist upload progress");
        }
    }

    /// Whether the stored record has been marked deleted or removed
    async fn deleted_in_store(&self) -> Result<bool> {
        let latest = self.ctx.db.get_task(self.id()).await?;
        Ok(latest.is_none_or(|record| record.deleted))
    }

    async fn execute(&mut self) -> std::result::Result<TransportResponse, TransferError> {
        let url = validate_target_url(&self.record.target_url)?;

        let network = self.ctx.connectivity.active_network();
        let state = self.record.check_network(&network);
        if state != NetworkState::Ok {
            return Err(TransferError::NetworkUnavailable(state));
        }

        let source = self.ctx.resolver.open(&self.record.file_reference).await?;
        let total_bytes = source
            .length
            .and_then(|length| i64::try_from(length).ok())
            .unwrap_or(-1);
        self.record.total_bytes = total_bytes;
        self.record.current_bytes = 0;
        self.persist(TaskUpdate {
            total_bytes: Some(total_bytes),
            current_bytes: Some(0),
            ..TaskUpdate::default()
        })
        .await;

        let now = Instant::now();
        self.throttle = ProgressThrottle::new(&self.ctx.config.progress, 0, now);
        self.rate = RateEstimator::new(self.ctx.config.progress.rate_sample_interval, 0, now);

        let http = &self.ctx.config.http;
        let request = UploadRequest {
            id: self.id(),
            url,
            headers: self.record.request_headers.clone(),
            form_fields: self.record.form_fields.clone(),
            field_name: self
                .record
                .field_name
                .clone()
                .unwrap_or_else(|| http.default_field_name.clone()),
            mime_type: self
                .record
                .mime_type
                .clone()
                .unwrap_or_else(|| http.default_mime_type.clone()),
            user_agent: self
                .record
                .user_agent
                .clone()
                .unwrap_or_else(|| http.user_agent.clone()),
            source,
        };

        tracing::info!(
            upload_id = self.id().0,
            name = %self.record.display_name(),
            total_bytes,
            attempt = self.record.num_failed + 1,
            "Starting upload attempt"
        );

        let (sink, mut progress) = ProgressSink::channel();
        let transport = Arc::clone(&self.ctx.transport);
        let signal = self.signal.clone();
        let transfer = transport.upload(request, sink);
        tokio::pin!(transfer);
        let mut progress_open = true;

        loop {
            tokio::select! {
                result = &mut transfer => {
                    // The sink is gone by now; pick up its last report
                    let sent = *progress.borrow_and_update();
                    if sent > 0 {
                        self.on_progress(sent).await;
                    }
                    return result;
                }
                changed = progress.changed(), if progress_open => {
                    if changed.is_err() {
                        progress_open = false;
                        continue;
                    }
                    let sent = *progress.borrow_and_update();
                    self.on_progress(sent).await;
                    if let Some(reason) = signal.reason() {
                        return Err(reason.into_error());
                    }
                }
                _ = signal.stopped() => {
                    return Err(signal
                        .reason()
                        .map(|reason| reason.into_error())
                        .unwrap_or(TransferError::Canceled));
                }
            }
        }
    }

    async fn on_progress(&mut self, sent: u64) {
        let mut current = i64::try_from(sent).unwrap_or(i64::MAX);
        if self.record.total_bytes >= 0 {
            current = current.min(self.record.total_bytes);
        }
        self.record.current_bytes = current;
        self.made_progress |= current > 0;

        let now = Instant::now();
        if let Some(rate) = self.rate.sample(current, now) {
            self.ctx.notifier.report_rate(self.id(), rate);
        }
        if self.throttle.should_persist(current, now) {
            self.persist(TaskUpdate {
                current_bytes: Some(current),
                ..TaskUpdate::default()
            })
            .await;
            self.throttle.mark(current, now);

            match self.deleted_in_store().await {
                Ok(true) => self.signal.stop(StopReason::Canceled),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(upload_id = self.id().0, error = %e, "Failed to re-read upload during transfer")
                }
            }
        }
    }

    /// Persist the verdict and tell the notifier
    async fn finish(mut self, verdict: Verdict) -> Result<()> {
        let id = self.id();
        let hint = retry_hint(&verdict);
        let record = &mut self.record;

        let mut update = TaskUpdate {
            status: Some(verdict.status),
            num_failed: Some(verdict.num_failed),
            retry_after_seconds: Some(verdict.retry_after_seconds),
            error_message: Some(verdict.error_message.clone()),
            ..TaskUpdate::default()
        };

        match verdict.status {
            Status::Success => {
                if record.total_bytes < 0 {
                    record.total_bytes = record.current_bytes;
                } else {
                    record.current_bytes = record.total_bytes;
                }
                update.server_response = Some(verdict.server_response.clone());
            }
            Status::Pending => record.current_bytes = 0,
            _ => {}
        }
        update.total_bytes = Some(record.total_bytes);
        update.current_bytes = Some(record.current_bytes);

        record.status = verdict.status;
        record.num_failed = verdict.num_failed;
        record.retry_after_seconds = verdict.retry_after_seconds;
        record.error_message = verdict.error_message.clone();

        if verdict.status.is_terminal() && record.visibility == Visibility::Visible {
            record.visibility = Visibility::VisibleNotifyCompleted;
            update.visibility = Some(Visibility::VisibleNotifyCompleted);
        }

        self.ctx.db.update_task(id, &update).await?;

        match verdict.status {
            Status::Success => tracing::info!(
                upload_id = id.0,
                bytes = record.current_bytes,
                "Upload completed"
            ),
            Status::Pending => tracing::info!(upload_id = id.0, "Upload paused"),
            Status::Canceled => tracing::info!(upload_id = id.0, "Upload canceled"),
            Status::WaitingToRetry | Status::WaitingForNetwork | Status::WaitingForWifi => {
                tracing::warn!(
                    upload_id = id.0,
                    status = %verdict.status,
                    num_failed = verdict.num_failed,
                    retry_after_secs = hint.map(|d| d.as_secs()),
                    error = verdict.error_message.as_deref().unwrap_or(""),
                    "Upload attempt did not complete, will retry"
                )
            }
            _ => tracing::error!(
                upload_id = id.0,
                status = %verdict.status,
                error = verdict.error_message.as_deref().unwrap_or(""),
                "Upload failed"
            ),
        }

        let notifier = &self.ctx.notifier;
        notifier.report_rate(id, 0);
        let view = TaskView::from(&*record);
        notifier.attempt_finished(&view);
        if verdict.status.is_terminal() {
            notifier.completed(&view);
        }
        Ok(())
    }
}
