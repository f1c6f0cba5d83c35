//! Upload control: enqueue, cancel, restart, pause, resume, hide, queries.

use crate::db::TaskUpdate;
use crate::error::{Error, Result, UploadError};
use crate::transport::validate_target_url;
use crate::types::{Control, NewUpload, Status, TaskId, TaskQuery, TaskRecord, Visibility};
use std::sync::atomic::Ordering;

use super::UploadQueue;
use super::orchestrator::Trigger;

impl UploadQueue {
    /// Add an upload to the queue
    ///
    /// The record is persisted as `Pending` before this returns; the upload
    /// survives a crash from that point on.
    ///
    /// # Errors
    ///
    /// - [`Error::ShuttingDown`] after [`shutdown`](Self::shutdown) has started
    /// - [`Error::InvalidUrl`] if the target is not an absolute http(s) URL
    /// - a database error if the insert fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use upload_queue::*;
    /// # use upload_queue::types::NewUpload;
    /// # async fn example(queue: UploadQueue) -> Result<()> {
    /// let id = queue
    ///     .enqueue(
    ///         NewUpload::new("https://example.com/upload", "/data/photo.jpg")
    ///             .mime_type("image/jpeg")
    ///             .allow_roaming(false),
    ///     )
    ///     .await?;
    /// println!("queued upload {id}");
    /// # Ok(())
    /// # }
    /// ```
    pub async fn enqueue(&self, upload: NewUpload) -> Result<TaskId> {
        if !self.accepting_new.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        validate_target_url(&upload.target_url).map_err(|e| Error::InvalidUrl {
            url: upload.target_url.clone(),
            reason: e.to_string(),
        })?;

        let id = self.db.insert_task(&upload).await?;
        tracing::info!(
            upload_id = id.0,
            target = %upload.target_url,
            file = %upload.file_reference,
            "Upload queued"
        );

        self.orchestrator.wake(Trigger::Enqueued);
        Ok(id)
    }

    /// Cancel uploads
    ///
    /// Marks each upload deleted; the reconciliation loop stops any running
    /// attempt and removes the records. Unknown ids are ignored.
    pub async fn cancel(&self, ids: &[TaskId]) -> Result<u64> {
        if ids.is_empty() {
            return Err(UploadError::EmptyIdList {
                operation: "cancel".to_string(),
            }
            .into());
        }

        let affected = self
            .db
            .update_tasks(
                ids,
                &TaskUpdate {
                    deleted: Some(true),
                    ..TaskUpdate::default()
                },
            )
            .await?;
        tracing::info!(requested = ids.len(), affected, "Uploads canceled");

        self.orchestrator.wake(Trigger::Control);
        Ok(affected)
    }

    /// Restart failed or canceled uploads from scratch
    ///
    /// Every id is checked before anything is written, so either all uploads
    /// restart or none do.
    ///
    /// # Errors
    ///
    /// - [`UploadError::EmptyIdList`] if `ids` is empty
    /// - [`UploadError::NotFound`] if an id is unknown or already deleted
    /// - [`UploadError::InvalidState`] if an upload is neither failed nor canceled
    pub async fn restart(&self, ids: &[TaskId]) -> Result<()> {
        if ids.is_empty() {
            return Err(UploadError::EmptyIdList {
                operation: "restart".to_string(),
            }
            .into());
        }

        for &id in ids {
            let record = self.require(id).await?;
            if !(record.status.is_failed() || record.status == Status::Canceled) {
                return Err(UploadError::InvalidState {
                    id: id.0,
                    operation: "restart".to_string(),
                    current_state: record.status.to_string(),
                }
                .into());
            }
        }

        self.db
            .update_tasks(
                ids,
                &TaskUpdate {
                    status: Some(Status::Pending),
                    num_failed: Some(0),
                    retry_after_seconds: Some(0),
                    current_bytes: Some(0),
                    total_bytes: Some(-1),
                    visibility: Some(Visibility::Visible),
                    server_response: Some(None),
                    error_message: Some(None),
                    ..TaskUpdate::default()
                },
            )
            .await?;
        tracing::info!(count = ids.len(), "Uploads restarted");

        self.orchestrator.wake(Trigger::Control);
        Ok(())
    }

    /// Hold an upload
    ///
    /// A running attempt is stopped and the upload returns to `Pending`; it
    /// stays there until [`resume`](Self::resume). Pausing twice is a no-op.
    pub async fn pause(&self, id: TaskId) -> Result<()> {
        self.set_control(id, Control::Paused).await
    }

    /// Release a held upload
    pub async fn resume(&self, id: TaskId) -> Result<()> {
        self.set_control(id, Control::Run).await
    }

    async fn set_control(&self, id: TaskId, control: Control) -> Result<()> {
        let record = self.require(id).await?;
        if record.control == control {
            return Ok(());
        }

        self.db
            .update_task(
                id,
                &TaskUpdate {
                    control: Some(control),
                    ..TaskUpdate::default()
                },
            )
            .await?;
        tracing::info!(upload_id = id.0, ?control, "Upload control changed");

        self.orchestrator.wake(Trigger::Control);
        Ok(())
    }

    /// Stop tracking finished uploads
    ///
    /// Hidden uploads keep their record but no longer appear in snapshots.
    pub async fn hide(&self, ids: &[TaskId]) -> Result<()> {
        if ids.is_empty() {
            return Err(UploadError::EmptyIdList {
                operation: "hide".to_string(),
            }
            .into());
        }

        for &id in ids {
            let record = self.require(id).await?;
            if !record.status.is_terminal() {
                return Err(UploadError::InvalidState {
                    id: id.0,
                    operation: "hide".to_string(),
                    current_state: record.status.to_string(),
                }
                .into());
            }
        }

        self.db
            .update_tasks(
                ids,
                &TaskUpdate {
                    visibility: Some(Visibility::HiddenComplete),
                    ..TaskUpdate::default()
                },
            )
            .await?;

        self.orchestrator.wake(Trigger::Control);
        Ok(())
    }

    /// Fetch one upload
    pub async fn get(&self, id: TaskId) -> Result<TaskRecord> {
        self.require(id).await
    }

    /// Query uploads
    pub async fn query(&self, query: &TaskQuery) -> Result<Vec<TaskRecord>> {
        self.db.list_tasks(query).await
    }

    /// Request an immediate reconciliation pass
    pub fn run_now(&self) {
        self.orchestrator.wake(Trigger::RunNow);
    }

    /// Tell the queue that the host's network changed
    ///
    /// Uploads waiting for a network are re-evaluated right away.
    pub fn network_changed(&self) {
        self.orchestrator.wake(Trigger::NetworkChanged);
    }

    async fn require(&self, id: TaskId) -> Result<TaskRecord> {
        match self.db.get_task(id).await? {
            Some(record) if !record.deleted => Ok(record),
            _ => Err(Error::upload_not_found(id)),
        }
    }
}
