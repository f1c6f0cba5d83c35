//! Database layer for upload-queue
//!
//! Handles SQLite persistence of upload records and publishes a change
//! notification after every write that touched at least one row.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`] - Database lifecycle, schema migrations
//! - [`tasks`] - Upload record CRUD, sparse updates and the row codec

use crate::error::DatabaseError;
use crate::types::{Control, Status, TaskId, TaskRecord, Visibility};
use crate::{Error, Result};
use sqlx::{FromRow, sqlite::SqlitePool};
use tokio::sync::broadcast;

mod migrations;
mod tasks;

/// Capacity of the change-notification channel
///
/// Subscribers only need to know that something changed, so a lagging
/// receiver loses nothing it needs.
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Upload record as stored in SQLite
///
/// Raw column values; convert with [`TaskRecord::try_from`] and
/// [`TaskRow::try_from`].
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct TaskRow {
    /// Unique database ID
    pub id: i64,
    /// Endpoint the file is POSTed to
    pub target_url: String,
    /// Locator of the file to send
    pub file_reference: String,
    /// Content type of the file part
    pub mime_type: Option<String>,
    /// Display title
    pub title: Option<String>,
    /// Display description
    pub description: Option<String>,
    /// User-Agent override
    pub user_agent: Option<String>,
    /// Multipart field name of the file part
    pub field_name: Option<String>,
    /// Status code (see [`Status::from_i32`])
    pub status: i32,
    /// Consecutive failures
    pub num_failed: i64,
    /// Server-supplied retry delay in seconds (0 = unset)
    pub retry_after_seconds: i64,
    /// Total bytes (-1 = unknown)
    pub total_bytes: i64,
    /// Bytes sent
    pub current_bytes: i64,
    /// Epoch millis of the last change
    pub last_modified_at: i64,
    /// Epoch millis of creation
    pub created_at: i64,
    /// Visibility code (see [`Visibility::from_i32`])
    pub visibility: i32,
    /// Control code (see [`Control::from_i32`])
    pub control: i32,
    /// May use a roaming link
    pub allow_roaming: bool,
    /// May use a metered link
    pub allow_metered: bool,
    /// Soft-delete flag
    pub deleted: bool,
    /// Response body of a successful upload
    pub server_response: Option<String>,
    /// Message of the last failure
    pub error_message: Option<String>,
    /// JSON array of `[name, value]` header pairs
    pub request_headers: String,
    /// JSON array of `[name, value]` form-field pairs
    pub form_fields: String,
}

impl TryFrom<TaskRow> for TaskRecord {
    type Error = Error;

    fn try_from(row: TaskRow) -> Result<Self> {
        let corrupt = |reason: String| {
            Error::Database(DatabaseError::CorruptRecord { id: row.id, reason })
        };

        let num_failed = u32::try_from(row.num_failed)
            .map_err(|_| corrupt(format!("num_failed out of range: {}", row.num_failed)))?;
        let retry_after_seconds = u32::try_from(row.retry_after_seconds).map_err(|_| {
            corrupt(format!(
                "retry_after_seconds out of range: {}",
                row.retry_after_seconds
            ))
        })?;
        let status = Status::from_i32(row.status)
            .ok_or_else(|| corrupt(format!("unknown status code: {}", row.status)))?;
        let visibility = Visibility::from_i32(row.visibility)
            .ok_or_else(|| corrupt(format!("unknown visibility code: {}", row.visibility)))?;
        let control = Control::from_i32(row.control)
            .ok_or_else(|| corrupt(format!("unknown control code: {}", row.control)))?;
        let request_headers: Vec<(String, String)> = serde_json::from_str(&row.request_headers)
            .map_err(|e| corrupt(format!("request_headers: {}", e)))?;
        let form_fields: Vec<(String, String)> = serde_json::from_str(&row.form_fields)
            .map_err(|e| corrupt(format!("form_fields: {}", e)))?;

        Ok(TaskRecord {
            id: TaskId(row.id),
            target_url: row.target_url,
            file_reference: row.file_reference,
            mime_type: row.mime_type,
            title: row.title,
            description: row.description,
            user_agent: row.user_agent,
            field_name: row.field_name,
            status,
            num_failed,
            retry_after_seconds,
            total_bytes: row.total_bytes,
            current_bytes: row.current_bytes,
            last_modified_at_millis: row.last_modified_at,
            created_at_millis: row.created_at,
            visibility,
            control,
            allow_roaming: row.allow_roaming,
            allow_metered: row.allow_metered,
            deleted: row.deleted,
            server_response: row.server_response,
            error_message: row.error_message,
            request_headers,
            form_fields,
        })
    }
}

impl TryFrom<&TaskRecord> for TaskRow {
    type Error = Error;

    fn try_from(record: &TaskRecord) -> Result<Self> {
        Ok(TaskRow {
            id: record.id.0,
            target_url: record.target_url.clone(),
            file_reference: record.file_reference.clone(),
            mime_type: record.mime_type.clone(),
            title: record.title.clone(),
            description: record.description.clone(),
            user_agent: record.user_agent.clone(),
            field_name: record.field_name.clone(),
            status: record.status.to_i32(),
            num_failed: i64::from(record.num_failed),
            retry_after_seconds: i64::from(record.retry_after_seconds),
            total_bytes: record.total_bytes,
            current_bytes: record.current_bytes,
            last_modified_at: record.last_modified_at_millis,
            created_at: record.created_at_millis,
            visibility: record.visibility.to_i32(),
            control: record.control.to_i32(),
            allow_roaming: record.allow_roaming,
            allow_metered: record.allow_metered,
            deleted: record.deleted,
            server_response: record.server_response.clone(),
            error_message: record.error_message.clone(),
            request_headers: serde_json::to_string(&record.request_headers)?,
            form_fields: serde_json::to_string(&record.form_fields)?,
        })
    }
}

/// Sparse update of an upload record
///
/// Only `Some` fields are written. `last_modified_at` is always stamped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskUpdate {
    /// New status
    pub status: Option<Status>,
    /// New failure count
    pub num_failed: Option<u32>,
    /// New Retry-After seconds
    pub retry_after_seconds: Option<u32>,
    /// New total bytes
    pub total_bytes: Option<i64>,
    /// New sent bytes
    pub current_bytes: Option<i64>,
    /// New visibility
    pub visibility: Option<Visibility>,
    /// New control
    pub control: Option<Control>,
    /// New soft-delete flag
    pub deleted: Option<bool>,
    /// New response body (`Some(None)` clears it)
    pub server_response: Option<Option<String>>,
    /// New error message (`Some(None)` clears it)
    pub error_message: Option<Option<String>>,
}

impl TaskUpdate {
    /// Update only the status
    pub fn status(status: Status) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

/// A write that touched the upload table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    /// A record was created
    Inserted(TaskId),
    /// Records were updated (including soft deletes)
    Updated(Vec<TaskId>),
    /// Records were physically removed
    Deleted(Vec<TaskId>),
}

/// Database handle for upload-queue
pub struct Database {
    pool: SqlitePool,
    changes: broadcast::Sender<StoreChange>,
}

impl Database {
    /// Subscribe to store change notifications
    ///
    /// A notification is sent after every insert, update or delete that
    /// affected at least one row.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    fn notify(&self, change: StoreChange) {
        // No subscribers is fine; nothing is listening while the queue is idle
        let _ = self.changes.send(change);
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
