//! Upload record CRUD operations.

use crate::error::DatabaseError;
use crate::retry::now_millis;
use crate::types::{
    Control, Direction, NewUpload, OrderBy, Status, TaskId, TaskQuery, TaskRecord, Visibility,
};
use crate::{Error, Result};
use sqlx::{QueryBuilder, Sqlite};

use super::{Database, StoreChange, TaskRow, TaskUpdate};

const TASK_COLUMNS: &str = r#"
    id, target_url, file_reference, mime_type, title, description,
    user_agent, field_name, status, num_failed, retry_after_seconds,
    total_bytes, current_bytes, last_modified_at, created_at, visibility,
    control, allow_roaming, allow_metered, deleted, server_response,
    error_message, request_headers, form_fields
"#;

fn decode_rows(rows: Vec<TaskRow>) -> Result<Vec<TaskRecord>> {
    rows.into_iter().map(TaskRecord::try_from).collect()
}

fn push_id_list(builder: &mut QueryBuilder<'_, Sqlite>, ids: &[TaskId]) {
    builder.push("(");
    let mut separated = builder.separated(", ");
    for id in ids {
        separated.push_bind(*id);
    }
    separated.push_unseparated(")");
}

impl Database {
    /// Insert a new upload record with status Pending
    pub async fn insert_task(&self, upload: &NewUpload) -> Result<TaskId> {
        let now = now_millis();
        let record = TaskRecord {
            id: TaskId(0),
            target_url: upload.target_url.clone(),
            file_reference: upload.file_reference.clone(),
            mime_type: upload.mime_type.clone(),
            title: upload.title.clone(),
            description: upload.description.clone(),
            user_agent: upload.user_agent.clone(),
            field_name: upload.field_name.clone(),
            status: Status::Pending,
            num_failed: 0,
            retry_after_seconds: 0,
            total_bytes: -1,
            current_bytes: 0,
            last_modified_at_millis: now,
            created_at_millis: now,
            visibility: upload.visibility,
            control: Control::Run,
            allow_roaming: upload.allow_roaming,
            allow_metered: upload.allow_metered,
            deleted: false,
            server_response: None,
            error_message: None,
            request_headers: upload.request_headers.clone(),
            form_fields: upload.form_fields.clone(),
        };
        let row = TaskRow::try_from(&record)?;

        let result = sqlx::query(
            r#"
            INSERT INTO uploads (
                target_url, file_reference, mime_type, title, description,
                user_agent, field_name, status, num_failed, retry_after_seconds,
                total_bytes, current_bytes, last_modified_at, created_at, visibility,
                control, allow_roaming, allow_metered, deleted, server_response,
                error_message, request_headers, form_fields
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.target_url)
        .bind(&row.file_reference)
        .bind(&row.mime_type)
        .bind(&row.title)
        .bind(&row.description)
        .bind(&row.user_agent)
        .bind(&row.field_name)
        .bind(row.status)
        .bind(row.num_failed)
        .bind(row.retry_after_seconds)
        .bind(row.total_bytes)
        .bind(row.current_bytes)
        .bind(row.last_modified_at)
        .bind(row.created_at)
        .bind(row.visibility)
        .bind(row.control)
        .bind(row.allow_roaming)
        .bind(row.allow_metered)
        .bind(row.deleted)
        .bind(&row.server_response)
        .bind(&row.error_message)
        .bind(&row.request_headers)
        .bind(&row.form_fields)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to insert upload: {}",
                e
            )))
        })?;

        let id = TaskId(result.last_insert_rowid());
        self.notify(StoreChange::Inserted(id));
        Ok(id)
    }

    /// Get an upload by ID, including soft-deleted ones
    pub async fn get_task(&self, id: TaskId) -> Result<Option<TaskRecord>> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM uploads WHERE id = ?",
            TASK_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get upload: {}",
                e
            )))
        })?;

        row.map(TaskRecord::try_from).transpose()
    }

    /// Every record the reconciliation pass tracks, ordered by id
    ///
    /// Excludes records already hidden after completion.
    pub async fn scan_tracked(&self) -> Result<Vec<TaskRecord>> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM uploads WHERE visibility != ? ORDER BY id ASC",
            TASK_COLUMNS
        ))
        .bind(Visibility::HiddenComplete.to_i32())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to scan uploads: {}",
                e
            )))
        })?;

        decode_rows(rows)
    }

    /// List uploads matching a query
    pub async fn list_tasks(&self, query: &TaskQuery) -> Result<Vec<TaskRecord>> {
        if matches!(&query.ids, Some(ids) if ids.is_empty())
            || matches!(&query.statuses, Some(statuses) if statuses.is_empty())
        {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM uploads WHERE 1 = 1", TASK_COLUMNS));

        if !query.include_deleted {
            builder.push(" AND deleted = 0");
        }

        if let Some(ids) = &query.ids {
            builder.push(" AND id IN ");
            push_id_list(&mut builder, ids);
        }

        if let Some(statuses) = &query.statuses {
            builder.push(" AND status IN (");
            let mut separated = builder.separated(", ");
            for status in statuses {
                separated.push_bind(status.to_i32());
            }
            separated.push_unseparated(")");
        }

        let column = match query.order_by {
            OrderBy::LastModified => "last_modified_at",
            OrderBy::TotalBytes => "total_bytes",
        };
        let direction = match query.direction {
            Direction::Ascending => "ASC",
            Direction::Descending => "DESC",
        };
        builder.push(format!(
            " ORDER BY {} {}, id {}",
            column, direction, direction
        ));

        let rows = builder
            .build_query_as::<TaskRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to list uploads: {}",
                    e
                )))
            })?;

        decode_rows(rows)
    }

    /// Apply a sparse update to one upload
    ///
    /// Returns the number of affected rows (0 if the record is gone).
    pub async fn update_task(&self, id: TaskId, update: &TaskUpdate) -> Result<u64> {
        self.update_tasks(&[id], update).await
    }

    /// Apply the same sparse update to several uploads
    pub async fn update_tasks(&self, ids: &[TaskId], update: &TaskUpdate) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE uploads SET last_modified_at = ");
        builder.push_bind(now_millis());

        if let Some(status) = update.status {
            builder.push(", status = ").push_bind(status.to_i32());
        }
        if let Some(num_failed) = update.num_failed {
            builder.push(", num_failed = ").push_bind(i64::from(num_failed));
        }
        if let Some(retry_after) = update.retry_after_seconds {
            builder
                .push(", retry_after_seconds = ")
                .push_bind(i64::from(retry_after));
        }
        if let Some(total) = update.total_bytes {
            builder.push(", total_bytes = ").push_bind(total);
        }
        if let Some(current) = update.current_bytes {
            builder.push(", current_bytes = ").push_bind(current);
        }
        if let Some(visibility) = update.visibility {
            builder.push(", visibility = ").push_bind(visibility.to_i32());
        }
        if let Some(control) = update.control {
            builder.push(", control = ").push_bind(control.to_i32());
        }
        if let Some(deleted) = update.deleted {
            builder.push(", deleted = ").push_bind(deleted);
        }
        if let Some(response) = &update.server_response {
            builder.push(", server_response = ").push_bind(response.clone());
        }
        if let Some(message) = &update.error_message {
            builder.push(", error_message = ").push_bind(message.clone());
        }

        builder.push(" WHERE id IN ");
        push_id_list(&mut builder, ids);

        let result = builder.build().execute(&self.pool).await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to update uploads: {}",
                e
            )))
        })?;

        let affected = result.rows_affected();
        if affected > 0 {
            self.notify(StoreChange::Updated(ids.to_vec()));
        }
        Ok(affected)
    }

    /// Physically remove an upload
    pub async fn delete_task(&self, id: TaskId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM uploads WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to delete upload: {}",
                    e
                )))
            })?;

        let affected = result.rows_affected();
        if affected > 0 {
            self.notify(StoreChange::Deleted(vec![id]));
        }
        Ok(affected)
    }
}
