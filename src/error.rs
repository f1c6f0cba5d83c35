//! Error types for upload-queue
//!
//! Two families live here:
//! - [`Error`] and its nested enums are returned from the public API and the
//!   persistence layer.
//! - [`TransferError`] is the tagged outcome of a single upload attempt. The
//!   worker matches on it to decide between retry, waiting and terminal states.

use crate::types::{NetworkState, TaskId};
use std::time::Duration;
use thiserror::Error;

/// Result type alias for upload-queue operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for upload-queue
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "queue.max_concurrent_uploads")
        key: Option<String>,
    },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Usage error from the control API
    #[error("upload error: {0}")]
    Upload(#[from] UploadError),

    /// Target URL could not be parsed or uses an unsupported scheme
    #[error("invalid target URL '{url}': {reason}")]
    InvalidUrl {
        /// The rejected URL
        url: String,
        /// Why it was rejected
        reason: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Shutdown in progress - not accepting new work
    #[error("shutdown in progress: not accepting new uploads")]
    ShuttingDown,

    /// HTTP client error outside of a transfer attempt (client construction)
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// A stored row could not be decoded into a task record
    #[error("corrupt record {id}: {reason}")]
    CorruptRecord {
        /// Row id of the undecodable record
        id: i64,
        /// What failed to decode
        reason: String,
    },
}

/// Usage errors raised synchronously by the control API
#[derive(Debug, Error)]
pub enum UploadError {
    /// Upload not found in the store
    #[error("upload {id} not found")]
    NotFound {
        /// The upload ID that was not found
        id: i64,
    },

    /// Cannot perform operation in current state
    #[error("cannot {operation} upload {id} in state {current_state}")]
    InvalidState {
        /// The upload ID that is in an invalid state for the operation
        id: i64,
        /// The operation that was attempted (e.g., "restart", "hide")
        operation: String,
        /// The current state that prevents the operation
        current_state: String,
    },

    /// An operation taking a list of ids was called with none
    #[error("no upload ids given to {operation}")]
    EmptyIdList {
        /// The operation that was attempted
        operation: String,
    },
}

/// Outcome of a failed transfer attempt.
///
/// Returned by [`Transport`](crate::transport::Transport) implementations and by
/// the worker's own pre-flight checks. Retry eligibility is decided through
/// [`IsRetryable`](crate::retry::IsRetryable).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    /// Target URL is malformed or not http(s)
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// The file reference could not be opened
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// The active network cannot be used for this upload right now
    #[error("network unusable: {0:?}")]
    NetworkUnavailable(NetworkState),

    /// The server answered with a non-success HTTP status
    #[error("unhandled HTTP response: {code} {reason}")]
    HttpStatus {
        /// HTTP status code
        code: u16,
        /// Canonical reason phrase, if any
        reason: String,
        /// Server-supplied `Retry-After`, already clamped
        retry_after: Option<Duration>,
    },

    /// Reading the file or sending/receiving data failed mid-request
    #[error("data error: {0}")]
    Data(String),

    /// The attempt was interrupted by shutdown while running
    #[error("upload interrupted")]
    Interrupted,

    /// The attempt was canceled (deleted, paused or dropped from the store)
    #[error("upload canceled")]
    Canceled,

    /// Anything the transport could not classify
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Build an [`UploadError::NotFound`] for the given id
    pub fn upload_not_found(id: TaskId) -> Self {
        Error::Upload(UploadError::NotFound { id: id.0 })
    }
}
