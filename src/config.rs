//! Configuration types for upload-queue

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Database path (default: "./upload-queue.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

/// Scheduling configuration for the reconciliation loop and worker pool
///
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum uploads executing at once (default: 5)
    ///
    /// Ready uploads beyond this limit wait for a free slot without changing
    /// their persisted status.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_uploads: usize,

    /// Safety re-scan interval while uploads are active (default: 300 seconds)
    ///
    /// Catches workers that finished without the store reporting a change.
    #[serde(default = "default_final_update_interval", with = "duration_serde")]
    pub final_update_interval: Duration,

    /// How long shutdown waits for running uploads to stop (default: 30 seconds)
    #[serde(default = "default_shutdown_timeout", with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_uploads: default_max_concurrent(),
            final_update_interval: default_final_update_interval(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Retry configuration for transient upload failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Failures after which an upload becomes terminal (default: 5)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay before the first retry (default: 5 seconds)
    ///
    /// Doubled for every further failure.
    #[serde(default = "default_first_delay", with = "duration_serde")]
    pub first_delay: Duration,

    /// Upper bound for a computed backoff delay (default: 24 hours)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,

    /// Lower clamp for a server-supplied Retry-After (default: 30 seconds)
    #[serde(default = "default_min_retry_after", with = "duration_serde")]
    pub min_retry_after: Duration,

    /// Upper clamp for a server-supplied Retry-After (default: 24 hours)
    #[serde(default = "default_max_retry_after", with = "duration_serde")]
    pub max_retry_after: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            first_delay: default_first_delay(),
            max_delay: default_max_delay(),
            jitter: true,
            min_retry_after: default_min_retry_after(),
            max_retry_after: default_max_retry_after(),
        }
    }
}

/// Progress persistence and rate sampling
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// Bytes that must be sent since the last write before progress is persisted (default: 64 KiB)
    #[serde(default = "default_min_step_bytes")]
    pub min_step_bytes: u64,

    /// Time that must pass since the last write before progress is persisted (default: 2000 ms)
    #[serde(default = "default_min_interval", with = "duration_millis_serde")]
    pub min_interval: Duration,

    /// Minimum spacing between transfer-rate samples (default: 500 ms)
    #[serde(default = "default_rate_sample_interval", with = "duration_millis_serde")]
    pub rate_sample_interval: Duration,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            min_step_bytes: default_min_step_bytes(),
            min_interval: default_min_interval(),
            rate_sample_interval: default_rate_sample_interval(),
        }
    }
}

/// HTTP transport settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HttpConfig {
    /// TCP connect timeout (default: 20 seconds)
    #[serde(default = "default_connect_timeout", with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Whole-request timeout (default: none, large files may take hours)
    #[serde(default, with = "optional_duration_serde")]
    pub request_timeout: Option<Duration>,

    /// User-Agent sent when an upload does not set its own
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Multipart field name of the file part when an upload does not set one (default: "file")
    #[serde(default = "default_field_name")]
    pub default_field_name: String,

    /// Content type of the file part when an upload does not set one
    #[serde(default = "default_mime_type")]
    pub default_mime_type: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            request_timeout: None,
            user_agent: default_user_agent(),
            default_field_name: default_field_name(),
            default_mime_type: default_mime_type(),
        }
    }
}

/// Main configuration for [`UploadQueue`](crate::UploadQueue)
///
/// Fields are organized into logical sub-configs:
/// - [`persistence`](PersistenceConfig) - database location
/// - [`queue`](QueueConfig) - concurrency, safety re-scan, shutdown
/// - [`retry`](RetryConfig) - failure limits and backoff
/// - [`progress`](ProgressConfig) - throttled progress writes and rate sampling
/// - [`http`](HttpConfig) - transport timeouts and multipart defaults
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Data storage
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Scheduling and worker pool
    #[serde(default)]
    pub queue: QueueConfig,

    /// Retry and backoff policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Progress tracking
    #[serde(default)]
    pub progress: ProgressConfig,

    /// HTTP transport
    #[serde(default)]
    pub http: HttpConfig,
}

impl Config {
    /// Database path
    pub fn database_path(&self) -> &PathBuf {
        &self.persistence.database_path
    }

    /// Check settings that would leave the queue unable to make progress
    pub fn validate(&self) -> Result<()> {
        if self.queue.max_concurrent_uploads == 0 {
            return Err(Error::Config {
                message: "max_concurrent_uploads must be at least 1".to_string(),
                key: Some("queue.max_concurrent_uploads".to_string()),
            });
        }

        if self.retry.max_retries == 0 {
            return Err(Error::Config {
                message: "max_retries must be at least 1".to_string(),
                key: Some("retry.max_retries".to_string()),
            });
        }

        if self.retry.min_retry_after > self.retry.max_retry_after {
            return Err(Error::Config {
                message: format!(
                    "min_retry_after ({}s) exceeds max_retry_after ({}s)",
                    self.retry.min_retry_after.as_secs(),
                    self.retry.max_retry_after.as_secs()
                ),
                key: Some("retry.min_retry_after".to_string()),
            });
        }

        if self.http.default_field_name.is_empty() {
            return Err(Error::Config {
                message: "default_field_name must not be empty".to_string(),
                key: Some("http.default_field_name".to_string()),
            });
        }

        Ok(())
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./upload-queue.db")
}

fn default_max_concurrent() -> usize {
    5
}

fn default_final_update_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_retries() -> u32 {
    5
}

fn default_first_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_true() -> bool {
    true
}

fn default_min_retry_after() -> Duration {
    Duration::from_secs(30)
}

fn default_max_retry_after() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_min_step_bytes() -> u64 {
    64 * 1024
}

fn default_min_interval() -> Duration {
    Duration::from_millis(2000)
}

fn default_rate_sample_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(20)
}

fn default_user_agent() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

fn default_field_name() -> String {
    "file".to_string()
}

fn default_mime_type() -> String {
    "application/octet-stream".to_string()
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Duration serialization helper (milliseconds)
mod duration_millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

// Optional Duration serialization helper
mod optional_duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}
