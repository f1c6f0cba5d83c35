//! Shared helpers for integration tests

#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use upload_queue::types::{Event, Status, TaskId};
use upload_queue::{Config, UploadQueue};

/// Config rooted in `dir` with fast, jitter-free retries
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.persistence.database_path = dir.join("uploads.db");
    config.retry.first_delay = Duration::from_millis(20);
    config.retry.jitter = false;
    config.retry.min_retry_after = Duration::ZERO;
    config.queue.shutdown_timeout = Duration::from_secs(5);
    config
}

/// Create a queue with production collaborators; keep the TempDir alive
pub async fn create_queue() -> (UploadQueue, TempDir) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let queue = UploadQueue::new(test_config(dir.path()))
        .await
        .expect("Failed to create queue");
    (queue, dir)
}

/// Write `content` to `name` inside `dir` and return the path as a string
pub fn write_file(dir: &TempDir, name: &str, content: &[u8]) -> String {
    let path = dir.path().join(name);
    std::fs::write(&path, content).expect("Failed to write upload file");
    path.to_str().expect("non-UTF-8 temp path").to_string()
}

/// Wait for `id` to reach a terminal status
pub async fn wait_completed(events: &mut broadcast::Receiver<Event>, id: TaskId) -> Status {
    tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            match events.recv().await {
                Ok(Event::Completed { id: done, status }) if done == id => return status,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("Timed out waiting for upload to complete")
}

/// Collect `(status, num_failed)` of every finished attempt of `id` until it completes
pub async fn attempts_until_complete(
    events: &mut broadcast::Receiver<Event>,
    id: TaskId,
) -> Vec<(Status, u32)> {
    tokio::time::timeout(Duration::from_secs(15), async {
        let mut attempts = Vec::new();
        loop {
            match events.recv().await {
                Ok(Event::AttemptFinished {
                    id: done,
                    status,
                    num_failed,
                }) if done == id => {
                    attempts.push((status, num_failed));
                    if status.is_terminal() {
                        return attempts;
                    }
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("Timed out waiting for upload attempts")
}
