//! Presentation seam for upload progress and status
//!
//! The orchestrator calls [`Notifier::present`] once per reconciliation pass
//! with every tracked upload. Workers call [`Notifier::report_rate`] on their
//! own, more frequent, schedule. The built-in [`BroadcastNotifier`] turns both
//! into [`Event`]s on a broadcast channel, which is what
//! [`UploadQueue::subscribe`](crate::UploadQueue::subscribe) hands out.

use crate::types::{Event, TaskId, TaskView};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio_stream::{Stream, StreamExt, wrappers::BroadcastStream};

/// Receives resolved upload state for display
///
/// Implementations must not block; they are called from the reconciliation
/// loop and from workers mid-transfer.
pub trait Notifier: Send + Sync {
    /// Full set of tracked uploads after a reconciliation pass, ordered by id
    fn present(&self, snapshot: &[TaskView]);

    /// Smoothed transfer rate of a running upload (0 when its attempt ends)
    fn report_rate(&self, id: TaskId, bytes_per_second: u64);

    /// A worker attempt finished and its outcome was persisted
    fn attempt_finished(&self, _task: &TaskView) {}

    /// An upload reached a terminal status
    fn completed(&self, _task: &TaskView) {}

    /// Log whatever live state the notifier keeps (safety re-scan)
    fn dump_rates(&self) {}
}

/// [`Notifier`] that publishes [`Event`]s on a broadcast channel
pub struct BroadcastNotifier {
    tx: broadcast::Sender<Event>,
    rates: Mutex<HashMap<TaskId, u64>>,
}

impl BroadcastNotifier {
    /// Create a notifier whose channel buffers `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self {
            tx,
            rates: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to upload events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Upload events as a stream; events missed by a slow consumer are skipped
    pub fn stream(&self) -> impl Stream<Item = Event> + Send + 'static {
        BroadcastStream::new(self.tx.subscribe()).filter_map(|event| event.ok())
    }

    /// Last reported rate of `id`, if it is transferring
    pub fn rate(&self, id: TaskId) -> Option<u64> {
        self.rates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .copied()
    }

    pub(crate) fn emit_shutdown(&self) {
        self.emit(Event::Shutdown);
    }

    fn emit(&self, event: Event) {
        // Send fails only when nobody subscribed
        let _ = self.tx.send(event);
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl Notifier for BroadcastNotifier {
    fn present(&self, snapshot: &[TaskView]) {
        self.emit(Event::Snapshot {
            tasks: snapshot.to_vec(),
        });
    }

    fn report_rate(&self, id: TaskId, bytes_per_second: u64) {
        {
            let mut rates = self.rates.lock().unwrap_or_else(|e| e.into_inner());
            if bytes_per_second == 0 {
                rates.remove(&id);
            } else {
                rates.insert(id, bytes_per_second);
            }
        }
        self.emit(Event::Rate {
            id,
            bytes_per_second,
        });
    }

    fn attempt_finished(&self, task: &TaskView) {
        self.emit(Event::AttemptFinished {
            id: task.id,
            status: task.status,
            num_failed: task.num_failed,
        });
    }

    fn completed(&self, task: &TaskView) {
        self.emit(Event::Completed {
            id: task.id,
            status: task.status,
        });
    }

    fn dump_rates(&self) {
        let rates = self.rates.lock().unwrap_or_else(|e| e.into_inner());
        if rates.is_empty() {
            tracing::info!("No uploads transferring");
            return;
        }
        for (id, rate) in rates.iter() {
            tracing::info!(upload_id = id.0, bytes_per_second = rate, "Upload transfer rate");
        }
    }
}

/// Forwards every call to several notifiers in order
#[derive(Default)]
pub struct FanoutNotifier {
    targets: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    /// Forward to `targets`
    pub fn new(targets: Vec<Arc<dyn Notifier>>) -> Self {
        Self { targets }
    }
}

impl Notifier for FanoutNotifier {
    fn present(&self, snapshot: &[TaskView]) {
        for target in &self.targets {
            target.present(snapshot);
        }
    }

    fn report_rate(&self, id: TaskId, bytes_per_second: u64) {
        for target in &self.targets {
            target.report_rate(id, bytes_per_second);
        }
    }

    fn attempt_finished(&self, task: &TaskView) {
        for target in &self.targets {
            target.attempt_finished(task);
        }
    }

    fn completed(&self, task: &TaskView) {
        for target in &self.targets {
            target.completed(task);
        }
    }

    fn dump_rates(&self) {
        for target in &self.targets {
            target.dump_rates();
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Status, Visibility};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn view(id: i64, status: Status) -> TaskView {
        TaskView {
            id: TaskId(id),
            name: format!("upload-{id}"),
            status,
            current_bytes: 0,
            total_bytes: -1,
            num_failed: 0,
            visibility: Visibility::Visible,
            error_message: None,
        }
    }

    #[tokio::test]
    async fn publishes_events_in_order() {
        let notifier = BroadcastNotifier::default();
        let mut rx = notifier.subscribe();

        notifier.present(&[view(1, Status::Running)]);
        notifier.report_rate(TaskId(1), 2048);
        notifier.completed(&view(1, Status::Success));

        assert!(matches!(rx.recv().await.unwrap(), Event::Snapshot { tasks } if tasks.len() == 1));
        assert!(matches!(
            rx.recv().await.unwrap(),
            Event::Rate { id: TaskId(1), bytes_per_second: 2048 }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            Event::Completed { id: TaskId(1), status: Status::Success }
        ));
    }

    #[test]
    fn zero_rate_forgets_the_upload() {
        let notifier = BroadcastNotifier::default();
        notifier.report_rate(TaskId(3), 100);
        assert_eq!(notifier.rate(TaskId(3)), Some(100));
        notifier.report_rate(TaskId(3), 0);
        assert_eq!(notifier.rate(TaskId(3)), None);
    }

    #[tokio::test]
    async fn stream_yields_events() {
        let notifier = BroadcastNotifier::default();
        let mut stream = Box::pin(notifier.stream());
        notifier.report_rate(TaskId(5), 7);
        let event = stream.next().await.unwrap();
        assert!(matches!(event, Event::Rate { id: TaskId(5), .. }));
    }

    struct Counting(AtomicUsize);

    impl Notifier for Counting {
        fn present(&self, _snapshot: &[TaskView]) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
        fn report_rate(&self, _id: TaskId, _bytes_per_second: u64) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn fanout_reaches_every_target() {
        let a = Arc::new(Counting(AtomicUsize::new(0)));
        let b = Arc::new(Counting(AtomicUsize::new(0)));
        let fanout = FanoutNotifier::new(vec![a.clone(), b.clone()]);
        fanout.present(&[]);
        fanout.report_rate(TaskId(1), 1);
        fanout.completed(&view(1, Status::Success));
        assert_eq!(a.0.load(Ordering::SeqCst), 2);
        assert_eq!(b.0.load(Ordering::SeqCst), 2);
    }
}
