//! Reconciliation loop
//!
//! At most one loop runs at a time. It is started on demand by [`Orchestrator::wake`]
//! and retires itself once a pass finds nothing ready or running, leaving any
//! future retry to a one-shot alarm. Every pass re-reads the store, so the loop
//! never trusts in-memory state across wake-ups.

use super::controller::{StopReason, TaskController};
use super::worker::WorkerContext;
use crate::db::StoreChange;
use crate::error::Result;
use crate::retry::now_millis;
use crate::types::TaskId;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// What woke the loop; only used for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Trigger {
    Startup,
    Enqueued,
    Control,
    RunNow,
    NetworkChanged,
    StoreChanged,
    Alarm,
    WorkerFinished,
    FinalUpdate,
}

#[derive(Default)]
struct LoopState {
    triggers: Option<mpsc::UnboundedSender<Trigger>>,
    alarm: Option<JoinHandle<()>>,
}

struct Inner {
    ctx: Arc<WorkerContext>,
    tasks: tokio::sync::Mutex<HashMap<TaskId, Arc<TaskController>>>,
    state: Mutex<LoopState>,
    stopped: CancellationToken,
}

/// Handle to the reconciliation loop; cheap to clone
#[derive(Clone)]
pub(crate) struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub(crate) fn new(ctx: Arc<WorkerContext>) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                tasks: tokio::sync::Mutex::new(HashMap::new()),
                state: Mutex::new(LoopState::default()),
                stopped: CancellationToken::new(),
            }),
        }
    }

    pub(crate) fn context(&self) -> Arc<WorkerContext> {
        Arc::clone(&self.inner.ctx)
    }

    fn lock_state(&self) -> MutexGuard<'_, LoopState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether a loop is currently alive
    #[cfg(test)]
    pub(crate) fn is_running(&self) -> bool {
        self.lock_state().triggers.is_some()
    }

    /// Request a reconciliation pass, starting the loop if it is idle
    pub(crate) fn wake(&self, trigger: Trigger) {
        if self.inner.stopped.is_cancelled() {
            return;
        }

        let mut state = self.lock_state();
        if let Some(tx) = &state.triggers
            && tx.send(trigger).is_ok()
        {
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        // The receiver is alive until the loop below drops it
        let _ = tx.send(trigger);
        state.triggers = Some(tx);

        // Subscribe before spawning so no write between here and the first pass is missed
        let changes = self.inner.ctx.db.subscribe();
        let this = self.clone();
        tokio::spawn(async move { this.run(rx, changes).await });
    }

    async fn run(
        self,
        mut triggers: mpsc::UnboundedReceiver<Trigger>,
        mut changes: broadcast::Receiver<StoreChange>,
    ) {
        tracing::debug!("Upload orchestrator started");
        let safety_interval = self.inner.ctx.config.queue.final_update_interval;
        let mut pending: Option<Trigger> = None;

        loop {
            if self.inner.stopped.is_cancelled() {
                break;
            }

            let trigger = match pending.take() {
                Some(trigger) => trigger,
                None => tokio::select! {
                    _ = self.inner.stopped.cancelled() => break,
                    Some(trigger) = triggers.recv() => trigger,
                    change = changes.recv() => match change {
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => Trigger::StoreChanged,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = tokio::time::sleep(safety_interval) => Trigger::FinalUpdate,
                },
            };

            // Everything queued so far is covered by the pass about to run
            while triggers.try_recv().is_ok() {}
            while !matches!(
                changes.try_recv(),
                Err(broadcast::error::TryRecvError::Empty | broadcast::error::TryRecvError::Closed)
            ) {}

            if trigger == Trigger::FinalUpdate {
                tracing::warn!(
                    interval_secs = safety_interval.as_secs(),
                    "No store change observed while uploads are active, re-scanning"
                );
                self.inner.ctx.notifier.dump_rates();
            }

            let active = match self.run_pass(trigger).await {
                Ok(active) => active,
                Err(e) => {
                    tracing::error!(error = %e, ?trigger, "Reconciliation pass failed");
                    true
                }
            };

            if !active {
                match self.try_retire(&mut triggers, &mut changes) {
                    Some(next) => pending = Some(next),
                    None => {
                        tracing::debug!("Upload orchestrator idle");
                        return;
                    }
                }
            }
        }

        self.lock_state().triggers = None;
        tracing::debug!("Upload orchestrator stopped");
    }

    /// Clear the loop slot unless a wake-up slipped in since the last pass
    ///
    /// Runs under the state lock, so a concurrent [`wake`](Self::wake) either
    /// lands in the still-registered channel or finds the slot empty and starts
    /// a new loop.
    fn try_retire(
        &self,
        triggers: &mut mpsc::UnboundedReceiver<Trigger>,
        changes: &mut broadcast::Receiver<StoreChange>,
    ) -> Option<Trigger> {
        let mut state = self.lock_state();
        if let Ok(trigger) = triggers.try_recv() {
            return Some(trigger);
        }
        match changes.try_recv() {
            Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => {
                return Some(Trigger::StoreChanged);
            }
            Err(_) => {}
        }
        state.triggers = None;
        None
    }

    /// One reconciliation pass; returns whether any upload is ready or running
    async fn run_pass(&self, trigger: Trigger) -> Result<bool> {
        let ctx = &self.inner.ctx;
        let retry = &ctx.config.retry;
        let now_ms = now_millis();
        let network = ctx.connectivity.active_network();
        let records = ctx.db.scan_tracked().await?;

        let mut tasks = self.inner.tasks.lock().await;
        let mut stale: HashSet<TaskId> = tasks.keys().copied().collect();
        let mut any_active = false;
        let mut next_wake: Option<Duration> = None;

        for record in records {
            let id = record.id;
            let deleted = record.deleted;
            stale.remove(&id);

            let controller = match tasks.get(&id) {
                Some(controller) => {
                    controller.refresh(record).await;
                    Arc::clone(controller)
                }
                None => {
                    let controller = Arc::new(TaskController::new(record));
                    tasks.insert(id, Arc::clone(&controller));
                    controller
                }
            };

            if deleted {
                if controller.is_active().await {
                    // Removed once the worker has unwound
                    any_active = true;
                    continue;
                }
                match ctx.db.delete_task(id).await {
                    Ok(_) => tracing::debug!(upload_id = id.0, "Removed deleted upload"),
                    Err(e) => {
                        tracing::error!(upload_id = id.0, error = %e, "Failed to remove deleted upload")
                    }
                }
                tasks.remove(&id);
                continue;
            }

            match controller.start_if_ready(self, now_ms, &network).await {
                Ok(ready) => any_active |= ready,
                Err(e) => {
                    tracing::error!(upload_id = id.0, error = %e, "Failed to start upload")
                }
            }

            if let Some(delay) = controller.next_action(now_ms, retry).await
                && !delay.is_zero()
            {
                next_wake = Some(next_wake.map_or(delay, |current| current.min(delay)));
            }
        }

        for id in stale {
            if let Some(controller) = tasks.remove(&id) {
                controller.forget().await;
                tracing::debug!(upload_id = id.0, "Stopped tracking upload");
            }
        }

        let mut ids: Vec<TaskId> = tasks.keys().copied().collect();
        ids.sort();
        let mut snapshot = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(view) = tasks[&id].view().await {
                snapshot.push(view);
            }
        }
        drop(tasks);

        ctx.notifier.present(&snapshot);
        self.arm_alarm(next_wake);

        tracing::debug!(
            ?trigger,
            tracked = snapshot.len(),
            any_active,
            next_wake_ms = next_wake.map(|d| d.as_millis() as u64),
            "Reconciliation pass complete"
        );
        Ok(any_active)
    }

    /// Replace the pending alarm; `None` leaves none armed
    fn arm_alarm(&self, delay: Option<Duration>) {
        let mut state = self.lock_state();
        if let Some(previous) = state.alarm.take() {
            previous.abort();
        }
        if let Some(delay) = delay {
            let this = self.clone();
            state.alarm = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                this.wake(Trigger::Alarm);
            }));
        }
    }

    /// Stop the loop and every running attempt
    ///
    /// Returns the worker handles so the caller can wait for them to persist
    /// their final state.
    pub(crate) async fn stop(&self) -> Vec<JoinHandle<()>> {
        self.inner.stopped.cancel();
        {
            let mut state = self.lock_state();
            state.triggers = None;
            if let Some(alarm) = state.alarm.take() {
                alarm.abort();
            }
        }

        let tasks = self.inner.tasks.lock().await;
        let mut handles = Vec::new();
        for controller in tasks.values() {
            if let Some(handle) = controller.stop(StopReason::Shutdown).await {
                handles.push(handle);
            }
        }
        handles
    }
}
