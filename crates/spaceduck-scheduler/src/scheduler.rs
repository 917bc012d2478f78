use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use spaceduck_types::TaskStatus;

use crate::error::SchedulerResult;
use crate::event_bus::EventBus;
use crate::queue::TaskQueue;
use crate::store::{TaskPatch, TaskStore};

/// Shared pause flag. Pausing prevents new claims everywhere (scheduler
/// tick, event triggers, queue drains) without cancelling in-flight runs.
#[derive(Clone, Debug, Default)]
pub struct PauseSwitch {
    paused: Arc<AtomicBool>,
}

impl PauseSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub paused: bool,
    pub heartbeat_interval_ms: u64,
}

struct SchedulerInner {
    store: Arc<TaskStore>,
    queue: TaskQueue,
    bus: EventBus,
    pause: PauseSwitch,
    heartbeat_interval_ms: AtomicU64,
    state: Mutex<SchedulerState>,
    shutdown: Mutex<Option<CancellationToken>>,
}

/// Heartbeat-driven trigger evaluation plus event-trigger dispatch.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
}

impl TaskScheduler {
    pub fn new(
        store: Arc<TaskStore>,
        queue: TaskQueue,
        bus: EventBus,
        pause: PauseSwitch,
        heartbeat_interval_ms: u64,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                queue,
                bus,
                pause,
                heartbeat_interval_ms: AtomicU64::new(heartbeat_interval_ms.max(1)),
                state: Mutex::new(SchedulerState::Stopped),
                shutdown: Mutex::new(None),
            }),
        }
    }

    pub async fn start(&self) {
        {
            let mut state = self.lock_state();
            if *state != SchedulerState::Stopped {
                return;
            }
            *state = SchedulerState::Starting;
        }
        let cancel = CancellationToken::new();
        *self.lock_shutdown() = Some(cancel.clone());
        tokio::spawn(heartbeat_loop(self.clone(), cancel.clone()));
        tokio::spawn(trigger_listener(self.clone(), cancel));
        *self.lock_state() = SchedulerState::Running;
        self.tick().await;
    }

    /// One trigger-evaluation pass. No-op while paused.
    pub async fn tick(&self) {
        if self.inner.pause.is_paused() {
            return;
        }
        let due = match self.inner.store.list_due(Utc::now()).await {
            Ok(due) => due,
            Err(err) => {
                tracing::warn!(error = %err, "listDue failed, skipping tick");
                return;
            }
        };
        for task in &due {
            self.inner.queue.enqueue(task).await;
        }
        self.inner.queue.drain().await;
    }

    pub fn pause(&self) {
        self.inner.pause.pause();
        tracing::info!("scheduler paused");
    }

    pub fn resume(&self) {
        if *self.lock_state() != SchedulerState::Running {
            return;
        }
        self.inner.pause.resume();
        tracing::info!("scheduler resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.inner.pause.is_paused()
    }

    pub async fn stop(&self) {
        {
            let mut state = self.lock_state();
            if *state != SchedulerState::Running && *state != SchedulerState::Starting {
                return;
            }
            *state = SchedulerState::Stopping;
        }
        if let Some(cancel) = self.lock_shutdown().take() {
            cancel.cancel();
        }
        *self.lock_state() = SchedulerState::Stopped;
    }

    /// New interval takes effect on the next heartbeat round.
    pub fn update_config(&self, heartbeat_interval_ms: u64) {
        self.inner
            .heartbeat_interval_ms
            .store(heartbeat_interval_ms.max(1), Ordering::SeqCst);
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            state: *self.lock_state(),
            paused: self.inner.pause.is_paused(),
            heartbeat_interval_ms: self.inner.heartbeat_interval_ms.load(Ordering::SeqCst),
        }
    }

    /// Stamp every scheduled task waiting on this trigger as due now and
    /// dispatch. Handler errors are logged and do not detach the listener.
    async fn handle_trigger(&self, event_name: &str) -> SchedulerResult<()> {
        if self.inner.pause.is_paused() {
            return Ok(());
        }
        let scheduled = self
            .inner
            .store
            .list_by_status(TaskStatus::Scheduled, None)
            .await?;
        let now = Utc::now();
        for task in scheduled {
            if task.schedule.event_trigger.as_deref() != Some(event_name) {
                continue;
            }
            let updated = self
                .inner
                .store
                .update(
                    &task.id,
                    TaskPatch {
                        next_run_at: Some(Some(now)),
                        ..TaskPatch::default()
                    },
                )
                .await?;
            self.inner.queue.enqueue(&updated).await;
        }
        self.inner.queue.drain().await;
        Ok(())
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SchedulerState> {
        self.inner.state.lock().expect("scheduler state poisoned")
    }

    fn lock_shutdown(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.inner
            .shutdown
            .lock()
            .expect("scheduler shutdown handle poisoned")
    }
}

async fn heartbeat_loop(scheduler: TaskScheduler, cancel: CancellationToken) {
    loop {
        let interval_ms = scheduler
            .inner
            .heartbeat_interval_ms
            .load(Ordering::SeqCst);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_millis(interval_ms)) => {
                scheduler.tick().await;
            }
        }
    }
}

async fn trigger_listener(scheduler: TaskScheduler, cancel: CancellationToken) {
    let mut rx = scheduler.inner.bus.subscribe();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = rx.recv() => match received {
                Ok(event) => {
                    // Lifecycle events never act as triggers.
                    if event.name.starts_with("task:") {
                        continue;
                    }
                    if let Err(err) = scheduler.handle_trigger(&event.name).await {
                        tracing::warn!(event = %event.name, error = %err, "event trigger handler failed");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "trigger listener lagged behind the bus");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_switch_toggles() {
        let pause = PauseSwitch::new();
        assert!(!pause.is_paused());
        pause.pause();
        assert!(pause.is_paused());
        // Clones observe the same flag.
        let clone = pause.clone();
        clone.resume();
        assert!(!pause.is_paused());
    }
}
