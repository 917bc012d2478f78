use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::Level;

use spaceduck_observability::{emit_event, ObservabilityEvent, ProcessKind};
use spaceduck_types::{RunStatus, Task, TaskStatus};

use crate::error::RunError;
use crate::event_bus::EventBus;
use crate::global_budget::GlobalBudgetGuard;
use crate::run_lock::RunLockMap;
use crate::runner::{ChainDirective, TaskRunner};
use crate::scheduler::PauseSwitch;
use crate::store::{TaskPatch, TaskStore};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueSettings {
    pub max_concurrent: usize,
    /// Create-time default for tasks that do not set their own bound.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            max_retries: 3,
            backoff_base_ms: 30_000,
            backoff_max_ms: 3_600_000,
        }
    }
}

struct QueueInner {
    settings: QueueSettings,
    store: Arc<TaskStore>,
    runner: Arc<TaskRunner>,
    global_budget: Arc<GlobalBudgetGuard>,
    bus: EventBus,
    pause: PauseSwitch,
    active: AtomicUsize,
    draining: AtomicBool,
    run_locks: RunLockMap,
    chained_context: tokio::sync::Mutex<HashMap<String, String>>,
}

/// Concurrency-bounded dispatch loop. Claims atomically from the store,
/// serializes runs per conversation, and applies the retry/dead-letter
/// policy.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl TaskQueue {
    pub fn new(
        settings: QueueSettings,
        store: Arc<TaskStore>,
        runner: Arc<TaskRunner>,
        global_budget: Arc<GlobalBudgetGuard>,
        bus: EventBus,
        pause: PauseSwitch,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                settings,
                store,
                runner,
                global_budget,
                bus,
                pause,
                active: AtomicUsize::new(0),
                draining: AtomicBool::new(false),
                run_locks: RunLockMap::new(),
                chained_context: tokio::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub async fn enqueue(&self, task: &Task) {
        self.inner
            .bus
            .emit("task:scheduled", json!({ "task": task }));
        self.drain().await;
    }

    /// Claim and dispatch until the concurrency bound is hit or nothing is
    /// due. Reentrant calls while a drain is in flight are absorbed by the
    /// latch; every task completion re-invokes drain.
    pub fn drain(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            if self.inner.draining.swap(true, Ordering::SeqCst) {
                return;
            }
            while !self.inner.pause.is_paused()
                && self.inner.active.load(Ordering::SeqCst) < self.inner.settings.max_concurrent
            {
                let claimed = match self.inner.store.claim(Utc::now()).await {
                    Ok(claimed) => claimed,
                    Err(err) => {
                        tracing::warn!(error = %err, "claim failed, skipping this drain pass");
                        break;
                    }
                };
                let Some(task) = claimed else { break };
                self.inner.active.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(run_claimed(self.clone(), task));
            }
            self.inner.draining.store(false, Ordering::SeqCst);
        })
    }

    async fn execute(&self, task: Task) {
        let _lane = match &task.definition.conversation_id {
            Some(id) => Some(self.inner.run_locks.acquire(id).await),
            None => None,
        };
        self.inner.bus.emit("task:started", json!({ "task": task }));

        let chained = self.inner.chained_context.lock().await.remove(&task.id);
        match self.inner.runner.run(&task, chained).await {
            Ok(outcome) => {
                let completed = self
                    .inner
                    .store
                    .complete(&task.id, &outcome.snapshot, Some(&outcome.response))
                    .await;
                match completed {
                    Ok(updated) => {
                        self.inner.bus.emit(
                            "task:completed",
                            json!({ "task": updated, "snapshot": outcome.snapshot }),
                        );
                        if let Some(chain) = outcome.chain {
                            self.apply_chain(chain).await;
                        }
                        if let Err(err) = self
                            .inner
                            .global_budget
                            .check_and_enforce(&updated, &outcome.snapshot)
                            .await
                        {
                            tracing::warn!(error = %err, "global budget check failed");
                        }
                    }
                    Err(err) => {
                        tracing::error!(task_id = %task.id, error = %err, "failed to record completion");
                    }
                }
            }
            Err(err) => self.handle_failure(&task, err).await,
        }
    }

    async fn handle_failure(&self, task: &Task, err: RunError) {
        let budget_exceeded = err.is_budget_exceeded();
        let snapshot = err.snapshot().copied().unwrap_or_default();
        let message = err.to_string();

        // The task's own bound governs; zero means dead-letter on the first
        // failure.
        if budget_exceeded || task.retry_count >= task.max_retries {
            let run_status = if budget_exceeded {
                RunStatus::BudgetExceeded
            } else {
                RunStatus::Failed
            };
            match self
                .inner
                .store
                .dead_letter(&task.id, &message, &snapshot, run_status)
                .await
            {
                Ok(updated) => {
                    emit_event(
                        Level::ERROR,
                        ProcessKind::Scheduler,
                        ObservabilityEvent {
                            event: "task.dead_letter",
                            component: "scheduler.queue",
                            task_id: Some(&task.id),
                            run_id: None,
                            conversation_id: task.definition.conversation_id.as_deref(),
                            model_id: None,
                            status: Some("dead_letter"),
                            error_code: budget_exceeded.then_some("budget_exceeded"),
                            detail: Some(&message),
                        },
                    );
                    self.inner
                        .bus
                        .emit("task:dead_letter", json!({ "task": updated, "error": message }));
                }
                Err(store_err) => {
                    tracing::error!(task_id = %task.id, error = %store_err, "failed to dead-letter task");
                }
            }
            return;
        }

        match self.inner.store.fail(&task.id, &message, &snapshot).await {
            Ok(updated) => {
                self.inner.bus.emit(
                    "task:failed",
                    json!({
                        "task": updated,
                        "error": message,
                        "retryCount": updated.retry_count,
                    }),
                );
                let backoff = compute_backoff_ms(&self.inner.settings, task.retry_count);
                let next = Utc::now() + chrono::Duration::milliseconds(backoff as i64);
                if let Err(err) = self
                    .inner
                    .store
                    .update(
                        &task.id,
                        TaskPatch {
                            status: Some(TaskStatus::Scheduled),
                            next_run_at: Some(Some(next)),
                            ..TaskPatch::default()
                        },
                    )
                    .await
                {
                    tracing::error!(task_id = %task.id, error = %err, "failed to reschedule retry");
                }
            }
            Err(err) => {
                tracing::error!(task_id = %task.id, error = %err, "failed to record failure");
            }
        }
    }

    /// Re-arm the chained task as due now, stashing this run's response as
    /// its chained context when requested.
    async fn apply_chain(&self, directive: ChainDirective) {
        let target = match self.inner.store.get(&directive.task_definition_id).await {
            Ok(Some(target)) => target,
            Ok(None) => {
                tracing::warn!(
                    target = %directive.task_definition_id,
                    "chain_next target does not exist"
                );
                return;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to load chain_next target");
                return;
            }
        };
        if target.status == TaskStatus::Running {
            tracing::warn!(target = %target.id, "chain_next target is already running, skipping");
            return;
        }
        if let Some(context) = directive.context {
            self.inner
                .chained_context
                .lock()
                .await
                .insert(target.id.clone(), context);
        }
        match self
            .inner
            .store
            .update(
                &target.id,
                TaskPatch {
                    status: Some(TaskStatus::Scheduled),
                    next_run_at: Some(Some(Utc::now())),
                    ..TaskPatch::default()
                },
            )
            .await
        {
            Ok(updated) => self.enqueue(&updated).await,
            Err(err) => {
                tracing::warn!(target = %target.id, error = %err, "failed to arm chain_next target");
            }
        }
    }
}

async fn run_claimed(queue: TaskQueue, task: Task) {
    queue.execute(task).await;
    queue.inner.active.fetch_sub(1, Ordering::SeqCst);
    queue.drain().await;
}

fn compute_backoff_ms(settings: &QueueSettings, retry_count: u32) -> u64 {
    let factor = 2u64.checked_pow(retry_count).unwrap_or(u64::MAX);
    settings
        .backoff_base_ms
        .saturating_mul(factor)
        .min(settings.backoff_max_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let settings = QueueSettings {
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
            ..QueueSettings::default()
        };
        assert_eq!(compute_backoff_ms(&settings, 0), 100);
        assert_eq!(compute_backoff_ms(&settings, 1), 200);
        assert_eq!(compute_backoff_ms(&settings, 2), 400);
        assert_eq!(compute_backoff_ms(&settings, 3), 800);
        assert_eq!(compute_backoff_ms(&settings, 4), 1_000);
        assert_eq!(compute_backoff_ms(&settings, 63), 1_000);
        assert_eq!(compute_backoff_ms(&settings, 200), 1_000);
    }
}
