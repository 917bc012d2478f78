use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use spaceduck_types::{BudgetLimit, BudgetSnapshot, Task, TaskBudget, TokenUsage};

use crate::event_bus::EventBus;

/// Resolved per-run limits. A value of zero means unlimited for that
/// dimension.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BudgetDefaults {
    pub max_tokens: u64,
    pub max_cost_usd: f64,
    pub max_wall_clock_ms: u64,
    pub max_tool_calls: u32,
    pub max_memory_writes: u32,
}

impl Default for BudgetDefaults {
    fn default() -> Self {
        Self {
            max_tokens: 100_000,
            max_cost_usd: 1.0,
            max_wall_clock_ms: 300_000,
            max_tool_calls: 25,
            max_memory_writes: 10,
        }
    }
}

/// Task overrides win field-by-field over the scheduler defaults.
pub fn resolve_budget(overrides: &TaskBudget, defaults: &BudgetDefaults) -> BudgetDefaults {
    BudgetDefaults {
        max_tokens: overrides.max_tokens.unwrap_or(defaults.max_tokens),
        max_cost_usd: overrides.max_cost_usd.unwrap_or(defaults.max_cost_usd),
        max_wall_clock_ms: overrides
            .max_wall_clock_ms
            .unwrap_or(defaults.max_wall_clock_ms),
        max_tool_calls: overrides.max_tool_calls.unwrap_or(defaults.max_tool_calls),
        max_memory_writes: overrides
            .max_memory_writes
            .unwrap_or(defaults.max_memory_writes),
    }
}

const WARN_THRESHOLD: f64 = 0.8;

struct GuardState {
    tokens_used: u64,
    cost_usd: f64,
    tool_calls: u32,
    memory_writes: u32,
    warned: bool,
    aborted: Option<BudgetLimit>,
    timer: Option<JoinHandle<()>>,
}

struct GuardShared {
    task: Task,
    limits: BudgetDefaults,
    bus: EventBus,
    cancel: CancellationToken,
    started: Instant,
    state: Mutex<GuardState>,
}

/// Live accounting for one run. Owned by a single `TaskRunner` invocation;
/// owns the cancellation signal handed to the agent stream and the
/// wall-clock timer. `dispose` must be called on every terminal path.
#[derive(Clone)]
pub struct BudgetGuard {
    shared: Arc<GuardShared>,
}

impl BudgetGuard {
    pub fn new(task: Task, limits: BudgetDefaults, bus: EventBus) -> Self {
        let guard = Self {
            shared: Arc::new(GuardShared {
                task,
                limits,
                bus,
                cancel: CancellationToken::new(),
                started: Instant::now(),
                state: Mutex::new(GuardState {
                    tokens_used: 0,
                    cost_usd: 0.0,
                    tool_calls: 0,
                    memory_writes: 0,
                    warned: false,
                    aborted: None,
                    timer: None,
                }),
            }),
        };
        if limits.max_wall_clock_ms > 0 {
            let timer_guard = guard.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(timer_guard.shared.limits.max_wall_clock_ms))
                    .await;
                timer_guard.abort(BudgetLimit::WallClock);
            });
            guard.lock_state().timer = Some(handle);
        }
        guard
    }

    pub fn signal(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        let state = self.lock_state();
        self.snapshot_locked(&state)
    }

    pub fn aborted_reason(&self) -> Option<BudgetLimit> {
        self.lock_state().aborted
    }

    /// Estimate streamed text as one token per three characters.
    pub fn track_chars(&self, chars: usize) {
        let mut state = self.lock_state();
        state.tokens_used += (chars as u64).div_ceil(3);
        self.check_thresholds(state);
    }

    pub fn track_exact_tokens(&self, tokens: u64) {
        let mut state = self.lock_state();
        state.tokens_used += tokens;
        self.check_thresholds(state);
    }

    /// Overwrite the running estimate with provider-reported usage, and the
    /// cost estimate when pricing is available.
    pub fn replace_with_exact_usage(&self, usage: &TokenUsage, cost: Option<f64>) {
        let mut state = self.lock_state();
        state.tokens_used = usage.input_tokens + usage.output_tokens;
        if let Some(cost) = cost {
            state.cost_usd = cost;
        }
        self.check_thresholds(state);
    }

    pub fn track_cost(&self, cost_usd: f64) {
        let mut state = self.lock_state();
        state.cost_usd += cost_usd;
        self.check_thresholds(state);
    }

    pub fn track_tool_call(&self) {
        let mut state = self.lock_state();
        state.tool_calls += 1;
        let over = self.shared.limits.max_tool_calls > 0
            && state.tool_calls >= self.shared.limits.max_tool_calls;
        drop(state);
        if over {
            self.abort(BudgetLimit::ToolCalls);
        }
    }

    pub fn track_memory_write(&self) {
        let mut state = self.lock_state();
        state.memory_writes += 1;
        let over = self.shared.limits.max_memory_writes > 0
            && state.memory_writes >= self.shared.limits.max_memory_writes;
        drop(state);
        if over {
            self.abort(BudgetLimit::MemoryWrites);
        }
    }

    /// True once the memory-write limit is reached. A zero limit never
    /// exhausts.
    pub fn memory_writes_budget_exhausted(&self) -> bool {
        let state = self.lock_state();
        self.shared.limits.max_memory_writes > 0
            && state.memory_writes >= self.shared.limits.max_memory_writes
    }

    /// Abort the run: stop the timer, emit one `task:budget_exceeded`, and
    /// cancel the signal. Idempotent.
    pub fn abort(&self, reason: BudgetLimit) {
        let (snapshot, timer) = {
            let mut state = self.lock_state();
            if state.aborted.is_some() {
                return;
            }
            state.aborted = Some(reason);
            let timer = state.timer.take();
            (self.snapshot_locked(&state), timer)
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        self.shared.bus.emit(
            "task:budget_exceeded",
            json!({
                "task": self.shared.task,
                "snapshot": snapshot,
                "limitExceeded": reason,
            }),
        );
        self.shared.cancel.cancel();
    }

    /// Release the wall-clock timer. Idempotent; required on every terminal
    /// path.
    pub fn dispose(&self) {
        let timer = self.lock_state().timer.take();
        if let Some(timer) = timer {
            timer.abort();
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, GuardState> {
        self.shared.state.lock().expect("budget guard lock poisoned")
    }

    fn snapshot_locked(&self, state: &GuardState) -> BudgetSnapshot {
        BudgetSnapshot {
            tokens_used: state.tokens_used,
            estimated_cost_usd: state.cost_usd,
            wall_clock_ms: self.shared.started.elapsed().as_millis() as u64,
            tool_calls_made: state.tool_calls,
            memory_writes_made: state.memory_writes,
        }
    }

    fn check_thresholds(&self, mut state: std::sync::MutexGuard<'_, GuardState>) {
        let limits = &self.shared.limits;
        let token_pct = if limits.max_tokens > 0 {
            state.tokens_used as f64 / limits.max_tokens as f64
        } else {
            0.0
        };
        let cost_pct = if limits.max_cost_usd > 0.0 {
            state.cost_usd / limits.max_cost_usd
        } else {
            0.0
        };
        let peak = token_pct.max(cost_pct);

        // Reaching a limit exactly warns; only going past it aborts, so an
        // estimate that lands on the limit still lets exact usage decide.
        let mut warn_snapshot = None;
        if peak >= WARN_THRESHOLD && !state.warned {
            state.warned = true;
            warn_snapshot = Some(self.snapshot_locked(&state));
        }
        let abort_reason = if token_pct > 1.0 {
            Some(BudgetLimit::Tokens)
        } else if cost_pct > 1.0 {
            Some(BudgetLimit::Cost)
        } else {
            None
        };
        drop(state);

        if let Some(snapshot) = warn_snapshot {
            self.shared.bus.emit(
                "task:budget_warning",
                json!({
                    "task": self.shared.task,
                    "snapshot": snapshot,
                    "thresholdPct": (peak * 100.0).round(),
                }),
            );
        }
        if let Some(reason) = abort_reason {
            self.abort(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spaceduck_types::{
        ResultRoute, TaskDefinition, TaskSchedule, TaskStatus, TaskType,
    };

    fn sample_task() -> Task {
        let now = chrono::Utc::now();
        Task {
            id: "task-1".to_string(),
            definition: TaskDefinition {
                task_type: TaskType::Scheduled,
                name: "sample".to_string(),
                prompt: "do the thing".to_string(),
                system_prompt: None,
                conversation_id: None,
                allowed_tools: None,
                denied_tools: None,
                result_route: ResultRoute::Silent,
            },
            schedule: TaskSchedule::default(),
            budget: TaskBudget::default(),
            status: TaskStatus::Running,
            priority: 0,
            next_run_at: None,
            last_run_at: None,
            retry_count: 0,
            max_retries: 3,
            created_at: now,
            updated_at: now,
            last_error: None,
            last_budget: None,
        }
    }

    fn limits() -> BudgetDefaults {
        BudgetDefaults {
            max_tokens: 100,
            max_cost_usd: 1.0,
            max_wall_clock_ms: 0,
            max_tool_calls: 2,
            max_memory_writes: 2,
        }
    }

    fn drain_names(rx: &mut tokio::sync::broadcast::Receiver<spaceduck_types::GatewayEvent>) -> Vec<String> {
        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name);
        }
        names
    }

    #[tokio::test]
    async fn warning_emitted_once_at_eighty_percent() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let guard = BudgetGuard::new(sample_task(), limits(), bus);

        guard.track_exact_tokens(80);
        guard.track_exact_tokens(10);
        let names = drain_names(&mut rx);
        assert_eq!(
            names.iter().filter(|n| *n == "task:budget_warning").count(),
            1
        );
        assert!(guard.aborted_reason().is_none());
        guard.dispose();
    }

    #[tokio::test]
    async fn token_limit_aborts_exactly_once() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let guard = BudgetGuard::new(sample_task(), limits(), bus);

        guard.track_exact_tokens(150);
        guard.track_exact_tokens(1);
        assert_eq!(guard.aborted_reason(), Some(BudgetLimit::Tokens));
        assert!(guard.signal().is_cancelled());
        let names = drain_names(&mut rx);
        assert_eq!(
            names.iter().filter(|n| *n == "task:budget_exceeded").count(),
            1
        );
        guard.dispose();
    }

    #[tokio::test]
    async fn tool_call_limit_aborts_at_count() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let guard = BudgetGuard::new(sample_task(), limits(), bus);

        guard.track_tool_call();
        assert!(guard.aborted_reason().is_none());
        guard.track_tool_call();
        assert_eq!(guard.aborted_reason(), Some(BudgetLimit::ToolCalls));
        assert_eq!(guard.snapshot().tool_calls_made, 2);
        let names = drain_names(&mut rx);
        assert_eq!(
            names.iter().filter(|n| *n == "task:budget_exceeded").count(),
            1
        );
        guard.dispose();
    }

    #[tokio::test]
    async fn exact_usage_overwrites_char_estimate() {
        let bus = EventBus::new();
        let guard = BudgetGuard::new(
            sample_task(),
            BudgetDefaults {
                max_tokens: 0,
                ..limits()
            },
            bus,
        );
        guard.track_chars(300);
        assert_eq!(guard.snapshot().tokens_used, 100);
        let usage = TokenUsage {
            input_tokens: 150,
            output_tokens: 5,
            total_tokens: 155,
            cache_read_tokens: None,
            cache_write_tokens: None,
        };
        guard.replace_with_exact_usage(&usage, Some(0.02));
        let snapshot = guard.snapshot();
        assert_eq!(snapshot.tokens_used, 155);
        assert!((snapshot.estimated_cost_usd - 0.02).abs() < 1e-12);
        guard.dispose();
    }

    #[tokio::test]
    async fn wall_clock_timer_aborts() {
        let bus = EventBus::new();
        let guard = BudgetGuard::new(
            sample_task(),
            BudgetDefaults {
                max_wall_clock_ms: 20,
                ..limits()
            },
            bus,
        );
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(guard.aborted_reason(), Some(BudgetLimit::WallClock));
        assert!(guard.signal().is_cancelled());
        guard.dispose();
    }

    #[tokio::test]
    async fn memory_write_budget_exhaustion() {
        let bus = EventBus::new();
        let guard = BudgetGuard::new(sample_task(), limits(), bus);
        assert!(!guard.memory_writes_budget_exhausted());
        guard.track_memory_write();
        assert!(!guard.memory_writes_budget_exhausted());
        guard.track_memory_write();
        assert!(guard.memory_writes_budget_exhausted());
        assert_eq!(guard.aborted_reason(), Some(BudgetLimit::MemoryWrites));
        guard.dispose();

        let unlimited = BudgetGuard::new(
            sample_task(),
            BudgetDefaults {
                max_memory_writes: 0,
                max_wall_clock_ms: 0,
                ..BudgetDefaults::default()
            },
            EventBus::new(),
        );
        unlimited.track_memory_write();
        assert!(!unlimited.memory_writes_budget_exhausted());
        unlimited.dispose();
    }

    #[tokio::test]
    async fn counters_are_monotone_and_dispose_is_idempotent() {
        let bus = EventBus::new();
        let guard = BudgetGuard::new(sample_task(), limits(), bus);
        guard.track_chars(10);
        let first = guard.snapshot();
        guard.track_chars(10);
        let second = guard.snapshot();
        assert!(second.tokens_used >= first.tokens_used);
        assert!(second.wall_clock_ms >= first.wall_clock_ms);
        guard.dispose();
        guard.dispose();
    }

    #[test]
    fn resolve_prefers_task_overrides() {
        let defaults = BudgetDefaults::default();
        let overrides = TaskBudget {
            max_tokens: Some(50),
            max_tool_calls: Some(2),
            ..TaskBudget::default()
        };
        let resolved = resolve_budget(&overrides, &defaults);
        assert_eq!(resolved.max_tokens, 50);
        assert_eq!(resolved.max_tool_calls, 2);
        assert_eq!(resolved.max_cost_usd, defaults.max_cost_usd);
        assert_eq!(resolved.max_memory_writes, defaults.max_memory_writes);
    }
}
