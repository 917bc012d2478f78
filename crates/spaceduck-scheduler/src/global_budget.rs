use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::json;

use spaceduck_types::{BudgetLimit, BudgetSnapshot, Task};

use crate::error::SchedulerResult;
use crate::event_bus::EventBus;
use crate::scheduler::PauseSwitch;
use crate::store::{SpendPeriod, TaskStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LimitPolicy {
    PauseAll,
    PauseNonCritical,
    AlertOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GlobalBudgetConfig {
    /// Zero disables the limit for that period.
    pub daily_limit_usd: f64,
    pub monthly_limit_usd: f64,
    /// Warning thresholds as fractions of a period limit.
    pub alert_thresholds: Vec<f64>,
    pub on_limit_reached: LimitPolicy,
}

impl Default for GlobalBudgetConfig {
    fn default() -> Self {
        Self {
            daily_limit_usd: 0.0,
            monthly_limit_usd: 0.0,
            alert_thresholds: vec![0.5, 0.8, 0.95],
            on_limit_reached: LimitPolicy::PauseAll,
        }
    }
}

struct RolloverState {
    emitted: HashSet<(String, String)>,
    day_key: String,
    month_key: String,
}

/// Rolls completed-run spend up against daily and monthly USD limits. A
/// breach pauses the scheduler (under the pause policies) while the run
/// that triggered it still completes normally.
pub struct GlobalBudgetGuard {
    config: GlobalBudgetConfig,
    store: Arc<TaskStore>,
    bus: EventBus,
    pause: PauseSwitch,
    state: Mutex<RolloverState>,
}

fn day_key() -> String {
    Local::now().format("%Y-%m-%d").to_string()
}

fn month_key() -> String {
    Local::now().format("%Y-%m").to_string()
}

impl GlobalBudgetGuard {
    pub fn new(
        config: GlobalBudgetConfig,
        store: Arc<TaskStore>,
        bus: EventBus,
        pause: PauseSwitch,
    ) -> Self {
        Self {
            config,
            store,
            bus,
            pause,
            state: Mutex::new(RolloverState {
                emitted: HashSet::new(),
                day_key: day_key(),
                month_key: month_key(),
            }),
        }
    }

    /// Clear all emitted alert keys (period rollover or manual reset).
    pub fn reset_thresholds(&self) {
        let mut state = self.state.lock().expect("global budget state poisoned");
        state.emitted.clear();
    }

    /// Check rolled-up spend after a completed run. Returns false when a
    /// limit was breached under a pause policy.
    pub async fn check_and_enforce(
        &self,
        task: &Task,
        snapshot: &BudgetSnapshot,
    ) -> SchedulerResult<bool> {
        let day_spend = self.store.sum_spend(SpendPeriod::Day).await?;
        let month_spend = self.store.sum_spend(SpendPeriod::Month).await?;

        let mut warnings = Vec::new();
        let mut breached = None;
        {
            let mut state = self.state.lock().expect("global budget state poisoned");
            // Lazy rollover: a new local day or month re-arms its alerts.
            let today = day_key();
            if state.day_key != today {
                state.day_key = today;
                state.emitted.retain(|(period, _)| period != "day");
            }
            let this_month = month_key();
            if state.month_key != this_month {
                state.month_key = this_month;
                state.emitted.retain(|(period, _)| period != "month");
            }

            for (period, spend, limit) in [
                ("day", day_spend, self.config.daily_limit_usd),
                ("month", month_spend, self.config.monthly_limit_usd),
            ] {
                if limit <= 0.0 {
                    continue;
                }
                for &threshold in &self.config.alert_thresholds {
                    if spend / limit < threshold {
                        continue;
                    }
                    let key = (period.to_string(), format!("{:.4}", threshold));
                    if state.emitted.insert(key) {
                        warnings.push((period, threshold, spend, limit));
                    }
                }
                if spend >= limit && breached.is_none() {
                    let key = (period.to_string(), "limit".to_string());
                    let fresh = state.emitted.insert(key);
                    let limit_kind = if period == "day" {
                        BudgetLimit::GlobalDaily
                    } else {
                        BudgetLimit::GlobalMonthly
                    };
                    breached = Some((limit_kind, fresh));
                }
            }
        }

        for (period, threshold, spend, limit) in warnings {
            tracing::warn!(
                period,
                spend,
                limit,
                threshold,
                "global budget threshold crossed"
            );
            self.bus.emit(
                "task:budget_warning",
                json!({
                    "task": task,
                    "snapshot": snapshot,
                    "thresholdPct": threshold * 100.0,
                    "period": period,
                }),
            );
        }

        if let Some((limit_kind, fresh)) = breached {
            if fresh {
                self.bus.emit(
                    "task:budget_exceeded",
                    json!({
                        "task": task,
                        "snapshot": snapshot,
                        "limitExceeded": limit_kind,
                    }),
                );
            }
            match self.config.on_limit_reached {
                LimitPolicy::PauseAll | LimitPolicy::PauseNonCritical => {
                    tracing::warn!(limit = %limit_kind, "global budget exhausted, pausing scheduler");
                    self.pause.pause();
                    return Ok(false);
                }
                LimitPolicy::AlertOnly => return Ok(true),
            }
        }
        Ok(true)
    }
}
