use serde::{Deserialize, Serialize};

use crate::budget::BudgetDefaults;
use crate::global_budget::GlobalBudgetConfig;
use crate::queue::QueueSettings;

/// Scheduler configuration as loaded by the gateway's config layer. Every
/// field has a default so partial documents deserialize cleanly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SchedulerSettings {
    pub heartbeat_interval_ms: u64,
    /// Model the agent loop is configured with; used to price usage chunks.
    pub model_id: String,
    pub queue: QueueSettings,
    pub default_budget: BudgetDefaults,
    pub global_budget: GlobalBudgetConfig,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            model_id: "claude-3-5-sonnet-latest".to_string(),
            queue: QueueSettings::default(),
            default_budget: BudgetDefaults::default(),
            global_budget: GlobalBudgetConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_documents_fill_defaults() {
        let settings: SchedulerSettings = serde_json::from_str(
            r#"{"heartbeatIntervalMs": 5000, "queue": {"maxConcurrent": 2}}"#,
        )
        .expect("deserialize");
        assert_eq!(settings.heartbeat_interval_ms, 5_000);
        assert_eq!(settings.queue.max_concurrent, 2);
        assert_eq!(settings.queue.max_retries, QueueSettings::default().max_retries);
        assert_eq!(settings.model_id, "claude-3-5-sonnet-latest");
        assert_eq!(settings.global_budget.daily_limit_usd, 0.0);
    }
}
