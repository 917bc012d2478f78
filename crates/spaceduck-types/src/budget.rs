use serde::{Deserialize, Serialize};

/// Provider-reported token usage for one completion.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_write_tokens: Option<u64>,
}

/// Per-task budget overrides. Unset fields fall back to scheduler defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskBudget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_wall_clock_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tool_calls: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_writes: Option<u32>,
}

/// Accounting for one run. All counters are monotonic within a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetSnapshot {
    pub tokens_used: u64,
    pub estimated_cost_usd: f64,
    pub wall_clock_ms: u64,
    pub tool_calls_made: u32,
    pub memory_writes_made: u32,
}

/// Which limit an abort or breach was attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetLimit {
    Tokens,
    Cost,
    WallClock,
    ToolCalls,
    MemoryWrites,
    GlobalDaily,
    GlobalMonthly,
}

impl BudgetLimit {
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetLimit::Tokens => "tokens",
            BudgetLimit::Cost => "cost",
            BudgetLimit::WallClock => "wall_clock",
            BudgetLimit::ToolCalls => "tool_calls",
            BudgetLimit::MemoryWrites => "memory_writes",
            BudgetLimit::GlobalDaily => "global_daily",
            BudgetLimit::GlobalMonthly => "global_monthly",
        }
    }
}

impl std::fmt::Display for BudgetLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
