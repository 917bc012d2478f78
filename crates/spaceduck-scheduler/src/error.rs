use spaceduck_types::{BudgetLimit, BudgetSnapshot};
use thiserror::Error;

/// Errors produced by the scheduler core.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("invalid cron expression `{expr}`: {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("task not found: {0}")]
    NotFound(String),

    #[error("invalid task input: {0}")]
    InvalidInput(String),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Failure of one task run. The budget variant is matched by kind at the
/// queue boundary; its message still contains "Budget exceeded" for
/// consumers that only see strings.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("Budget exceeded: {limit}")]
    BudgetExceeded {
        limit: BudgetLimit,
        snapshot: BudgetSnapshot,
        partial_response: String,
    },

    #[error(transparent)]
    Agent(#[from] anyhow::Error),
}

impl RunError {
    pub fn is_budget_exceeded(&self) -> bool {
        matches!(self, RunError::BudgetExceeded { .. })
    }

    pub fn snapshot(&self) -> Option<&BudgetSnapshot> {
        match self {
            RunError::BudgetExceeded { snapshot, .. } => Some(snapshot),
            RunError::Agent(_) => None,
        }
    }
}
