use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Local, NaiveTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;
use uuid::Uuid;

use spaceduck_types::{
    BudgetSnapshot, CreateTaskInput, RunStatus, Task, TaskDefinition, TaskRun, TaskSchedule,
    TaskStatus, TaskType,
};

use crate::cron::CronEvaluator;
use crate::error::{SchedulerError, SchedulerResult};

const DEFAULT_MAX_RETRIES: u32 = 3;

/// Ordered migrations; each entry bumps `scheduler_schema_version` by one.
const MIGRATIONS: &[&str] = &["
    CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        task_type TEXT NOT NULL,
        name TEXT NOT NULL,
        prompt TEXT NOT NULL,
        system_prompt TEXT,
        conversation_id TEXT,
        allowed_tools TEXT,
        denied_tools TEXT,
        result_route TEXT NOT NULL,
        cron TEXT,
        interval_ms INTEGER,
        event_trigger TEXT,
        run_immediately INTEGER NOT NULL DEFAULT 0,
        budget TEXT,
        status TEXT NOT NULL,
        priority INTEGER NOT NULL DEFAULT 0,
        next_run_at INTEGER,
        last_run_at INTEGER,
        retry_count INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL DEFAULT 3,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        last_error TEXT,
        last_budget TEXT
    );
    CREATE TABLE IF NOT EXISTS task_runs (
        id TEXT PRIMARY KEY,
        task_id TEXT NOT NULL,
        started_at INTEGER NOT NULL,
        completed_at INTEGER,
        status TEXT NOT NULL,
        error TEXT,
        tokens_used INTEGER NOT NULL DEFAULT 0,
        estimated_cost_usd REAL NOT NULL DEFAULT 0,
        wall_clock_ms INTEGER NOT NULL DEFAULT 0,
        tool_calls_made INTEGER NOT NULL DEFAULT 0,
        memory_writes_made INTEGER NOT NULL DEFAULT 0,
        result_text TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
    CREATE INDEX IF NOT EXISTS idx_tasks_due ON tasks(next_run_at) WHERE status = 'scheduled';
    CREATE INDEX IF NOT EXISTS idx_tasks_claim ON tasks(priority DESC, next_run_at ASC);
    CREATE INDEX IF NOT EXISTS idx_task_runs_task ON task_runs(task_id);
    CREATE INDEX IF NOT EXISTS idx_task_runs_completed ON task_runs(completed_at);
"];

const TASK_COLUMNS: &str = "id, task_type, name, prompt, system_prompt, conversation_id, \
    allowed_tools, denied_tools, result_route, cron, interval_ms, event_trigger, \
    run_immediately, budget, status, priority, next_run_at, last_run_at, retry_count, \
    max_retries, created_at, updated_at, last_error, last_budget";

const RUN_COLUMNS: &str = "id, task_id, started_at, completed_at, status, error, tokens_used, \
    estimated_cost_usd, wall_clock_ms, tool_calls_made, memory_writes_made, result_text";

/// Spend aggregation window, bounded by local wall-clock boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpendPeriod {
    Day,
    Month,
}

/// Partial update applied by `TaskStore::update`.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    /// `Some(None)` clears the field.
    pub next_run_at: Option<Option<DateTime<Utc>>>,
    pub priority: Option<u8>,
    pub max_retries: Option<u32>,
    pub name: Option<String>,
    pub prompt: Option<String>,
}

/// Durable task persistence over an embedded SQLite database. The single
/// connection behind a mutex gives claim its atomicity: a claim transaction
/// can never interleave with another writer.
pub struct TaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl TaskStore {
    pub async fn open(db_path: impl AsRef<Path>) -> SchedulerResult<Self> {
        let conn = Connection::open(db_path.as_ref())?;
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> SchedulerResult<Self> {
        Self::init(Connection::open_in_memory()?).await
    }

    async fn init(conn: Connection) -> SchedulerResult<Self> {
        conn.busy_timeout(Duration::from_secs(10))?;
        // PRAGMA journal_mode returns a row, so query_row and ignore it
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute("PRAGMA synchronous = NORMAL", [])?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> SchedulerResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS scheduler_schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;
        let current: i64 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM scheduler_schema_version",
            [],
            |row| row.get(0),
        )?;
        for (index, sql) in MIGRATIONS.iter().enumerate() {
            let version = index as i64 + 1;
            if version <= current {
                continue;
            }
            conn.execute_batch(&format!(
                "BEGIN;\n{}\nINSERT INTO scheduler_schema_version (version) VALUES ({});\nCOMMIT;",
                sql, version
            ))?;
        }
        Ok(())
    }

    pub async fn schema_version(&self) -> SchedulerResult<i64> {
        let conn = self.conn.lock().await;
        let version = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM scheduler_schema_version",
            [],
            |row| row.get(0),
        )?;
        Ok(version)
    }

    pub async fn create(&self, input: CreateTaskInput) -> SchedulerResult<Task> {
        if input.priority > 9 {
            return Err(SchedulerError::InvalidInput(format!(
                "priority must be in 0..=9, got {}",
                input.priority
            )));
        }
        let schedule = &input.schedule;
        if schedule.cron.is_some() && schedule.interval_ms.is_some() {
            return Err(SchedulerError::InvalidSchedule(
                "cron and intervalMs are mutually exclusive".to_string(),
            ));
        }
        if let Some(expr) = &schedule.cron {
            CronEvaluator::validate(expr)?;
        }
        if schedule.interval_ms == Some(0) {
            return Err(SchedulerError::InvalidSchedule(
                "intervalMs must be positive".to_string(),
            ));
        }

        let now = Utc::now();
        let has_schedule = schedule.is_present() || schedule.run_immediately;
        let status = if has_schedule {
            TaskStatus::Scheduled
        } else {
            TaskStatus::Pending
        };
        let next_run_at = if !has_schedule {
            None
        } else if schedule.run_immediately {
            Some(now)
        } else if let Some(expr) = &schedule.cron {
            Some(CronEvaluator::next_run(expr, now)?)
        } else {
            schedule
                .interval_ms
                .map(|ms| now + chrono::Duration::milliseconds(ms as i64))
        };

        let task = Task {
            id: Uuid::new_v4().to_string(),
            definition: input.definition,
            schedule: input.schedule,
            budget: input.budget,
            status,
            priority: input.priority,
            next_run_at,
            last_run_at: None,
            retry_count: 0,
            max_retries: input.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            created_at: now,
            updated_at: now,
            last_error: None,
            last_budget: None,
        };

        let conn = self.conn.lock().await;
        conn.execute(
            &format!(
                "INSERT INTO tasks ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, \
                 ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)",
                TASK_COLUMNS
            ),
            params![
                task.id,
                task.definition.task_type.as_str(),
                task.definition.name,
                task.definition.prompt,
                task.definition.system_prompt,
                task.definition.conversation_id,
                to_json_opt(&task.definition.allowed_tools)?,
                to_json_opt(&task.definition.denied_tools)?,
                serde_json::to_string(&task.definition.result_route)?,
                task.schedule.cron,
                task.schedule.interval_ms.map(|ms| ms as i64),
                task.schedule.event_trigger,
                task.schedule.run_immediately as i64,
                serde_json::to_string(&task.budget)?,
                task.status.as_str(),
                task.priority as i64,
                task.next_run_at.map(to_ms),
                task.last_run_at.map(to_ms),
                task.retry_count as i64,
                task.max_retries as i64,
                to_ms(task.created_at),
                to_ms(task.updated_at),
                task.last_error,
                Option::<String>::None,
            ],
        )?;
        Ok(task)
    }

    pub async fn get(&self, id: &str) -> SchedulerResult<Option<Task>> {
        let conn = self.conn.lock().await;
        get_task(&conn, id)
    }

    pub async fn update(&self, id: &str, patch: TaskPatch) -> SchedulerResult<Task> {
        let now = Utc::now();
        let conn = self.conn.lock().await;
        let mut task = get_task(&conn, id)?.ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
        if let Some(status) = patch.status {
            task.status = status;
        }
        if let Some(next_run_at) = patch.next_run_at {
            task.next_run_at = next_run_at;
        }
        if let Some(priority) = patch.priority {
            if priority > 9 {
                return Err(SchedulerError::InvalidInput(format!(
                    "priority must be in 0..=9, got {}",
                    priority
                )));
            }
            task.priority = priority;
        }
        if let Some(max_retries) = patch.max_retries {
            task.max_retries = max_retries;
        }
        if let Some(name) = patch.name {
            task.definition.name = name;
        }
        if let Some(prompt) = patch.prompt {
            task.definition.prompt = prompt;
        }
        task.updated_at = now;
        conn.execute(
            "UPDATE tasks SET status = ?2, next_run_at = ?3, priority = ?4, max_retries = ?5, \
             name = ?6, prompt = ?7, updated_at = ?8 WHERE id = ?1",
            params![
                id,
                task.status.as_str(),
                task.next_run_at.map(to_ms),
                task.priority as i64,
                task.max_retries as i64,
                task.definition.name,
                task.definition.prompt,
                to_ms(now),
            ],
        )?;
        Ok(task)
    }

    /// Atomically select the most eligible due task and transition it to
    /// `running`, opening its `task_runs` row in the same transaction. Two
    /// concurrent claims never return the same task.
    pub async fn claim(&self, now: DateTime<Utc>) -> SchedulerResult<Option<Task>> {
        let now_ms = to_ms(now);
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let claimed = tx
            .query_row(
                &format!(
                    "SELECT {} FROM tasks WHERE status = 'scheduled' AND next_run_at IS NOT NULL \
                     AND next_run_at <= ?1 ORDER BY priority DESC, next_run_at ASC, id ASC LIMIT 1",
                    TASK_COLUMNS
                ),
                params![now_ms],
                map_task_row,
            )
            .optional()?;
        let Some(mut task) = claimed else {
            return Ok(None);
        };
        tx.execute(
            "UPDATE tasks SET status = 'running', last_run_at = ?2, updated_at = ?2 WHERE id = ?1",
            params![task.id, now_ms],
        )?;
        tx.execute(
            "INSERT INTO task_runs (id, task_id, started_at, status) VALUES (?1, ?2, ?3, 'running')",
            params![Uuid::new_v4().to_string(), task.id, now_ms],
        )?;
        tx.commit()?;
        task.status = TaskStatus::Running;
        task.last_run_at = Some(now);
        task.updated_at = now;
        Ok(Some(task))
    }

    /// Non-mutating preview of eligible tasks, in claim order.
    pub async fn list_due(&self, now: DateTime<Utc>) -> SchedulerResult<Vec<Task>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tasks WHERE status = 'scheduled' AND next_run_at IS NOT NULL \
             AND next_run_at <= ?1 ORDER BY priority DESC, next_run_at ASC, id ASC",
            TASK_COLUMNS
        ))?;
        let rows = stmt.query_map(params![to_ms(now)], map_task_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn list_by_status(
        &self,
        status: TaskStatus,
        limit: Option<usize>,
    ) -> SchedulerResult<Vec<Task>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tasks WHERE status = ?1 ORDER BY updated_at DESC LIMIT ?2",
            TASK_COLUMNS
        ))?;
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let rows = stmt.query_map(params![status.as_str(), limit], map_task_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Record completion. Recurring tasks go back to `scheduled` with a
    /// fresh `next_run_at` and a reset retry count; one-shot tasks finish.
    pub async fn complete(
        &self,
        id: &str,
        snapshot: &BudgetSnapshot,
        result_text: Option<&str>,
    ) -> SchedulerResult<Task> {
        let now = Utc::now();
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let task = get_task(&tx, id)?.ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
        close_open_run(&tx, id, RunStatus::Completed, None, snapshot, result_text, now)?;

        let (status, next_run_at) = if task.schedule.is_recurring() {
            let next = if let Some(expr) = &task.schedule.cron {
                CronEvaluator::next_run(expr, now)?
            } else {
                let interval = task.schedule.interval_ms.unwrap_or(0);
                now + chrono::Duration::milliseconds(interval as i64)
            };
            (TaskStatus::Scheduled, Some(next))
        } else {
            (TaskStatus::Completed, None)
        };
        tx.execute(
            "UPDATE tasks SET status = ?2, next_run_at = ?3, retry_count = 0, last_error = NULL, \
             last_budget = ?4, updated_at = ?5 WHERE id = ?1",
            params![
                id,
                status.as_str(),
                next_run_at.map(to_ms),
                serde_json::to_string(snapshot)?,
                to_ms(now),
            ],
        )?;
        let updated = get_task(&tx, id)?.ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
        tx.commit()?;
        Ok(updated)
    }

    /// Record a failed attempt and bump the retry count. Rescheduling with
    /// backoff is the queue's decision, applied via `update`.
    pub async fn fail(
        &self,
        id: &str,
        error: &str,
        snapshot: &BudgetSnapshot,
    ) -> SchedulerResult<Task> {
        let now = Utc::now();
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        close_open_run(&tx, id, RunStatus::Failed, Some(error), snapshot, None, now)?;
        tx.execute(
            "UPDATE tasks SET status = 'failed', retry_count = retry_count + 1, last_error = ?2, \
             last_budget = ?3, updated_at = ?4 WHERE id = ?1",
            params![id, error, serde_json::to_string(snapshot)?, to_ms(now)],
        )?;
        let updated = get_task(&tx, id)?.ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
        tx.commit()?;
        Ok(updated)
    }

    /// Terminal parking: retries exhausted or a budget abort.
    pub async fn dead_letter(
        &self,
        id: &str,
        error: &str,
        snapshot: &BudgetSnapshot,
        run_status: RunStatus,
    ) -> SchedulerResult<Task> {
        let now = Utc::now();
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        close_open_run(&tx, id, run_status, Some(error), snapshot, None, now)?;
        tx.execute(
            "UPDATE tasks SET status = 'dead_letter', next_run_at = NULL, last_error = ?2, \
             last_budget = ?3, updated_at = ?4 WHERE id = ?1",
            params![id, error, serde_json::to_string(snapshot)?, to_ms(now)],
        )?;
        let updated = get_task(&tx, id)?.ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
        tx.commit()?;
        Ok(updated)
    }

    pub async fn cancel(&self, id: &str) -> SchedulerResult<Task> {
        let now = Utc::now();
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE tasks SET status = 'cancelled', next_run_at = NULL, updated_at = ?2 WHERE id = ?1",
            params![id, to_ms(now)],
        )?;
        get_task(&conn, id)?.ok_or_else(|| SchedulerError::NotFound(id.to_string()))
    }

    pub async fn delete(&self, id: &str) -> SchedulerResult<bool> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM task_runs WHERE task_id = ?1", params![id])?;
        let removed = conn.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    pub async fn record_run(&self, mut run: TaskRun) -> SchedulerResult<TaskRun> {
        if run.id.is_empty() {
            run.id = Uuid::new_v4().to_string();
        }
        let conn = self.conn.lock().await;
        conn.execute(
            &format!(
                "INSERT INTO task_runs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                RUN_COLUMNS
            ),
            params![
                run.id,
                run.task_id,
                to_ms(run.started_at),
                run.completed_at.map(to_ms),
                run.status.as_str(),
                run.error,
                run.budget_consumed.tokens_used as i64,
                run.budget_consumed.estimated_cost_usd,
                run.budget_consumed.wall_clock_ms as i64,
                run.budget_consumed.tool_calls_made as i64,
                run.budget_consumed.memory_writes_made as i64,
                run.result_text,
            ],
        )?;
        Ok(run)
    }

    pub async fn list_runs(&self, task_id: &str, limit: usize) -> SchedulerResult<Vec<TaskRun>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM task_runs WHERE task_id = ?1 ORDER BY started_at DESC LIMIT ?2",
            RUN_COLUMNS
        ))?;
        let rows = stmt.query_map(params![task_id, limit as i64], map_run_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// USD spent by completed runs since the local day or month boundary.
    pub async fn sum_spend(&self, period: SpendPeriod) -> SchedulerResult<f64> {
        let start_ms = period_start_ms(period);
        let conn = self.conn.lock().await;
        let total: f64 = conn.query_row(
            "SELECT COALESCE(SUM(estimated_cost_usd), 0.0) FROM task_runs \
             WHERE status = 'completed' AND completed_at IS NOT NULL AND completed_at >= ?1",
            params![start_ms],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    pub async fn counts_by_status(&self) -> SchedulerResult<HashMap<TaskStatus, i64>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut counts = HashMap::new();
        for row in rows {
            let (status, count) = row?;
            if let Some(status) = TaskStatus::parse(&status) {
                counts.insert(status, count);
            }
        }
        Ok(counts)
    }
}

fn to_json_opt<T: serde::Serialize>(value: &Option<T>) -> SchedulerResult<Option<String>> {
    Ok(match value {
        Some(v) => Some(serde_json::to_string(v)?),
        None => None,
    })
}

fn to_ms(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn period_start_ms(period: SpendPeriod) -> i64 {
    let now = Local::now();
    let date = match period {
        SpendPeriod::Day => now.date_naive(),
        SpendPeriod::Month => now.date_naive().with_day(1).unwrap_or(now.date_naive()),
    };
    date.and_time(NaiveTime::MIN)
        .and_local_timezone(Local)
        .earliest()
        .map(|t| t.timestamp_millis())
        .unwrap_or_else(|| now.timestamp_millis())
}

fn get_task(conn: &Connection, id: &str) -> SchedulerResult<Option<Task>> {
    let task = conn
        .query_row(
            &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
            params![id],
            map_task_row,
        )
        .optional()?;
    Ok(task)
}

fn close_open_run(
    conn: &Connection,
    task_id: &str,
    status: RunStatus,
    error: Option<&str>,
    snapshot: &BudgetSnapshot,
    result_text: Option<&str>,
    now: DateTime<Utc>,
) -> SchedulerResult<()> {
    let updated = conn.execute(
        "UPDATE task_runs SET completed_at = ?2, status = ?3, error = ?4, tokens_used = ?5, \
         estimated_cost_usd = ?6, wall_clock_ms = ?7, tool_calls_made = ?8, \
         memory_writes_made = ?9, result_text = ?10 \
         WHERE task_id = ?1 AND completed_at IS NULL",
        params![
            task_id,
            to_ms(now),
            status.as_str(),
            error,
            snapshot.tokens_used as i64,
            snapshot.estimated_cost_usd,
            snapshot.wall_clock_ms as i64,
            snapshot.tool_calls_made as i64,
            snapshot.memory_writes_made as i64,
            result_text,
        ],
    )?;
    if updated == 0 {
        // No claim-opened run (direct completion path); record one whole.
        conn.execute(
            &format!(
                "INSERT INTO task_runs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                RUN_COLUMNS
            ),
            params![
                Uuid::new_v4().to_string(),
                task_id,
                to_ms(now),
                to_ms(now),
                status.as_str(),
                error,
                snapshot.tokens_used as i64,
                snapshot.estimated_cost_usd,
                snapshot.wall_clock_ms as i64,
                snapshot.tool_calls_made as i64,
                snapshot.memory_writes_made as i64,
                result_text,
            ],
        )?;
    }
    Ok(())
}

fn map_task_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let task_type: String = row.get(1)?;
    let allowed_tools: Option<String> = row.get(6)?;
    let denied_tools: Option<String> = row.get(7)?;
    let result_route: String = row.get(8)?;
    let budget: Option<String> = row.get(13)?;
    let status: String = row.get(14)?;
    let last_budget: Option<String> = row.get(23)?;
    Ok(Task {
        id: row.get(0)?,
        definition: TaskDefinition {
            task_type: TaskType::parse(&task_type).unwrap_or(TaskType::Scheduled),
            name: row.get(2)?,
            prompt: row.get(3)?,
            system_prompt: row.get(4)?,
            conversation_id: row.get(5)?,
            allowed_tools: allowed_tools.and_then(|raw| serde_json::from_str(&raw).ok()),
            denied_tools: denied_tools.and_then(|raw| serde_json::from_str(&raw).ok()),
            result_route: serde_json::from_str(&result_route).unwrap_or_default(),
        },
        schedule: TaskSchedule {
            cron: row.get(9)?,
            interval_ms: row.get::<_, Option<i64>>(10)?.map(|ms| ms as u64),
            event_trigger: row.get(11)?,
            run_immediately: row.get::<_, i64>(12)? != 0,
        },
        budget: budget
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default(),
        status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Pending),
        priority: row.get::<_, i64>(15)? as u8,
        next_run_at: row.get::<_, Option<i64>>(16)?.map(from_ms),
        last_run_at: row.get::<_, Option<i64>>(17)?.map(from_ms),
        retry_count: row.get::<_, i64>(18)? as u32,
        max_retries: row.get::<_, i64>(19)? as u32,
        created_at: from_ms(row.get(20)?),
        updated_at: from_ms(row.get(21)?),
        last_error: row.get(22)?,
        last_budget: last_budget.and_then(|raw| serde_json::from_str(&raw).ok()),
    })
}

fn map_run_row(row: &Row<'_>) -> rusqlite::Result<TaskRun> {
    let status: String = row.get(4)?;
    Ok(TaskRun {
        id: row.get(0)?,
        task_id: row.get(1)?,
        started_at: from_ms(row.get(2)?),
        completed_at: row.get::<_, Option<i64>>(3)?.map(from_ms),
        status: RunStatus::parse(&status).unwrap_or(RunStatus::Failed),
        error: row.get(5)?,
        budget_consumed: BudgetSnapshot {
            tokens_used: row.get::<_, i64>(6)? as u64,
            estimated_cost_usd: row.get(7)?,
            wall_clock_ms: row.get::<_, i64>(8)? as u64,
            tool_calls_made: row.get::<_, i64>(9)? as u32,
            memory_writes_made: row.get::<_, i64>(10)? as u32,
        },
        result_text: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use spaceduck_types::{ResultRoute, TaskBudget};

    fn definition(name: &str) -> TaskDefinition {
        TaskDefinition {
            task_type: TaskType::Scheduled,
            name: name.to_string(),
            prompt: "ping".to_string(),
            system_prompt: None,
            conversation_id: None,
            allowed_tools: None,
            denied_tools: None,
            result_route: ResultRoute::Silent,
        }
    }

    fn interval_input(name: &str, interval_ms: u64, run_immediately: bool) -> CreateTaskInput {
        CreateTaskInput {
            definition: definition(name),
            schedule: TaskSchedule {
                cron: None,
                interval_ms: Some(interval_ms),
                event_trigger: None,
                run_immediately,
            },
            budget: TaskBudget::default(),
            priority: 0,
            max_retries: None,
        }
    }

    #[tokio::test]
    async fn create_sets_schedule_and_next_run() {
        let store = TaskStore::open_in_memory().await.expect("store");
        let before = Utc::now();
        let task = store
            .create(interval_input("ping", 5_000, false))
            .await
            .expect("create");
        assert_eq!(task.status, TaskStatus::Scheduled);
        let next = task.next_run_at.expect("next_run_at");
        assert!(next >= before + chrono::Duration::milliseconds(4_900));
    }

    #[tokio::test]
    async fn create_run_immediately_is_due_now() {
        let store = TaskStore::open_in_memory().await.expect("store");
        let task = store
            .create(interval_input("ping", 5_000, true))
            .await
            .expect("create");
        assert!(task.next_run_at.expect("next") <= Utc::now());
        let due = store.list_due(Utc::now()).await.expect("due");
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, task.id);
    }

    #[tokio::test]
    async fn create_rejects_cron_and_interval_together() {
        let store = TaskStore::open_in_memory().await.expect("store");
        let mut input = interval_input("bad", 1_000, false);
        input.schedule.cron = Some("* * * * *".to_string());
        let err = store.create(input).await.expect_err("must reject");
        assert!(matches!(err, SchedulerError::InvalidSchedule(_)));
    }

    #[tokio::test]
    async fn create_rejects_malformed_cron_and_priority() {
        let store = TaskStore::open_in_memory().await.expect("store");
        let mut input = interval_input("bad", 1_000, false);
        input.schedule.interval_ms = None;
        input.schedule.cron = Some("not a cron".to_string());
        assert!(matches!(
            store.create(input).await,
            Err(SchedulerError::InvalidCron { .. })
        ));

        let mut input = interval_input("bad", 1_000, false);
        input.priority = 10;
        assert!(matches!(
            store.create(input).await,
            Err(SchedulerError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn event_tasks_wait_without_next_run() {
        let store = TaskStore::open_in_memory().await.expect("store");
        let input = CreateTaskInput {
            definition: definition("on-email"),
            schedule: TaskSchedule {
                cron: None,
                interval_ms: None,
                event_trigger: Some("email:received".to_string()),
                run_immediately: false,
            },
            budget: TaskBudget::default(),
            priority: 0,
            max_retries: None,
        };
        let task = store.create(input).await.expect("create");
        assert_eq!(task.status, TaskStatus::Scheduled);
        assert!(task.next_run_at.is_none());
        assert!(store.list_due(Utc::now()).await.expect("due").is_empty());
    }

    #[tokio::test]
    async fn claim_orders_by_priority_then_due_time() {
        let store = TaskStore::open_in_memory().await.expect("store");
        let low = store
            .create(interval_input("low", 1_000, true))
            .await
            .expect("low");
        let mut high_input = interval_input("high", 1_000, true);
        high_input.priority = 9;
        let high = store.create(high_input).await.expect("high");

        let first = store.claim(Utc::now()).await.expect("claim").expect("task");
        assert_eq!(first.id, high.id);
        assert_eq!(first.status, TaskStatus::Running);
        let second = store.claim(Utc::now()).await.expect("claim").expect("task");
        assert_eq!(second.id, low.id);
        assert!(store.claim(Utc::now()).await.expect("claim").is_none());
    }

    #[tokio::test]
    async fn claim_opens_exactly_one_running_run() {
        let store = TaskStore::open_in_memory().await.expect("store");
        let task = store
            .create(interval_input("ping", 1_000, true))
            .await
            .expect("create");
        store.claim(Utc::now()).await.expect("claim").expect("task");
        let runs = store.list_runs(&task.id, 10).await.expect("runs");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Running);
        assert!(runs[0].completed_at.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_claims_never_share_a_task() {
        let store = Arc::new(TaskStore::open_in_memory().await.expect("store"));
        store
            .create(interval_input("only", 1_000, true))
            .await
            .expect("create");

        let a = {
            let store = store.clone();
            tokio::spawn(async move { store.claim(Utc::now()).await.expect("claim") })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(async move { store.claim(Utc::now()).await.expect("claim") })
        };
        let (a, b) = (a.await.expect("join"), b.await.expect("join"));
        match (a, b) {
            (Some(_), None) | (None, Some(_)) => {}
            (Some(x), Some(y)) => assert_ne!(x.id, y.id),
            (None, None) => panic!("one claim should have succeeded"),
        }
    }

    #[tokio::test]
    async fn complete_reschedules_recurring_and_resets_retries() {
        let store = TaskStore::open_in_memory().await.expect("store");
        let task = store
            .create(interval_input("ping", 5_000, true))
            .await
            .expect("create");
        store.claim(Utc::now()).await.expect("claim").expect("task");
        // Simulate an earlier failed attempt's counter.
        store.fail(&task.id, "boom", &BudgetSnapshot::default()).await.expect("fail");

        let before = Utc::now();
        let snapshot = BudgetSnapshot {
            tokens_used: 12,
            estimated_cost_usd: 0.001,
            ..BudgetSnapshot::default()
        };
        let updated = store
            .complete(&task.id, &snapshot, Some("pong"))
            .await
            .expect("complete");
        assert_eq!(updated.status, TaskStatus::Scheduled);
        assert_eq!(updated.retry_count, 0);
        let next = updated.next_run_at.expect("next");
        assert!(next >= before + chrono::Duration::milliseconds(4_900));
        assert!(next <= Utc::now() + chrono::Duration::milliseconds(5_100));
        assert_eq!(
            updated.last_budget.expect("last budget").tokens_used,
            12
        );
    }

    #[tokio::test]
    async fn complete_finishes_one_shot_tasks() {
        let store = TaskStore::open_in_memory().await.expect("store");
        let input = CreateTaskInput {
            definition: definition("once"),
            schedule: TaskSchedule {
                run_immediately: true,
                ..TaskSchedule::default()
            },
            budget: TaskBudget::default(),
            priority: 0,
            max_retries: None,
        };
        let task = store.create(input).await.expect("create");
        store.claim(Utc::now()).await.expect("claim").expect("task");
        let updated = store
            .complete(&task.id, &BudgetSnapshot::default(), None)
            .await
            .expect("complete");
        assert_eq!(updated.status, TaskStatus::Completed);
        assert!(updated.next_run_at.is_none());
    }

    #[tokio::test]
    async fn fail_increments_retry_and_records_run() {
        let store = TaskStore::open_in_memory().await.expect("store");
        let task = store
            .create(interval_input("ping", 1_000, true))
            .await
            .expect("create");
        store.claim(Utc::now()).await.expect("claim").expect("task");
        let updated = store
            .fail(&task.id, "network timeout", &BudgetSnapshot::default())
            .await
            .expect("fail");
        assert_eq!(updated.status, TaskStatus::Failed);
        assert_eq!(updated.retry_count, 1);
        assert_eq!(updated.last_error.as_deref(), Some("network timeout"));
        let runs = store.list_runs(&task.id, 10).await.expect("runs");
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert!(runs[0].completed_at.is_some());
    }

    #[tokio::test]
    async fn dead_letter_parks_the_task() {
        let store = TaskStore::open_in_memory().await.expect("store");
        let task = store
            .create(interval_input("ping", 1_000, true))
            .await
            .expect("create");
        store.claim(Utc::now()).await.expect("claim").expect("task");
        let updated = store
            .dead_letter(
                &task.id,
                "Budget exceeded: tool_calls",
                &BudgetSnapshot::default(),
                RunStatus::BudgetExceeded,
            )
            .await
            .expect("dead letter");
        assert_eq!(updated.status, TaskStatus::DeadLetter);
        assert!(updated.next_run_at.is_none());
        let runs = store.list_runs(&task.id, 10).await.expect("runs");
        assert_eq!(runs[0].status, RunStatus::BudgetExceeded);
    }

    #[tokio::test]
    async fn sum_spend_counts_only_completed_runs_today() {
        let store = TaskStore::open_in_memory().await.expect("store");
        let task = store
            .create(interval_input("ping", 1_000, true))
            .await
            .expect("create");
        store.claim(Utc::now()).await.expect("claim").expect("task");
        let snapshot = BudgetSnapshot {
            estimated_cost_usd: 0.25,
            ..BudgetSnapshot::default()
        };
        store
            .complete(&task.id, &snapshot, None)
            .await
            .expect("complete");
        // A failed run's cost must not count. The task was rescheduled one
        // interval out, so claim from a slightly later instant.
        store
            .claim(Utc::now() + chrono::Duration::seconds(2))
            .await
            .expect("claim")
            .expect("task");
        store
            .fail(&task.id, "boom", &snapshot)
            .await
            .expect("fail");

        let day = store.sum_spend(SpendPeriod::Day).await.expect("day");
        assert!((day - 0.25).abs() < 1e-9);
        let month = store.sum_spend(SpendPeriod::Month).await.expect("month");
        assert!((month - 0.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn update_patch_reschedules() {
        let store = TaskStore::open_in_memory().await.expect("store");
        let task = store
            .create(interval_input("ping", 1_000, true))
            .await
            .expect("create");
        let next = Utc::now() + chrono::Duration::milliseconds(250);
        let updated = store
            .update(
                &task.id,
                TaskPatch {
                    status: Some(TaskStatus::Scheduled),
                    next_run_at: Some(Some(next)),
                    ..TaskPatch::default()
                },
            )
            .await
            .expect("update");
        assert_eq!(updated.status, TaskStatus::Scheduled);
        let stored = store.get(&task.id).await.expect("get").expect("task");
        let delta = (stored.next_run_at.expect("next") - next).num_milliseconds().abs();
        assert!(delta < 5);
    }

    #[tokio::test]
    async fn cancel_clears_next_run() {
        let store = TaskStore::open_in_memory().await.expect("store");
        let task = store
            .create(interval_input("ping", 1_000, true))
            .await
            .expect("create");
        let cancelled = store.cancel(&task.id).await.expect("cancel");
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert!(cancelled.next_run_at.is_none());
        assert!(store.claim(Utc::now()).await.expect("claim").is_none());
    }

    #[tokio::test]
    async fn schema_version_is_monotonic_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("scheduler.db");
        {
            let store = TaskStore::open(&path).await.expect("store");
            assert_eq!(store.schema_version().await.expect("version"), MIGRATIONS.len() as i64);
        }
        let store = TaskStore::open(&path).await.expect("reopen");
        assert_eq!(store.schema_version().await.expect("version"), MIGRATIONS.len() as i64);
    }

    #[tokio::test]
    async fn counts_by_status_groups_tasks() {
        let store = TaskStore::open_in_memory().await.expect("store");
        store
            .create(interval_input("a", 1_000, true))
            .await
            .expect("a");
        store
            .create(interval_input("b", 1_000, true))
            .await
            .expect("b");
        let counts = store.counts_by_status().await.expect("counts");
        assert_eq!(counts.get(&TaskStatus::Scheduled), Some(&2));
    }
}
