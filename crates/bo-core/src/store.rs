//! SQLite-backed write-through persistence for tasks, agent runs, test
//! results, and regression log entries.
//!
//! Every write method returns a typed error to the caller; per the
//! orchestrator's error-handling policy, callers log and swallow store
//! failures rather than aborting the pipeline — this module only reports
//! failure, it does not decide what to do about it.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::params;
use tokio_rusqlite::Connection;
use tracing::warn;

use crate::types::{AgentRun, AgentStatus, RegressionLogEntry, Task, TaskStatus, TestLevel, TestResult};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("connection error: {0}")]
    Connection(#[from] tokio_rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Write-through store for the orchestrator's own entities.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (creating if absent) the store at `path`, applying the schema
    /// idempotently.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path.as_ref()).await?;
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    /// Open an in-memory store, useful for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    // -- tasks --

    pub async fn create_task(&self, task: &Task) -> Result<()> {
        let task = task.clone();
        self.conn
            .call(move |conn| {
                let plan_json = task
                    .plan
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()
                    .map_err(to_sql_err)?;
                conn.execute(
                    "INSERT INTO tasks (id, project_path, description, status, plan_json, \
                     integration_branch, retry_count, total_cost_usd, total_tokens, \
                     created_at, updated_at, completed_at, error) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                    params![
                        task.id,
                        task.project_path,
                        task.description,
                        task.status.as_str(),
                        plan_json,
                        task.integration_branch,
                        task.retry_count,
                        task.total_cost_usd,
                        task.total_tokens as i64,
                        task.created_at.to_rfc3339(),
                        task.updated_at.to_rfc3339(),
                        task.completed_at.map(|t| t.to_rfc3339()),
                        task.error,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn update_task(&self, task: &Task) -> Result<()> {
        let task = task.clone();
        self.conn
            .call(move |conn| {
                let plan_json = task
                    .plan
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()
                    .map_err(to_sql_err)?;
                conn.execute(
                    "UPDATE tasks SET status=?2, plan_json=?3, integration_branch=?4, \
                     retry_count=?5, total_cost_usd=?6, total_tokens=?7, updated_at=?8, \
                     completed_at=?9, error=?10 WHERE id=?1",
                    params![
                        task.id,
                        task.status.as_str(),
                        plan_json,
                        task.integration_branch,
                        task.retry_count,
                        task.total_cost_usd,
                        task.total_tokens as i64,
                        task.updated_at.to_rfc3339(),
                        task.completed_at.map(|t| t.to_rfc3339()),
                        task.error,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let id = id.to_string();
        let row = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, project_path, description, status, plan_json, \
                     integration_branch, retry_count, total_cost_usd, total_tokens, \
                     created_at, updated_at, completed_at, error FROM tasks WHERE id = ?1",
                )?;
                let row = stmt
                    .query_row(params![id], |r| Ok(task_row_to_tuple(r)))
                    .map(|t| t.transpose())
                    .ok()
                    .flatten();
                Ok::<_, tokio_rusqlite::Error>(row.transpose().map_err(to_sql_err)?)
            })
            .await?;
        Ok(row.map(tuple_to_task).transpose()?)
    }

    pub async fn list_recent_tasks(&self, limit: u32) -> Result<Vec<Task>> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, project_path, description, status, plan_json, \
                     integration_branch, retry_count, total_cost_usd, total_tokens, \
                     created_at, updated_at, completed_at, error FROM tasks \
                     ORDER BY created_at DESC LIMIT ?1",
                )?;
                let out: std::result::Result<Vec<_>, rusqlite::Error> = stmt
                    .query_map(params![limit], |r| Ok(task_row_to_tuple(r)))?
                    .collect::<std::result::Result<Vec<_>, _>>()?
                    .into_iter()
                    .collect::<std::result::Result<Vec<_>, _>>();
                Ok(out?)
            })
            .await?;
        rows.into_iter().map(tuple_to_task).collect()
    }

    // -- agent runs --

    pub async fn create_agent_run(&self, run: &AgentRun) -> Result<()> {
        let run = run.clone();
        self.conn
            .call(move |conn| {
                let files = run.files_modified.join(",");
                conn.execute(
                    "INSERT INTO agent_runs (id, task_id, role, status, model, \
                     worktree_path, branch, prompt, output, cost_usd, input_tokens, \
                     output_tokens, duration_seconds, files_modified, attempt, error, \
                     started_at, completed_at) \
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18)",
                    params![
                        run.id,
                        run.task_id,
                        run.role,
                        run.status.as_str(),
                        run.model,
                        run.worktree_path,
                        run.branch,
                        run.prompt,
                        run.output,
                        run.cost_usd,
                        run.input_tokens as i64,
                        run.output_tokens as i64,
                        run.duration_seconds,
                        files,
                        run.attempt,
                        run.error,
                        run.started_at.to_rfc3339(),
                        run.completed_at.map(|t| t.to_rfc3339()),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn update_agent_run(&self, run: &AgentRun) -> Result<()> {
        let run = run.clone();
        self.conn
            .call(move |conn| {
                let files = run.files_modified.join(",");
                conn.execute(
                    "UPDATE agent_runs SET status=?2, output=?3, cost_usd=?4, \
                     input_tokens=?5, output_tokens=?6, duration_seconds=?7, \
                     files_modified=?8, error=?9, completed_at=?10 WHERE id=?1",
                    params![
                        run.id,
                        run.status.as_str(),
                        run.output,
                        run.cost_usd,
                        run.input_tokens as i64,
                        run.output_tokens as i64,
                        run.duration_seconds,
                        files,
                        run.error,
                        run.completed_at.map(|t| t.to_rfc3339()),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // -- test results / regression log --

    pub async fn insert_test_result(
        &self,
        task_id: &str,
        agent_run_id: Option<&str>,
        result: &TestResult,
    ) -> Result<()> {
        let task_id = task_id.to_string();
        let agent_run_id = agent_run_id.map(|s| s.to_string());
        let result = result.clone_for_store();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO test_results (task_id, agent_run_id, level, passed, \
                     total_tests, passed_tests, failed_tests, output, compiler_errors, \
                     regressions, created_at) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
                    params![
                        task_id,
                        agent_run_id,
                        level_label(result.level),
                        result.passed,
                        result.total_tests,
                        result.passed_tests,
                        result.failed_tests.join(","),
                        result.output_excerpt,
                        result.compiler_errors.join("\n"),
                        result.regressions,
                        Utc::now().to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn insert_regression_log(&self, entry: &RegressionLogEntry) -> Result<()> {
        let entry = entry.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO regression_log (task_id, role, tests_before, tests_after, \
                     regressions, new_tests, regression_rate, created_at) \
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
                    params![
                        entry.task_id,
                        entry.role,
                        entry.tests_before,
                        entry.tests_after,
                        entry.regressions,
                        entry.new_tests,
                        entry.regression_rate,
                        entry.created_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

/// Record the outcome of a store write, logging and swallowing failures per
/// the orchestrator's error-handling policy (store failures never abort the
/// pipeline).
pub fn log_store_err<T>(context: &str, result: Result<T>) {
    if let Err(e) = result {
        warn!(context, error = %e, "store write failed; continuing");
    }
}

fn level_label(level: TestLevel) -> &'static str {
    match level {
        TestLevel::Smoke => "smoke",
        TestLevel::Fast => "fast",
        TestLevel::Normal => "normal",
        TestLevel::Full => "full",
    }
}

fn to_sql_err(e: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(e))
}

type TaskRow = (
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    u32,
    f64,
    i64,
    String,
    String,
    Option<String>,
    Option<String>,
);

fn task_row_to_tuple(row: &rusqlite::Row) -> rusqlite::Result<TaskRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
    ))
}

fn tuple_to_task(row: TaskRow) -> Result<Task> {
    let (
        id,
        project_path,
        description,
        status,
        plan_json,
        integration_branch,
        retry_count,
        total_cost_usd,
        total_tokens,
        created_at,
        updated_at,
        completed_at,
        error,
    ) = row;

    let status = parse_status(&status);
    let plan = plan_json.map(|j| serde_json::from_str(&j)).transpose()?;
    let created_at = parse_ts(&created_at);
    let updated_at = parse_ts(&updated_at);
    let completed_at = completed_at.map(|s| parse_ts(&s));

    Ok(Task {
        id,
        project_path,
        description,
        status,
        plan,
        integration_branch,
        total_cost_usd,
        total_tokens: total_tokens as u64,
        retry_count,
        created_at,
        updated_at,
        completed_at,
        error,
    })
}

fn parse_status(s: &str) -> TaskStatus {
    match s {
        "pending" => TaskStatus::Pending,
        "planning" => TaskStatus::Planning,
        "executing" => TaskStatus::Executing,
        "merging" => TaskStatus::Merging,
        "testing" => TaskStatus::Testing,
        "done" => TaskStatus::Done,
        "cancelled" => TaskStatus::Cancelled,
        _ => TaskStatus::Error,
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl TestResult {
    fn clone_for_store(&self) -> TestResult {
        self.clone()
    }
}

impl AgentRun {
    /// Bump status to `status`, setting `completed_at` to now.
    pub fn finish(&mut self, status: AgentStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    project_path TEXT NOT NULL,
    description TEXT NOT NULL,
    status TEXT NOT NULL,
    plan_json TEXT,
    integration_branch TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    total_cost_usd REAL NOT NULL DEFAULT 0,
    total_tokens INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    completed_at TEXT,
    error TEXT
);

CREATE TABLE IF NOT EXISTS agent_runs (
    id TEXT PRIMARY KEY,
    task_id TEXT NOT NULL,
    role TEXT NOT NULL,
    status TEXT NOT NULL,
    model TEXT NOT NULL,
    worktree_path TEXT,
    branch TEXT,
    prompt TEXT,
    output TEXT,
    cost_usd REAL NOT NULL DEFAULT 0,
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    duration_seconds REAL NOT NULL DEFAULT 0,
    files_modified TEXT,
    attempt INTEGER NOT NULL DEFAULT 1,
    error TEXT,
    started_at TEXT NOT NULL,
    completed_at TEXT
);

CREATE TABLE IF NOT EXISTS test_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL,
    agent_run_id TEXT,
    level TEXT NOT NULL,
    passed INTEGER NOT NULL,
    total_tests INTEGER NOT NULL DEFAULT 0,
    passed_tests INTEGER NOT NULL DEFAULT 0,
    failed_tests TEXT,
    output TEXT,
    compiler_errors TEXT,
    regressions INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS regression_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL,
    role TEXT NOT NULL,
    tests_before INTEGER NOT NULL,
    tests_after INTEGER NOT NULL,
    regressions INTEGER NOT NULL,
    new_tests INTEGER NOT NULL,
    regression_rate REAL NOT NULL,
    created_at TEXT NOT NULL
);
";

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_fetch_task() {
        let store = Store::open_in_memory().await.unwrap();
        let task = Task::new("/tmp/proj", "add a feature");
        store.create_task(&task).await.unwrap();

        let fetched = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, task.id);
        assert_eq!(fetched.status, TaskStatus::Pending);
        assert_eq!(fetched.description, "add a feature");
    }

    #[tokio::test]
    async fn update_task_persists_status() {
        let store = Store::open_in_memory().await.unwrap();
        let mut task = Task::new("/tmp/proj", "add a feature");
        store.create_task(&task).await.unwrap();

        task.status = TaskStatus::Done;
        task.total_cost_usd = 4.2;
        store.update_task(&task).await.unwrap();

        let fetched = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, TaskStatus::Done);
        assert_eq!(fetched.total_cost_usd, 4.2);
    }

    #[tokio::test]
    async fn get_missing_task_returns_none() {
        let store = Store::open_in_memory().await.unwrap();
        let result = store.get_task("does-not-exist").await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn list_recent_tasks_orders_by_created_at_desc() {
        let store = Store::open_in_memory().await.unwrap();
        let t1 = Task::new("/tmp/a", "first");
        store.create_task(&t1).await.unwrap();
        let t2 = Task::new("/tmp/b", "second");
        store.create_task(&t2).await.unwrap();

        let recent = store.list_recent_tasks(10).await.unwrap();
        assert_eq!(recent.len(), 2);
    }

    #[tokio::test]
    async fn agent_run_roundtrip() {
        let store = Store::open_in_memory().await.unwrap();
        let task = Task::new("/tmp/proj", "add a feature");
        store.create_task(&task).await.unwrap();

        let mut run = AgentRun::new(&task.id, "rust-backend", "sonnet", 1);
        store.create_agent_run(&run).await.unwrap();

        run.finish(AgentStatus::Success);
        run.cost_usd = 0.42;
        store.update_agent_run(&run).await.unwrap();
    }

    #[tokio::test]
    async fn insert_test_result_and_regression_log() {
        let store = Store::open_in_memory().await.unwrap();
        let task = Task::new("/tmp/proj", "add a feature");
        store.create_task(&task).await.unwrap();

        let mut result = TestResult::new(TestLevel::Fast);
        result.passed = true;
        result.total_tests = 5;
        result.passed_tests = 5;
        store.insert_test_result(&task.id, None, &result).await.unwrap();

        let entry = RegressionLogEntry {
            task_id: task.id.clone(),
            role: "rust-backend".into(),
            tests_before: 5,
            tests_after: 5,
            regressions: 0,
            new_tests: 0,
            regression_rate: 0.0,
            created_at: Utc::now(),
        };
        store.insert_regression_log(&entry).await.unwrap();
    }
}
