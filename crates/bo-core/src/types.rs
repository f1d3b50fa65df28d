//! Shared data model for the orchestration engine: tasks, agent runs, test
//! results, execution plans, and the dashboard snapshot consumed by callers.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Planning,
    Executing,
    Merging,
    Testing,
    Done,
    Error,
    Cancelled,
}

impl TaskStatus {
    /// Whether this status is terminal — no further transitions are valid.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Error | TaskStatus::Cancelled)
    }

    /// Whether `next` is a valid transition from `self`.
    ///
    /// The pipeline is linear (Pending -> Planning -> Executing -> Merging ->
    /// Testing -> Done); Error and Cancelled are reachable from any
    /// non-terminal state and are themselves terminal.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Planning)
                | (TaskStatus::Planning, TaskStatus::Executing)
                | (TaskStatus::Executing, TaskStatus::Merging)
                | (TaskStatus::Merging, TaskStatus::Testing)
                | (TaskStatus::Testing, TaskStatus::Done)
                | (_, TaskStatus::Error)
                | (_, TaskStatus::Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Planning => "planning",
            TaskStatus::Executing => "executing",
            TaskStatus::Merging => "merging",
            TaskStatus::Testing => "testing",
            TaskStatus::Done => "done",
            TaskStatus::Error => "error",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// One-character status icon for compact dashboard rendering.
    pub fn icon(&self) -> char {
        match self {
            TaskStatus::Pending => '\u{23f8}',
            TaskStatus::Planning | TaskStatus::Executing | TaskStatus::Merging | TaskStatus::Testing => {
                '\u{23f3}'
            }
            TaskStatus::Done => '\u{2713}',
            TaskStatus::Error => '\u{2717}',
            TaskStatus::Cancelled => '\u{2715}',
        }
    }
}

// ---------------------------------------------------------------------------
// AgentStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Pending,
    Running,
    #[default]
    Success,
    Failed,
    Retrying,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Pending => "pending",
            AgentStatus::Running => "running",
            AgentStatus::Success => "success",
            AgentStatus::Failed => "failed",
            AgentStatus::Retrying => "retrying",
        }
    }
}

// ---------------------------------------------------------------------------
// TestLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestLevel {
    /// `cargo check --workspace` — compile only.
    Smoke,
    /// `cargo test --lib` — unit tests only.
    Fast,
    /// `cargo test --workspace` — all tests.
    Normal,
    /// All tests plus a front-end build.
    Full,
}

impl TestLevel {
    /// Default timeout for this level, in seconds.
    pub fn default_timeout_secs(&self) -> u64 {
        match self {
            TestLevel::Smoke => 30,
            TestLevel::Fast => 30,
            TestLevel::Normal => 120,
            TestLevel::Full => 600,
        }
    }
}

// ---------------------------------------------------------------------------
// Test baseline / result / delta
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestBaseline {
    pub total_tests: u32,
    pub passing_tests: u32,
    pub snapshot_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub level: TestLevel,
    pub passed: bool,
    #[serde(default)]
    pub total_tests: u32,
    #[serde(default)]
    pub passed_tests: u32,
    #[serde(default)]
    pub failed_tests: Vec<String>,
    #[serde(default)]
    pub compiler_errors: Vec<String>,
    #[serde(default)]
    pub output_excerpt: String,
    #[serde(default)]
    pub regressions: u32,
    #[serde(default)]
    pub duration_seconds: f64,
}

impl TestResult {
    pub fn new(level: TestLevel) -> Self {
        Self {
            level,
            passed: false,
            total_tests: 0,
            passed_tests: 0,
            failed_tests: Vec::new(),
            compiler_errors: Vec::new(),
            output_excerpt: String::new(),
            regressions: 0,
            duration_seconds: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestDelta {
    pub total_before: u32,
    pub total_after: u32,
    pub passing_before: u32,
    pub passing_after: u32,
    pub newly_failing: u32,
    pub newly_added: u32,
}

impl TestDelta {
    /// Compare a baseline against a fresh test result.
    pub fn compare(baseline: &TestBaseline, result: &TestResult) -> Self {
        let newly_failing = baseline.passing_tests.saturating_sub(result.passed_tests);
        let newly_added = result.total_tests.saturating_sub(baseline.total_tests);
        Self {
            total_before: baseline.total_tests,
            total_after: result.total_tests,
            passing_before: baseline.passing_tests,
            passing_after: result.passed_tests,
            newly_failing,
            newly_added,
        }
    }
}

// ---------------------------------------------------------------------------
// Rust stack detection / execution plan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RustStack {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub frontend: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub build_wasm: Option<String>,
    #[serde(default)]
    pub extra_crates: Vec<String>,
}

fn default_backend() -> String {
    "axum".to_string()
}

impl Default for RustStack {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            frontend: None,
            database: None,
            build_wasm: None,
            extra_crates: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileOwnershipMap {
    #[serde(default)]
    pub file_ownership: HashMap<String, String>,
    #[serde(default)]
    pub shared_files: Vec<String>,
    #[serde(default = "default_conflict_resolution")]
    pub conflict_resolution: String,
}

fn default_conflict_resolution() -> String {
    "architect owns shared files, others request via HANDOFF.md".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    pub role: String,
    pub description: String,
    #[serde(default)]
    pub files_to_modify: Vec<String>,
    #[serde(default)]
    pub files_to_create: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub task_id: String,
    pub description: String,
    #[serde(default)]
    pub stack: RustStack,
    #[serde(default)]
    pub file_ownership: FileOwnershipMap,
    #[serde(default)]
    pub agents: Vec<AgentTask>,
    #[serde(default)]
    pub estimated_cost_usd: f64,
    #[serde(default)]
    pub estimated_duration_seconds: u64,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ExecutionPlan {
    /// A single-agent fallback plan used when the planner's output can't be
    /// parsed as a structured plan.
    pub fn fallback(task_id: impl Into<String>, description: impl Into<String>, role: &str) -> Self {
        let description = description.into();
        Self {
            task_id: task_id.into(),
            description: description.clone(),
            stack: RustStack::default(),
            file_ownership: FileOwnershipMap::default(),
            agents: vec![AgentTask {
                role: role.to_string(),
                description,
                files_to_modify: Vec::new(),
                files_to_create: Vec::new(),
                depends_on: Vec::new(),
            }],
            estimated_cost_usd: 0.0,
            estimated_duration_seconds: 0,
            metadata: HashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Agent configuration / result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub role: String,
    pub prompt_file: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_budget")]
    pub budget_usd: f64,
    #[serde(default)]
    pub owned_files: Vec<String>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub read_only: bool,
}

fn default_model() -> String {
    "sonnet".to_string()
}
fn default_timeout() -> u64 {
    600
}
fn default_budget() -> f64 {
    1.50
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentResult {
    #[serde(default)]
    pub status: AgentStatus,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub tests_added: u32,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub duration_seconds: f64,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub raw_output: String,
}

// ---------------------------------------------------------------------------
// Cost tracking
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostSnapshot {
    pub agent_role: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCostSummary {
    pub task_id: String,
    #[serde(default)]
    pub agents: Vec<CostSnapshot>,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub total_duration_seconds: f64,
    #[serde(default = "default_task_budget")]
    pub budget_usd: f64,
}

fn default_task_budget() -> f64 {
    15.0
}

impl TaskCostSummary {
    pub fn budget_percent(&self) -> f64 {
        if self.budget_usd <= 0.0 {
            0.0
        } else {
            (self.total_cost_usd / self.budget_usd) * 100.0
        }
    }
}

// ---------------------------------------------------------------------------
// Dashboard
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDashboardEntry {
    pub role: String,
    #[serde(default = "default_waiting")]
    pub status: String,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub duration_seconds: f64,
    #[serde(default)]
    pub tokens: u64,
}

fn default_waiting() -> String {
    "waiting".to_string()
}

impl AgentDashboardEntry {
    pub fn waiting(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            status: default_waiting(),
            cost_usd: 0.0,
            duration_seconds: 0.0,
            tokens: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dashboard {
    pub task_id: String,
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub agents: Vec<AgentDashboardEntry>,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default = "default_task_budget")]
    pub budget_usd: f64,
    #[serde(default)]
    pub compile_ok: Option<bool>,
    #[serde(default)]
    pub clippy_ok: Option<bool>,
    #[serde(default = "default_tests_status")]
    pub tests_status: String,
    #[serde(default)]
    pub baseline_tests: u32,
    #[serde(default)]
    pub current_tests: u32,
    #[serde(default)]
    pub regressions: u32,
}

fn default_tests_status() -> String {
    "pending".to_string()
}

impl Default for TaskStatus {
    fn default() -> Self {
        TaskStatus::Pending
    }
}

// ---------------------------------------------------------------------------
// Task / AgentRun / regression log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub project_path: String,
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub plan: Option<ExecutionPlan>,
    #[serde(default)]
    pub integration_branch: Option<String>,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Task {
    pub fn new(project_path: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            project_path: project_path.into(),
            description: description.into(),
            status: TaskStatus::Pending,
            plan: None,
            integration_branch: None,
            total_cost_usd: 0.0,
            total_tokens: 0,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRun {
    pub id: String,
    pub task_id: String,
    pub role: String,
    pub status: AgentStatus,
    pub model: String,
    #[serde(default)]
    pub worktree_path: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub duration_seconds: f64,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default = "default_attempt")]
    pub attempt: u32,
    #[serde(default)]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

fn default_attempt() -> u32 {
    1
}

impl AgentRun {
    pub fn new(task_id: impl Into<String>, role: impl Into<String>, model: impl Into<String>, attempt: u32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            role: role.into(),
            status: AgentStatus::Running,
            model: model.into(),
            worktree_path: None,
            branch: None,
            prompt: String::new(),
            output: String::new(),
            cost_usd: 0.0,
            input_tokens: 0,
            output_tokens: 0,
            duration_seconds: 0.0,
            files_modified: Vec::new(),
            attempt,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegressionLogEntry {
    pub task_id: String,
    pub role: String,
    pub tests_before: u32,
    pub tests_after: u32,
    pub regressions: u32,
    pub new_tests: u32,
    pub regression_rate: f64,
    pub created_at: DateTime<Utc>,
}
