//! The top-level build-orchestration state machine: PLANNING -> EXECUTING ->
//! MERGING -> TESTING -> DONE, with ERROR reachable from any non-terminal
//! state. Wires together the cost tracker, test gate, regression tracker,
//! worktree manager, and agent runner for one task end to end.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bo_agent::{AgentRunner, RunContext};
use bo_core::{
    AgentConfig, AgentDashboardEntry, AgentStatus, Dashboard, Store, Task, TaskStatus, TestLevel,
};
use bo_cost::CostTracker;
use bo_testgate::{capture_baseline, format_compact, run_test_level, RegressionTracker};
use bo_worktree::{GitRunner, RealGitRunner, WorktreeManager};
use thiserror::Error;
use tracing::{info, warn};

use crate::agents::{compose_agent_prompt, default_agent_configs, extract_plan};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("worktree error: {0}")]
    Worktree(#[from] bo_worktree::WorktreeError),
    #[error("test gate error: {0}")]
    TestGate(#[from] bo_testgate::GateError),
    #[error("merge conflicts: {0}")]
    Merge(String),
    #[error("integration tests failed: {0}")]
    Testing(String),
    #[error("agent {role} failed after {retries} attempts")]
    AgentFailed { role: String, retries: u32 },
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

const MAX_ERROR_CHARS: usize = 500;

type ProgressCallback = Box<dyn Fn(&Dashboard) + Send + Sync>;

/// Drives one build task from description to integration branch.
pub struct Orchestrator {
    project_path: String,
    namespace: String,
    build_budget_usd: f64,
    build_max_retries: u32,
    model_rates: HashMap<String, bo_core::ModelRate>,
    test_timeouts: HashMap<String, u64>,
    store: Arc<Store>,
    agent_runner: AgentRunner,
    agent_configs: HashMap<String, AgentConfig>,
    on_progress: Option<ProgressCallback>,
    /// Taken (not cloned) the first time `execute` runs; defaults to
    /// `RealGitRunner` if never overridden via [`Self::with_git_runner`].
    git_runner: Mutex<Option<Box<dyn GitRunner>>>,
}

impl Orchestrator {
    pub fn new(project_path: impl Into<String>, config: &bo_core::Config, store: Arc<Store>) -> Self {
        Self {
            project_path: project_path.into(),
            namespace: config.namespace.clone(),
            build_budget_usd: config.build_budget_usd,
            build_max_retries: config.build_max_retries,
            model_rates: config.model_rates.clone(),
            test_timeouts: config.test_timeouts.clone(),
            store,
            agent_runner: AgentRunner::new(config.llm_binary.clone()),
            agent_configs: default_agent_configs(),
            on_progress: None,
            git_runner: Mutex::new(None),
        }
    }

    /// Supply a non-default [`GitRunner`] for the worktree manager (mainly
    /// for tests). Only takes effect on the next `execute` call.
    pub fn with_git_runner(self, git: Box<dyn GitRunner>) -> Self {
        *self.git_runner.lock().unwrap() = Some(git);
        self
    }

    /// Replace the default agent-role table (mainly for tests).
    pub fn with_agent_configs(mut self, configs: HashMap<String, AgentConfig>) -> Self {
        self.agent_configs = configs;
        self
    }

    /// Inject a non-default [`AgentRunner`] (mainly for tests, to supply a
    /// mock process spawner).
    pub fn with_agent_runner(mut self, runner: AgentRunner) -> Self {
        self.agent_runner = runner;
        self
    }

    pub fn with_progress_callback(mut self, callback: impl Fn(&Dashboard) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Box::new(callback));
        self
    }

    /// Look up a configured timeout override for `level` (from
    /// `Config::test_timeouts`), keyed by the level's snake_case name.
    fn test_timeout_for(&self, level: TestLevel) -> Option<Duration> {
        let key = match level {
            TestLevel::Smoke => "smoke",
            TestLevel::Fast => "fast",
            TestLevel::Normal => "normal",
            TestLevel::Full => "full",
        };
        self.test_timeouts.get(key).map(|secs| Duration::from_secs(*secs))
    }

    /// Run the full pipeline for `description` against the configured
    /// project. Always returns a [`Dashboard`] — pipeline failures land the
    /// task in the terminal ERROR status rather than surfacing as a Rust
    /// error, matching the task-as-data model the store persists.
    pub async fn execute(&self, description: &str) -> Dashboard {
        let mut task = Task::new(self.project_path.clone(), description);
        bo_core::store::log_store_err("create_task", self.store.create_task(&task).await);

        let cost_tracker =
            CostTracker::new(task.id.clone(), self.build_budget_usd).with_model_rates(self.model_rates.clone());
        let mut agent_rows: Vec<AgentDashboardEntry> = Vec::new();
        let git: Box<dyn GitRunner> = self.git_runner.lock().unwrap().take().unwrap_or_else(|| Box::new(RealGitRunner));
        let mut worktrees =
            WorktreeManager::with_git_runner(self.project_path.clone(), task.id.clone(), self.namespace.clone(), git);

        let baseline = capture_baseline(&self.project_path).await;
        let mut regression_tracker = RegressionTracker::new(task.id.clone(), baseline.clone());
        let mut current_tests = baseline.total_tests;

        self.set_status(&mut task, TaskStatus::Planning).await;
        self.emit_progress(&task, &cost_tracker, &agent_rows, &baseline, baseline.total_tests, 0).await;

        let outcome = self
            .run_pipeline(
                &mut task,
                &cost_tracker,
                &mut agent_rows,
                &mut worktrees,
                &mut regression_tracker,
                &baseline,
                &mut current_tests,
            )
            .await;

        let regressions = regression_tracker.total_regressions();

        match outcome {
            Ok(()) => {
                self.set_status(&mut task, TaskStatus::Done).await;
                task.completed_at = Some(chrono::Utc::now());
            }
            Err(e) => {
                let message: String = e.to_string().chars().take(MAX_ERROR_CHARS).collect();
                warn!(task_id = %task.id, error = %message, "task failed");
                task.error = Some(message);
                self.set_status(&mut task, TaskStatus::Error).await;
            }
        }

        task.total_cost_usd = cost_tracker.total_cost().await;
        task.total_tokens = cost_tracker.total_tokens().await;
        bo_core::store::log_store_err("update_task (final)", self.store.update_task(&task).await);

        worktrees.cleanup();

        let dashboard = self
            .build_dashboard(&task, &cost_tracker, &agent_rows, &baseline, current_tests, regressions)
            .await;
        self.notify(&dashboard);
        dashboard
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_pipeline(
        &self,
        task: &mut Task,
        cost_tracker: &CostTracker,
        agent_rows: &mut Vec<AgentDashboardEntry>,
        worktrees: &mut WorktreeManager,
        regression_tracker: &mut RegressionTracker,
        baseline: &bo_core::TestBaseline,
        current_tests: &mut u32,
    ) -> Result<()> {
        let plan = self.run_planner(task, cost_tracker).await;
        task.plan = Some(plan.clone());
        bo_core::store::log_store_err("update_task (plan)", self.store.update_task(task).await);

        let mut handoff = plan.description.clone();

        self.set_status(task, TaskStatus::Executing).await;
        *agent_rows = plan.agents.iter().map(|a| AgentDashboardEntry::waiting(a.role.clone())).collect();
        self.emit_progress_rows(task, cost_tracker, agent_rows, baseline).await;

        for agent_task in &plan.agents {
            if cost_tracker.budget_exceeded().await {
                warn!(task_id = %task.id, "budget exhausted; stopping before remaining agents");
                break;
            }

            let Some(agent_config) = self.agent_configs.get(&agent_task.role).cloned() else {
                warn!(task_id = %task.id, role = %agent_task.role, "unknown agent role in plan; skipping");
                continue;
            };

            let wt_path = worktrees.create(&agent_task.role)?;
            self.set_agent_row(agent_rows, &agent_task.role, "running", 0.0, 0.0, 0);
            self.emit_progress_rows(task, cost_tracker, agent_rows, baseline).await;

            let mut error_context: Option<String> = None;
            let mut succeeded = false;

            for attempt in 1..=self.build_max_retries {
                let prompt = compose_agent_prompt(agent_task);
                let base_prompt = self.load_role_prompt(&agent_task.role);
                let ctx = RunContext {
                    handoff: Some(handoff.clone()),
                    file_ownership: None,
                    error_context: error_context.clone(),
                };

                let result = self
                    .agent_runner
                    .run(&agent_config, &base_prompt, &prompt, &wt_path, ctx)
                    .await;

                let snapshot = cost_tracker
                    .record(
                        agent_task.role.clone(),
                        agent_config.model.clone(),
                        result.input_tokens,
                        result.output_tokens,
                        result.duration_seconds,
                    )
                    .await;

                let message = format!("feat({}): {}", agent_task.role, truncate(&agent_task.description, 60));
                let _ = worktrees.commit_agent_work(&agent_task.role, &message);

                let test_result =
                    run_test_level(TestLevel::Fast, &wt_path, self.test_timeout_for(TestLevel::Fast)).await?;
                *current_tests = test_result.total_tests;
                bo_core::store::log_store_err(
                    "insert_test_result",
                    self.store.insert_test_result(&task.id, None, &test_result).await,
                );
                let delta = regression_tracker.check(&agent_task.role, &test_result);
                bo_core::store::log_store_err(
                    "insert_regression_log",
                    self.store
                        .insert_regression_log(&bo_core::RegressionLogEntry {
                            task_id: task.id.clone(),
                            role: agent_task.role.clone(),
                            tests_before: delta.total_before,
                            tests_after: delta.total_after,
                            regressions: delta.newly_failing,
                            new_tests: delta.newly_added,
                            regression_rate: regression_tracker.regression_rate(&agent_task.role),
                            created_at: chrono::Utc::now(),
                        })
                        .await,
                );

                info!(
                    task_id = %task.id,
                    role = %agent_task.role,
                    attempt,
                    cost_usd = snapshot.cost_usd,
                    test_passed = test_result.passed,
                    "agent attempt finished"
                );

                if result.status == AgentStatus::Success && test_result.passed {
                    self.set_agent_row(
                        agent_rows,
                        &agent_task.role,
                        "done",
                        snapshot.cost_usd,
                        result.duration_seconds,
                        result.input_tokens + result.output_tokens,
                    );
                    handoff.push_str(&format!(
                        "\n## {} (done)\nFiles: {}\nTests added: {}",
                        agent_task.role,
                        if result.files_modified.is_empty() {
                            "none".to_string()
                        } else {
                            result.files_modified.join(", ")
                        },
                        result.tests_added
                    ));
                    self.emit_progress_rows(task, cost_tracker, agent_rows, baseline).await;
                    succeeded = true;
                    break;
                }

                let mut ctx_parts = vec![format_compact(&test_result)];
                if !result.errors.is_empty() {
                    ctx_parts.push(result.errors.join("; "));
                }
                if delta.newly_failing > 0 {
                    ctx_parts.push(format!("REGRESSION: {} tests broke vs baseline", delta.newly_failing));
                }
                error_context = Some(ctx_parts.join("\n"));
            }

            if !succeeded {
                self.set_agent_row(agent_rows, &agent_task.role, "error", 0.0, 0.0, 0);
                self.emit_progress_rows(task, cost_tracker, agent_rows, baseline).await;
                worktrees.remove(&agent_task.role);
                return Err(OrchestratorError::AgentFailed {
                    role: agent_task.role.clone(),
                    retries: self.build_max_retries,
                });
            }
        }

        self.set_status(task, TaskStatus::Merging).await;
        self.emit_progress_rows(task, cost_tracker, agent_rows, baseline).await;

        let integration_branch = format!("{}/integration/{}", self.namespace, task.id);
        let conflicts = worktrees.merge_to_integration(&integration_branch);
        if !conflicts.is_empty() {
            return Err(OrchestratorError::Merge(conflicts.join("; ")));
        }
        task.integration_branch = Some(integration_branch);

        self.set_status(task, TaskStatus::Testing).await;
        self.emit_progress_rows(task, cost_tracker, agent_rows, baseline).await;

        let final_result =
            run_test_level(TestLevel::Normal, &self.project_path, self.test_timeout_for(TestLevel::Normal)).await?;
        *current_tests = final_result.total_tests;
        bo_core::store::log_store_err(
            "insert_test_result (final)",
            self.store.insert_test_result(&task.id, None, &final_result).await,
        );
        if !final_result.passed {
            return Err(OrchestratorError::Testing(format_compact(&final_result)));
        }

        Ok(())
    }

    async fn run_planner(&self, task: &Task, cost_tracker: &CostTracker) -> bo_core::ExecutionPlan {
        let planner_config = self
            .agent_configs
            .get("planner")
            .cloned()
            .unwrap_or_else(|| default_agent_configs()["planner"].clone());

        let prompt = format!(
            "Produce an execution plan for the following project task:\n{}\n\n\
             Respond with a JSON object: {{\"agents\": [{{\"role\": ..., \"description\": ..., \
             \"files_to_modify\": [...], \"files_to_create\": [...]}}]}}.",
            task.description
        );
        let base_prompt = self.load_role_prompt("planner");

        let result = self
            .agent_runner
            .run(&planner_config, &base_prompt, &prompt, &self.project_path, RunContext::default())
            .await;

        cost_tracker
            .record(
                "planner",
                planner_config.model.clone(),
                result.input_tokens,
                result.output_tokens,
                result.duration_seconds,
            )
            .await;

        extract_plan(&result.raw_output, &task.id, &task.description)
    }

    fn load_role_prompt(&self, role: &str) -> String {
        let path = bo_core::config::expand_tilde(&format!("~/.bo/agents/{role}.md"));
        std::fs::read_to_string(&path)
            .unwrap_or_else(|_| format!("You are the {role} agent for a Rust project."))
    }

    async fn set_status(&self, task: &mut Task, status: TaskStatus) {
        if !task.status.can_transition_to(status) {
            warn!(task_id = %task.id, from = task.status.as_str(), to = status.as_str(), "ignoring invalid transition");
            return;
        }
        task.status = status;
        task.updated_at = chrono::Utc::now();
        bo_core::store::log_store_err("update_task (status)", self.store.update_task(task).await);
    }

    fn set_agent_row(
        &self,
        rows: &mut [AgentDashboardEntry],
        role: &str,
        status: &str,
        cost_usd: f64,
        duration_seconds: f64,
        tokens: u64,
    ) {
        if let Some(row) = rows.iter_mut().find(|r| r.role == role) {
            row.status = status.to_string();
            row.cost_usd = cost_usd;
            row.duration_seconds = duration_seconds;
            row.tokens = tokens;
        }
    }

    async fn emit_progress_rows(
        &self,
        task: &Task,
        cost_tracker: &CostTracker,
        agent_rows: &[AgentDashboardEntry],
        baseline: &bo_core::TestBaseline,
    ) {
        let dashboard = Dashboard {
            task_id: task.id.clone(),
            description: task.description.clone(),
            status: task.status,
            agents: agent_rows.to_vec(),
            total_cost_usd: cost_tracker.total_cost().await,
            budget_usd: self.build_budget_usd,
            compile_ok: None,
            clippy_ok: None,
            tests_status: "pending".to_string(),
            baseline_tests: baseline.total_tests,
            current_tests: baseline.total_tests,
            regressions: 0,
        };
        self.notify(&dashboard);
    }

    #[allow(clippy::too_many_arguments)]
    async fn emit_progress(
        &self,
        task: &Task,
        cost_tracker: &CostTracker,
        agent_rows: &[AgentDashboardEntry],
        baseline: &bo_core::TestBaseline,
        current_tests: u32,
        regressions: u32,
    ) {
        let dashboard = self
            .build_dashboard(task, cost_tracker, agent_rows, baseline, current_tests, regressions)
            .await;
        self.notify(&dashboard);
    }

    #[allow(clippy::too_many_arguments)]
    async fn build_dashboard(
        &self,
        task: &Task,
        cost_tracker: &CostTracker,
        agent_rows: &[AgentDashboardEntry],
        baseline: &bo_core::TestBaseline,
        current_tests: u32,
        regressions: u32,
    ) -> Dashboard {
        Dashboard {
            task_id: task.id.clone(),
            description: task.description.clone(),
            status: task.status,
            agents: agent_rows.to_vec(),
            total_cost_usd: cost_tracker.total_cost().await,
            budget_usd: self.build_budget_usd,
            compile_ok: None,
            clippy_ok: None,
            tests_status: match task.status {
                TaskStatus::Done => "passed".to_string(),
                TaskStatus::Error => "failed".to_string(),
                _ => "pending".to_string(),
            },
            baseline_tests: baseline.total_tests,
            current_tests,
            regressions,
        }
    }

    fn notify(&self, dashboard: &Dashboard) {
        if let Some(cb) = &self.on_progress {
            cb(dashboard);
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bo_agent::{ProcessSpawner, RawOutput};
    use bo_worktree::GitOutput;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct ScriptedSpawner {
        responses: Mutex<Vec<String>>,
    }

    impl ScriptedSpawner {
        fn new(responses: Vec<&str>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().map(|s| s.to_string()).collect()),
            }
        }
    }

    #[async_trait]
    impl ProcessSpawner for ScriptedSpawner {
        async fn spawn(
            &self,
            _program: &str,
            _args: &[String],
            _cwd: &str,
            _timeout: Duration,
        ) -> bo_agent::Result<RawOutput> {
            let mut responses = self.responses.lock().unwrap();
            let stdout = if responses.is_empty() {
                String::new()
            } else {
                responses.remove(0)
            };
            Ok(RawOutput {
                stdout,
                stderr: String::new(),
                timed_out: false,
            })
        }
    }

    struct AlwaysOkGit {
        calls: AtomicUsize,
    }

    impl AlwaysOkGit {
        fn new() -> Self {
            Self { calls: AtomicUsize::new(0) }
        }
    }

    impl GitRunner for AlwaysOkGit {
        fn run_git(&self, _dir: &str, args: &[&str]) -> std::result::Result<GitOutput, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if args.first() == Some(&"worktree") && args.get(1) == Some(&"add") {
                // The real git binary creates the worktree directory; mirror
                // that so a subsequent `cargo` invocation has somewhere to
                // run rather than failing to spawn at all.
                if let Some(path) = args.last() {
                    let _ = std::fs::create_dir_all(path);
                }
            }
            if args.first() == Some(&"status") {
                return Ok(GitOutput { success: true, stdout: " M file\n".into(), stderr: String::new() });
            }
            if args.first() == Some(&"rev-parse") {
                return Ok(GitOutput { success: true, stdout: "deadbeef\n".into(), stderr: String::new() });
            }
            Ok(GitOutput { success: true, stdout: String::new(), stderr: String::new() })
        }
    }

    fn planner_response() -> String {
        r#"{"result": "```json\n{\"agents\": [{\"role\": \"rust-backend\", \"description\": \"add endpoint\"}]}\n```"}"#.to_string()
    }

    fn agent_success_response() -> String {
        r#"{"result": "## RESULT\nSTATUS: success\nFILES_MODIFIED: src/lib.rs\nTESTS_ADDED: 1\nERRORS: none\n", "cost_usd": 0.01}"#.to_string()
    }

    fn test_configs() -> HashMap<String, AgentConfig> {
        let mut table = default_agent_configs();
        table.get_mut("rust-backend").unwrap().timeout_secs = 5;
        table.get_mut("planner").unwrap().timeout_secs = 5;
        table
    }

    #[tokio::test]
    async fn test_timeout_for_reads_configured_override() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let mut config = bo_core::Config::default();
        config.test_timeouts.insert("fast".to_string(), 42);

        let project = std::env::temp_dir().to_string_lossy().to_string();
        let orch = Orchestrator::new(project, &config, store);

        assert_eq!(orch.test_timeout_for(TestLevel::Fast), Some(Duration::from_secs(42)));
        assert_eq!(orch.test_timeout_for(TestLevel::Normal), None);
    }

    #[tokio::test]
    async fn unknown_role_in_plan_is_skipped_not_fatal() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let config = bo_core::Config::default();

        let responses = vec![
            r#"{"result": "```json\n{\"agents\": [{\"role\": \"mystery-role\", \"description\": \"x\"}]}\n```"}"#
                .to_string(),
        ];
        let runner = AgentRunner::with_spawner("claude", Box::new(ScriptedSpawner::new(responses.iter().map(|s| s.as_str()).collect())));

        let project = std::env::temp_dir().to_string_lossy().to_string();
        let orch = Orchestrator::new(project, &config, store)
            .with_agent_runner(runner)
            .with_agent_configs(test_configs())
            .with_git_runner(Box::new(AlwaysOkGit::new()));

        let dashboard = orch.execute("do something").await;
        // The unknown role never gets a worktree, so it's never marked
        // running or errored -- it just stays "waiting" on the dashboard.
        assert_eq!(dashboard.agents.len(), 1);
        assert_eq!(dashboard.agents[0].role, "mystery-role");
        assert_eq!(dashboard.agents[0].status, "waiting");
    }

    #[tokio::test]
    async fn agent_failure_exhausts_retries_and_errors_task() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let config = bo_core::Config::default();

        let mut responses = vec![planner_response()];
        for _ in 0..3 {
            responses.push(
                r#"{"result": "## RESULT\nSTATUS: error\nFILES_MODIFIED: none\nTESTS_ADDED: 0\nERRORS: compile failed\n"}"#
                    .to_string(),
            );
        }
        let runner = AgentRunner::with_spawner("claude", Box::new(ScriptedSpawner::new(responses.iter().map(|s| s.as_str()).collect())));

        let configs = test_configs();

        let orch = Orchestrator::new(std::env::temp_dir().to_string_lossy().to_string(), &config, store)
            .with_agent_runner(runner)
            .with_agent_configs(configs)
            .with_git_runner(Box::new(AlwaysOkGit::new()));

        let dashboard = orch.execute("do something").await;
        assert_eq!(dashboard.status, TaskStatus::Error);
        assert_eq!(dashboard.agents[0].status, "error");
    }

    #[tokio::test]
    async fn planner_parse_failure_falls_back_to_single_agent_plan() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let config = bo_core::Config::default();

        let responses = vec![r#"{"result": "I cannot produce a plan right now."}"#.to_string()];
        let runner = AgentRunner::with_spawner("claude", Box::new(ScriptedSpawner::new(responses.iter().map(|s| s.as_str()).collect())));

        let orch = Orchestrator::new("/nonexistent/project", &config, store)
            .with_agent_runner(runner)
            .with_agent_configs(test_configs());

        let dashboard = orch.execute("implement a widget").await;
        assert_eq!(dashboard.agents.len(), 1);
        assert_eq!(dashboard.agents[0].role, "rust-backend");
    }

    #[test]
    fn truncate_caps_at_max_chars() {
        assert_eq!(truncate("hello world", 5), "hello");
        assert_eq!(truncate("hi", 5), "hi");
    }

    #[tokio::test]
    async fn agent_success_response_is_accepted_by_parser() {
        // Sanity check the fixture used above parses to a Success status via
        // the real agent-runner envelope parser, not just by construction.
        let runner = AgentRunner::with_spawner(
            "claude",
            Box::new(ScriptedSpawner::new(vec![agent_success_response().as_str()])),
        );
        let cfg = default_agent_configs()["rust-backend"].clone();
        let result = runner
            .run(&cfg, "base", "do it", "/tmp", RunContext::default())
            .await;
        assert_eq!(result.status, AgentStatus::Success);
        assert_eq!(result.files_modified, vec!["src/lib.rs".to_string()]);
    }
}
