//! Spawns a single LLM CLI agent process, composes its system prompt from
//! context blocks, and parses the structured result it reports back.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use bo_core::{AgentConfig, AgentResult, AgentStatus};
use regex::Regex;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum AgentRunError {
    #[error("failed to spawn {0}: {1}")]
    Spawn(String, String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AgentRunError>;

/// Instruction appended to every agent's system prompt asking it to report
/// a machine-parsable summary of what it did.
pub const RESULT_BLOCK_INSTRUCTION: &str = "
When you are done, output a summary block in EXACTLY this format:

## RESULT
STATUS: success|error
FILES_MODIFIED: file1.rs, file2.rs
TESTS_ADDED: 0
ERRORS: none
";

/// Raw bytes collected from a finished (or timed-out) process.
pub struct RawOutput {
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

/// Abstraction over spawning the LLM CLI binary, so agent orchestration can
/// be tested without shelling out to a real binary.
#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    async fn spawn(&self, program: &str, args: &[String], cwd: &str, timeout: Duration) -> Result<RawOutput>;
}

/// Spawns the real LLM CLI via `tokio::process::Command`.
pub struct RealSpawner;

#[async_trait]
impl ProcessSpawner for RealSpawner {
    async fn spawn(&self, program: &str, args: &[String], cwd: &str, timeout: Duration) -> Result<RawOutput> {
        let tmpdir = bo_core::config::expand_tilde("~/tmp");
        std::fs::create_dir_all(&tmpdir).ok();

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(cwd)
            .env("NO_COLOR", "1")
            .env("TMPDIR", &tmpdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|e| AgentRunError::Spawn(program.to_string(), e.to_string()))?;

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(RawOutput {
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                timed_out: false,
            }),
            Ok(Err(e)) => Err(AgentRunError::Io(e)),
            Err(_) => Ok(RawOutput {
                stdout: String::new(),
                stderr: format!("Timeout after {}s", timeout.as_secs()),
                timed_out: true,
            }),
        }
    }
}

/// Context injected ahead of the result-block instruction for one agent run.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub handoff: Option<String>,
    pub file_ownership: Option<String>,
    pub error_context: Option<String>,
}

/// Drives one agent role's CLI invocation end to end: builds the prompt,
/// spawns the process, and parses its structured result.
pub struct AgentRunner {
    llm_binary: String,
    spawner: Box<dyn ProcessSpawner>,
}

impl AgentRunner {
    pub fn new(llm_binary: impl Into<String>) -> Self {
        Self {
            llm_binary: llm_binary.into(),
            spawner: Box::new(RealSpawner),
        }
    }

    pub fn with_spawner(llm_binary: impl Into<String>, spawner: Box<dyn ProcessSpawner>) -> Self {
        Self {
            llm_binary: llm_binary.into(),
            spawner,
        }
    }

    /// Run one agent invocation in `cwd` and return its structured result.
    pub async fn run(
        &self,
        agent_config: &AgentConfig,
        base_system_prompt: &str,
        prompt: &str,
        cwd: &str,
        ctx: RunContext,
    ) -> AgentResult {
        let full_system = compose_system_prompt(base_system_prompt, &ctx);

        let mut args = vec![
            "-p".to_string(),
            prompt.to_string(),
            "--output-format".to_string(),
            "json".to_string(),
            "--dangerously-skip-permissions".to_string(),
            "--model".to_string(),
            agent_config.model.clone(),
            "--append-system-prompt".to_string(),
            full_system,
        ];
        if agent_config.budget_usd > 0.0 {
            args.push("--max-turns".to_string());
            args.push("50".to_string());
        }

        info!(role = %agent_config.role, model = %agent_config.model, cwd, "starting agent");

        let timeout = Duration::from_secs(agent_config.timeout_secs);
        let t0 = std::time::Instant::now();

        let raw = match self.spawner.spawn(&self.llm_binary, &args, cwd, timeout).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(role = %agent_config.role, error = %e, "agent spawn failed");
                return AgentResult {
                    status: AgentStatus::Failed,
                    errors: vec![e.to_string()],
                    duration_seconds: t0.elapsed().as_secs_f64(),
                    ..AgentResult::default()
                };
            }
        };

        if raw.timed_out {
            return AgentResult {
                status: AgentStatus::Failed,
                errors: vec![format!("Timeout after {}s", agent_config.timeout_secs)],
                duration_seconds: t0.elapsed().as_secs_f64(),
                ..AgentResult::default()
            };
        }

        if !raw.stderr.is_empty() {
            let excerpt: String = raw.stderr.chars().take(500).collect();
            debug!(role = %agent_config.role, stderr = %excerpt, "agent stderr");
        }

        let trimmed = raw.stdout.trim();
        if trimmed.is_empty() {
            return AgentResult {
                status: AgentStatus::Failed,
                errors: vec!["Empty output from agent CLI".to_string()],
                duration_seconds: t0.elapsed().as_secs_f64(),
                ..AgentResult::default()
            };
        }

        let mut result = parse_cli_envelope(trimmed);
        result.duration_seconds = t0.elapsed().as_secs_f64();
        result
    }
}

fn compose_system_prompt(base: &str, ctx: &RunContext) -> String {
    let mut parts = Vec::new();
    if let Some(handoff) = &ctx.handoff {
        parts.push(format!("## HANDOFF\n{handoff}"));
    }
    if let Some(ownership) = &ctx.file_ownership {
        parts.push(format!("## FILE OWNERSHIP\n{ownership}"));
    }
    if let Some(errors) = &ctx.error_context {
        parts.push(format!("## PREVIOUS ERRORS (fix these)\n{errors}"));
    }
    parts.push(RESULT_BLOCK_INSTRUCTION.to_string());
    format!("{base}\n\n{}", parts.join("\n\n"))
}

/// Parse the CLI's top-level JSON envelope (`{"result": "...", "usage": {...},
/// "cost_usd": ...}`), falling back to treating the raw text as the result
/// body if it isn't JSON.
fn parse_cli_envelope(raw: &str) -> AgentResult {
    let (result_text, input_tokens, output_tokens, cost_usd) =
        match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(value) => {
                let result_text = value
                    .get("result")
                    .and_then(|v| v.as_str())
                    .unwrap_or(raw)
                    .to_string();
                let usage = value.get("usage");
                let input = value
                    .get("input_tokens")
                    .and_then(|v| v.as_u64())
                    .or_else(|| usage.and_then(|u| u.get("input_tokens")).and_then(|v| v.as_u64()))
                    .unwrap_or(0);
                let output = value
                    .get("output_tokens")
                    .and_then(|v| v.as_u64())
                    .or_else(|| usage.and_then(|u| u.get("output_tokens")).and_then(|v| v.as_u64()))
                    .unwrap_or(0);
                let cost = value.get("cost_usd").and_then(|v| v.as_f64()).unwrap_or(0.0);
                (result_text, input, output, cost)
            }
            Err(_) => (raw.to_string(), 0, 0, 0.0),
        };

    let mut result = parse_result_block(&result_text);
    result.raw_output = result_text;
    result.input_tokens = input_tokens;
    result.output_tokens = output_tokens;
    result.cost_usd = cost_usd;
    result
}

/// Parse the `## RESULT` block an agent is instructed to emit.
fn parse_result_block(text: &str) -> AgentResult {
    let mut result = AgentResult::default();

    let block_re = Regex::new(r"(?s)## RESULT\s*\n(.*?)(?:\n##|\z)").unwrap();
    let Some(caps) = block_re.captures(text) else {
        // No structured block — assume the agent completed normally.
        result.status = AgentStatus::Success;
        return result;
    };
    let block = &caps[1];

    if let Some(status_caps) = Regex::new(r"STATUS:\s*(\w+)").unwrap().captures(block) {
        result.status = if status_caps[1].eq_ignore_ascii_case("success") {
            AgentStatus::Success
        } else {
            AgentStatus::Failed
        };
    }

    if let Some(files_caps) = Regex::new(r"FILES_MODIFIED:\s*(.+)").unwrap().captures(block) {
        result.files_modified = files_caps[1]
            .split(',')
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty() && !f.eq_ignore_ascii_case("none"))
            .collect();
    }

    if let Some(tests_caps) = Regex::new(r"TESTS_ADDED:\s*(\d+)").unwrap().captures(block) {
        result.tests_added = tests_caps[1].parse().unwrap_or(0);
    }

    if let Some(errors_caps) = Regex::new(r"ERRORS:\s*(.+)").unwrap().captures(block) {
        let err_text = errors_caps[1].trim();
        if !err_text.eq_ignore_ascii_case("none") {
            result.errors = vec![err_text.to_string()];
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct MockSpawner {
        responses: Mutex<Vec<RawOutput>>,
        calls: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl MockSpawner {
        fn new(stdout: &str) -> Self {
            Self {
                responses: Mutex::new(vec![RawOutput {
                    stdout: stdout.to_string(),
                    stderr: String::new(),
                    timed_out: false,
                }]),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn timeout() -> Self {
            Self {
                responses: Mutex::new(vec![RawOutput {
                    stdout: String::new(),
                    stderr: "Timeout after 5s".to_string(),
                    timed_out: true,
                }]),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ProcessSpawner for MockSpawner {
        async fn spawn(&self, program: &str, args: &[String], _cwd: &str, _timeout: Duration) -> Result<RawOutput> {
            self.calls.lock().unwrap().push((program.to_string(), args.to_vec()));
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(RawOutput {
                    stdout: String::new(),
                    stderr: String::new(),
                    timed_out: false,
                })
            } else {
                let r = responses.remove(0);
                Ok(RawOutput {
                    stdout: r.stdout,
                    stderr: r.stderr,
                    timed_out: r.timed_out,
                })
            }
        }
    }

    fn test_config() -> AgentConfig {
        AgentConfig {
            role: "rust-backend".into(),
            prompt_file: "agents/rust-backend.md".into(),
            model: "sonnet".into(),
            timeout_secs: 600,
            budget_usd: 1.5,
            owned_files: vec![],
            allowed_tools: vec![],
            depends_on: vec![],
            read_only: false,
        }
    }

    #[test]
    fn parse_result_block_success_case() {
        let text = "some preamble\n## RESULT\nSTATUS: success\nFILES_MODIFIED: src/a.rs, src/b.rs\nTESTS_ADDED: 2\nERRORS: none\n";
        let result = parse_result_block(text);
        assert_eq!(result.status, AgentStatus::Success);
        assert_eq!(result.files_modified, vec!["src/a.rs", "src/b.rs"]);
        assert_eq!(result.tests_added, 2);
        assert!(result.errors.is_empty());
    }

    #[test]
    fn parse_result_block_error_case() {
        let text = "## RESULT\nSTATUS: error\nFILES_MODIFIED: none\nTESTS_ADDED: 0\nERRORS: compile failed\n";
        let result = parse_result_block(text);
        assert_eq!(result.status, AgentStatus::Failed);
        assert!(result.files_modified.is_empty());
        assert_eq!(result.errors, vec!["compile failed".to_string()]);
    }

    #[test]
    fn parse_result_block_missing_defaults_to_success() {
        let result = parse_result_block("I finished the task with no structured output.");
        assert_eq!(result.status, AgentStatus::Success);
    }

    #[test]
    fn parse_cli_envelope_extracts_usage() {
        let raw = r#"{"result": "## RESULT\nSTATUS: success\nFILES_MODIFIED: none\nTESTS_ADDED: 0\nERRORS: none\n", "usage": {"input_tokens": 100, "output_tokens": 50}, "cost_usd": 0.01}"#;
        let result = parse_cli_envelope(raw);
        assert_eq!(result.input_tokens, 100);
        assert_eq!(result.output_tokens, 50);
        assert!((result.cost_usd - 0.01).abs() < 1e-9);
        assert_eq!(result.status, AgentStatus::Success);
    }

    #[test]
    fn parse_cli_envelope_falls_back_on_non_json() {
        let result = parse_cli_envelope("not json at all");
        assert_eq!(result.input_tokens, 0);
        assert_eq!(result.raw_output, "not json at all");
    }

    #[tokio::test]
    async fn run_returns_parsed_result_on_success() {
        let stdout = r#"{"result": "## RESULT\nSTATUS: success\nFILES_MODIFIED: src/lib.rs\nTESTS_ADDED: 1\nERRORS: none\n", "cost_usd": 0.02}"#;
        let runner = AgentRunner::with_spawner("claude", Box::new(MockSpawner::new(stdout)));
        let result = runner
            .run(&test_config(), "You are the rust-backend agent.", "add a feature", "/tmp/proj", RunContext::default())
            .await;

        assert_eq!(result.status, AgentStatus::Success);
        assert_eq!(result.files_modified, vec!["src/lib.rs"]);
        assert_eq!(result.tests_added, 1);
    }

    #[tokio::test]
    async fn run_reports_timeout_as_failure() {
        let runner = AgentRunner::with_spawner("claude", Box::new(MockSpawner::timeout()));
        let result = runner
            .run(&test_config(), "base prompt", "do it", "/tmp/proj", RunContext::default())
            .await;

        assert_eq!(result.status, AgentStatus::Failed);
        assert!(result.errors[0].contains("Timeout"));
    }

    #[tokio::test]
    async fn run_reports_empty_output_as_failure() {
        let runner = AgentRunner::with_spawner("claude", Box::new(MockSpawner::new("")));
        let result = runner
            .run(&test_config(), "base prompt", "do it", "/tmp/proj", RunContext::default())
            .await;

        assert_eq!(result.status, AgentStatus::Failed);
        assert!(result.errors[0].contains("Empty output"));
    }

    #[tokio::test]
    async fn composed_prompt_includes_error_context() {
        let stdout = r#"{"result": "## RESULT\nSTATUS: success\nFILES_MODIFIED: none\nTESTS_ADDED: 0\nERRORS: none\n"}"#;
        let spawner = MockSpawner::new(stdout);
        let runner = AgentRunner::with_spawner("claude", Box::new(spawner));
        let ctx = RunContext {
            handoff: None,
            file_ownership: None,
            error_context: Some("previous attempt failed to compile".to_string()),
        };
        let result = runner
            .run(&test_config(), "base prompt", "fix it", "/tmp/proj", ctx)
            .await;
        assert_eq!(result.status, AgentStatus::Success);
    }
}
