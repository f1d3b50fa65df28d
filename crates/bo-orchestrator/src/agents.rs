//! Default agent-role table and execution-plan extraction from planner text.

use std::collections::HashMap;

use bo_core::{AgentConfig, AgentTask, ExecutionPlan};
use regex::Regex;
use tracing::warn;

/// The role table the Orchestrator ships with. Callers may override or
/// extend it; unknown roles encountered in a plan are logged and skipped.
pub fn default_agent_configs() -> HashMap<String, AgentConfig> {
    let mut table = HashMap::new();
    for (role, model, timeout_secs, budget_usd, read_only) in [
        ("planner", "opus", 120, 3.00, true),
        ("rust-backend", "sonnet", 600, 1.50, false),
        ("rust-frontend", "sonnet", 600, 1.50, false),
        ("rust-database", "sonnet", 300, 1.50, false),
        ("rust-architect", "sonnet", 300, 2.00, false),
        ("tester-cargo", "sonnet", 600, 1.00, false),
    ] {
        table.insert(
            role.to_string(),
            AgentConfig {
                role: role.to_string(),
                prompt_file: bo_core::config::expand_tilde(&format!("~/.bo/agents/{role}.md"))
                    .to_string_lossy()
                    .to_string(),
                model: model.to_string(),
                timeout_secs,
                budget_usd,
                owned_files: Vec::new(),
                allowed_tools: Vec::new(),
                depends_on: Vec::new(),
                read_only,
            },
        );
    }
    table
}

/// Extract an [`ExecutionPlan`] from a planner agent's raw text: try a fenced
/// ```json block first, then the first balanced `{...}` object, injecting
/// the real task id/description over whatever the planner produced.
pub fn extract_plan(raw_text: &str, task_id: &str, description: &str) -> ExecutionPlan {
    let candidate = fenced_json_block(raw_text).or_else(|| first_balanced_object(raw_text));

    let Some(candidate) = candidate else {
        warn!(task_id, "planner produced no parsable JSON; falling back to single-agent plan");
        return fallback_plan(task_id, description);
    };

    match serde_json::from_str::<serde_json::Value>(&candidate) {
        Ok(mut value) => {
            if let Some(obj) = value.as_object_mut() {
                obj.insert("task_id".to_string(), serde_json::Value::String(task_id.to_string()));
                obj.insert("description".to_string(), serde_json::Value::String(description.to_string()));
            }
            match serde_json::from_value::<ExecutionPlan>(value) {
                Ok(plan) => plan,
                Err(e) => {
                    warn!(task_id, error = %e, "planner JSON did not match the expected plan shape");
                    fallback_plan(task_id, description)
                }
            }
        }
        Err(e) => {
            warn!(task_id, error = %e, "planner JSON candidate failed to parse");
            fallback_plan(task_id, description)
        }
    }
}

fn fallback_plan(task_id: &str, description: &str) -> ExecutionPlan {
    ExecutionPlan::fallback(task_id, description, "rust-backend")
}

fn fenced_json_block(text: &str) -> Option<String> {
    let re = Regex::new(r"(?s)```json\s*\n(.*?)```").unwrap();
    re.captures(text).map(|c| c[1].trim().to_string())
}

/// Scan for the first `{`, then track brace depth (ignoring braces inside
/// string literals) until it closes, returning that slice.
fn first_balanced_object(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let start = text.find('{')?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        let c = b as char;
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..=i].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Build the prompt handed to one agent task: description plus the files it
/// is expected to touch.
pub fn compose_agent_prompt(task: &AgentTask) -> String {
    let modify = if task.files_to_modify.is_empty() {
        "as needed".to_string()
    } else {
        task.files_to_modify.join(", ")
    };
    let create = if task.files_to_create.is_empty() {
        "as needed".to_string()
    } else {
        task.files_to_create.join(", ")
    };
    format!(
        "Task: {}\nFiles to modify: {modify}\nFiles to create: {create}",
        task.description
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_has_all_six_roles() {
        let table = default_agent_configs();
        for role in ["planner", "rust-backend", "rust-frontend", "rust-database", "rust-architect", "tester-cargo"] {
            assert!(table.contains_key(role), "missing role {role}");
        }
        assert!(table["planner"].read_only);
        assert!(!table["rust-backend"].read_only);
    }

    #[test]
    fn extract_plan_parses_fenced_json_block() {
        let text = "Here is the plan:\n```json\n{\"agents\": [{\"role\": \"rust-backend\", \"description\": \"add endpoint\"}]}\n```\nDone.";
        let plan = extract_plan(text, "task-1", "add a feature");
        assert_eq!(plan.task_id, "task-1");
        assert_eq!(plan.agents.len(), 1);
        assert_eq!(plan.agents[0].role, "rust-backend");
    }

    #[test]
    fn extract_plan_parses_bare_balanced_object() {
        let text = "preamble { \"agents\": [{\"role\": \"rust-frontend\", \"description\": \"x\"}] } trailer";
        let plan = extract_plan(text, "task-2", "add ui");
        assert_eq!(plan.agents.len(), 1);
        assert_eq!(plan.agents[0].role, "rust-frontend");
    }

    #[test]
    fn extract_plan_falls_back_on_unparseable_text() {
        let plan = extract_plan("no json here at all", "task-3", "do the thing");
        assert_eq!(plan.agents.len(), 1);
        assert_eq!(plan.agents[0].role, "rust-backend");
        assert_eq!(plan.description, "do the thing");
    }

    #[test]
    fn compose_agent_prompt_defaults_to_as_needed() {
        let task = AgentTask {
            role: "rust-backend".into(),
            description: "add a feature".into(),
            files_to_modify: vec![],
            files_to_create: vec![],
            depends_on: vec![],
        };
        let prompt = compose_agent_prompt(&task);
        assert!(prompt.contains("Files to modify: as needed"));
        assert!(prompt.contains("Files to create: as needed"));
    }

    #[test]
    fn compose_agent_prompt_lists_files() {
        let task = AgentTask {
            role: "rust-backend".into(),
            description: "add a feature".into(),
            files_to_modify: vec!["src/lib.rs".into()],
            files_to_create: vec!["src/new.rs".into()],
            depends_on: vec![],
        };
        let prompt = compose_agent_prompt(&task);
        assert!(prompt.contains("Files to modify: src/lib.rs"));
        assert!(prompt.contains("Files to create: src/new.rs"));
    }
}
