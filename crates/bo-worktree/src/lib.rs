//! Per-role git worktree isolation for concurrent agents working on the
//! same task, plus merging each role's branch into an integration branch.

use std::collections::HashMap;
use std::path::PathBuf;

use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("git command failed: {0}")]
    GitCommand(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no worktree registered for role {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, WorktreeError>;

/// Output of one `git` invocation.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Abstraction over the `git` CLI so it can be mocked in tests.
pub trait GitRunner: Send + Sync {
    fn run_git(&self, dir: &str, args: &[&str]) -> std::result::Result<GitOutput, String>;
}

/// Shells out to the real `git` binary.
pub struct RealGitRunner;

impl GitRunner for RealGitRunner {
    fn run_git(&self, dir: &str, args: &[&str]) -> std::result::Result<GitOutput, String> {
        let output = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .map_err(|e| e.to_string())?;
        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

fn branch_name(namespace: &str, task_id: &str, role: &str) -> String {
    format!("{namespace}/{task_id}/{role}")
}

/// Manages one task's per-role worktrees under
/// `{project_path}/.{namespace}-worktrees/{task_id}/{role}`.
pub struct WorktreeManager {
    project_path: String,
    task_id: String,
    namespace: String,
    base_dir: PathBuf,
    git: Box<dyn GitRunner>,
    worktrees: HashMap<String, String>,
}

impl WorktreeManager {
    pub fn new(project_path: impl Into<String>, task_id: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self::with_git_runner(project_path, task_id, namespace, Box::new(RealGitRunner))
    }

    pub fn with_git_runner(
        project_path: impl Into<String>,
        task_id: impl Into<String>,
        namespace: impl Into<String>,
        git: Box<dyn GitRunner>,
    ) -> Self {
        let project_path = project_path.into();
        let task_id = task_id.into();
        let namespace = namespace.into();
        let base_dir = PathBuf::from(&project_path)
            .join(format!(".{namespace}-worktrees"))
            .join(&task_id);
        Self {
            project_path,
            task_id,
            namespace,
            base_dir,
            git,
            worktrees: HashMap::new(),
        }
    }

    /// Create a worktree for `role`, branched off the current HEAD.
    pub fn create(&mut self, role: &str) -> Result<String> {
        let branch = branch_name(&self.namespace, &self.task_id, role);
        let wt_path = self.base_dir.join(role);
        std::fs::create_dir_all(&self.base_dir)?;

        let wt_path_str = wt_path.to_string_lossy().to_string();

        let result = self.git.run_git(
            &self.project_path,
            &["worktree", "add", "-b", &branch, &wt_path_str],
        );

        let ok = match &result {
            Ok(out) => out.success,
            Err(_) => false,
        };

        if !ok {
            // Branch may already exist (retry of a previously-started task).
            let retry = self
                .git
                .run_git(&self.project_path, &["worktree", "add", &wt_path_str, &branch]);
            match retry {
                Ok(out) if out.success => {}
                Ok(out) => return Err(WorktreeError::GitCommand(out.stderr)),
                Err(e) => return Err(WorktreeError::GitCommand(e)),
            }
        }

        self.worktrees.insert(role.to_string(), wt_path_str.clone());
        info!(role, path = %wt_path_str, "created worktree");
        Ok(wt_path_str)
    }

    pub fn get_path(&self, role: &str) -> Option<&str> {
        self.worktrees.get(role).map(|s| s.as_str())
    }

    /// Stage and commit all changes in a role's worktree.
    ///
    /// Returns `None` if there is nothing to commit or the commit fails.
    pub fn commit_agent_work(&self, role: &str, message: &str) -> Result<Option<String>> {
        let wt_path = self.worktrees.get(role).ok_or_else(|| WorktreeError::NotFound(role.to_string()))?;

        let add = self.git.run_git(wt_path, &["add", "-A"]).map_err(WorktreeError::GitCommand)?;
        if !add.success {
            return Ok(None);
        }

        let status = self
            .git
            .run_git(wt_path, &["status", "--porcelain"])
            .map_err(WorktreeError::GitCommand)?;
        if status.stdout.trim().is_empty() {
            return Ok(None);
        }

        let commit = self
            .git
            .run_git(wt_path, &["commit", "-m", message])
            .map_err(WorktreeError::GitCommand)?;
        if !commit.success {
            warn!(role, stderr = %commit.stderr, "commit failed");
            return Ok(None);
        }

        let rev = self
            .git
            .run_git(wt_path, &["rev-parse", "HEAD"])
            .map_err(WorktreeError::GitCommand)?;
        if rev.success {
            Ok(Some(rev.stdout.trim().to_string()))
        } else {
            Ok(None)
        }
    }

    /// Remove a role's worktree and delete its branch.
    pub fn remove(&mut self, role: &str) {
        let Some(wt_path) = self.worktrees.get(role).cloned() else {
            return;
        };
        let branch = branch_name(&self.namespace, &self.task_id, role);

        let _ = self.git.run_git(&self.project_path, &["worktree", "remove", "--force", &wt_path]);
        let _ = self.git.run_git(&self.project_path, &["branch", "-D", &branch]);

        self.worktrees.remove(role);
        info!(role, "removed worktree");
    }

    /// Remove every worktree created for this task and prune the task
    /// directory.
    pub fn cleanup(&mut self) {
        let roles: Vec<String> = self.worktrees.keys().cloned().collect();
        for role in roles {
            self.remove(&role);
        }
        if self.base_dir.exists() {
            let _ = self.git.run_git(&self.project_path, &["worktree", "prune"]);
            let _ = std::fs::remove_dir(&self.base_dir);
        }
    }

    /// Merge every role's branch into `integration_branch`, one at a time.
    ///
    /// Returns a list of conflict descriptions; an empty list means every
    /// branch merged cleanly. A conflicting merge is aborted before moving
    /// on to the next role.
    pub fn merge_to_integration(&self, integration_branch: &str) -> Vec<String> {
        let mut conflicts = Vec::new();

        let checkout = self.git.run_git(
            &self.project_path,
            &["checkout", "-B", integration_branch],
        );
        match checkout {
            Ok(out) if out.success => {}
            _ => return vec!["failed to create integration branch".to_string()],
        }

        for (role, _) in &self.worktrees {
            let branch = branch_name(&self.namespace, &self.task_id, role);
            let message = format!("Merge {role} into integration");
            let merge = self.git.run_git(
                &self.project_path,
                &["merge", "--no-ff", &branch, "-m", &message],
            );
            match merge {
                Ok(out) if out.success => {
                    info!(role, "merged into integration branch");
                }
                Ok(out) => {
                    let excerpt: String = out.stderr.trim().chars().take(200).collect();
                    conflicts.push(format!("{role}: {excerpt}"));
                    let _ = self.git.run_git(&self.project_path, &["merge", "--abort"]);
                }
                Err(e) => {
                    conflicts.push(format!("{role}: {e}"));
                }
            }
        }

        conflicts
    }
}
