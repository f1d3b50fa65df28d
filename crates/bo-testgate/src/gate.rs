//! Runs `cargo check`/`cargo test` at a given tier and parses the output
//! into a structured [`TestResult`].

use std::process::Stdio;
use std::time::{Duration, Instant};

use bo_core::{TestBaseline, TestLevel, TestResult};
use regex::Regex;
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("failed to spawn {0}: {1}")]
    Spawn(String, std::io::Error),
}

pub type Result<T> = std::result::Result<T, GateError>;

struct CmdOutput {
    success: bool,
    combined: String,
}

async fn run_cmd(cmd: &[&str], cwd: &str, timeout: Duration) -> Result<CmdOutput> {
    let mut command = Command::new(cmd[0]);
    command
        .args(&cmd[1..])
        .current_dir(cwd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .map_err(|e| GateError::Spawn(cmd.join(" "), e))?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Ok(CmdOutput {
                success: false,
                combined: format!("failed to collect output: {e}"),
            })
        }
        Err(_) => {
            warn!(cmd = cmd.join(" "), timeout_secs = timeout.as_secs(), "test command timed out");
            return Ok(CmdOutput {
                success: false,
                combined: format!("Timeout after {}s", timeout.as_secs()),
            });
        }
    };

    let combined = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    Ok(CmdOutput {
        success: output.status.success(),
        combined,
    })
}

/// Snapshot the current test suite before a task begins, so later runs can
/// be compared against it.
pub async fn capture_baseline(project_path: &str) -> TestBaseline {
    let list = match run_cmd(
        &["cargo", "test", "--workspace", "--", "--list"],
        project_path,
        Duration::from_secs(60),
    )
    .await
    {
        Ok(out) if out.success => out,
        Ok(_) => {
            warn!(project_path, "failed to list tests for baseline");
            return TestBaseline::default();
        }
        Err(e) => {
            warn!(project_path, error = %e, "failed to list tests for baseline");
            return TestBaseline::default();
        }
    };

    let total = list
        .combined
        .lines()
        .filter(|l| l.trim_end().ends_with(": test"))
        .count() as u32;
    let snapshot_hash = fingerprint(&list.combined);

    let run = run_cmd(&["cargo", "test", "--workspace"], project_path, Duration::from_secs(120))
        .await
        .map(|o| o.combined)
        .unwrap_or_default();
    let passing_tests = count_passing(&run);

    TestBaseline {
        total_tests: total,
        passing_tests,
        snapshot_hash,
    }
}

fn fingerprint(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
}

/// Run one test tier and return a structured result.
pub async fn run_test_level(
    level: TestLevel,
    project_path: &str,
    timeout_override: Option<Duration>,
) -> Result<TestResult> {
    let t0 = Instant::now();
    let to = timeout_override.unwrap_or_else(|| Duration::from_secs(level.default_timeout_secs()));

    if level == TestLevel::Smoke {
        let out = run_cmd(&["cargo", "check", "--workspace"], project_path, to).await?;
        return Ok(TestResult {
            level,
            passed: out.success,
            compiler_errors: extract_compiler_errors(&out.combined),
            output_excerpt: compact_output(&out.combined, 50),
            duration_seconds: t0.elapsed().as_secs_f64(),
            ..TestResult::new(level)
        });
    }

    let cmd: &[&str] = match level {
        TestLevel::Fast => &["cargo", "test", "--lib"],
        _ => &["cargo", "test", "--workspace"],
    };

    let out = run_cmd(cmd, project_path, to).await?;
    let passed_count = count_passing(&out.combined);
    let failed_count = count_failed(&out.combined);
    let failed_names = extract_failed_tests(&out.combined);

    let mut result = TestResult {
        level,
        passed: out.success,
        total_tests: passed_count + failed_count,
        passed_tests: passed_count,
        failed_tests: failed_names,
        compiler_errors: extract_compiler_errors(&out.combined),
        output_excerpt: compact_output(&out.combined, 50),
        duration_seconds: t0.elapsed().as_secs_f64(),
        ..TestResult::new(level)
    };

    if level == TestLevel::Full {
        let trunk = run_cmd(&["trunk", "build"], project_path, Duration::from_secs(300)).await?;
        if !trunk.success {
            result.passed = false;
            let excerpt: String = trunk.combined.chars().take(200).collect();
            result.compiler_errors.push(format!("trunk build failed: {excerpt}"));
        }
    }

    Ok(result)
}

fn count_passing(output: &str) -> u32 {
    let re = Regex::new(r"test result: \w+\.\s+(\d+) passed").unwrap();
    re.captures_iter(output)
        .filter_map(|c| c[1].parse::<u32>().ok())
        .sum()
}

fn count_failed(output: &str) -> u32 {
    let re = Regex::new(r"(\d+) failed").unwrap();
    re.captures_iter(output)
        .filter_map(|c| c[1].parse::<u32>().ok())
        .sum()
}

fn extract_failed_tests(output: &str) -> Vec<String> {
    let mut failed = Vec::new();
    let stdout_re = Regex::new(r"---- (\S+) stdout ----").unwrap();
    for cap in stdout_re.captures_iter(output) {
        failed.push(cap[1].to_string());
    }
    let failed_re = Regex::new(r"test (\S+) \.\.\. FAILED").unwrap();
    for cap in failed_re.captures_iter(output) {
        let name = cap[1].to_string();
        if !failed.contains(&name) {
            failed.push(name);
        }
    }
    failed
}

fn extract_compiler_errors(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|l| l.starts_with("error[") || l.starts_with("error:"))
        .map(|l| l.trim().to_string())
        .take(20)
        .collect()
}

/// Render a tiered test result as `OK:`/`ERROR:`/`REGRESSION:` lines suited
/// for injection into a follow-up agent prompt.
pub fn format_compact(result: &TestResult) -> String {
    if result.passed {
        return format!(
            "OK: {}/{} tests passing ({:.1}s)",
            result.passed_tests, result.total_tests, result.duration_seconds
        );
    }
    let mut lines = Vec::new();
    for err in result.compiler_errors.iter().take(5) {
        lines.push(format!("ERROR: {err}"));
    }
    for name in result.failed_tests.iter().take(5) {
        lines.push(format!("ERROR: {name} — FAILED"));
    }
    if result.regressions > 0 {
        lines.push(format!("REGRESSION: {} tests broke vs baseline", result.regressions));
    }
    if lines.is_empty() {
        let excerpt: String = result.output_excerpt.chars().take(100).collect();
        format!("ERROR: tests failed ({excerpt})")
    } else {
        lines.join("\n")
    }
}

fn compact_output(output: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();
    if lines.len() <= max_lines {
        return output.to_string();
    }
    let head = &lines[..10.min(lines.len())];
    let tail_start = lines.len().saturating_sub(40);
    let tail = &lines[tail_start..];
    let mut out = head.join("\n");
    out.push_str("\n... (truncated) ...\n");
    out.push_str(&tail.join("\n"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_passing_sums_across_suites() {
        let output = "test result: ok. 3 passed; 0 failed\ntest result: ok. 2 passed; 1 failed";
        assert_eq!(count_passing(output), 5);
    }

    #[test]
    fn count_failed_sums_failures() {
        let output = "test result: FAILED. 2 passed; 3 failed";
        assert_eq!(count_failed(output), 3);
    }

    #[test]
    fn extract_failed_tests_dedupes() {
        let output = "---- foo::bar stdout ----\ntest foo::bar ... FAILED\ntest baz::qux ... FAILED";
        let failed = extract_failed_tests(output);
        assert_eq!(failed, vec!["foo::bar".to_string(), "baz::qux".to_string()]);
    }

    #[test]
    fn extract_compiler_errors_caps_at_twenty() {
        let output = (0..30).map(|i| format!("error[E{i:04}]: oops\n")).collect::<String>();
        let errors = extract_compiler_errors(&output);
        assert_eq!(errors.len(), 20);
    }

    #[test]
    fn format_compact_ok_case() {
        let mut result = TestResult::new(TestLevel::Fast);
        result.passed = true;
        result.passed_tests = 5;
        result.total_tests = 5;
        let line = format_compact(&result);
        assert!(line.starts_with("OK:"));
    }

    #[test]
    fn format_compact_failure_lists_errors() {
        let mut result = TestResult::new(TestLevel::Fast);
        result.passed = false;
        result.compiler_errors = vec!["error: mismatched types".into()];
        let line = format_compact(&result);
        assert!(line.contains("ERROR: error: mismatched types"));
    }

    #[test]
    fn format_compact_notes_regressions() {
        let mut result = TestResult::new(TestLevel::Normal);
        result.passed = false;
        result.failed_tests = vec!["mod::test_a".into()];
        result.regressions = 2;
        let line = format_compact(&result);
        assert!(line.contains("REGRESSION: 2 tests broke vs baseline"));
    }

    #[test]
    fn compact_output_passes_short_output_through() {
        let output = "line1\nline2";
        assert_eq!(compact_output(output, 50), output);
    }

    #[test]
    fn compact_output_truncates_long_output() {
        let output = (0..100).map(|i| format!("line{i}\n")).collect::<String>();
        let compacted = compact_output(&output, 50);
        assert!(compacted.contains("truncated"));
    }

    #[tokio::test]
    async fn run_test_level_smoke_on_nonexistent_dir_fails_cleanly() {
        let result = run_test_level(TestLevel::Smoke, "/nonexistent/project/path", None).await;
        assert!(result.is_err() || !result.unwrap().passed);
    }
}
