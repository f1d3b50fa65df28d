//! Tracks per-agent test deltas against a task's baseline and flags
//! regressions (agents whose change made previously-passing tests fail).

use std::collections::HashMap;

use bo_core::{TestBaseline, TestDelta, TestResult};
use tracing::warn;

/// Per-agent regression bookkeeping for a single task.
pub struct RegressionTracker {
    task_id: String,
    baseline: TestBaseline,
    per_agent: HashMap<String, TestDelta>,
}

impl RegressionTracker {
    pub fn new(task_id: impl Into<String>, baseline: TestBaseline) -> Self {
        Self {
            task_id: task_id.into(),
            baseline,
            per_agent: HashMap::new(),
        }
    }

    /// Compare `result` to the task baseline, record the delta, and warn if
    /// the agent broke previously-passing tests.
    pub fn check(&mut self, agent_role: &str, result: &TestResult) -> TestDelta {
        let delta = TestDelta::compare(&self.baseline, result);
        self.per_agent.insert(agent_role.to_string(), delta.clone());

        if delta.newly_failing > 0 {
            warn!(
                task_id = %self.task_id,
                agent_role,
                broke = delta.newly_failing,
                passing_before = delta.passing_before,
                passing_after = delta.passing_after,
                "agent introduced test regressions"
            );
        }

        delta
    }

    pub fn has_regression(&self, agent_role: &str) -> bool {
        self.per_agent
            .get(agent_role)
            .is_some_and(|d| d.newly_failing > 0)
    }

    /// Fraction of the baseline's passing tests this agent broke.
    pub fn regression_rate(&self, agent_role: &str) -> f64 {
        let Some(delta) = self.per_agent.get(agent_role) else {
            return 0.0;
        };
        if self.baseline.passing_tests == 0 {
            return 0.0;
        }
        delta.newly_failing as f64 / self.baseline.passing_tests as f64
    }

    pub fn total_regressions(&self) -> u32 {
        self.per_agent.values().map(|d| d.newly_failing).sum()
    }

    /// Human-readable per-agent summary, suitable for the dashboard or a
    /// task-completion report.
    pub fn summary(&self) -> String {
        self.per_agent
            .iter()
            .map(|(role, delta)| {
                let status = if delta.newly_failing == 0 { "OK" } else { "REGRESSION" };
                format!(
                    "{role}: {status} — {}/{} passing (+{} new, -{} broken)",
                    delta.passing_after, delta.total_after, delta.newly_added, delta.newly_failing
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bo_core::TestLevel;

    fn baseline() -> TestBaseline {
        TestBaseline {
            total_tests: 10,
            passing_tests: 10,
            snapshot_hash: "abc123".into(),
        }
    }

    #[test]
    fn no_regression_when_all_still_passing() {
        let mut tracker = RegressionTracker::new("task-1", baseline());
        let mut result = TestResult::new(TestLevel::Normal);
        result.total_tests = 12;
        result.passed_tests = 12;

        tracker.check("rust-backend", &result);
        assert!(!tracker.has_regression("rust-backend"));
        assert_eq!(tracker.total_regressions(), 0);
    }

    #[test]
    fn flags_regression_when_passing_count_drops() {
        let mut tracker = RegressionTracker::new("task-1", baseline());
        let mut result = TestResult::new(TestLevel::Normal);
        result.total_tests = 10;
        result.passed_tests = 7;

        let delta = tracker.check("rust-backend", &result);
        assert_eq!(delta.newly_failing, 3);
        assert!(tracker.has_regression("rust-backend"));
        assert_eq!(tracker.total_regressions(), 3);
    }

    #[test]
    fn regression_rate_is_fraction_of_baseline() {
        let mut tracker = RegressionTracker::new("task-1", baseline());
        let mut result = TestResult::new(TestLevel::Normal);
        result.total_tests = 10;
        result.passed_tests = 5;
        tracker.check("rust-backend", &result);

        assert!((tracker.regression_rate("rust-backend") - 0.5).abs() < 1e-9);
    }

    #[test]
    fn regression_rate_zero_for_unknown_agent() {
        let tracker = RegressionTracker::new("task-1", baseline());
        assert_eq!(tracker.regression_rate("nobody"), 0.0);
    }

    #[test]
    fn summary_lists_each_agent() {
        let mut tracker = RegressionTracker::new("task-1", baseline());
        let mut ok_result = TestResult::new(TestLevel::Normal);
        ok_result.total_tests = 10;
        ok_result.passed_tests = 10;
        tracker.check("rust-backend", &ok_result);

        let summary = tracker.summary();
        assert!(summary.contains("rust-backend"));
        assert!(summary.contains("OK"));
    }
}
