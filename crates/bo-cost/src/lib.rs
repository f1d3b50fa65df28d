//! Cost tracking and budget enforcement for a single build task.
//!
//! One [`CostTracker`] is created per task and shared (via `Arc`) across
//! every agent run spawned for that task, so concurrent agents accumulate
//! into the same total.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bo_core::{CostSnapshot, ModelRate, TaskCostSummary};
use tokio::sync::RwLock;
use tracing::info;

/// Per-million-token (input, output) USD pricing, keyed by model alias.
pub fn model_rate(model: &str) -> (f64, f64) {
    match model {
        "opus" => (15.0, 75.0),
        "haiku" => (0.25, 1.25),
        _ => (3.0, 15.0), // sonnet, and the fallback for unknown aliases
    }
}

/// Same as [`model_rate`], but checks a config-supplied override table first.
pub fn model_rate_with_overrides(model: &str, overrides: &HashMap<String, ModelRate>) -> (f64, f64) {
    match overrides.get(model) {
        Some(rate) => (rate.input_per_million, rate.output_per_million),
        None => model_rate(model),
    }
}

/// Budget crossings that fire a callback exactly once per task.
const BUDGET_THRESHOLDS: [u32; 3] = [50, 80, 100];

/// Cost in USD for one model invocation, using the built-in rate table.
pub fn calculate_cost(model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    calculate_cost_with_rates(model, input_tokens, output_tokens, &HashMap::new())
}

/// Cost in USD for one model invocation, preferring `overrides` (typically
/// `Config::model_rates`) over the built-in rate table.
pub fn calculate_cost_with_rates(
    model: &str,
    input_tokens: u64,
    output_tokens: u64,
    overrides: &HashMap<String, ModelRate>,
) -> f64 {
    let (input_rate, output_rate) = model_rate_with_overrides(model, overrides);
    (input_tokens as f64 * input_rate + output_tokens as f64 * output_rate) / 1_000_000.0
}

type ThresholdCallback = Box<dyn Fn(&str, u32, f64, f64) + Send + Sync>;

/// Tracks cost and token usage across every agent run for one task, and
/// fires a callback the first time cumulative spend crosses 50/80/100% of
/// budget.
pub struct CostTracker {
    task_id: String,
    budget_usd: f64,
    model_rates: HashMap<String, ModelRate>,
    snapshots: Arc<RwLock<Vec<CostSnapshot>>>,
    thresholds_fired: Arc<RwLock<HashSet<u32>>>,
    on_threshold: Option<ThresholdCallback>,
}

impl CostTracker {
    pub fn new(task_id: impl Into<String>, budget_usd: f64) -> Self {
        Self {
            task_id: task_id.into(),
            budget_usd,
            model_rates: HashMap::new(),
            snapshots: Arc::new(RwLock::new(Vec::new())),
            thresholds_fired: Arc::new(RwLock::new(HashSet::new())),
            on_threshold: None,
        }
    }

    /// Override the built-in per-model pricing table (from `Config::model_rates`).
    pub fn with_model_rates(mut self, model_rates: HashMap<String, ModelRate>) -> Self {
        self.model_rates = model_rates;
        self
    }

    /// Attach a callback invoked once per threshold crossing with
    /// `(task_id, threshold_percent, current_cost, budget)`.
    pub fn with_threshold_callback(
        mut self,
        callback: impl Fn(&str, u32, f64, f64) + Send + Sync + 'static,
    ) -> Self {
        self.on_threshold = Some(Box::new(callback));
        self
    }

    pub async fn total_cost(&self) -> f64 {
        self.snapshots.read().await.iter().map(|s| s.cost_usd).sum()
    }

    pub async fn total_tokens(&self) -> u64 {
        self.snapshots
            .read()
            .await
            .iter()
            .map(|s| s.input_tokens + s.output_tokens)
            .sum()
    }

    pub async fn budget_percent(&self) -> f64 {
        if self.budget_usd <= 0.0 {
            return 0.0;
        }
        (self.total_cost().await / self.budget_usd) * 100.0
    }

    pub async fn budget_exceeded(&self) -> bool {
        self.total_cost().await >= self.budget_usd
    }

    /// Record one agent's usage and check whether a budget threshold was
    /// just crossed.
    pub async fn record(
        &self,
        agent_role: impl Into<String>,
        model: impl Into<String>,
        input_tokens: u64,
        output_tokens: u64,
        duration_seconds: f64,
    ) -> CostSnapshot {
        let model = model.into();
        let cost_usd = calculate_cost_with_rates(&model, input_tokens, output_tokens, &self.model_rates);
        let snapshot = CostSnapshot {
            agent_role: agent_role.into(),
            model,
            input_tokens,
            output_tokens,
            cost_usd,
            duration_seconds,
        };
        self.snapshots.write().await.push(snapshot.clone());
        self.check_thresholds().await;
        snapshot
    }

    async fn check_thresholds(&self) {
        let pct = self.budget_percent().await;
        let total = self.total_cost().await;
        let mut fired = self.thresholds_fired.write().await;
        for threshold in BUDGET_THRESHOLDS {
            if pct >= threshold as f64 && !fired.contains(&threshold) {
                fired.insert(threshold);
                info!(
                    task_id = %self.task_id,
                    threshold,
                    cost_usd = total,
                    budget_usd = self.budget_usd,
                    "task budget threshold crossed"
                );
                if let Some(cb) = &self.on_threshold {
                    cb(&self.task_id, threshold, total, self.budget_usd);
                }
            }
        }
    }

    /// Build a [`TaskCostSummary`] snapshot for the task so far.
    pub async fn summary(&self) -> TaskCostSummary {
        let snapshots = self.snapshots.read().await;
        TaskCostSummary {
            task_id: self.task_id.clone(),
            agents: snapshots.clone(),
            total_cost_usd: snapshots.iter().map(|s| s.cost_usd).sum(),
            total_tokens: snapshots.iter().map(|s| s.input_tokens + s.output_tokens).sum(),
            total_duration_seconds: snapshots.iter().map(|s| s.duration_seconds).sum(),
            budget_usd: self.budget_usd,
        }
    }

    /// One-line `"Budget: $x.xx/$y.yy (z%)"` summary for compact UIs.
    pub async fn format_dashboard_line(&self) -> String {
        format!(
            "Budget: ${:.2}/${:.2} ({:.0}%)",
            self.total_cost().await,
            self.budget_usd,
            self.budget_percent().await
        )
    }
}
