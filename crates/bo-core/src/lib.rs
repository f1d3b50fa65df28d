//! Shared types, configuration, and persistence for the build-orchestration
//! engine. Every other `bo-*` crate depends on this one.

pub mod config;
pub mod store;
pub mod types;

pub use config::{Config, ConfigError, ModelRate};
pub use store::{Store, StoreError};
pub use types::{
    AgentConfig, AgentDashboardEntry, AgentResult, AgentRun, AgentStatus, AgentTask, CostSnapshot,
    Dashboard, ExecutionPlan, FileOwnershipMap, RegressionLogEntry, RustStack, Task,
    TaskCostSummary, TaskStatus, TestBaseline, TestDelta, TestLevel, TestResult,
};
