//! Ties the cost tracker, test gate, regression tracker, worktree manager,
//! and agent runner into the build-task state machine.

pub mod agents;
pub mod orchestrator;

pub use agents::{compose_agent_prompt, default_agent_configs, extract_plan};
pub use orchestrator::{Orchestrator, OrchestratorError};
