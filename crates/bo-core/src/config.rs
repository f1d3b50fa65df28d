//! File-backed configuration for the orchestration engine.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level configuration, loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_budget")]
    pub build_budget_usd: f64,
    #[serde(default = "default_max_retries")]
    pub build_max_retries: u32,
    #[serde(default = "default_worktree_root")]
    pub worktree_root: String,
    #[serde(default = "default_llm_binary")]
    pub llm_binary: String,
    #[serde(default)]
    pub model_rates: HashMap<String, ModelRate>,
    #[serde(default)]
    pub test_timeouts: HashMap<String, u64>,
    #[serde(default = "default_store_path")]
    pub store_path: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            build_budget_usd: default_budget(),
            build_max_retries: default_max_retries(),
            worktree_root: default_worktree_root(),
            llm_binary: default_llm_binary(),
            model_rates: HashMap::new(),
            test_timeouts: HashMap::new(),
            store_path: default_store_path(),
            log_level: default_log_level(),
        }
    }
}

/// Per-million-token input/output pricing for one model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelRate {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

fn default_namespace() -> String {
    "bo".to_string()
}
fn default_budget() -> f64 {
    15.0
}
fn default_max_retries() -> u32 {
    3
}
fn default_worktree_root() -> String {
    ".bo-worktrees".to_string()
}
fn default_llm_binary() -> String {
    "claude".to_string()
}
fn default_store_path() -> String {
    "~/.bo/orchestrator.db".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load config from the default path (`~/.bo/config.toml`), falling back
    /// to defaults if the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Config::default())
        }
    }

    /// Load config from a specific file path.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(cfg)
    }

    /// Serialize config to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".bo")
            .join("config.toml")
    }

    /// Expand a leading `~` in `store_path` to the user's home directory.
    pub fn expanded_store_path(&self) -> PathBuf {
        expand_tilde(&self.store_path)
    }
}

/// Expand a leading `~` to the home directory; returns the path unchanged if
/// there is no leading `~` or no resolvable home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_values() {
        let cfg = Config::default();
        assert_eq!(cfg.namespace, "bo");
        assert_eq!(cfg.build_max_retries, 3);
        assert!(cfg.build_budget_usd > 0.0);
    }

    #[test]
    fn load_from_missing_file_errors() {
        let result = Config::load_from("/nonexistent/path/config.toml");
        assert!(result.is_err());
    }

    #[test]
    fn roundtrip_through_toml() {
        let cfg = Config::default();
        let toml_str = cfg.to_toml().unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.namespace, cfg.namespace);
        assert_eq!(parsed.build_max_retries, cfg.build_max_retries);
    }

    #[test]
    fn load_from_partial_toml_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "namespace = \"custom\"\n").unwrap();

        let cfg = Config::load_from(&path).unwrap();
        assert_eq!(cfg.namespace, "custom");
        assert_eq!(cfg.build_budget_usd, default_budget());
    }

    #[test]
    fn expand_tilde_joins_home() {
        let expanded = expand_tilde("~/.bo/orchestrator.db");
        assert!(expanded.ends_with(".bo/orchestrator.db"));
    }
}
