use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

/// Top-level lieflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub checkpoint: Option<CheckpointConfig>,
    #[serde(default)]
    pub log: LogConfig,
}

/// Workflow engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of tasks running at once (0 = unlimited).
    #[serde(default = "default_max_parallel_tasks")]
    pub max_parallel_tasks: usize,
    /// Per-attempt task timeout in seconds (0 = none).
    #[serde(default)]
    pub task_timeout_secs: u64,
    /// Retry count given to tasks created without an explicit one.
    #[serde(default)]
    pub default_retry_count: u64,
    /// Base directory for per-task working directories.
    #[serde(default)]
    pub project_dir: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_tasks: default_max_parallel_tasks(),
            task_timeout_secs: 0,
            default_retry_count: 0,
            project_dir: None,
        }
    }
}

fn default_max_parallel_tasks() -> usize {
    8
}

/// Checkpoint / autosave configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Enable autosave (default: true when section is present).
    #[serde(default = "default_checkpoint_enabled")]
    pub enabled: bool,
    /// Where the workflow document is written after each state change.
    pub path: String,
}

fn default_checkpoint_enabled() -> bool {
    true
}

/// Log filter used when `RUST_LOG` is not set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "lieflow=info,warn".to_string()
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| FlowError::Config(e.to_string()))
    }

    /// Resolve the project directory (expand ~).
    pub fn project_dir(&self) -> Option<PathBuf> {
        let dir = self.engine.project_dir.as_deref()?;
        if let Some(rest) = dir.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return Some(home.join(rest));
            }
        }
        Some(PathBuf::from(dir))
    }

    /// Autosave path, if checkpointing is enabled.
    pub fn checkpoint_path(&self) -> Option<PathBuf> {
        self.checkpoint
            .as_ref()
            .filter(|c| c.enabled)
            .map(|c| PathBuf::from(&c.path))
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep the reference if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
