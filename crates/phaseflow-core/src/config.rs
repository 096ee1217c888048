use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PhaseflowError, Result};

/// Top-level phaseflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    /// Runtime JSONL event logging.
    #[serde(default)]
    pub log: Option<LogConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Node visits allowed per run before an infinite loop is suspected.
    #[serde(default = "default_max_node_visits")]
    pub max_node_visits: usize,
    /// Retry budget for catalog questions that don't declare their own.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    /// Timeout applied by the shell command runner.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// Working directory for system-command nodes. Default: the project path.
    #[serde(default)]
    pub working_dir: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_node_visits: default_max_node_visits(),
            default_max_retries: default_max_retries(),
            command_timeout_secs: default_command_timeout(),
            working_dir: None,
        }
    }
}

fn default_max_node_visits() -> usize { 100 }
fn default_max_retries() -> u32 { 3 }
fn default_command_timeout() -> u64 { 120 }

/// External command used as the language-model collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Shell command that reads a prompt on stdin and prints a completion.
    #[serde(default)]
    pub command: Option<String>,
    /// Tool names offered to every LLM node that doesn't list its own.
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

fn default_llm_timeout() -> u64 { 300 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// SQLite database path for execution contexts.
    #[serde(default = "default_memory_path")]
    pub path: String,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            path: default_memory_path(),
        }
    }
}

fn default_memory_path() -> String { "~/.phaseflow/memory.db".to_string() }

/// JSONL runtime logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable runtime logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: ~/.phaseflow/logs
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    /// 1 = execution/phase events, 2 = + interactions and runs, 3 = + nodes.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            level: default_log_level(),
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_dir() -> String { "~/.phaseflow/logs".to_string() }
fn default_log_level() -> u8 { 2 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| PhaseflowError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| PhaseflowError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.max_node_visits == 0 {
            return Err(PhaseflowError::Config(
                "engine.max_node_visits must be at least 1".into(),
            ));
        }
        if self.engine.default_max_retries == 0 {
            return Err(PhaseflowError::Config(
                "engine.default_max_retries must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Resolve the memory database path (expand ~).
    pub fn memory_path(&self) -> PathBuf {
        expand_home(&self.memory.path)
    }

    /// Resolve the log directory (expand ~), if logging is enabled.
    pub fn log_dir(&self) -> Option<PathBuf> {
        self.log
            .as_ref()
            .filter(|l| l.enabled)
            .map(|l| expand_home(&l.log_dir))
    }
}

/// Expand a leading `~/` to `$HOME`.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
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
