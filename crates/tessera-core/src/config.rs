use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TesseraError};

/// Top-level Tessera configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    /// Applied to steps that declare no timeout.
    #[serde(default = "default_step_timeout")]
    pub default_step_timeout_secs: u64,
    /// Applied to workflows that declare no timeout.
    #[serde(default = "default_workflow_timeout")]
    pub workflow_timeout_secs: u64,
    /// How long an execution may sit with nothing runnable while waiting
    /// on approvals or scheduled steps.
    #[serde(default = "default_dependency_wait")]
    pub dependency_wait_timeout_secs: u64,
    /// Poll tick for condition-triggered scheduled steps.
    #[serde(default = "default_condition_poll")]
    pub condition_poll_interval_ms: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            default_step_timeout_secs: default_step_timeout(),
            workflow_timeout_secs: default_workflow_timeout(),
            dependency_wait_timeout_secs: default_dependency_wait(),
            condition_poll_interval_ms: default_condition_poll(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl EngineSection {
    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_secs(self.default_step_timeout_secs)
    }

    pub fn condition_poll_interval(&self) -> Duration {
        Duration::from_millis(self.condition_poll_interval_ms.max(1))
    }

    pub fn dependency_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.dependency_wait_timeout_secs)
    }
}

fn default_step_timeout() -> u64 { 300 }
fn default_workflow_timeout() -> u64 { 3600 }
fn default_dependency_wait() -> u64 { 3600 }
fn default_condition_poll() -> u64 { 1000 }
fn default_event_capacity() -> usize { 256 }

/// Backoff between step retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    /// Scale each delay by a random factor in 0.8..1.2.
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            jitter: default_jitter(),
        }
    }
}

fn default_initial_backoff() -> u64 { 100 }
fn default_max_backoff() -> u64 { 10_000 }
fn default_jitter() -> bool { true }

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Database path for the sqlite backend. Default: ~/.tessera/tessera.db
    #[serde(default)]
    pub path: Option<String>,
}

impl StoreConfig {
    pub fn resolved_path(&self) -> PathBuf {
        match &self.path {
            Some(p) => expand_home(p),
            None => dirs_home()
                .map(|h| h.join(".tessera").join("tessera.db"))
                .unwrap_or_else(|| PathBuf::from("tessera.db")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// When set, notifications are POSTed here as JSON.
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_channel")]
    pub default_channel: String,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            default_channel: default_channel(),
        }
    }
}

fn default_channel() -> String {
    "log".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive, e.g. `tessera=debug`.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String {
    "tessera=info,warn".into()
}

impl EngineConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| TesseraError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| TesseraError::Config(e.to_string()))
    }

    pub fn log_filter(&self) -> String {
        self.log
            .as_ref()
            .map(|l| l.filter.clone())
            .unwrap_or_else(default_log_filter)
    }
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

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_TESSERA_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_TESSERA_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_TESSERA_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_TESSERA_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_TESSERA_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.default_step_timeout_secs, 300);
        assert_eq!(config.engine.workflow_timeout_secs, 3600);
        assert_eq!(config.engine.condition_poll_interval_ms, 1000);
        assert_eq!(config.retry.initial_backoff_ms, 100);
        assert!(config.retry.jitter);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.notifications.default_channel, "log");
        assert_eq!(config.log_filter(), "tessera=info,warn");
    }

    #[test]
    fn test_sqlite_store_section() {
        let toml_str = r#"
[store]
backend = "sqlite"
path = "/var/lib/tessera/state.db"
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert_eq!(
            config.store.resolved_path(),
            PathBuf::from("/var/lib/tessera/state.db")
        );
    }
}
