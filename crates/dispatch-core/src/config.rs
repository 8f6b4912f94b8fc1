//! Runtime configuration from environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{DispatchError, Result};

pub const DEFAULT_STATE_DIR: &str = ".dispatch";
pub const DEFAULT_AGENT_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_LOCK_STALE_SECS: u64 = 900;

/// Settings for the CLI and workflow.
///
/// | Variable | Field |
/// |---|---|
/// | `DISPATCH_STATE_DIR` | `state_dir` |
/// | `DISPATCH_REPO` | `repo` (`owner/name`) |
/// | `DISPATCH_AGENT_COMMAND` | `agent_command` |
/// | `DISPATCH_AGENT_TIMEOUT_SECS` | `agent_timeout` |
/// | `DISPATCH_LOCK_STALE_SECS` | `lock_stale_after` |
/// | `OPENAI_API_KEY` | `openai_api_key` |
/// | `OPENAI_BASE_URL` | `openai_base_url` |
/// | `DISPATCH_LLM_MODEL` | `llm_model` |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    pub state_dir: PathBuf,
    pub repo: Option<String>,
    pub agent_command: Option<String>,
    pub agent_timeout: Duration,
    /// Age at which a lock counts as abandoned on platforms where the
    /// holder's pid cannot be probed.
    pub lock_stale_after: Duration,
    pub openai_api_key: Option<String>,
    pub openai_base_url: Option<String>,
    pub llm_model: Option<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            repo: None,
            agent_command: None,
            agent_timeout: Duration::from_secs(DEFAULT_AGENT_TIMEOUT_SECS),
            lock_stale_after: Duration::from_secs(DEFAULT_LOCK_STALE_SECS),
            openai_api_key: None,
            openai_base_url: None,
            llm_model: None,
        }
    }
}

impl DispatchConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        Ok(Self {
            state_dir: get("DISPATCH_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.state_dir),
            repo: get("DISPATCH_REPO"),
            agent_command: get("DISPATCH_AGENT_COMMAND"),
            agent_timeout: parse_secs(&get, "DISPATCH_AGENT_TIMEOUT_SECS")?
                .unwrap_or(defaults.agent_timeout),
            lock_stale_after: parse_secs(&get, "DISPATCH_LOCK_STALE_SECS")?
                .unwrap_or(defaults.lock_stale_after),
            openai_api_key: get("OPENAI_API_KEY"),
            openai_base_url: get("OPENAI_BASE_URL"),
            llm_model: get("DISPATCH_LLM_MODEL"),
        })
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join("coordination.json")
    }

    pub fn communications_dir(&self) -> PathBuf {
        self.state_dir.join("communications")
    }

    pub fn metrics_file(&self) -> PathBuf {
        self.state_dir.join("metrics.json")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.state_dir.join("state.lock")
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }
}

fn parse_secs(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<Duration>> {
    match get(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|s| Some(Duration::from_secs(s)))
            .map_err(|_| {
                DispatchError::Config(format!("{key} must be whole seconds, got {raw:?}"))
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = DispatchConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, DispatchConfig::default());
        assert_eq!(config.state_file(), PathBuf::from(".dispatch/coordination.json"));
        assert_eq!(config.lock_file(), PathBuf::from(".dispatch/state.lock"));
    }

    #[test]
    fn test_reads_variables() {
        let config = DispatchConfig::from_lookup(lookup(&[
            ("DISPATCH_STATE_DIR", "/tmp/dispatch"),
            ("DISPATCH_REPO", "acme/blog"),
            ("DISPATCH_AGENT_TIMEOUT_SECS", "30"),
            ("DISPATCH_LLM_MODEL", "gpt-test"),
            ("OPENAI_API_KEY", ""),
        ]))
        .unwrap();
        assert_eq!(config.communications_dir(), PathBuf::from("/tmp/dispatch/communications"));
        assert_eq!(config.repo.as_deref(), Some("acme/blog"));
        assert_eq!(config.agent_timeout, Duration::from_secs(30));
        assert_eq!(config.llm_model.as_deref(), Some("gpt-test"));
        assert!(config.openai_api_key.is_none());
    }

    #[test]
    fn test_rejects_bad_duration() {
        let result = DispatchConfig::from_lookup(lookup(&[("DISPATCH_LOCK_STALE_SECS", "soon")]));
        assert!(matches!(result, Err(DispatchError::Config(_))));
    }
}
