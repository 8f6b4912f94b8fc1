//! Error taxonomy for dispatch.

/// Errors produced by the dispatch core.
///
/// Expected conditions (unknown issue, malformed message line, tool failure)
/// are ordinary variants; callers decide whether to surface or degrade them.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("issue not found: {0}")]
    IssueNotFound(String),

    #[error("unknown agent role: {0}")]
    UnknownAgent(String),

    #[error("{agent} is not a required role of {issue_id}")]
    RoleNotRequired { issue_id: String, agent: String },

    #[error("{agent} has no queued work for {issue_id}")]
    RoleNotQueued { issue_id: String, agent: String },

    #[error("no agents required for issue {0}")]
    NoAgents(String),

    #[error("dependency cycle detected involving roles: {roles:?}")]
    DependencyCycle { roles: Vec<String> },

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("state is locked by pid {pid} since {since}")]
    Locked { pid: u32, since: String },

    #[error("{tool} failed: {detail}")]
    ExternalTool { tool: String, detail: String },

    #[error("agent {agent} timed out after {secs}s")]
    Timeout { agent: String, secs: u64 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DispatchError {
    /// Shorthand for an external tool failure.
    pub fn tool(tool: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::ExternalTool {
            tool: tool.into(),
            detail: detail.into(),
        }
    }
}

/// Result type for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_not_found_display() {
        let err = DispatchError::IssueNotFound("issue-42".to_string());
        assert!(err.to_string().contains("issue not found"));
        assert!(err.to_string().contains("issue-42"));
    }

    #[test]
    fn test_dependency_cycle_lists_roles() {
        let err = DispatchError::DependencyCycle {
            roles: vec!["backend".to_string(), "database".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("backend"));
        assert!(msg.contains("database"));
    }

    #[test]
    fn test_external_tool_shorthand() {
        let err = DispatchError::tool("gh", "exit status 1");
        assert_eq!(err.to_string(), "gh failed: exit status 1");
    }
}
