//! Structured observability hooks for the issue lifecycle.
//!
//! - Issue-scoped tracing spans via the `IssueSpan` RAII guard
//! - Emission functions for registration, dispatch, completion, retry and
//!   persistence failures
//!
//! Events are emitted at `info!` (failures at `warn!`). For JSON output run
//! the CLI with `--json`.

use tracing::{info, warn};

use crate::roles::AgentRole;

/// RAII guard that enters an issue-scoped span.
///
/// ```ignore
/// let _span = IssueSpan::enter("issue-42");
/// // all tracing calls now carry issue_id = "issue-42"
/// ```
pub struct IssueSpan {
    _span: tracing::span::EnteredSpan,
}

impl IssueSpan {
    pub fn enter(issue_id: &str) -> Self {
        let span = tracing::info_span!("dispatch.issue", issue_id = %issue_id);
        Self {
            _span: span.entered(),
        }
    }
}

pub fn emit_issue_registered(issue_id: &str, order: &[AgentRole]) {
    let order: Vec<&str> = order.iter().map(|r| r.as_str()).collect();
    info!(
        event = "issue.registered",
        issue_id = %issue_id,
        order = %order.join(","),
    );
}

pub fn emit_agent_dispatched(issue_id: &str, agent: AgentRole, attempt: u32) {
    info!(
        event = "agent.dispatched",
        issue_id = %issue_id,
        agent = %agent,
        attempt = attempt,
    );
}

pub fn emit_agent_finished(issue_id: &str, agent: AgentRole, success: bool) {
    info!(
        event = "agent.finished",
        issue_id = %issue_id,
        agent = %agent,
        success = success,
    );
}

pub fn emit_agent_retry(issue_id: &str, agent: AgentRole, attempt: u32, max_retries: u32) {
    warn!(
        event = "agent.retry",
        issue_id = %issue_id,
        agent = %agent,
        attempt = attempt,
        max_retries = max_retries,
    );
}

pub fn emit_issue_completed(issue_id: &str, completed: usize, failed: usize) {
    info!(
        event = "issue.completed",
        issue_id = %issue_id,
        completed = completed,
        failed = failed,
    );
}

/// Persistence failures are logged and swallowed; this is the log.
pub fn emit_persistence_error(context: &str, error: &dyn std::fmt::Display) {
    warn!(event = "state.persist_error", context = %context, error = %error);
}
