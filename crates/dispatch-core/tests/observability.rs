//! Observability tests for the issue lifecycle.
//!
//! These verify that structured tracing events are emitted for
//! registration, dispatch, retry, completion and persistence failures.

use std::sync::Arc;

use dispatch_core::obs::{
    emit_agent_dispatched, emit_agent_finished, emit_agent_retry, emit_issue_completed,
    emit_issue_registered, emit_persistence_error, IssueSpan,
};
use dispatch_core::{
    AgentRole, Coordinator, IssueData, MemoryStateStore, RoleCatalog, METRICS,
};
use tracing_test::traced_test;

#[traced_test]
#[test]
fn test_emit_issue_registered_logs_order() {
    emit_issue_registered("issue-1", &[AgentRole::Database, AgentRole::Backend]);
    assert!(logs_contain("issue.registered"));
    assert!(logs_contain("database,backend"));
}

#[traced_test]
#[test]
fn test_emit_agent_events() {
    emit_agent_dispatched("issue-2", AgentRole::Frontend, 0);
    emit_agent_finished("issue-2", AgentRole::Frontend, true);
    emit_issue_completed("issue-2", 1, 0);
    assert!(logs_contain("agent.dispatched"));
    assert!(logs_contain("agent.finished"));
    assert!(logs_contain("issue.completed"));
}

#[traced_test]
#[test]
fn test_emit_agent_retry_logs_warning() {
    emit_agent_retry("issue-3", AgentRole::Backend, 1, 2);
    assert!(logs_contain("agent.retry"));
    assert!(logs_contain("WARN"));
}

#[traced_test]
#[test]
fn test_emit_persistence_error_logs_context() {
    emit_persistence_error("register_issue", &"disk full");
    assert!(logs_contain("state.persist_error"));
    assert!(logs_contain("disk full"));
}

#[traced_test]
#[test]
fn test_issue_span_enter_creates_span() {
    let span = IssueSpan::enter("issue-span");
    tracing::info!("inside span");
    drop(span);
    assert!(logs_contain("issue-span"));
}

#[traced_test]
#[tokio::test]
async fn test_failed_saves_are_logged_and_counted() {
    let store = Arc::new(MemoryStateStore::new());
    store.fail_saves(true);
    let coord = Coordinator::open(store, RoleCatalog::standard())
        .await
        .unwrap();

    let before = METRICS.snapshot().persistence_failures;
    coord
        .register_issue(
            9,
            IssueData {
                title: "docs".into(),
                ..IssueData::default()
            },
            &[AgentRole::Documentation],
        )
        .await
        .unwrap();

    assert!(METRICS.snapshot().persistence_failures > before);
    assert!(logs_contain("state.persist_error"));
    assert!(logs_contain("issue.registered"));
}
