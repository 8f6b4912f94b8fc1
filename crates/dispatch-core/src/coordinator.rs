//! Issue coordination state machine.
//!
//! Per issue: `registered → (queued → executing → completed | failed |
//! retry → queued)* per role → completed`. An issue completes once its last
//! queue entry is gone, however many roles failed.
//!
//! The coordinator owns the [`CoordinationState`] behind one async mutex.
//! Every mutation runs under that mutex and ends with a save through the
//! [`StateStore`], so writers inside one process are serialized. Save
//! failures are logged and counted but not returned: the in-memory state
//! stays authoritative for the rest of the run.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::comms::MessageLog;
use crate::error::{DispatchError, Result};
use crate::graph::{self, OrderHints};
use crate::metrics::METRICS;
use crate::obs;
use crate::outcome::{AgentResult, FailureClass};
use crate::roles::{AgentRole, RoleCatalog};
use crate::state::{
    issue_id as make_issue_id, AgentMessage, AgentProgress, CoordinationState, IssueData,
    IssueRecord, IssueStatus, LockHolder, ProgressStatus, QueueEntry, QueueStatus,
};
use crate::store::StateStore;

/// Sender name used for messages the coordinator writes itself.
pub const COORDINATOR: &str = "coordinator";

/// A dequeued unit of work handed to an executor.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NextAgent {
    pub issue_id: String,
    pub issue_number: u64,
    pub agent: AgentRole,
    pub retry_attempt: u32,
    pub issue_data: IssueData,
}

/// Result of [`Coordinator::record_agent_completion`].
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionOutcome {
    pub issue_complete: bool,
    /// The next runnable unit, already marked executing.
    pub next_agent: Option<NextAgent>,
}

pub struct Coordinator {
    catalog: RoleCatalog,
    store: Arc<dyn StateStore>,
    messages: Option<MessageLog>,
    state: Mutex<CoordinationState>,
}

impl Coordinator {
    /// Load state from `store`, starting empty when nothing was saved.
    ///
    /// A corrupt state document is logged and replaced by an empty one.
    /// Read failures are returned: overwriting state we could not read
    /// would lose it.
    pub async fn open(store: Arc<dyn StateStore>, catalog: RoleCatalog) -> Result<Self> {
        let state = match store.load().await {
            Ok(Some(state)) => state,
            Ok(None) => CoordinationState::default(),
            Err(DispatchError::Parse(detail)) => {
                warn!(error = %detail, "coordination state unreadable, starting fresh");
                CoordinationState::default()
            }
            Err(e) => return Err(e),
        };
        debug!(
            active_issues = state.active_issues.len(),
            queued = state.agent_queue.len(),
            "coordination state loaded"
        );
        Ok(Self {
            catalog,
            store,
            messages: None,
            state: Mutex::new(state),
        })
    }

    /// Mirror every message into a JSONL log as well as the state document.
    pub fn with_message_log(mut self, log: MessageLog) -> Self {
        self.messages = Some(log);
        self
    }

    pub fn catalog(&self) -> &RoleCatalog {
        &self.catalog
    }

    /// A copy of the whole coordination document.
    pub async fn snapshot(&self) -> CoordinationState {
        self.state.lock().await.clone()
    }

    pub async fn issue(&self, issue_id: &str) -> Option<IssueRecord> {
        self.state.lock().await.active_issues.get(issue_id).cloned()
    }

    async fn persist(&self, state: &mut CoordinationState, context: &str) {
        state.last_update = Utc::now();
        if let Err(e) = self.store.save(state).await {
            METRICS.inc_persistence_failures();
            obs::emit_persistence_error(context, &e);
        }
    }

    async fn log_message(&self, message: &AgentMessage) {
        if let Some(log) = &self.messages {
            if let Err(e) = log.append(message).await {
                METRICS.inc_persistence_failures();
                obs::emit_persistence_error("message_log.append", &e);
            }
        }
    }

    /// Register an issue and enqueue one entry per required role.
    ///
    /// Re-registering an issue that is still in flight returns its id
    /// without enqueuing anything; a completed issue starts over.
    pub async fn register_issue(
        &self,
        issue_number: u64,
        issue_data: IssueData,
        required_agents: &[AgentRole],
    ) -> Result<String> {
        let issue_id = make_issue_id(issue_number);
        let required = graph::dedup_roles(required_agents);
        if required.is_empty() {
            return Err(DispatchError::NoAgents(issue_id));
        }

        let mut state = self.state.lock().await;
        if let Some(existing) = state.active_issues.get(&issue_id) {
            if !existing.is_completed() {
                warn!(issue_id = %issue_id, "issue already registered, keeping existing queue");
                return Ok(issue_id);
            }
            state.agent_communication.remove(&issue_id);
        }

        let order = self.determine_agent_order(&required, &issue_data)?;
        let now = Utc::now();

        let record = IssueRecord {
            issue_id: issue_id.clone(),
            issue_number,
            issue_data,
            required_agents: required,
            execution_order: order.clone(),
            status: IssueStatus::Registered,
            agent_progress: order.iter().map(|r| (*r, AgentProgress::queued())).collect(),
            completed_agents: Vec::new(),
            failed_agents: Vec::new(),
            current_agent: None,
            registered_at: now,
            completed_at: None,
            communication: Vec::new(),
        };

        state.agent_queue.extend(order.iter().map(|agent| QueueEntry {
            issue_id: issue_id.clone(),
            issue_number,
            agent_type: *agent,
            status: QueueStatus::Queued,
            queue_time: now,
            retry_attempt: 0,
        }));
        state.active_issues.insert(issue_id.clone(), record);

        self.persist(&mut state, "register_issue").await;
        drop(state);

        METRICS.inc_issues_registered();
        obs::emit_issue_registered(&issue_id, &order);
        Ok(issue_id)
    }

    /// Execution order for `required`, shaped by the issue's analysis.
    pub fn determine_agent_order(
        &self,
        required: &[AgentRole],
        issue_data: &IssueData,
    ) -> Result<Vec<AgentRole>> {
        let hints = issue_data
            .analysis
            .as_ref()
            .map(OrderHints::from)
            .unwrap_or_default();
        graph::determine_agent_order(&self.catalog, required, hints)
    }

    /// Dequeue the first runnable entry: mark it executing, take its
    /// resource locks and return it. `None` when nothing can run now.
    pub async fn get_next_agent(&self) -> Option<NextAgent> {
        let mut state = self.state.lock().await;
        let idx = state.agent_queue.iter().position(|e| {
            e.status == QueueStatus::Queued && can_execute(&state, &self.catalog, e)
        })?;

        let entry = &mut state.agent_queue[idx];
        entry.status = QueueStatus::Executing;
        let entry = entry.clone();

        acquire_locks(&mut state, &self.catalog, entry.issue_number, entry.agent_type);

        let record = state.active_issues.get_mut(&entry.issue_id)?;
        record.current_agent = Some(entry.agent_type);
        record.agent_progress.insert(
            entry.agent_type,
            AgentProgress {
                status: ProgressStatus::Executing,
                attempt: entry.retry_attempt,
                started_at: Some(Utc::now()),
                completed_at: None,
                result: None,
            },
        );
        let next = NextAgent {
            issue_id: entry.issue_id.clone(),
            issue_number: entry.issue_number,
            agent: entry.agent_type,
            retry_attempt: entry.retry_attempt,
            issue_data: record.issue_data.clone(),
        };

        self.persist(&mut state, "get_next_agent").await;
        drop(state);

        METRICS.inc_agents_dispatched();
        obs::emit_agent_dispatched(&next.issue_id, next.agent, next.retry_attempt);
        Some(next)
    }

    /// What [`get_next_agent`](Self::get_next_agent) would return, without
    /// changing any state.
    pub async fn peek_next_agent(&self) -> Option<NextAgent> {
        let state = self.state.lock().await;
        let entry = state
            .agent_queue
            .iter()
            .find(|e| e.status == QueueStatus::Queued && can_execute(&state, &self.catalog, e))?;
        let record = state.active_issues.get(&entry.issue_id)?;
        Some(NextAgent {
            issue_id: entry.issue_id.clone(),
            issue_number: entry.issue_number,
            agent: entry.agent_type,
            retry_attempt: entry.retry_attempt,
            issue_data: record.issue_data.clone(),
        })
    }

    /// Whether the queued `agent` of `issue_id` could be dequeued right now.
    pub async fn can_execute_agent(&self, issue_id: &str, agent: AgentRole) -> Result<bool> {
        let state = self.state.lock().await;
        if !state.active_issues.contains_key(issue_id) {
            return Err(DispatchError::IssueNotFound(issue_id.to_string()));
        }
        Ok(state
            .agent_queue
            .iter()
            .find(|e| e.issue_id == issue_id && e.agent_type == agent)
            .map(|e| e.status == QueueStatus::Queued && can_execute(&state, &self.catalog, e))
            .unwrap_or(false))
    }

    /// Take every resource `agent` needs on behalf of `issue_number`.
    ///
    /// Returns `false`, taking nothing, if any of them is already held.
    pub async fn acquire_resource_locks(&self, issue_number: u64, agent: AgentRole) -> bool {
        let mut state = self.state.lock().await;
        let free = self
            .catalog
            .resources(agent)
            .iter()
            .all(|r| !state.resource_locks.contains_key(r));
        if !free {
            return false;
        }
        acquire_locks(&mut state, &self.catalog, issue_number, agent);
        self.persist(&mut state, "acquire_resource_locks").await;
        true
    }

    /// Release the resources held by `agent` for `issue_number`.
    pub async fn release_resource_locks(&self, issue_number: u64, agent: AgentRole) {
        let mut state = self.state.lock().await;
        release_locks(&mut state, &self.catalog, issue_number, agent);
        self.persist(&mut state, "release_resource_locks").await;
    }

    /// Record the final result of a role and advance the queue.
    ///
    /// A failed result also skips every still-queued role of the issue that
    /// depends on it, directly or transitively. When the issue has no queue
    /// entries left it is marked completed and its buffered messages move
    /// into the issue record.
    ///
    /// The role must still have a queue entry for the issue; otherwise
    /// `RoleNotRequired` or `RoleNotQueued` is returned and nothing changes.
    pub async fn record_agent_completion(
        &self,
        issue_id: &str,
        agent: AgentRole,
        result: AgentResult,
    ) -> Result<CompletionOutcome> {
        let issue_complete = self.finish_agent(issue_id, agent, result).await?;
        let next_agent = self.get_next_agent().await;
        Ok(CompletionOutcome {
            issue_complete,
            next_agent,
        })
    }

    /// Record a final result without claiming further work.
    /// Returns whether the issue completed.
    async fn finish_agent(
        &self,
        issue_id: &str,
        agent: AgentRole,
        result: AgentResult,
    ) -> Result<bool> {
        let success = result.is_success();
        let mut state = self.state.lock().await;
        queued_entry(&state, issue_id, agent)?;

        let record = state
            .active_issues
            .get_mut(issue_id)
            .ok_or_else(|| DispatchError::IssueNotFound(issue_id.to_string()))?;
        let issue_number = record.issue_number;

        let progress = record
            .agent_progress
            .entry(agent)
            .or_insert_with(AgentProgress::queued);
        progress.status = if success {
            ProgressStatus::Completed
        } else {
            ProgressStatus::Failed
        };
        progress.completed_at = Some(Utc::now());
        progress.result = Some(result);

        let bucket = if success {
            &mut record.completed_agents
        } else {
            &mut record.failed_agents
        };
        if !bucket.contains(&agent) {
            bucket.push(agent);
        }
        if record.current_agent == Some(agent) {
            record.current_agent = None;
        }

        state
            .agent_queue
            .retain(|e| !(e.issue_id == issue_id && e.agent_type == agent));

        release_locks(&mut state, &self.catalog, issue_number, agent);
        if !success {
            skip_dependents(&mut state, &self.catalog, issue_id);
        }
        let issue_complete = finalize_if_drained(&mut state, issue_id);

        self.persist(&mut state, "record_agent_completion").await;
        drop(state);

        if success {
            METRICS.inc_agents_completed();
        } else {
            METRICS.inc_agents_failed();
        }
        obs::emit_agent_finished(issue_id, agent, success);
        Ok(issue_complete)
    }

    /// Decide between retry and terminal failure for an executing role.
    ///
    /// Returns `true` when the role was re-queued. Otherwise the failure is
    /// recorded as the role's final result. Either way nothing new is
    /// claimed; call [`get_next_agent`](Self::get_next_agent) afterwards.
    pub async fn handle_agent_failure(
        &self,
        issue_id: &str,
        agent: AgentRole,
        error: &str,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let current_retries = queued_entry(&state, issue_id, agent)?.retry_attempt;

        if !self.should_retry_agent(agent, error, current_retries) {
            drop(state);
            self.finish_agent(issue_id, agent, AgentResult::failed(error))
                .await?;
            return Ok(false);
        }

        let attempt = current_retries + 1;
        let max_retries = self.catalog.max_retries(agent);
        let issue_number = state.active_issues[issue_id].issue_number;

        state
            .agent_queue
            .retain(|e| !(e.issue_id == issue_id && e.agent_type == agent));
        state.agent_queue.push(QueueEntry {
            issue_id: issue_id.to_string(),
            issue_number,
            agent_type: agent,
            status: QueueStatus::Queued,
            queue_time: Utc::now(),
            retry_attempt: attempt,
        });
        release_locks(&mut state, &self.catalog, issue_number, agent);

        if let Some(record) = state.active_issues.get_mut(issue_id) {
            if record.current_agent == Some(agent) {
                record.current_agent = None;
            }
            let progress = record
                .agent_progress
                .entry(agent)
                .or_insert_with(AgentProgress::queued);
            progress.status = ProgressStatus::Retrying;
            progress.attempt = attempt;
            progress.result = Some(AgentResult::failed(error));
        }

        let message = AgentMessage::new(
            Some(issue_id),
            COORDINATOR,
            agent.as_str(),
            format!("Retrying {agent} (attempt {attempt}/{max_retries}) after failure: {error}"),
            serde_json::json!({
                "error": error,
                "attempt": attempt,
                "maxRetries": max_retries,
            }),
        );
        push_message(&mut state, message.clone());

        self.persist(&mut state, "handle_agent_failure").await;
        drop(state);

        self.log_message(&message).await;
        METRICS.inc_agent_retries();
        obs::emit_agent_retry(issue_id, agent, attempt, max_retries);
        Ok(true)
    }

    /// Retry unless the error is denylisted or the role used up its retries.
    pub fn should_retry_agent(&self, agent: AgentRole, error: &str, current_retries: u32) -> bool {
        FailureClass::of(error) == FailureClass::Retryable
            && current_retries < self.catalog.max_retries(agent)
    }

    /// Append a message to the issue's communication list.
    pub async fn add_agent_communication(
        &self,
        issue_id: &str,
        from: &str,
        to: &str,
        message: &str,
        data: serde_json::Value,
    ) -> AgentMessage {
        let message = AgentMessage::new(Some(issue_id), from, to, message, data);
        let mut state = self.state.lock().await;
        push_message(&mut state, message.clone());
        self.persist(&mut state, "add_agent_communication").await;
        drop(state);

        self.log_message(&message).await;
        message
    }

    /// Messages for `issue_id` in append order, optionally only those sent
    /// by or addressed to `agent`.
    pub async fn get_agent_communication(
        &self,
        issue_id: &str,
        agent: Option<AgentRole>,
    ) -> Vec<AgentMessage> {
        let state = self.state.lock().await;
        let migrated = state
            .active_issues
            .get(issue_id)
            .map(|r| r.communication.as_slice())
            .unwrap_or_default();
        let buffered = state
            .agent_communication
            .get(issue_id)
            .map(Vec::as_slice)
            .unwrap_or_default();

        migrated
            .iter()
            .chain(buffered)
            .filter(|m| agent.map_or(true, |a| m.involves(a.as_str())))
            .cloned()
            .collect()
    }

    /// Drop completed issues that finished more than `older_than` ago.
    ///
    /// Returns the number of issues removed.
    pub async fn clean_completed(&self, older_than: chrono::Duration) -> usize {
        let cutoff = Utc::now() - older_than;
        let mut state = self.state.lock().await;

        let stale: Vec<String> = state
            .active_issues
            .values()
            .filter(|r| r.is_completed() && r.completed_at.map_or(true, |t| t < cutoff))
            .map(|r| r.issue_id.clone())
            .collect();
        if stale.is_empty() {
            return 0;
        }

        for id in &stale {
            state.active_issues.remove(id);
            state.agent_communication.remove(id);
            state.agent_queue.retain(|e| &e.issue_id != id);
        }
        self.persist(&mut state, "clean_completed").await;
        drop(state);

        let note = AgentMessage::new(
            None,
            COORDINATOR,
            "all",
            format!("Pruned {} completed issue(s)", stale.len()),
            serde_json::json!({ "issues": stale }),
        );
        self.log_message(&note).await;
        stale.len()
    }
}

/// The queue entry a result for (issue, role) must settle.
fn queued_entry<'a>(
    state: &'a CoordinationState,
    issue_id: &str,
    agent: AgentRole,
) -> Result<&'a QueueEntry> {
    let record = state
        .active_issues
        .get(issue_id)
        .ok_or_else(|| DispatchError::IssueNotFound(issue_id.to_string()))?;
    if !record.required_agents.contains(&agent) {
        return Err(DispatchError::RoleNotRequired {
            issue_id: issue_id.to_string(),
            agent: agent.to_string(),
        });
    }
    state
        .agent_queue
        .iter()
        .find(|e| e.issue_id == issue_id && e.agent_type == agent)
        .ok_or_else(|| DispatchError::RoleNotQueued {
            issue_id: issue_id.to_string(),
            agent: agent.to_string(),
        })
}

fn can_execute(state: &CoordinationState, catalog: &RoleCatalog, entry: &QueueEntry) -> bool {
    let Some(record) = state.active_issues.get(&entry.issue_id) else {
        return false;
    };
    if record.is_completed() {
        return false;
    }

    let locks_free = catalog
        .resources(entry.agent_type)
        .iter()
        .all(|r| !state.resource_locks.contains_key(r));

    let deps_done = catalog
        .dependencies(entry.agent_type)
        .iter()
        .filter(|d| record.required_agents.contains(d))
        .all(|d| record.completed_agents.contains(d));

    locks_free && deps_done
}

fn acquire_locks(
    state: &mut CoordinationState,
    catalog: &RoleCatalog,
    issue_number: u64,
    agent: AgentRole,
) {
    let now = Utc::now();
    for resource in catalog.resources(agent) {
        state.resource_locks.insert(
            resource.clone(),
            LockHolder {
                issue_number,
                agent,
                acquired_at: now,
            },
        );
    }
}

fn release_locks(
    state: &mut CoordinationState,
    catalog: &RoleCatalog,
    issue_number: u64,
    agent: AgentRole,
) {
    for resource in catalog.resources(agent) {
        let held_by_us = state
            .resource_locks
            .get(resource)
            .map_or(false, |h| h.issue_number == issue_number && h.agent == agent);
        if held_by_us {
            state.resource_locks.remove(resource);
        }
    }
}

/// Mark queued roles whose in-issue dependencies failed as skipped, until
/// no more can be skipped.
fn skip_dependents(state: &mut CoordinationState, catalog: &RoleCatalog, issue_id: &str) {
    loop {
        let Some(record) = state.active_issues.get(issue_id) else {
            return;
        };
        let failed: HashSet<AgentRole> = record.failed_agents.iter().copied().collect();

        let blocked: Vec<(AgentRole, AgentRole)> = state
            .queue_for(issue_id)
            .filter(|e| e.status == QueueStatus::Queued)
            .filter_map(|e| {
                catalog
                    .dependencies(e.agent_type)
                    .iter()
                    .find(|d| record.required_agents.contains(d) && failed.contains(d))
                    .map(|d| (e.agent_type, *d))
            })
            .collect();
        if blocked.is_empty() {
            return;
        }

        state.agent_queue.retain(|e| {
            !(e.issue_id == issue_id && blocked.iter().any(|(agent, _)| *agent == e.agent_type))
        });

        if let Some(record) = state.active_issues.get_mut(issue_id) {
            let now = Utc::now();
            for (agent, upstream) in blocked {
                debug!(issue_id = %issue_id, agent = %agent, upstream = %upstream, "skipping role");
                record.agent_progress.insert(
                    agent,
                    AgentProgress {
                        status: ProgressStatus::Skipped,
                        attempt: 0,
                        started_at: None,
                        completed_at: Some(now),
                        result: Some(AgentResult::skipped(format!(
                            "upstream role {upstream} failed"
                        ))),
                    },
                );
                if !record.failed_agents.contains(&agent) {
                    record.failed_agents.push(agent);
                }
            }
        }
    }
}

fn finalize_if_drained(state: &mut CoordinationState, issue_id: &str) -> bool {
    if state.queue_for(issue_id).next().is_some() {
        return false;
    }
    let buffered = state
        .agent_communication
        .remove(issue_id)
        .unwrap_or_default();
    let Some(record) = state.active_issues.get_mut(issue_id) else {
        return false;
    };
    record.status = IssueStatus::Completed;
    record.completed_at = Some(Utc::now());
    record.current_agent = None;
    record.communication.extend(buffered);
    obs::emit_issue_completed(
        issue_id,
        record.completed_agents.len(),
        record.failed_agents.len(),
    );
    true
}

fn push_message(state: &mut CoordinationState, message: AgentMessage) {
    let Some(issue_id) = message.issue_id.clone() else {
        return;
    };
    match state.active_issues.get_mut(&issue_id) {
        Some(record) if record.is_completed() => record.communication.push(message),
        _ => state
            .agent_communication
            .entry(issue_id)
            .or_default()
            .push(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::RoleOutput;
    use crate::store::MemoryStateStore;

    async fn coordinator() -> (Arc<MemoryStateStore>, Coordinator) {
        let store = Arc::new(MemoryStateStore::new());
        let coord = Coordinator::open(store.clone(), RoleCatalog::standard())
            .await
            .unwrap();
        (store, coord)
    }

    fn data(title: &str) -> IssueData {
        IssueData {
            title: title.to_string(),
            ..IssueData::default()
        }
    }

    fn done(agent: AgentRole) -> AgentResult {
        AgentResult::completed(RoleOutput::basic(agent, vec![], "ok")).unwrap()
    }

    #[tokio::test]
    async fn test_register_enqueues_in_dependency_order() {
        let (store, coord) = coordinator().await;
        let id = coord
            .register_issue(
                12,
                data("full stack"),
                &[AgentRole::Frontend, AgentRole::Database, AgentRole::Backend],
            )
            .await
            .unwrap();
        assert_eq!(id, "issue-12");

        let saved = store.saved().unwrap();
        let queued: Vec<AgentRole> = saved.agent_queue.iter().map(|e| e.agent_type).collect();
        assert_eq!(
            queued,
            vec![AgentRole::Database, AgentRole::Backend, AgentRole::Frontend]
        );
        assert_eq!(saved.active_issues[&id].status, IssueStatus::Registered);
    }

    #[tokio::test]
    async fn test_register_rejects_empty_agent_set() {
        let (_store, coord) = coordinator().await;
        let result = coord.register_issue(1, data("nothing"), &[]).await;
        assert!(matches!(result, Err(DispatchError::NoAgents(_))));
    }

    #[tokio::test]
    async fn test_reregistering_in_flight_issue_is_idempotent() {
        let (_store, coord) = coordinator().await;
        coord
            .register_issue(5, data("a"), &[AgentRole::Frontend])
            .await
            .unwrap();
        coord
            .register_issue(5, data("a again"), &[AgentRole::Frontend, AgentRole::Backend])
            .await
            .unwrap();
        let snap = coord.snapshot().await;
        assert_eq!(snap.agent_queue.len(), 1);
        assert_eq!(snap.active_issues["issue-5"].issue_data.title, "a");
    }

    #[tokio::test]
    async fn test_dependency_blocks_until_upstream_completes() {
        let (_store, coord) = coordinator().await;
        let id = coord
            .register_issue(3, data("api + schema"), &[AgentRole::Backend, AgentRole::Database])
            .await
            .unwrap();

        let first = coord.get_next_agent().await.unwrap();
        assert_eq!(first.agent, AgentRole::Database);
        // Backend waits on database even though nothing else is running for it.
        assert!(!coord.can_execute_agent(&id, AgentRole::Backend).await.unwrap());
        assert!(coord.get_next_agent().await.is_none());

        let outcome = coord
            .record_agent_completion(&id, AgentRole::Database, done(AgentRole::Database))
            .await
            .unwrap();
        assert!(!outcome.issue_complete);
        assert_eq!(outcome.next_agent.unwrap().agent, AgentRole::Backend);
    }

    #[tokio::test]
    async fn test_global_locks_serialize_issues() {
        let (_store, coord) = coordinator().await;
        coord
            .register_issue(1, data("one"), &[AgentRole::Frontend])
            .await
            .unwrap();
        coord
            .register_issue(2, data("two"), &[AgentRole::Frontend])
            .await
            .unwrap();

        let first = coord.get_next_agent().await.unwrap();
        assert_eq!(first.issue_number, 1);
        assert!(coord.get_next_agent().await.is_none());

        let snap = coord.snapshot().await;
        assert_eq!(snap.resource_locks["frontend-ui"].issue_number, 1);

        let outcome = coord
            .record_agent_completion("issue-1", AgentRole::Frontend, done(AgentRole::Frontend))
            .await
            .unwrap();
        assert!(outcome.issue_complete);
        assert_eq!(outcome.next_agent.unwrap().issue_number, 2);
    }

    #[tokio::test]
    async fn test_unknown_issue_is_not_found() {
        let (_store, coord) = coordinator().await;
        let result = coord
            .record_agent_completion("issue-999", AgentRole::Backend, done(AgentRole::Backend))
            .await;
        assert!(matches!(result, Err(DispatchError::IssueNotFound(_))));

        let result = coord
            .handle_agent_failure("issue-999", AgentRole::Backend, "boom")
            .await;
        assert!(matches!(result, Err(DispatchError::IssueNotFound(_))));
    }

    #[tokio::test]
    async fn test_results_for_roles_outside_the_issue_are_rejected() {
        let (_store, coord) = coordinator().await;
        let id = coord
            .register_issue(2, data("ui"), &[AgentRole::Frontend])
            .await
            .unwrap();
        coord.get_next_agent().await.unwrap();

        let result = coord
            .handle_agent_failure(&id, AgentRole::Database, "network blip")
            .await;
        assert!(matches!(result, Err(DispatchError::RoleNotRequired { .. })));
        let result = coord
            .record_agent_completion(&id, AgentRole::Database, done(AgentRole::Database))
            .await;
        assert!(matches!(result, Err(DispatchError::RoleNotRequired { .. })));

        let snap = coord.snapshot().await;
        assert_eq!(snap.agent_queue.len(), 1);
        assert_eq!(snap.agent_queue[0].agent_type, AgentRole::Frontend);
        assert_eq!(snap.active_issues[&id].required_agents, vec![AgentRole::Frontend]);
        assert!(!snap.active_issues[&id]
            .agent_progress
            .contains_key(&AgentRole::Database));
    }

    #[tokio::test]
    async fn test_failure_after_completion_does_not_requeue() {
        let (_store, coord) = coordinator().await;
        let id = coord
            .register_issue(1, data("ui"), &[AgentRole::Frontend])
            .await
            .unwrap();
        coord.get_next_agent().await.unwrap();
        coord
            .record_agent_completion(&id, AgentRole::Frontend, done(AgentRole::Frontend))
            .await
            .unwrap();

        let result = coord
            .handle_agent_failure(&id, AgentRole::Frontend, "network blip")
            .await;
        assert!(matches!(result, Err(DispatchError::RoleNotQueued { .. })));
        let result = coord
            .handle_agent_failure(&id, AgentRole::Devops, "network blip")
            .await;
        assert!(matches!(result, Err(DispatchError::RoleNotRequired { .. })));
        let result = coord
            .record_agent_completion(&id, AgentRole::Frontend, done(AgentRole::Frontend))
            .await;
        assert!(matches!(result, Err(DispatchError::RoleNotQueued { .. })));

        let record = coord.issue(&id).await.unwrap();
        assert!(record.is_completed());
        assert_eq!(record.completed_agents, vec![AgentRole::Frontend]);
        assert!(coord.snapshot().await.agent_queue.is_empty());
        assert!(coord.get_next_agent().await.is_none());
    }

    #[tokio::test]
    async fn test_denylisted_error_fails_without_retry() {
        let (_store, coord) = coordinator().await;
        let id = coord
            .register_issue(4, data("docs"), &[AgentRole::Documentation])
            .await
            .unwrap();
        coord.get_next_agent().await.unwrap();

        let retried = coord
            .handle_agent_failure(&id, AgentRole::Documentation, "Permission denied: README.md")
            .await
            .unwrap();
        assert!(!retried);

        let record = coord.issue(&id).await.unwrap();
        assert!(record.is_completed());
        assert_eq!(record.failed_agents, vec![AgentRole::Documentation]);
    }

    #[tokio::test]
    async fn test_retry_requeues_and_logs_message() {
        let (_store, coord) = coordinator().await;
        let id = coord
            .register_issue(6, data("ui"), &[AgentRole::Frontend])
            .await
            .unwrap();
        coord.get_next_agent().await.unwrap();

        let retried = coord
            .handle_agent_failure(&id, AgentRole::Frontend, "network timeout")
            .await
            .unwrap();
        assert!(retried);

        let snap = coord.snapshot().await;
        assert_eq!(snap.agent_queue.len(), 1);
        assert_eq!(snap.agent_queue[0].retry_attempt, 1);
        assert_eq!(snap.agent_queue[0].status, QueueStatus::Queued);
        assert!(snap.resource_locks.is_empty());

        let messages = coord.get_agent_communication(&id, None).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].from_agent, COORDINATOR);
        assert_eq!(messages[0].to_agent, "frontend");

        let next = coord.get_next_agent().await.unwrap();
        assert_eq!(next.retry_attempt, 1);
    }

    #[tokio::test]
    async fn test_terminal_failure_skips_dependents() {
        let (_store, coord) = coordinator().await;
        let id = coord
            .register_issue(
                8,
                data("stack"),
                &[
                    AgentRole::Database,
                    AgentRole::Backend,
                    AgentRole::Frontend,
                    AgentRole::Documentation,
                ],
            )
            .await
            .unwrap();

        let db = coord.get_next_agent().await.unwrap();
        assert_eq!(db.agent, AgentRole::Database);
        let outcome = coord
            .record_agent_completion(&id, AgentRole::Database, AgentResult::failed("syntax error"))
            .await
            .unwrap();

        // Backend and frontend are skipped; documentation still runs.
        assert!(!outcome.issue_complete);
        assert_eq!(outcome.next_agent.unwrap().agent, AgentRole::Documentation);

        let record = coord.issue(&id).await.unwrap();
        assert_eq!(
            record.agent_progress[&AgentRole::Frontend].status,
            ProgressStatus::Skipped
        );
        assert!(record.failed_agents.contains(&AgentRole::Backend));

        let outcome = coord
            .record_agent_completion(&id, AgentRole::Documentation, done(AgentRole::Documentation))
            .await
            .unwrap();
        assert!(outcome.issue_complete);
    }

    #[tokio::test]
    async fn test_messages_migrate_on_completion() {
        let (_store, coord) = coordinator().await;
        let id = coord
            .register_issue(9, data("docs"), &[AgentRole::Documentation])
            .await
            .unwrap();
        coord
            .add_agent_communication(
                &id,
                "documentation",
                "frontend",
                "heads up",
                serde_json::json!({}),
            )
            .await;
        coord.get_next_agent().await.unwrap();
        coord
            .record_agent_completion(&id, AgentRole::Documentation, done(AgentRole::Documentation))
            .await
            .unwrap();

        let snap = coord.snapshot().await;
        assert!(!snap.agent_communication.contains_key(&id));
        assert_eq!(snap.active_issues[&id].communication.len(), 1);
        assert_eq!(coord.get_agent_communication(&id, None).await.len(), 1);
        assert_eq!(
            coord
                .get_agent_communication(&id, Some(AgentRole::Frontend))
                .await
                .len(),
            1
        );
        assert!(coord
            .get_agent_communication(&id, Some(AgentRole::Devops))
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_save_failures_are_swallowed() {
        let (store, coord) = coordinator().await;
        store.fail_saves(true);
        let id = coord
            .register_issue(10, data("ui"), &[AgentRole::Frontend])
            .await
            .unwrap();
        assert!(coord.issue(&id).await.is_some());
        assert!(store.saved().is_none());
    }

    #[tokio::test]
    async fn test_peek_does_not_claim() {
        let (_store, coord) = coordinator().await;
        coord
            .register_issue(11, data("ui"), &[AgentRole::Frontend])
            .await
            .unwrap();
        let peeked = coord.peek_next_agent().await.unwrap();
        let claimed = coord.get_next_agent().await.unwrap();
        assert_eq!(peeked, claimed);
        assert!(coord.peek_next_agent().await.is_none());
    }

    #[tokio::test]
    async fn test_clean_completed_respects_age() {
        let (_store, coord) = coordinator().await;
        let id = coord
            .register_issue(13, data("ui"), &[AgentRole::Frontend])
            .await
            .unwrap();
        coord.get_next_agent().await.unwrap();
        coord
            .record_agent_completion(&id, AgentRole::Frontend, done(AgentRole::Frontend))
            .await
            .unwrap();

        assert_eq!(coord.clean_completed(chrono::Duration::hours(24)).await, 0);
        assert_eq!(coord.clean_completed(chrono::Duration::zero()).await, 1);
        assert!(coord.issue(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_manual_lock_acquisition_conflicts() {
        let (_store, coord) = coordinator().await;
        assert!(coord.acquire_resource_locks(1, AgentRole::Backend).await);
        // Devops shares shared-config with backend.
        assert!(!coord.acquire_resource_locks(2, AgentRole::Devops).await);
        coord.release_resource_locks(1, AgentRole::Backend).await;
        assert!(coord.acquire_resource_locks(2, AgentRole::Devops).await);
    }
}
