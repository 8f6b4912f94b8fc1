//! Persisted coordination state.
//!
//! The JSON layout uses camelCase keys:
//! `activeIssues`, `agentQueue`, `resourceLocks`, `agentCommunication`,
//! `lastUpdate`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::classifier::IssueAnalysis;
use crate::outcome::AgentResult;
use crate::roles::AgentRole;

/// Key into [`CoordinationState::active_issues`] for an issue number.
pub fn issue_id(issue_number: u64) -> String {
    format!("issue-{issue_number}")
}

/// Issue content captured at registration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueData {
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub analysis: Option<IssueAnalysis>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Registered,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Queued,
    Executing,
    Retrying,
    Completed,
    Failed,
    Skipped,
}

/// Per-role progress within an issue. Overwritten on retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProgress {
    pub status: ProgressStatus,
    #[serde(default)]
    pub attempt: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<AgentResult>,
}

impl AgentProgress {
    pub fn queued() -> Self {
        Self {
            status: ProgressStatus::Queued,
            attempt: 0,
            started_at: None,
            completed_at: None,
            result: None,
        }
    }
}

/// One externally reported issue under coordination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueRecord {
    pub issue_id: String,
    pub issue_number: u64,
    pub issue_data: IssueData,
    /// Fixed at registration.
    pub required_agents: Vec<AgentRole>,
    /// Order in which the roles were enqueued.
    pub execution_order: Vec<AgentRole>,
    pub status: IssueStatus,
    #[serde(default)]
    pub agent_progress: BTreeMap<AgentRole, AgentProgress>,
    #[serde(default)]
    pub completed_agents: Vec<AgentRole>,
    #[serde(default)]
    pub failed_agents: Vec<AgentRole>,
    pub current_agent: Option<AgentRole>,
    pub registered_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Messages moved here from the shared buffer once the issue completes.
    #[serde(default)]
    pub communication: Vec<AgentMessage>,
}

impl IssueRecord {
    pub fn is_completed(&self) -> bool {
        self.status == IssueStatus::Completed
    }

    /// Files modified by every completed role, deduplicated in report order.
    pub fn files_modified(&self) -> Vec<String> {
        let mut files: Vec<String> = Vec::new();
        for role in &self.execution_order {
            let output = self
                .agent_progress
                .get(role)
                .and_then(|p| p.result.as_ref())
                .and_then(|r| r.output());
            if let Some(output) = output {
                for f in output.files_modified() {
                    if !files.contains(f) {
                        files.push(f.clone());
                    }
                }
            }
        }
        files
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    Executing,
}

/// One (issue, role) unit of work awaiting or undergoing execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub issue_id: String,
    pub issue_number: u64,
    pub agent_type: AgentRole,
    pub status: QueueStatus,
    pub queue_time: DateTime<Utc>,
    #[serde(default)]
    pub retry_attempt: u32,
}

/// Holder of a global resource lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockHolder {
    pub issue_number: u64,
    pub agent: AgentRole,
    pub acquired_at: DateTime<Utc>,
}

/// Bookkeeping message exchanged between roles (or the coordinator).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessage {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub issue_id: Option<String>,
    pub from_agent: String,
    pub to_agent: String,
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl AgentMessage {
    pub fn new(
        issue_id: Option<&str>,
        from: impl Into<String>,
        to: impl Into<String>,
        message: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            issue_id: issue_id.map(str::to_string),
            from_agent: from.into(),
            to_agent: to.into(),
            message: message.into(),
            data,
        }
    }

    /// Whether the message was sent by or addressed to `participant`.
    pub fn involves(&self, participant: &str) -> bool {
        self.from_agent == participant || self.to_agent == participant
    }
}

/// The whole coordination document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinationState {
    #[serde(default)]
    pub active_issues: BTreeMap<String, IssueRecord>,
    #[serde(default)]
    pub agent_queue: Vec<QueueEntry>,
    #[serde(default)]
    pub resource_locks: BTreeMap<String, LockHolder>,
    #[serde(default)]
    pub agent_communication: BTreeMap<String, Vec<AgentMessage>>,
    pub last_update: DateTime<Utc>,
}

impl Default for CoordinationState {
    fn default() -> Self {
        Self {
            active_issues: BTreeMap::new(),
            agent_queue: Vec::new(),
            resource_locks: BTreeMap::new(),
            agent_communication: BTreeMap::new(),
            last_update: Utc::now(),
        }
    }
}

impl CoordinationState {
    pub fn queue_for<'a>(&'a self, issue_id: &'a str) -> impl Iterator<Item = &'a QueueEntry> + 'a {
        self.agent_queue.iter().filter(move |e| e.issue_id == issue_id)
    }

    pub fn executing(&self) -> impl Iterator<Item = &QueueEntry> {
        self.agent_queue
            .iter()
            .filter(|e| e.status == QueueStatus::Executing)
    }
}
