//! In-memory fakes for the collaborator traits (testing only)
//!
//! Provides `FakeTracker`, `FakePullRequests` and `ScriptedExecutor` that
//! satisfy the trait contracts without spawning `gh`, `git` or an agent.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{DispatchError, Result};
use crate::executor::{AgentExecutor, AgentTask};
use crate::outcome::RoleOutput;
use crate::roles::AgentRole;
use crate::tracker::{
    BranchChanges, IssueDetails, IssueTracker, PullRequestCreator, PullRequestOutcome,
};

// ---------------------------------------------------------------------------
// FakeTracker
// ---------------------------------------------------------------------------

/// Issue tracker backed by a map, recording every posted comment.
#[derive(Debug, Default)]
pub struct FakeTracker {
    issues: Mutex<HashMap<u64, IssueDetails>>,
    comments: Mutex<Vec<(u64, String)>>,
    fail_comments: Mutex<bool>,
}

impl FakeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_issue(self, number: u64, title: &str, body: &str, labels: &[&str]) -> Self {
        self.issues.lock().unwrap().insert(
            number,
            IssueDetails {
                number,
                title: title.to_string(),
                body: body.to_string(),
                labels: labels.iter().map(|l| l.to_string()).collect(),
            },
        );
        self
    }

    pub fn fail_comments(&self, fail: bool) {
        *self.fail_comments.lock().unwrap() = fail;
    }

    pub fn comments(&self) -> Vec<(u64, String)> {
        self.comments.lock().unwrap().clone()
    }
}

#[async_trait]
impl IssueTracker for FakeTracker {
    async fn get_issue(&self, number: u64) -> Result<IssueDetails> {
        self.issues
            .lock()
            .unwrap()
            .get(&number)
            .cloned()
            .ok_or_else(|| DispatchError::tool("gh", format!("issue #{number} not found")))
    }

    async fn post_comment(&self, number: u64, body: &str) -> Result<()> {
        if *self.fail_comments.lock().unwrap() {
            return Err(DispatchError::tool("gh", "comment rejected"));
        }
        self.comments.lock().unwrap().push((number, body.to_string()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakePullRequests
// ---------------------------------------------------------------------------

/// Pull-request creator that records requests and returns canned URLs.
#[derive(Debug, Default)]
pub struct FakePullRequests {
    requests: Mutex<Vec<BranchChanges>>,
    fail: Mutex<bool>,
}

impl FakePullRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }

    pub fn requests(&self) -> Vec<BranchChanges> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl PullRequestCreator for FakePullRequests {
    async fn create_pull_request(&self, changes: &BranchChanges) -> Result<PullRequestOutcome> {
        self.requests.lock().unwrap().push(changes.clone());
        if *self.fail.lock().unwrap() {
            return Err(DispatchError::tool("gh", "pr create failed"));
        }
        Ok(PullRequestOutcome {
            success: true,
            pr_url: Some(format!(
                "https://github.com/example/repo/pull/{}",
                changes.issue_number
            )),
            files_changed: changes.files.clone(),
            branch: changes.branch.clone(),
            error: None,
        })
    }
}

// ---------------------------------------------------------------------------
// ScriptedExecutor
// ---------------------------------------------------------------------------

/// Executor that replays scripted results per role.
///
/// Once a role's script is exhausted it succeeds, modifying `<role>.txt`.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<BTreeMap<AgentRole, VecDeque<std::result::Result<RoleOutput, String>>>>,
    calls: Mutex<Vec<(String, AgentRole, u32)>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a failure with `error` for the next attempt of `role`.
    pub fn fail_next(self, role: AgentRole, error: &str) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(role)
            .or_default()
            .push_back(Err(error.to_string()));
        self
    }

    /// Queue an explicit output for the next attempt of `role`.
    pub fn succeed_next(self, output: RoleOutput) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(output.role())
            .or_default()
            .push_back(Ok(output));
        self
    }

    /// `(issue_id, role, attempt)` for every call, in order.
    pub fn calls(&self) -> Vec<(String, AgentRole, u32)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentExecutor for ScriptedExecutor {
    async fn execute(&self, task: &AgentTask) -> Result<RoleOutput> {
        self.calls
            .lock()
            .unwrap()
            .push((task.issue_id.clone(), task.agent, task.attempt));

        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&task.agent)
            .and_then(VecDeque::pop_front);

        match scripted {
            Some(Ok(output)) => Ok(output),
            Some(Err(error)) => Err(DispatchError::tool(task.agent.as_str(), error)),
            None => Ok(RoleOutput::basic(
                task.agent,
                vec![format!("{}.txt", task.agent)],
                format!("{} done", task.agent),
            )),
        }
    }
}
