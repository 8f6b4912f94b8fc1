//! End-to-end driver for one tracked issue.
//!
//! fetch → classify → register → execute until nothing is runnable →
//! optional pull request → summary comment → metrics flush.
//!
//! The loop drains the shared queue, so other issues' work may run too;
//! any of them that completes gets its own pull request and summary.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};

use crate::classifier::{classify, IssueAnalysis};
use crate::coordinator::{Coordinator, NextAgent};
use crate::error::{DispatchError, Result};
use crate::executor::{AgentExecutor, AgentTask};
use crate::metrics::METRICS;
use crate::outcome::AgentResult;
use crate::reporter::Reporter;
use crate::roles::AgentRole;
use crate::state::{issue_id as make_issue_id, IssueRecord};
use crate::tracker::{BranchChanges, IssueTracker, PullRequestCreator, PullRequestOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every role reached a final state.
    Completed,
    /// Not auto-implementable and not forced; a review comment was posted.
    NeedsReview,
    /// Work for this issue remains but none of it can run now, usually
    /// because another process holds a resource.
    Stalled,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub issue_id: String,
    pub issue_number: u64,
    pub status: RunStatus,
    pub analysis: IssueAnalysis,
    pub completed_agents: Vec<AgentRole>,
    pub failed_agents: Vec<AgentRole>,
    pub files_modified: Vec<String>,
    pub pull_request: Option<PullRequestOutcome>,
    /// Whether the summary comment was posted.
    pub reported: bool,
}

impl RunSummary {
    fn new(issue_number: u64, analysis: IssueAnalysis, status: RunStatus) -> Self {
        Self {
            issue_id: make_issue_id(issue_number),
            issue_number,
            status,
            analysis,
            completed_agents: Vec::new(),
            failed_agents: Vec::new(),
            files_modified: Vec::new(),
            pull_request: None,
            reported: false,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Completed && self.failed_agents.is_empty()
    }
}

pub struct IssueWorkflow {
    coordinator: Arc<Coordinator>,
    tracker: Arc<dyn IssueTracker>,
    executor: Arc<dyn AgentExecutor>,
    pull_requests: Option<Arc<dyn PullRequestCreator>>,
    reporter: Reporter,
    metrics_path: Option<PathBuf>,
}

impl IssueWorkflow {
    pub fn new(
        coordinator: Arc<Coordinator>,
        tracker: Arc<dyn IssueTracker>,
        executor: Arc<dyn AgentExecutor>,
    ) -> Self {
        Self {
            coordinator,
            reporter: Reporter::new(tracker.clone()),
            tracker,
            executor,
            pull_requests: None,
            metrics_path: None,
        }
    }

    /// Open a pull request when a run modified files.
    pub fn with_pull_requests(mut self, creator: Arc<dyn PullRequestCreator>) -> Self {
        self.pull_requests = Some(creator);
        self
    }

    /// Persist the metrics snapshot here at the end of each run.
    pub fn with_metrics_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.metrics_path = Some(path.into());
        self
    }

    /// Process one issue end to end.
    ///
    /// `force` runs issues the classifier would hold for review. Errors after
    /// registration post the failure comment before being returned.
    pub async fn run(&self, issue_number: u64, force: bool) -> Result<RunSummary> {
        let span = info_span!("dispatch.run", issue_number);
        self.run_inner(issue_number, force).instrument(span).await
    }

    async fn run_inner(&self, issue_number: u64, force: bool) -> Result<RunSummary> {
        let issue = self.tracker.get_issue(issue_number).await?;
        let analysis = classify(&issue.title, &issue.body, &issue.labels);
        info!(
            issue = issue_number,
            issue_type = %analysis.issue_type,
            complexity = %analysis.complexity,
            risk = %analysis.risk,
            auto_implement = analysis.auto_implement,
            "issue classified"
        );

        if !analysis.auto_implement && !force {
            self.reporter
                .report_needs_review(issue_number, &analysis)
                .await;
            return Ok(RunSummary::new(issue_number, analysis, RunStatus::NeedsReview));
        }

        let agents = analysis.agents.clone();
        let mut data = issue.into_issue_data();
        data.analysis = Some(analysis.clone());
        let issue_id = self
            .coordinator
            .register_issue(issue_number, data, &agents)
            .await?;

        match self.drive(&issue_id, issue_number, analysis).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                warn!(issue_id = %issue_id, error = %e, "run failed");
                self.reporter
                    .report_failure(issue_number, &e.to_string())
                    .await;
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        issue_id: &str,
        issue_number: u64,
        analysis: IssueAnalysis,
    ) -> Result<RunSummary> {
        // Other issues whose queued work ran here.
        let mut others: Vec<String> = Vec::new();
        let mut next = self.coordinator.get_next_agent().await;
        while let Some(unit) = next {
            if unit.issue_id != issue_id && !others.contains(&unit.issue_id) {
                others.push(unit.issue_id.clone());
            }
            next = self.execute_unit(unit).await?;
        }

        for other in &others {
            match self.coordinator.issue(other).await {
                Some(record) if record.is_completed() => {
                    info!(issue_id = %other, "reporting issue completed during this run");
                    self.finish_issue(&record).await;
                }
                _ => {}
            }
        }

        let record = self
            .coordinator
            .issue(issue_id)
            .await
            .ok_or_else(|| DispatchError::IssueNotFound(issue_id.to_string()))?;

        if !record.is_completed() {
            warn!(issue_id = %issue_id, "no runnable work left but issue is not complete");
            let mut summary = RunSummary::new(issue_number, analysis, RunStatus::Stalled);
            summary.completed_agents = record.completed_agents;
            summary.failed_agents = record.failed_agents;
            return Ok(summary);
        }

        let (pull_request, reported) = self.finish_issue(&record).await;

        METRICS.flush();
        if let Some(path) = &self.metrics_path {
            if let Err(e) = METRICS.write_json(path) {
                warn!(path = %path.display(), error = %e, "failed to write metrics");
            }
        }

        let files_modified = record.files_modified();
        Ok(RunSummary {
            issue_id: issue_id.to_string(),
            issue_number,
            status: RunStatus::Completed,
            analysis,
            completed_agents: record.completed_agents,
            failed_agents: record.failed_agents,
            files_modified,
            pull_request,
            reported,
        })
    }

    /// Open the pull request (when files changed) and post the summary for a
    /// completed issue. Returns the PR outcome and whether the comment landed.
    async fn finish_issue(&self, record: &IssueRecord) -> (Option<PullRequestOutcome>, bool) {
        let files = record.files_modified();
        let pull_request = match &self.pull_requests {
            Some(creator) if !files.is_empty() => {
                let changes =
                    BranchChanges::for_issue(record.issue_number, &record.issue_data.title, files);
                Some(match creator.create_pull_request(&changes).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!(issue_id = %record.issue_id, error = %e, "pull request failed");
                        PullRequestOutcome::failed(&changes, e.to_string())
                    }
                })
            }
            _ => None,
        };

        let reported = self.reporter.report(record, pull_request.as_ref()).await;
        (pull_request, reported)
    }

    /// Execute one claimed unit and return the next claimed unit, if any.
    async fn execute_unit(&self, unit: NextAgent) -> Result<Option<NextAgent>> {
        let issue_id = unit.issue_id.clone();
        let agent = unit.agent;
        let focus = self
            .coordinator
            .catalog()
            .template(agent)
            .map(|t| t.description)
            .unwrap_or_default();
        let context = self
            .coordinator
            .get_agent_communication(&issue_id, None)
            .await;
        let task = AgentTask::new(unit, focus, context);

        match self.executor.execute(&task).await {
            Ok(output) => {
                let files = output.files_modified().to_vec();
                let note = format!("{agent} finished: {}", output.description());
                let result = AgentResult::completed(output)?;
                self.coordinator
                    .add_agent_communication(
                        &issue_id,
                        agent.as_str(),
                        "all",
                        &note,
                        serde_json::json!({ "filesModified": files }),
                    )
                    .await;
                let outcome = self
                    .coordinator
                    .record_agent_completion(&issue_id, agent, result)
                    .await?;
                Ok(outcome.next_agent)
            }
            Err(e) => {
                warn!(issue_id = %issue_id, agent = %agent, error = %e, "agent failed");
                self.coordinator
                    .handle_agent_failure(&issue_id, agent, &e.to_string())
                    .await?;
                Ok(self.coordinator.get_next_agent().await)
            }
        }
    }
}
