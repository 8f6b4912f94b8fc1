//! Markdown issue comments summarizing a run.
//!
//! Posting is best effort: tracker errors are logged and reported as
//! `false`, never returned. Coordinator state is not touched.

use std::fmt::Write as _;
use std::sync::Arc;

use tracing::{info, warn};

use crate::classifier::IssueAnalysis;
use crate::outcome::AgentResult;
use crate::state::{IssueRecord, ProgressStatus};
use crate::tracker::{IssueTracker, PullRequestOutcome};

pub struct Reporter {
    tracker: Arc<dyn IssueTracker>,
}

impl Reporter {
    pub fn new(tracker: Arc<dyn IssueTracker>) -> Self {
        Self { tracker }
    }

    /// Post the run summary for a finished issue.
    pub async fn report(&self, record: &IssueRecord, pr: Option<&PullRequestOutcome>) -> bool {
        let body = render_summary(record, pr);
        self.post(record.issue_number, &body, "summary").await
    }

    /// Post the "please review manually" comment after a failed run.
    pub async fn report_failure(&self, issue_number: u64, error: &str) -> bool {
        let body = render_failure(error);
        self.post(issue_number, &body, "failure").await
    }

    /// Explain why an issue was not picked up automatically.
    pub async fn report_needs_review(&self, issue_number: u64, analysis: &IssueAnalysis) -> bool {
        let body = render_needs_review(analysis);
        self.post(issue_number, &body, "needs_review").await
    }

    async fn post(&self, issue_number: u64, body: &str, kind: &str) -> bool {
        match self.tracker.post_comment(issue_number, body).await {
            Ok(()) => {
                info!(issue = issue_number, kind, "report posted");
                true
            }
            Err(e) => {
                warn!(issue = issue_number, kind, error = %e, "failed to post report");
                false
            }
        }
    }
}

fn analysis_table(out: &mut String, analysis: &IssueAnalysis) {
    let agents: Vec<&str> = analysis.agents.iter().map(|a| a.as_str()).collect();
    let _ = writeln!(out, "| | |");
    let _ = writeln!(out, "|---|---|");
    let _ = writeln!(out, "| Type | {} |", analysis.issue_type);
    let _ = writeln!(out, "| Complexity | {} |", analysis.complexity);
    let _ = writeln!(out, "| Risk | {} |", analysis.risk);
    let _ = writeln!(out, "| Agents | {} |", agents.join(", "));
    let _ = writeln!(
        out,
        "| Auto-implement | {} |",
        if analysis.auto_implement { "yes" } else { "no" }
    );
}

/// Render the markdown summary for `record`.
pub fn render_summary(record: &IssueRecord, pr: Option<&PullRequestOutcome>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "## Automated implementation for #{}", record.issue_number);
    let _ = writeln!(out);

    if let Some(analysis) = &record.issue_data.analysis {
        analysis_table(&mut out, analysis);
        let _ = writeln!(out);
    }

    let _ = writeln!(out, "### Agents");
    let _ = writeln!(out);
    for role in &record.execution_order {
        let Some(progress) = record.agent_progress.get(role) else {
            continue;
        };
        let line = match (&progress.status, &progress.result) {
            (ProgressStatus::Completed, Some(result @ AgentResult::Completed { output, .. })) => {
                let files = output.files_modified().len();
                format!("completed: {} ({files} file(s))", result.summary())
            }
            (ProgressStatus::Failed, Some(result)) => format!("failed: {}", result.summary()),
            (ProgressStatus::Skipped, Some(result)) => format!("skipped: {}", result.summary()),
            (status, _) => format!("{status:?}").to_lowercase(),
        };
        let _ = writeln!(out, "- **{role}**: {line}");
    }

    let files = record.files_modified();
    if !files.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "### Files changed");
        let _ = writeln!(out);
        for f in &files {
            let _ = writeln!(out, "- `{f}`");
        }
    }

    if let Some(pr) = pr {
        let _ = writeln!(out);
        let _ = writeln!(out, "### Pull request");
        let _ = writeln!(out);
        match (&pr.pr_url, pr.success) {
            (Some(url), true) => {
                let _ = writeln!(out, "Opened {url} from `{}`.", pr.branch);
            }
            (None, true) => {
                let _ = writeln!(out, "Opened from `{}`.", pr.branch);
            }
            (_, false) => {
                let _ = writeln!(
                    out,
                    "Not opened: {}",
                    pr.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
    }

    if !record.failed_agents.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "Some agents did not finish. Please review the changes manually."
        );
    }
    out
}

pub fn render_failure(error: &str) -> String {
    format!(
        "## Automated implementation failed\n\n\
         The automated run stopped with an error:\n\n```\n{error}\n```\n\n\
         Please review manually.\n"
    )
}

pub fn render_needs_review(analysis: &IssueAnalysis) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "## Manual review needed");
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "This issue was classified as {} complexity with {} risk \
         and will not be implemented automatically.",
        analysis.complexity, analysis.risk
    );
    let _ = writeln!(out);
    analysis_table(&mut out, analysis);
    out
}
