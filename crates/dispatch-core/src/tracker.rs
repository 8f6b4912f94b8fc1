//! Issue-tracker and pull-request collaborators.
//!
//! [`GhCli`] implements both traits by shelling out to `gh` and `git`.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{DispatchError, Result};
use crate::state::IssueData;

/// Title, body and labels of a tracked issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueDetails {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

impl IssueDetails {
    pub fn into_issue_data(self) -> IssueData {
        IssueData {
            title: self.title,
            body: self.body,
            labels: self.labels,
            analysis: None,
        }
    }
}

#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn get_issue(&self, number: u64) -> Result<IssueDetails>;
    async fn post_comment(&self, number: u64, body: &str) -> Result<()>;
}

/// Files to commit on a fresh branch and the pull request to open for them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchChanges {
    pub issue_number: u64,
    pub branch: String,
    pub title: String,
    pub body: String,
    pub files: Vec<String>,
}

impl BranchChanges {
    pub fn for_issue(issue_number: u64, issue_title: &str, files: Vec<String>) -> Self {
        Self {
            issue_number,
            branch: branch_name(issue_number, issue_title),
            title: format!("Resolve #{issue_number}: {issue_title}"),
            body: format!("Automated changes for #{issue_number}.\n\nCloses #{issue_number}"),
            files,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestOutcome {
    pub success: bool,
    pub pr_url: Option<String>,
    pub files_changed: Vec<String>,
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PullRequestOutcome {
    pub fn failed(changes: &BranchChanges, error: impl Into<String>) -> Self {
        Self {
            success: false,
            pr_url: None,
            files_changed: changes.files.clone(),
            branch: changes.branch.clone(),
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait PullRequestCreator: Send + Sync {
    async fn create_pull_request(&self, changes: &BranchChanges) -> Result<PullRequestOutcome>;
}

/// `dispatch/issue-<n>-<slug>`, slug limited to 40 characters.
pub fn branch_name(issue_number: u64, title: &str) -> String {
    static NON_ALNUM: OnceLock<Regex> = OnceLock::new();
    let re = NON_ALNUM.get_or_init(|| Regex::new(r"[^a-z0-9]+").unwrap());
    let lower = title.to_lowercase();
    let slug = re.replace_all(&lower, "-");
    let slug: String = slug.trim_matches('-').chars().take(40).collect();
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        format!("dispatch/issue-{issue_number}")
    } else {
        format!("dispatch/issue-{issue_number}-{slug}")
    }
}

/// First pull-request URL in `gh pr create` output.
pub fn parse_pr_url(output: &str) -> Option<String> {
    static PR_URL: OnceLock<Regex> = OnceLock::new();
    let re = PR_URL.get_or_init(|| Regex::new(r"https://\S+/pull/\d+").unwrap());
    re.find(output).map(|m| m.as_str().to_string())
}

#[derive(Deserialize)]
struct GhIssue {
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    labels: Vec<GhLabel>,
}

#[derive(Deserialize)]
struct GhLabel {
    name: String,
}

/// Parse `gh issue view --json title,body,labels` output.
pub fn parse_issue_json(number: u64, json: &str) -> Result<IssueDetails> {
    let issue: GhIssue = serde_json::from_str(json)
        .map_err(|e| DispatchError::Parse(format!("gh issue view output: {e}")))?;
    Ok(IssueDetails {
        number,
        title: issue.title,
        body: issue.body.unwrap_or_default(),
        labels: issue.labels.into_iter().map(|l| l.name).collect(),
    })
}

/// `gh`/`git` backed tracker and pull-request creator.
#[derive(Debug, Clone)]
pub struct GhCli {
    repo: Option<String>,
    workdir: PathBuf,
}

impl GhCli {
    /// `repo` is `owner/name`; `None` lets `gh` infer it from `workdir`.
    pub fn new(repo: Option<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            repo,
            workdir: workdir.into(),
        }
    }

    fn repo_args(&self) -> Vec<String> {
        match &self.repo {
            Some(r) => vec!["--repo".to_string(), r.clone()],
            None => Vec::new(),
        }
    }

    async fn run(&self, program: &str, args: &[String]) -> Result<String> {
        debug!(program, args = ?args, "running external tool");
        let output = Command::new(program)
            .args(args)
            .current_dir(&self.workdir)
            .env("GH_FORCE_TTY", "0")
            .env("NO_COLOR", "1")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| DispatchError::tool(program, format!("failed to run: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DispatchError::tool(
                program,
                format!(
                    "{} exited with {}: {}",
                    args.first().map_or("", String::as_str),
                    output.status,
                    stderr.trim()
                ),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn git(&self, args: &[&str]) -> Result<String> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.run("git", &args).await
    }
}

#[async_trait]
impl IssueTracker for GhCli {
    async fn get_issue(&self, number: u64) -> Result<IssueDetails> {
        let mut args = vec![
            "issue".to_string(),
            "view".to_string(),
            number.to_string(),
            "--json".to_string(),
            "title,body,labels".to_string(),
        ];
        args.extend(self.repo_args());
        let out = self.run("gh", &args).await?;
        parse_issue_json(number, &out)
    }

    async fn post_comment(&self, number: u64, body: &str) -> Result<()> {
        let mut args = vec![
            "issue".to_string(),
            "comment".to_string(),
            number.to_string(),
            "--body".to_string(),
            body.to_string(),
        ];
        args.extend(self.repo_args());
        self.run("gh", &args).await?;
        info!(issue = number, "comment posted");
        Ok(())
    }
}

#[async_trait]
impl PullRequestCreator for GhCli {
    async fn create_pull_request(&self, changes: &BranchChanges) -> Result<PullRequestOutcome> {
        if changes.files.is_empty() {
            return Ok(PullRequestOutcome::failed(changes, "no files changed"));
        }

        self.git(&["checkout", "-B", &changes.branch]).await?;
        let mut add: Vec<&str> = vec!["add", "--"];
        add.extend(changes.files.iter().map(String::as_str));
        self.git(&add).await?;
        self.git(&["commit", "-m", &changes.title]).await?;
        self.git(&["push", "--force-with-lease", "-u", "origin", &changes.branch])
            .await?;

        let mut args = vec![
            "pr".to_string(),
            "create".to_string(),
            "--title".to_string(),
            changes.title.clone(),
            "--body".to_string(),
            changes.body.clone(),
            "--head".to_string(),
            changes.branch.clone(),
        ];
        args.extend(self.repo_args());
        let out = self.run("gh", &args).await?;
        let pr_url = parse_pr_url(&out);
        info!(branch = %changes.branch, pr_url = ?pr_url, "pull request created");

        Ok(PullRequestOutcome {
            success: true,
            pr_url,
            files_changed: changes.files.clone(),
            branch: changes.branch.clone(),
            error: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_name_slugifies_title() {
        assert_eq!(
            branch_name(42, "Fix: Login button broken!"),
            "dispatch/issue-42-fix-login-button-broken"
        );
        assert_eq!(branch_name(7, "!!!"), "dispatch/issue-7");
    }

    #[test]
    fn test_branch_name_truncates_long_titles() {
        let name = branch_name(1, &"word ".repeat(30));
        let slug = name.trim_start_matches("dispatch/issue-1-");
        assert!(slug.len() <= 40);
        assert!(!slug.ends_with('-'));
    }

    #[test]
    fn test_parse_pr_url() {
        let out = "Creating pull request for feature into main\n\nhttps://github.com/acme/blog/pull/17\n";
        assert_eq!(
            parse_pr_url(out).as_deref(),
            Some("https://github.com/acme/blog/pull/17")
        );
        assert!(parse_pr_url("nothing here").is_none());
    }

    #[test]
    fn test_parse_issue_json_flattens_labels() {
        let json = r#"{"title":"Add dark mode","body":null,"labels":[{"name":"enhancement"},{"name":"ui"}]}"#;
        let issue = parse_issue_json(9, json).unwrap();
        assert_eq!(issue.number, 9);
        assert_eq!(issue.body, "");
        assert_eq!(issue.labels, vec!["enhancement", "ui"]);
    }

    #[test]
    fn test_parse_issue_json_rejects_garbage() {
        assert!(matches!(
            parse_issue_json(1, "not json"),
            Err(DispatchError::Parse(_))
        ));
    }

    #[test]
    fn test_branch_changes_for_issue() {
        let changes = BranchChanges::for_issue(5, "Update docs", vec!["README.md".into()]);
        assert_eq!(changes.branch, "dispatch/issue-5-update-docs");
        assert!(changes.body.contains("Closes #5"));
    }

    #[tokio::test]
    async fn test_empty_change_set_is_unsuccessful() {
        let gh = GhCli::new(None, std::env::temp_dir());
        let changes = BranchChanges::for_issue(5, "Nothing", Vec::new());
        let outcome = gh.create_pull_request(&changes).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("no files changed"));
    }
}
