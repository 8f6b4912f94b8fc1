//! Execution shim: turns a dequeued role into a [`RoleOutput`].
//!
//! Two implementations ship: [`CommandExecutor`] runs an external agent CLI,
//! [`LlmExecutor`] asks an [`LlmClient`] directly. Both expect the role's
//! output as a JSON object shaped like [`RoleOutput`].

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::coordinator::NextAgent;
use crate::error::{DispatchError, Result};
use crate::llm::{parse_json_response, LlmClient};
use crate::outcome::RoleOutput;
use crate::roles::AgentRole;
use crate::state::{AgentMessage, IssueData};

/// Everything an executor needs to work on one role of one issue.
#[derive(Debug, Clone)]
pub struct AgentTask {
    pub issue_id: String,
    pub issue_number: u64,
    pub agent: AgentRole,
    pub attempt: u32,
    pub issue: IssueData,
    /// What the role is responsible for.
    pub focus: String,
    /// Messages already exchanged on this issue.
    pub context: Vec<AgentMessage>,
}

impl AgentTask {
    pub fn new(next: NextAgent, focus: impl Into<String>, context: Vec<AgentMessage>) -> Self {
        Self {
            issue_id: next.issue_id,
            issue_number: next.issue_number,
            agent: next.agent,
            attempt: next.retry_attempt,
            issue: next.issue_data,
            focus: focus.into(),
            context,
        }
    }

    /// Prompt handed to the agent.
    pub fn render_prompt(&self) -> String {
        let mut prompt = format!(
            "You are the {agent} agent working on issue #{number}: {title}\n\n\
             Focus: {focus}\n\n\
             Issue description:\n{body}\n",
            agent = self.agent,
            number = self.issue_number,
            title = self.issue.title,
            focus = self.focus,
            body = if self.issue.body.trim().is_empty() {
                "(none)"
            } else {
                self.issue.body.trim()
            },
        );
        if !self.issue.labels.is_empty() {
            prompt.push_str(&format!("\nLabels: {}\n", self.issue.labels.join(", ")));
        }
        if self.attempt > 0 {
            prompt.push_str(&format!(
                "\nThis is retry attempt {}; the previous attempt failed.\n",
                self.attempt
            ));
        }
        if !self.context.is_empty() {
            prompt.push_str("\nMessages from other agents:\n");
            for m in &self.context {
                prompt.push_str(&format!("- {} -> {}: {}\n", m.from_agent, m.to_agent, m.message));
            }
        }
        prompt.push_str(&format!(
            "\nMake the change, then reply with only a JSON object:\n\
             {{\"kind\": \"{kind}\", \"{detail}\": [...], \"files_modified\": [...], \
             \"description\": \"...\"}}\n",
            kind = self.agent,
            detail = detail_key(self.agent),
        ));
        prompt
    }
}

fn detail_key(role: AgentRole) -> &'static str {
    match role {
        AgentRole::Frontend => "components",
        AgentRole::Backend => "endpoints",
        AgentRole::Database => "migrations",
        AgentRole::Devops => "pipelines",
        AgentRole::Documentation => "pages",
    }
}

/// Parse an agent reply and check it belongs to the expected role.
pub fn parse_role_output(agent: AgentRole, reply: &str) -> Result<RoleOutput> {
    let output: RoleOutput = parse_json_response(reply)?;
    if output.role() != agent {
        return Err(DispatchError::Parse(format!(
            "expected {agent} output, got {}",
            output.role()
        )));
    }
    Ok(output)
}

/// Performs the work for one role.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(&self, task: &AgentTask) -> Result<RoleOutput>;
}

/// Runs an external agent CLI with the prompt as its final argument.
///
/// The process must exit zero and print a JSON [`RoleOutput`] on stdout.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    workdir: Option<PathBuf>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
            workdir: None,
        }
    }

    /// Split a whitespace-separated command line into program and arguments.
    pub fn from_command_line(command: &str, timeout: Duration) -> Result<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| DispatchError::Config("agent command is empty".to_string()))?;
        Ok(Self::new(program, parts.collect(), timeout))
    }

    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }
}

#[async_trait]
impl AgentExecutor for CommandExecutor {
    async fn execute(&self, task: &AgentTask) -> Result<RoleOutput> {
        let start = Instant::now();
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(task.render_prompt())
            .env("DISPATCH_ISSUE_ID", &task.issue_id)
            .env("DISPATCH_AGENT", task.agent.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }

        let child = cmd
            .spawn()
            .map_err(|e| DispatchError::tool(&self.program, format!("spawn failed: {e}")))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| DispatchError::Timeout {
                agent: task.agent.to_string(),
                secs: self.timeout.as_secs(),
            })??;

        let duration_ms = start.elapsed().as_millis() as u64;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let code = output.status.code().unwrap_or(-1);
            warn!(agent = %task.agent, exit_code = code, duration_ms, "agent command failed");
            return Err(DispatchError::tool(
                &self.program,
                format!("exit code {code}: {}", stderr.trim()),
            ));
        }

        debug!(agent = %task.agent, duration_ms, "agent command finished");
        parse_role_output(task.agent, &String::from_utf8_lossy(&output.stdout))
    }
}

/// Asks an [`LlmClient`] for the role output directly.
pub struct LlmExecutor<C: LlmClient> {
    client: C,
    max_tokens: u32,
}

impl<C: LlmClient> LlmExecutor<C> {
    pub fn new(client: C) -> Self {
        Self {
            client,
            max_tokens: 2048,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

#[async_trait]
impl<C: LlmClient> AgentExecutor for LlmExecutor<C> {
    async fn execute(&self, task: &AgentTask) -> Result<RoleOutput> {
        let reply = self
            .client
            .complete(&task.render_prompt(), self.max_tokens)
            .await?;
        parse_role_output(task.agent, &reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(agent: AgentRole) -> AgentTask {
        AgentTask {
            issue_id: "issue-3".to_string(),
            issue_number: 3,
            agent,
            attempt: 0,
            issue: IssueData {
                title: "Update README".to_string(),
                body: "Document the install steps".to_string(),
                labels: vec!["documentation".to_string()],
                analysis: None,
            },
            focus: "README and guide updates".to_string(),
            context: Vec::new(),
        }
    }

    fn sh(script: &str) -> CommandExecutor {
        CommandExecutor::new(
            "sh",
            vec!["-c".to_string(), script.to_string(), "agent".to_string()],
            Duration::from_secs(10),
        )
    }

    struct CannedClient(String);

    #[async_trait]
    impl LlmClient for CannedClient {
        async fn complete(&self, _prompt: &str, _max_tokens: u32) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_prompt_mentions_issue_and_schema() {
        let mut t = task(AgentRole::Documentation);
        t.attempt = 2;
        let prompt = t.render_prompt();
        assert!(prompt.contains("issue #3: Update README"));
        assert!(prompt.contains("\"kind\": \"documentation\""));
        assert!(prompt.contains("\"pages\""));
        assert!(prompt.contains("retry attempt 2"));
    }

    #[test]
    fn test_parse_role_output_rejects_wrong_role() {
        let reply = r#"{"kind": "backend", "description": "api"}"#;
        let result = parse_role_output(AgentRole::Frontend, reply);
        assert!(matches!(result, Err(DispatchError::Parse(_))));
    }

    #[test]
    fn test_from_command_line_rejects_empty() {
        let result = CommandExecutor::from_command_line("   ", Duration::from_secs(1));
        assert!(matches!(result, Err(DispatchError::Config(_))));
    }

    #[tokio::test]
    async fn test_command_executor_parses_stdout() {
        let exec = sh(
            r#"printf '%s' '{"kind":"documentation","pages":["install"],"files_modified":["README.md"],"description":"docs"}'"#,
        );
        let output = exec.execute(&task(AgentRole::Documentation)).await.unwrap();
        assert_eq!(output.files_modified(), ["README.md".to_string()]);
        assert_eq!(output.details(), ["install".to_string()]);
    }

    #[tokio::test]
    async fn test_command_executor_nonzero_exit_is_tool_error() {
        let exec = sh("echo boom >&2; exit 3");
        let err = exec.execute(&task(AgentRole::Documentation)).await.unwrap_err();
        match err {
            DispatchError::ExternalTool { detail, .. } => {
                assert!(detail.contains("exit code 3"));
                assert!(detail.contains("boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_command_executor_times_out() {
        let exec = CommandExecutor::new(
            "sh",
            vec!["-c".to_string(), "sleep 5".to_string(), "agent".to_string()],
            Duration::from_millis(100),
        );
        let err = exec.execute(&task(AgentRole::Documentation)).await.unwrap_err();
        assert!(matches!(err, DispatchError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_llm_executor_parses_fenced_reply() {
        let reply = "Done.\n```json\n{\"kind\":\"documentation\",\"files_modified\":[\"docs/guide.md\"],\"description\":\"guide\"}\n```";
        let exec = LlmExecutor::new(CannedClient(reply.to_string())).with_max_tokens(128);
        let output = exec.execute(&task(AgentRole::Documentation)).await.unwrap();
        assert_eq!(output.description(), "guide");
    }
}
