//! Append-only JSONL message log.
//!
//! One file per issue (`<dir>/<issue_id>.jsonl`), or `global.jsonl` for
//! messages not tied to an issue. Lines are never rewritten. Reading skips
//! malformed lines with a warning so one bad write does not hide the rest.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::error::{DispatchError, Result};
use crate::state::AgentMessage;

const GLOBAL_LOG: &str = "global";

/// Directory of per-issue JSONL message files.
#[derive(Debug, Clone)]
pub struct MessageLog {
    dir: PathBuf,
}

impl MessageLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the log file for `issue_id` (or the global log).
    pub fn path_for(&self, issue_id: Option<&str>) -> PathBuf {
        let stem = issue_id.unwrap_or(GLOBAL_LOG);
        self.dir.join(format!("{stem}.jsonl"))
    }

    /// Append one message as a single JSON line.
    pub async fn append(&self, message: &AgentMessage) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');

        let path = self.path_for(message.issue_id.as_deref());
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| {
                DispatchError::Persistence(format!("failed to open {}: {e}", path.display()))
            })?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    /// All messages for `issue_id`, in append order.
    ///
    /// A missing file yields an empty list.
    pub async fn read(&self, issue_id: Option<&str>) -> Result<Vec<AgentMessage>> {
        let path = self.path_for(issue_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(parse_lines(&path, &content))
    }

    /// Messages for `issue_id` sent by or addressed to `participant`.
    pub async fn read_filtered(
        &self,
        issue_id: Option<&str>,
        participant: &str,
    ) -> Result<Vec<AgentMessage>> {
        Ok(self
            .read(issue_id)
            .await?
            .into_iter()
            .filter(|m| m.involves(participant))
            .collect())
    }
}

fn parse_lines(path: &Path, content: &str) -> Vec<AgentMessage> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .filter_map(|(idx, line)| match serde_json::from_str::<AgentMessage>(line) {
            Ok(m) => Some(m),
            Err(e) => {
                warn!(
                    path = %path.display(),
                    line = idx + 1,
                    error = %e,
                    "skipping malformed message line"
                );
                None
            }
        })
        .collect()
}
