//! Typed agent results.
//!
//! Each role reports a [`RoleOutput`] variant with an explicit schema. The
//! coordinator stores it inside an [`AgentResult`] together with a SHA-256
//! digest of the serialized output, so tampering with the state file is
//! detectable via [`AgentResult::verify`].

use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};
use crate::roles::AgentRole;

/// Error phrases that never justify a retry.
pub const NON_RETRYABLE_ERRORS: &[&str] = &[
    "syntax error",
    "invalid configuration",
    "authentication failed",
    "permission denied",
];

/// Output produced by a completed role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoleOutput {
    Frontend {
        #[serde(default)]
        components: Vec<String>,
        #[serde(default)]
        files_modified: Vec<String>,
        description: String,
    },
    Backend {
        #[serde(default)]
        endpoints: Vec<String>,
        #[serde(default)]
        files_modified: Vec<String>,
        description: String,
    },
    Database {
        #[serde(default)]
        migrations: Vec<String>,
        #[serde(default)]
        files_modified: Vec<String>,
        description: String,
    },
    Devops {
        #[serde(default)]
        pipelines: Vec<String>,
        #[serde(default)]
        files_modified: Vec<String>,
        description: String,
    },
    Documentation {
        #[serde(default)]
        pages: Vec<String>,
        #[serde(default)]
        files_modified: Vec<String>,
        description: String,
    },
}

impl RoleOutput {
    /// An output with no role-specific detail.
    pub fn basic(
        role: AgentRole,
        files_modified: Vec<String>,
        description: impl Into<String>,
    ) -> Self {
        let description = description.into();
        match role {
            AgentRole::Frontend => RoleOutput::Frontend {
                components: Vec::new(),
                files_modified,
                description,
            },
            AgentRole::Backend => RoleOutput::Backend {
                endpoints: Vec::new(),
                files_modified,
                description,
            },
            AgentRole::Database => RoleOutput::Database {
                migrations: Vec::new(),
                files_modified,
                description,
            },
            AgentRole::Devops => RoleOutput::Devops {
                pipelines: Vec::new(),
                files_modified,
                description,
            },
            AgentRole::Documentation => RoleOutput::Documentation {
                pages: Vec::new(),
                files_modified,
                description,
            },
        }
    }

    /// The role that produces this output variant.
    pub fn role(&self) -> AgentRole {
        match self {
            RoleOutput::Frontend { .. } => AgentRole::Frontend,
            RoleOutput::Backend { .. } => AgentRole::Backend,
            RoleOutput::Database { .. } => AgentRole::Database,
            RoleOutput::Devops { .. } => AgentRole::Devops,
            RoleOutput::Documentation { .. } => AgentRole::Documentation,
        }
    }

    pub fn files_modified(&self) -> &[String] {
        match self {
            RoleOutput::Frontend { files_modified, .. }
            | RoleOutput::Backend { files_modified, .. }
            | RoleOutput::Database { files_modified, .. }
            | RoleOutput::Devops { files_modified, .. }
            | RoleOutput::Documentation { files_modified, .. } => files_modified,
        }
    }

    pub fn description(&self) -> &str {
        match self {
            RoleOutput::Frontend { description, .. }
            | RoleOutput::Backend { description, .. }
            | RoleOutput::Database { description, .. }
            | RoleOutput::Devops { description, .. }
            | RoleOutput::Documentation { description, .. } => description,
        }
    }

    /// Role-specific detail items (components, endpoints, ...).
    pub fn details(&self) -> &[String] {
        match self {
            RoleOutput::Frontend { components, .. } => components,
            RoleOutput::Backend { endpoints, .. } => endpoints,
            RoleOutput::Database { migrations, .. } => migrations,
            RoleOutput::Devops { pipelines, .. } => pipelines,
            RoleOutput::Documentation { pages, .. } => pages,
        }
    }
}

/// Whether a failure may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Retryable,
    Terminal,
}

impl FailureClass {
    /// Classify an error message against [`NON_RETRYABLE_ERRORS`].
    pub fn of(error: &str) -> Self {
        let lower = error.to_lowercase();
        if NON_RETRYABLE_ERRORS.iter().any(|p| lower.contains(p)) {
            FailureClass::Terminal
        } else {
            FailureClass::Retryable
        }
    }
}

/// Final result recorded for a role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AgentResult {
    Completed {
        output: RoleOutput,
        /// SHA-256 hex digest of `serde_json::to_vec(&output)`.
        digest: String,
    },
    Failed {
        error: String,
        class: FailureClass,
    },
    /// Never ran because an upstream role failed.
    Skipped { reason: String },
}

fn output_digest(output: &RoleOutput) -> Result<String> {
    use sha2::Digest as _;
    let bytes = serde_json::to_vec(output)?;
    Ok(hex::encode(sha2::Sha256::digest(&bytes)))
}

impl AgentResult {
    /// Wrap an output, computing and embedding its digest.
    pub fn completed(output: RoleOutput) -> Result<Self> {
        let digest = output_digest(&output)?;
        Ok(AgentResult::Completed { output, digest })
    }

    pub fn failed(error: impl Into<String>) -> Self {
        let error = error.into();
        let class = FailureClass::of(&error);
        AgentResult::Failed { error, class }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        AgentResult::Skipped {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AgentResult::Completed { .. })
    }

    pub fn output(&self) -> Option<&RoleOutput> {
        match self {
            AgentResult::Completed { output, .. } => Some(output),
            _ => None,
        }
    }

    /// Short human-readable summary for reports and logs.
    pub fn summary(&self) -> String {
        match self {
            AgentResult::Completed { output, .. } => output.description().to_string(),
            AgentResult::Failed { error, .. } => error.clone(),
            AgentResult::Skipped { reason } => reason.clone(),
        }
    }

    /// Re-derive the digest of a completed output.
    ///
    /// Returns [`DispatchError::DigestMismatch`] if the stored output was altered.
    pub fn verify(&self) -> Result<()> {
        if let AgentResult::Completed { output, digest } = self {
            let computed = output_digest(output)?;
            if &computed != digest {
                return Err(DispatchError::DigestMismatch {
                    expected: digest.clone(),
                    actual: computed,
                });
            }
        }
        Ok(())
    }
}
