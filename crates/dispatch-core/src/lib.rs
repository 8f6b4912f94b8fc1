//! Dispatch Core Library
//!
//! Classifies tracked issues, orders the agent roles they need, and
//! coordinates role execution through a persisted state machine with
//! resource locks, retries and a per-issue message log.

pub mod classifier;
pub mod comms;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod fakes;
pub mod graph;
pub mod llm;
pub mod metrics;
pub mod obs;
pub mod outcome;
pub mod reporter;
pub mod roles;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod tracker;
pub mod workflow;

pub use classifier::{classify, Complexity, IssueAnalysis, IssueType, Risk};
pub use comms::MessageLog;
pub use config::DispatchConfig;
pub use coordinator::{CompletionOutcome, Coordinator, NextAgent, COORDINATOR};
pub use error::{DispatchError, Result};
pub use executor::{AgentExecutor, AgentTask, CommandExecutor, LlmExecutor};
pub use graph::{determine_agent_order, topological_order, OrderHints};
pub use llm::{LlmClient, OpenAiClient};
pub use metrics::{MetricsSnapshot, METRICS};
pub use outcome::{AgentResult, FailureClass, RoleOutput, NON_RETRYABLE_ERRORS};
pub use reporter::Reporter;
pub use roles::{AgentRole, RoleCatalog, RoleTemplate};
pub use state::{
    issue_id, AgentMessage, AgentProgress, CoordinationState, IssueData, IssueRecord,
    IssueStatus, LockHolder, ProgressStatus, QueueEntry, QueueStatus,
};
pub use store::{FsStateStore, LockInfo, MemoryStateStore, StateLock, StateStore};
pub use tracker::{
    BranchChanges, GhCli, IssueDetails, IssueTracker, PullRequestCreator, PullRequestOutcome,
};
pub use workflow::{IssueWorkflow, RunStatus, RunSummary};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
