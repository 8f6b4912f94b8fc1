//! Dispatch - issue orchestration CLI
//!
//! The `dispatch` command classifies tracked issues and coordinates the
//! agent roles that work on them.
//!
//! ## Commands
//!
//! - `status`: Show active issues, the queue and resource locks
//! - `clean`: Remove completed issues older than N hours
//! - `next`: Show (or claim) the next runnable unit of work
//! - `classify`: Classify an issue from its text
//! - `register`: Register an issue and enqueue its roles
//! - `complete`: Record the outcome of a role
//! - `comms`: Show the messages exchanged on an issue
//! - `run`: Process an issue end to end

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};

use dispatch_core::obs::IssueSpan;
use dispatch_core::{
    classify, issue_id, AgentExecutor, AgentResult, AgentRole, CommandExecutor, Coordinator,
    DispatchConfig, FsStateStore, GhCli, IssueData, IssueWorkflow, LlmExecutor, MessageLog,
    OpenAiClient, ProgressStatus, RoleCatalog, RoleOutput, RunStatus, StateLock,
};

/// How long mutating commands wait for another process to release the state.
const LOCK_WAIT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "dispatch")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Issue classification and agent coordination", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Directory holding coordination state (overrides DISPATCH_STATE_DIR)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show active issues, the agent queue and resource locks
    Status,

    /// Remove completed issues older than the given age
    Clean {
        /// Minimum age in hours
        #[arg(default_value = "24")]
        hours: u32,
    },

    /// Show the next runnable unit of work
    Next {
        /// Mark it executing and take its resource locks
        #[arg(long)]
        claim: bool,
    },

    /// Classify an issue and print the analysis as JSON
    Classify {
        #[arg(long)]
        title: String,

        #[arg(long, default_value = "")]
        body: String,

        /// Issue label (repeatable)
        #[arg(long = "label")]
        labels: Vec<String>,
    },

    /// Register an issue and enqueue its roles
    Register {
        /// Issue number
        number: u64,

        /// Required role (repeatable); classified from the text when omitted
        #[arg(long = "agent")]
        agents: Vec<AgentRole>,

        #[arg(long, default_value = "")]
        title: String,

        #[arg(long, default_value = "")]
        body: String,

        /// Issue label (repeatable)
        #[arg(long = "label")]
        labels: Vec<String>,
    },

    /// Record the outcome of an executing role
    Complete {
        /// Issue id (`issue-12`) or number
        issue: String,

        /// Role that finished
        agent: AgentRole,

        /// The role failed; it is retried when allowed
        #[arg(long)]
        failed: bool,

        /// Failure message
        #[arg(long)]
        error: Option<String>,

        /// File modified by the role (repeatable)
        #[arg(long = "file")]
        files: Vec<String>,

        /// Summary of the work done
        #[arg(long, default_value = "completed")]
        description: String,
    },

    /// Show messages exchanged on an issue
    Comms {
        /// Issue id (`issue-12`) or number
        issue: String,

        /// Only messages sent by or addressed to this role
        #[arg(long)]
        agent: Option<AgentRole>,
    },

    /// Fetch, classify and process an issue end to end
    Run {
        /// Issue number
        number: u64,

        /// Run even when the classifier holds the issue for review
        #[arg(long)]
        force: bool,

        /// Do not open a pull request
        #[arg(long)]
        no_pr: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    dispatch_core::telemetry::init_tracing(cli.json, level);

    let mut config = DispatchConfig::from_env().context("Invalid dispatch configuration")?;
    if let Some(dir) = cli.state_dir {
        config = config.with_state_dir(dir);
    }

    match cli.command {
        Commands::Status => cmd_status(&config).await,
        Commands::Clean { hours } => cmd_clean(&config, hours).await,
        Commands::Next { claim } => cmd_next(&config, claim).await,
        Commands::Classify {
            title,
            body,
            labels,
        } => cmd_classify(&title, &body, &labels),
        Commands::Register {
            number,
            agents,
            title,
            body,
            labels,
        } => cmd_register(&config, number, &agents, title, body, labels).await,
        Commands::Complete {
            issue,
            agent,
            failed,
            error,
            files,
            description,
        } => {
            cmd_complete(
                &config,
                &issue,
                agent,
                failed,
                error.as_deref(),
                files,
                &description,
            )
            .await
        }
        Commands::Comms { issue, agent } => cmd_comms(&config, &issue, agent).await,
        Commands::Run {
            number,
            force,
            no_pr,
        } => cmd_run(&config, number, force, no_pr).await,
    }
}

/// Accept `issue-12` or `12`.
fn normalize_issue_id(raw: &str) -> String {
    match raw.trim().parse::<u64>() {
        Ok(n) => issue_id(n),
        Err(_) => raw.trim().to_string(),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn open_coordinator(config: &DispatchConfig) -> Result<Coordinator> {
    let store = Arc::new(FsStateStore::new(config.state_file()));
    let coordinator = Coordinator::open(store, RoleCatalog::standard())
        .await
        .with_context(|| format!("Failed to load {}", config.state_file().display()))?;
    Ok(coordinator.with_message_log(MessageLog::new(config.communications_dir())))
}

/// Serialize writers across processes.
async fn lock_state(config: &DispatchConfig) -> Result<StateLock> {
    std::fs::create_dir_all(config.state_dir())
        .with_context(|| format!("Failed to create {}", config.state_dir().display()))?;
    StateLock::acquire_with_wait(config.lock_file(), config.lock_stale_after, LOCK_WAIT)
        .await
        .context("Coordination state is in use by another process")
}

/// Show coordination status
async fn cmd_status(config: &DispatchConfig) -> Result<()> {
    let coordinator = open_coordinator(config).await?;
    let state = coordinator.snapshot().await;

    let completed = state
        .active_issues
        .values()
        .filter(|r| r.is_completed())
        .count();
    let executing = state.executing().count();
    println!(
        "Issues: {} ({} completed)",
        state.active_issues.len(),
        completed
    );
    println!(
        "Queue:  {} queued, {} executing",
        state.agent_queue.len() - executing,
        executing
    );
    println!();

    for record in state.active_issues.values() {
        let roles: Vec<String> = record
            .execution_order
            .iter()
            .map(|role| {
                let mark = match record.agent_progress.get(role).map(|p| p.status) {
                    Some(ProgressStatus::Completed) => "done",
                    Some(ProgressStatus::Failed) => "failed",
                    Some(ProgressStatus::Skipped) => "skipped",
                    Some(ProgressStatus::Executing) => "running",
                    Some(ProgressStatus::Retrying) => "retrying",
                    Some(ProgressStatus::Queued) | None => "queued",
                };
                format!("{role}:{mark}")
            })
            .collect();
        let status = if record.is_completed() {
            "completed"
        } else {
            "registered"
        };
        println!(
            "{:<12} {:<10} {}  {}",
            record.issue_id,
            status,
            roles.join(" "),
            record.issue_data.title
        );
    }

    if !state.resource_locks.is_empty() {
        println!();
        println!("Resource locks:");
        for (resource, holder) in &state.resource_locks {
            println!(
                "  {:<16} issue {} ({}) since {}",
                resource,
                holder.issue_number,
                holder.agent,
                holder.acquired_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
        }
    }

    println!();
    println!(
        "Last update: {}",
        state.last_update.format("%Y-%m-%d %H:%M:%S UTC")
    );
    Ok(())
}

/// Remove old completed issues
async fn cmd_clean(config: &DispatchConfig, hours: u32) -> Result<()> {
    let _lock = lock_state(config).await?;
    let coordinator = open_coordinator(config).await?;
    let removed = coordinator
        .clean_completed(chrono::Duration::hours(i64::from(hours)))
        .await;
    println!("Removed {removed} completed issue(s) older than {hours}h");
    Ok(())
}

/// Show or claim the next runnable unit
async fn cmd_next(config: &DispatchConfig, claim: bool) -> Result<()> {
    let _lock = if claim {
        Some(lock_state(config).await?)
    } else {
        None
    };
    let coordinator = open_coordinator(config).await?;
    let next = if claim {
        coordinator.get_next_agent().await
    } else {
        coordinator.peek_next_agent().await
    };

    match next {
        Some(unit) => print_json(&unit),
        None => {
            println!("No runnable work");
            Ok(())
        }
    }
}

/// Classify an issue
fn cmd_classify(title: &str, body: &str, labels: &[String]) -> Result<()> {
    print_json(&classify(title, body, labels))
}

/// Register an issue
async fn cmd_register(
    config: &DispatchConfig,
    number: u64,
    agents: &[AgentRole],
    title: String,
    body: String,
    labels: Vec<String>,
) -> Result<()> {
    let _span = IssueSpan::enter(&issue_id(number));
    let analysis = classify(&title, &body, &labels);
    let required = if agents.is_empty() {
        analysis.agents.clone()
    } else {
        agents.to_vec()
    };

    let _lock = lock_state(config).await?;
    let coordinator = open_coordinator(config).await?;
    let data = IssueData {
        title,
        body,
        labels,
        analysis: Some(analysis),
    };
    let id = coordinator
        .register_issue(number, data, &required)
        .await
        .with_context(|| format!("Failed to register issue #{number}"))?;

    let record = coordinator
        .issue(&id)
        .await
        .with_context(|| format!("{id} missing after registration"))?;
    let order: Vec<&str> = record.execution_order.iter().map(|r| r.as_str()).collect();
    println!("Registered {id}: {}", order.join(" -> "));
    Ok(())
}

/// Record a role outcome
async fn cmd_complete(
    config: &DispatchConfig,
    issue: &str,
    agent: AgentRole,
    failed: bool,
    error: Option<&str>,
    files: Vec<String>,
    description: &str,
) -> Result<()> {
    let id = normalize_issue_id(issue);
    let _span = IssueSpan::enter(&id);
    let _lock = lock_state(config).await?;
    let coordinator = open_coordinator(config).await?;

    if failed {
        let error = error.unwrap_or("agent reported failure");
        let retried = coordinator
            .handle_agent_failure(&id, agent, error)
            .await
            .with_context(|| format!("Failed to record failure of {agent} on {id}"))?;
        if retried {
            println!("{agent} on {id} re-queued for retry");
        } else {
            println!("{agent} on {id} marked failed");
        }
        return Ok(());
    }

    let result = AgentResult::completed(RoleOutput::basic(agent, files, description))?;
    let outcome = coordinator
        .record_agent_completion(&id, agent, result)
        .await
        .with_context(|| format!("Failed to record completion of {agent} on {id}"))?;

    println!("{agent} on {id} completed");
    if outcome.issue_complete {
        println!("{id} is complete");
    }
    if let Some(next) = outcome.next_agent {
        info!(issue_id = %next.issue_id, agent = %next.agent, "next unit claimed");
        println!("Next: {} on {}", next.agent, next.issue_id);
    }
    Ok(())
}

/// Show messages for an issue
async fn cmd_comms(config: &DispatchConfig, issue: &str, agent: Option<AgentRole>) -> Result<()> {
    let id = normalize_issue_id(issue);
    let coordinator = open_coordinator(config).await?;
    let messages = coordinator.get_agent_communication(&id, agent).await;

    if messages.is_empty() {
        println!("No messages for {id}");
        return Ok(());
    }
    for m in messages {
        println!(
            "[{}] {} -> {}: {}",
            m.timestamp.format("%Y-%m-%d %H:%M:%S"),
            m.from_agent,
            m.to_agent,
            m.message
        );
    }
    Ok(())
}

fn build_executor(
    config: &DispatchConfig,
    workdir: &std::path::Path,
) -> Result<Arc<dyn AgentExecutor>> {
    if let Some(command) = &config.agent_command {
        let executor = CommandExecutor::from_command_line(command, config.agent_timeout)?
            .with_workdir(workdir);
        return Ok(Arc::new(executor));
    }
    if config.openai_api_key.is_some() {
        let client = OpenAiClient::new(
            config.openai_base_url.clone(),
            config.llm_model.clone(),
            config.openai_api_key.clone(),
        );
        return Ok(Arc::new(LlmExecutor::new(client)));
    }
    anyhow::bail!("No agent configured: set DISPATCH_AGENT_COMMAND or OPENAI_API_KEY")
}

/// Process an issue end to end
async fn cmd_run(config: &DispatchConfig, number: u64, force: bool, no_pr: bool) -> Result<()> {
    let workdir = std::env::current_dir().context("Failed to resolve working directory")?;
    let executor = build_executor(config, &workdir)?;
    let gh = Arc::new(GhCli::new(config.repo.clone(), &workdir));

    let _lock = lock_state(config).await?;
    let coordinator = Arc::new(open_coordinator(config).await?);

    let mut workflow = IssueWorkflow::new(coordinator, gh.clone(), executor)
        .with_metrics_file(config.metrics_file());
    if !no_pr {
        workflow = workflow.with_pull_requests(gh);
    }

    let summary = workflow
        .run(number, force)
        .await
        .with_context(|| format!("Run for issue #{number} failed"))?;
    print_json(&summary)?;

    match summary.status {
        RunStatus::Completed if !summary.succeeded() => {
            let failed: Vec<&str> = summary.failed_agents.iter().map(|r| r.as_str()).collect();
            anyhow::bail!("Agents failed on issue #{number}: {}", failed.join(", "))
        }
        RunStatus::Stalled => {
            anyhow::bail!("Issue #{number} has work that cannot run now; see `dispatch status`")
        }
        _ => Ok(()),
    }
}
