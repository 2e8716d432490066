mod config;

pub use config::{DEFAULT_DB_PATH, DiagflowConfig};

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::engine::types::Finding;
use crate::engine::{AgentOrchestrator, ExecuteOptions, StaticContext};
use crate::state::StateManager;
use crate::storage::{RecoveryQuery, SessionStatus};
use crate::workflows::triage::{TRIAGE_WORKFLOW_ID, triage_definition};

#[derive(Parser)]
#[command(name = "diagflow", version, about = "Checkpointed diagnostic workflows")]
pub struct Cli {
    /// Path to a .env file to load (default: auto-detect .env in cwd)
    #[arg(long, global = true)]
    dotenv: Option<PathBuf>,

    /// Path to a diagflow.yaml config file (default: auto-detect in cwd)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// State database path (":memory:" for a throwaway database)
    #[arg(long, global = true, env = "DIAGFLOW_DB")]
    db: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the bundled triage workflow over a findings file
    Run {
        /// Endpoint the findings were collected from
        #[arg(short, long)]
        endpoint: String,

        /// JSON file holding an array of findings
        #[arg(short, long)]
        findings: Option<PathBuf>,

        /// Thread id for this run (default: generated)
        #[arg(short, long)]
        thread: Option<String>,

        /// Enable verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// List sessions
    Sessions {
        /// Only sessions of this workflow
        #[arg(short, long)]
        workflow: Option<String>,

        /// Filter by status (active, completed, failed)
        #[arg(short, long)]
        status: Option<String>,

        /// Output format (table, json)
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// List checkpoints of a workflow, newest first
    Checkpoints {
        #[arg(short, long)]
        workflow: String,

        #[arg(short, long)]
        thread: Option<String>,
    },

    /// Print a checkpoint as JSON
    Inspect {
        /// Checkpoint ID
        checkpoint_id: String,
    },

    /// Print the newest checkpoint matching the filters
    Recover {
        #[arg(short, long)]
        workflow: String,

        #[arg(short, long)]
        thread: Option<String>,

        /// Only checkpoints strictly older than this RFC 3339 timestamp
        #[arg(long)]
        before: Option<String>,
    },

    /// Print the recorded node transitions
    History {
        #[arg(short, long)]
        workflow: String,

        #[arg(short, long)]
        thread: Option<String>,
    },
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    load_dotenv(cli.dotenv.as_deref());

    let file_config = DiagflowConfig::load(cli.config.as_deref())?;
    let manager_config = file_config.resolve(cli.db.as_deref());

    let manager = Arc::new(
        StateManager::open(manager_config.clone())
            .await
            .with_context(|| format!("Failed to open state database: {}", manager_config.db_path))?,
    );

    let result = match cli.command {
        Commands::Run {
            endpoint,
            findings,
            thread,
            verbose,
        } => cmd_run(&manager, endpoint, findings, thread, verbose).await,
        Commands::Sessions {
            workflow,
            status,
            format,
        } => cmd_sessions(&manager, workflow, status, format).await,
        Commands::Checkpoints { workflow, thread } => {
            cmd_checkpoints(&manager, workflow, thread).await
        }
        Commands::Inspect { checkpoint_id } => cmd_inspect(&manager, checkpoint_id).await,
        Commands::Recover {
            workflow,
            thread,
            before,
        } => cmd_recover(&manager, workflow, thread, before).await,
        Commands::History { workflow, thread } => cmd_history(&manager, workflow, thread).await,
    };

    manager.close().await?;
    result
}

/// Load environment variables from a .env file.
/// If an explicit path is given, load from that path (warn if missing).
/// Otherwise, auto-detect .env in the current working directory (silently skip if absent).
fn load_dotenv(explicit_path: Option<&std::path::Path>) {
    match explicit_path {
        Some(path) => match dotenvy::from_path(path) {
            Ok(()) => info!("Loaded env from {}", path.display()),
            Err(e) => {
                eprintln!(
                    "Warning: Failed to load dotenv file '{}': {}",
                    path.display(),
                    e
                );
            }
        },
        None => match dotenvy::dotenv() {
            Ok(path) => info!("Loaded env from {}", path.display()),
            Err(dotenvy::Error::Io(_)) => {}
            Err(e) => {
                eprintln!("Warning: Failed to parse .env file: {}", e);
            }
        },
    }
}

fn read_findings(path: Option<PathBuf>) -> Result<Vec<Finding>> {
    let Some(path) = path else {
        return Ok(Vec::new());
    };
    let data = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read findings file: {}", path.display()))?;
    serde_json::from_str(&data)
        .with_context(|| format!("Failed to parse findings file: {}", path.display()))
}

fn parse_status(status: Option<String>) -> Result<Option<SessionStatus>> {
    status
        .as_deref()
        .map(|s| {
            s.parse::<SessionStatus>()
                .map_err(|_| anyhow::anyhow!("Invalid status filter: {}", s))
        })
        .transpose()
}

async fn cmd_run(
    manager: &Arc<StateManager>,
    endpoint: String,
    findings_path: Option<PathBuf>,
    thread: Option<String>,
    verbose: bool,
) -> Result<()> {
    let findings = read_findings(findings_path)?;
    let thread_id = thread.unwrap_or_else(|| format!("thread-{}", uuid::Uuid::new_v4()));

    let orchestrator = AgentOrchestrator::new(manager.clone());
    orchestrator.create_workflow(triage_definition(true))?;

    let session_id = manager
        .create_session(TRIAGE_WORKFLOW_ID, &thread_id, Some(serde_json::json!({ "endpoint": endpoint })))
        .await?;

    let mut options = ExecuteOptions::new(Arc::new(StaticContext::new(&endpoint)))
        .endpoint(&endpoint)
        .thread(&thread_id)
        .findings(findings);
    if verbose {
        options = options.on_event(|event| {
            println!("  {:?} {}", event.kind, event.node_id);
            Ok(())
        });
    }

    let result = orchestrator
        .execute_workflow(TRIAGE_WORKFLOW_ID, options)
        .await?;

    let status = if !result.success {
        Some(SessionStatus::Failed)
    } else if result.state.awaiting_user_input {
        None
    } else {
        Some(SessionStatus::Completed)
    };
    if let Some(status) = status {
        manager.update_session_status(&session_id, status).await?;
    }

    let state = &result.state;
    println!("\nSession: {}", session_id);
    println!("Thread: {}", result.thread_id);
    println!("Success: {}", result.success);
    println!("Path: {}", state.execution_path.join(" -> "));
    println!(
        "Severity: {}",
        state
            .severity
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    println!("Findings: {}", state.finding_count);
    if let Some(ref prompt) = state.user_prompt {
        println!("Awaiting input: {}", prompt);
    }
    if let Some(ref cp) = result.checkpoint_id {
        println!("Checkpoint: {}", cp);
    }
    for err in &state.errors {
        println!("Error: {}", err);
    }
    if verbose {
        println!("\nTimings:");
        for (node, ms) in &state.node_timings {
            println!("  {:<12} {:.3}ms", node, ms);
        }
        println!("Total: {:.3}ms", result.execution_time_ms);
    }

    Ok(())
}

async fn cmd_sessions(
    manager: &StateManager,
    workflow: Option<String>,
    status: Option<String>,
    format: String,
) -> Result<()> {
    let status = parse_status(status)?;
    let sessions = match workflow {
        Some(ref wf) => manager.list_sessions(wf, status).await?,
        None => manager.list_all_sessions(status).await?,
    };

    if sessions.is_empty() {
        println!("No sessions found.");
        return Ok(());
    }

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }

    println!(
        "{:<46} {:<16} {:<12} {:<20}",
        "SESSION ID", "WORKFLOW", "STATUS", "CREATED"
    );
    println!("{}", "-".repeat(96));
    for s in &sessions {
        println!(
            "{:<46} {:<16} {:<12} {:<20}",
            s.session_id,
            s.workflow_id,
            s.status,
            s.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!("\nTotal: {} session(s)", sessions.len());
    Ok(())
}

async fn cmd_checkpoints(
    manager: &StateManager,
    workflow: String,
    thread: Option<String>,
) -> Result<()> {
    let checkpoints = manager
        .list_checkpoints(&workflow, thread.as_deref())
        .await?;

    if checkpoints.is_empty() {
        println!("No checkpoints found.");
        return Ok(());
    }

    println!(
        "{:<42} {:<44} {:<16} {:<26}",
        "CHECKPOINT ID", "THREAD", "NODE", "TIMESTAMP"
    );
    println!("{}", "-".repeat(128));
    for cp in &checkpoints {
        println!(
            "{:<42} {:<44} {:<16} {:<26}",
            cp.checkpoint_id,
            cp.thread_id,
            cp.state.current_node,
            cp.timestamp.to_rfc3339()
        );
    }
    println!("\nTotal: {} checkpoint(s)", checkpoints.len());
    Ok(())
}

async fn cmd_inspect(manager: &StateManager, checkpoint_id: String) -> Result<()> {
    let cp = manager
        .load_checkpoint(&checkpoint_id)
        .await?
        .with_context(|| format!("Checkpoint '{}' not found", checkpoint_id))?;
    println!("{}", serde_json::to_string_pretty(&cp)?);
    Ok(())
}

async fn cmd_recover(
    manager: &StateManager,
    workflow: String,
    thread: Option<String>,
    before: Option<String>,
) -> Result<()> {
    let mut query = RecoveryQuery::new(&workflow);
    if let Some(ref t) = thread {
        query = query.thread(t);
    }
    if let Some(ref b) = before {
        let ts: DateTime<Utc> = DateTime::parse_from_rfc3339(b)
            .with_context(|| format!("Invalid --before timestamp: {}", b))?
            .with_timezone(&Utc);
        query = query.before(ts);
    }

    match manager.recover_state(&query).await? {
        Some(cp) => println!("{}", serde_json::to_string_pretty(&cp)?),
        None => println!("No checkpoint matches."),
    }
    Ok(())
}

async fn cmd_history(manager: &StateManager, workflow: String, thread: Option<String>) -> Result<()> {
    let history = manager
        .get_transition_history(&workflow, thread.as_deref())
        .await?;

    if history.is_empty() {
        println!("No transitions recorded.");
        return Ok(());
    }

    for t in &history {
        let duration = t
            .duration_ms
            .map(|d| format!("{:.3}ms", d))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {:<8} {:>16} -> {:<16} {}",
            t.timestamp.format("%H:%M:%S%.6f"),
            t.transition_type,
            t.from_node.as_deref().unwrap_or("(start)"),
            t.to_node,
            duration
        );
    }
    Ok(())
}
