//! CLI entry point. A single `run` subcommand reads a dispatch request as
//! JSON (from `--input <file>` or stdin) and prints the resulting
//! [`subagent_coordinator::ExecutionReport`] as JSON to stdout.

use std::collections::HashMap;
use std::io::Read as _;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::info;

use coordinator_core::budget::Budget;
use coordinator_core::{ContextMode, IsolationChoice, TaskItem, TopologyPolicy};

use subagent_coordinator::{
    AgentDescriptor, AgentSource, ChildResult, CoordinatorConfig, ExecuteRequest, Orchestrator,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Resolve topology, dispatch single/parallel/chain subagents, and run
    /// the phase smoke gate for one request.
    Run {
        /// Read the request from this file instead of stdin.
        #[arg(long)]
        input: Option<PathBuf>,
    },
}

#[derive(Debug, Deserialize)]
struct AgentSpec {
    #[serde(default)]
    source: AgentSourceInput,
    #[serde(default)]
    tools: Vec<String>,
    #[serde(default)]
    allow_nested: bool,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize, Default, Clone, Copy)]
#[serde(rename_all = "lowercase")]
enum AgentSourceInput {
    User,
    Project,
    #[default]
    Unknown,
}

impl From<AgentSourceInput> for AgentSource {
    fn from(value: AgentSourceInput) -> Self {
        match value {
            AgentSourceInput::User => AgentSource::User,
            AgentSourceInput::Project => AgentSource::Project,
            AgentSourceInput::Unknown => AgentSource::Unknown,
        }
    }
}

/// The JSON shape accepted on `run`'s stdin/`--input`, mirroring the
/// tool-call input fields described in the coordinator's dispatch contract.
#[derive(Debug, Deserialize)]
struct RunInput {
    run_id: String,
    #[serde(default)]
    cwd: Option<PathBuf>,
    #[serde(default)]
    single: Option<TaskItem>,
    #[serde(default)]
    parallel: Option<Vec<TaskItem>>,
    #[serde(default)]
    chain: Option<Vec<TaskItem>>,
    #[serde(default)]
    agents: HashMap<String, AgentSpec>,
    #[serde(default)]
    context_mode: Option<ContextModeInput>,
    #[serde(default)]
    isolation: Option<IsolationInput>,
    #[serde(default)]
    topology_policy: Option<TopologyPolicyInput>,
    #[serde(default = "default_shared_context_limit")]
    shared_context_limit: Option<usize>,
    #[serde(default)]
    phase_name: Option<String>,
    #[serde(default)]
    require_phase_smoke: bool,
    #[serde(default)]
    phase_smoke_commands: Vec<String>,
    #[serde(default)]
    phase_smoke_retries: Option<u32>,
    #[serde(default)]
    phase_max_fix_attempts: Option<u32>,
}

fn default_shared_context_limit() -> Option<usize> {
    None
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(rename_all = "snake_case")]
enum ContextModeInput {
    Isolated,
    SharedRead,
    SharedWrite,
}

impl From<ContextModeInput> for ContextMode {
    fn from(value: ContextModeInput) -> Self {
        match value {
            ContextModeInput::Isolated => ContextMode::Isolated,
            ContextModeInput::SharedRead => ContextMode::SharedRead,
            ContextModeInput::SharedWrite => ContextMode::SharedWrite,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(rename_all = "lowercase")]
enum IsolationInput {
    Auto,
    Shared,
    Worktree,
}

impl From<IsolationInput> for IsolationChoice {
    fn from(value: IsolationInput) -> Self {
        match value {
            IsolationInput::Auto => IsolationChoice::Auto,
            IsolationInput::Shared => IsolationChoice::Shared,
            IsolationInput::Worktree => IsolationChoice::Worktree,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(rename_all = "lowercase")]
enum TopologyPolicyInput {
    Advisory,
    Auto,
}

impl From<TopologyPolicyInput> for TopologyPolicy {
    fn from(value: TopologyPolicyInput) -> Self {
        match value {
            TopologyPolicyInput::Advisory => TopologyPolicy::Advisory,
            TopologyPolicyInput::Auto => TopologyPolicy::Auto,
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn read_input(path: Option<PathBuf>) -> Result<String> {
    match path {
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("reading request from {}", path.display())),
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("reading request from stdin")?;
            Ok(buf)
        }
    }
}

fn build_request(input: RunInput, config: &CoordinatorConfig) -> Result<ExecuteRequest> {
    let cwd = input
        .cwd
        .map(Ok)
        .unwrap_or_else(|| std::env::current_dir().context("resolving current directory"))?;

    let known_agents = input
        .agents
        .into_iter()
        .map(|(name, spec)| {
            (
                name,
                AgentDescriptor {
                    source: spec.source.into(),
                    tools: spec.tools,
                    allow_nested: spec.allow_nested,
                    model: spec.model,
                },
            )
        })
        .collect();

    let env: HashMap<String, String> = std::env::vars().collect();
    let budget = Budget::from_env(&env, input.run_id.clone(), now_ms());

    Ok(ExecuteRequest {
        run_id: input.run_id,
        cwd,
        single: input.single,
        parallel: input.parallel,
        chain: input.chain,
        known_agents,
        context_mode: input.context_mode.map(ContextMode::from).unwrap_or(ContextMode::Isolated),
        isolation: input.isolation.map(IsolationChoice::from).unwrap_or(IsolationChoice::Auto),
        topology_policy: input.topology_policy.map(TopologyPolicy::from).unwrap_or(TopologyPolicy::Auto),
        shared_context_limit: input.shared_context_limit.unwrap_or(config.default_shared_context_limit),
        phase_name: input.phase_name,
        require_phase_smoke: input.require_phase_smoke,
        phase_smoke_commands: input.phase_smoke_commands,
        phase_smoke_retries: input.phase_smoke_retries,
        phase_max_fix_attempts: input.phase_max_fix_attempts,
        budget,
    })
}

fn summarize_child(result: &ChildResult) -> serde_json::Value {
    serde_json::json!({
        "agent": result.agent,
        "success": result.is_success(),
        "exit_code": result.exit_code,
        "stop_reason": result.stop_reason,
        "error_message": result.error_message,
        "step": result.step,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let Commands::Run { input } = cli.command;

    let raw = read_input(input)?;
    let run_input: RunInput = serde_json::from_str(&raw).context("parsing request JSON")?;

    let config = CoordinatorConfig::default();
    let run_id = run_input.run_id.clone();
    let request = build_request(run_input, &config)?;

    info!(run_id = %run_id, "dispatching subagent coordinator request");

    let orchestrator = Orchestrator::new(config);
    let report = orchestrator.execute(request, None).await?;

    let child_summaries: Vec<serde_json::Value> =
        report.child_results.iter().map(summarize_child).collect();
    let output = serde_json::json!({
        "topology": report.topology,
        "phase_gate": {
            "phase_name": report.phase_gate.phase_name,
            "gates": report.phase_gate.gates,
        },
        "worktree_reports": report.worktree_reports,
        "children": child_summaries,
        "warnings": report.warnings,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}
