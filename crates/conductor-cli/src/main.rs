//! `conductor`: inspect agent definitions and dry-run tasks, messages and
//! cross-agent workflows.

use clap::{Parser, Subcommand};
use conductor_orchestrator::{
    AgentCatalog, AgentMessage, CrossAgentStep, DirectoryCatalog, DryRunBackend, ExecuteOptions,
    FailurePolicy, JsonlRecorder, Orchestrator, OrchestratorConfig,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "conductor", about = "Conductor: Agent Orchestration Engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "conductor.toml")]
    config: PathBuf,

    /// Override the agent definitions directory
    #[arg(long)]
    agents_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect agent definitions
    Agents {
        #[command(subcommand)]
        action: AgentsAction,
    },
    /// Run one task on one agent (omit the task to run its full workflow)
    Run {
        agent: String,
        task: Option<String>,
        /// JSON input passed to the task
        #[arg(long, default_value = "{}")]
        input: String,
        /// Keep going when a step of the full workflow fails
        #[arg(long)]
        continue_on_error: bool,
        /// Deadline for this dispatch in milliseconds (0 disables)
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Run a cross-agent workflow from a YAML or JSON file
    Workflow {
        file: PathBuf,
        /// Record failed steps and keep running their dependents
        #[arg(long)]
        continue_on_error: bool,
    },
    /// Send a message from one agent to another
    Send {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long)]
        task: String,
        /// Task run on the sender with the reply as input
        #[arg(long)]
        callback: Option<String>,
        /// JSON payload
        #[arg(long, default_value = "{}")]
        data: String,
    },
}

#[derive(Subcommand)]
enum AgentsAction {
    /// List valid agent definitions
    List,
    /// Validate a single agent definition
    Validate { name: String },
    /// Show deployment status and statistics for an agent
    Status { name: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = load_config(&cli.config).await?;
    if let Some(dir) = cli.agents_dir {
        config.agents_dir = dir;
    }

    match cli.command {
        Commands::Agents { action } => match action {
            AgentsAction::List => {
                let orchestrator = build(config).await?;
                print_json(&orchestrator.list_agents().await?)?;
            }
            AgentsAction::Validate { name } => {
                let catalog = DirectoryCatalog::new(config.agents_dir.clone());
                let agent = catalog.load_agent(&name).await?;
                info!(agent = %agent.name, steps = agent.workflow.len(), "Definition is valid");
                print_json(&agent)?;
            }
            AgentsAction::Status { name } => {
                let orchestrator = build(config).await?;
                print_json(&orchestrator.get_status(&name).await)?;
            }
        },
        Commands::Run {
            agent,
            task,
            input,
            continue_on_error,
            timeout_ms,
        } => {
            let input = parse_json_arg("input", &input)?;
            let options = ExecuteOptions {
                continue_on_error,
                timeout_ms,
                ..ExecuteOptions::default()
            };
            let orchestrator = build(config).await?;
            let output = orchestrator
                .execute(&agent, task.as_deref(), input, options)
                .await?;
            print_json(&output)?;
        }
        Commands::Workflow {
            file,
            continue_on_error,
        } => {
            let steps = load_steps(&file).await?;
            let policy = if continue_on_error {
                FailurePolicy::ContinueOnError
            } else {
                FailurePolicy::FailFast
            };
            let orchestrator = build(config).await?;
            let run = orchestrator.execute_workflow(steps, policy).await?;
            print_json(&run)?;
        }
        Commands::Send {
            from,
            to,
            task,
            callback,
            data,
        } => {
            let message = AgentMessage {
                from,
                to,
                task,
                data: parse_json_arg("data", &data)?,
                callback,
            };
            let orchestrator = build(config).await?;
            print_json(&orchestrator.send_message(message).await?)?;
        }
    }

    Ok(())
}

/// Read the config file, falling back to defaults when it does not exist.
async fn load_config(path: &Path) -> anyhow::Result<OrchestratorConfig> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        Ok(OrchestratorConfig::load(path).await?)
    } else {
        warn!(path = %path.display(), "Config file not found, using defaults");
        Ok(OrchestratorConfig::default())
    }
}

async fn build(config: OrchestratorConfig) -> anyhow::Result<Orchestrator> {
    let recorder = Arc::new(JsonlRecorder::new(config.data_dir.join("history")).await?);
    info!(
        agents_dir = %config.agents_dir.display(),
        data_dir = %config.data_dir.display(),
        "Using dry-run backend"
    );
    Ok(Orchestrator::with_directory_catalog(
        config,
        recorder,
        Arc::new(DryRunBackend),
    )?)
}

fn parse_json_arg(name: &str, raw: &str) -> anyhow::Result<serde_json::Value> {
    serde_json::from_str(raw).map_err(|e| anyhow::anyhow!("--{name} is not valid JSON: {e}"))
}

/// Parse a workflow file. JSON is accepted by the YAML parser as well.
async fn load_steps(path: &Path) -> anyhow::Result<Vec<CrossAgentStep>> {
    let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
        anyhow::anyhow!("Failed to read workflow file '{}': {e}", path.display())
    })?;
    parse_steps(&raw)
}

fn parse_steps(raw: &str) -> anyhow::Result<Vec<CrossAgentStep>> {
    let steps: Vec<CrossAgentStep> = serde_yaml_ng::from_str(raw)
        .map_err(|e| anyhow::anyhow!("Invalid workflow file: {e}"))?;
    if steps.is_empty() {
        anyhow::bail!("Workflow file declares no steps");
    }
    Ok(steps)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_yaml_workflow() {
        let steps = parse_steps(
            r#"
- id: plan
  agent: planner
  task: outline
  input: { feature: login }
- agent: coder
  task: implement
  depends_on: plan
  options: { timeoutMs: 1000 }
"#,
        )
        .unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].key(), "plan");
        assert_eq!(steps[1].key(), "coder_implement");
        assert_eq!(steps[1].options.timeout_ms, Some(1000));
    }

    #[test]
    fn test_parse_json_workflow() {
        let steps = parse_steps(r#"[{"agent": "tester"}]"#).unwrap();
        assert_eq!(steps[0].task, "default");
    }

    #[test]
    fn test_empty_workflow_rejected() {
        assert!(parse_steps("[]").is_err());
        assert!(parse_steps("agent: x").is_err());
    }

    #[test]
    fn test_parse_json_arg() {
        assert_eq!(parse_json_arg("input", r#"{"a": 1}"#).unwrap()["a"], 1);
        let err = parse_json_arg("data", "{oops").unwrap_err();
        assert!(err.to_string().starts_with("--data is not valid JSON"));
    }

    #[tokio::test]
    async fn test_missing_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).await.unwrap();
        assert_eq!(config, OrchestratorConfig::default());
    }

    #[tokio::test]
    async fn test_config_file_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conductor.toml");
        std::fs::write(&path, "[orchestrator]\nmax_concurrent_agents = 3\n").unwrap();
        let config = load_config(&path).await.unwrap();
        assert_eq!(config.max_concurrent_agents, 3);
    }
}
