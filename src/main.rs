use std::collections::HashMap;
use std::path::{Path, PathBuf};

use clap::{CommandFactory, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tessera_core::config::EngineConfig;
use tessera_core::types::{ApprovalDecision, EngineEvent, ExecutionStatus};
use tessera_core::workflow::WorkflowDefinition;
use tessera_engine::{AgentRegistry, CompiledWorkflow, Engine};

#[derive(Parser)]
#[command(name = "tessera", version, about = "Workflow execution engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "tessera.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow definition and wait for it to finish
    Run {
        /// Workflow definition (.toml or .json)
        workflow: PathBuf,
        /// Input variable as key=value (value parsed as JSON, else string)
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,
        /// Approve every approval request as the `cli` approver
        #[arg(long)]
        approve_all: bool,
        /// Print engine events as they happen
        #[arg(long)]
        watch: bool,
    },
    /// Validate a workflow definition and print its execution plan
    Validate {
        workflow: PathBuf,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "tessera", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_filter())),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Validate { workflow } => {
            let def = WorkflowDefinition::load(&workflow)?;
            let compiled = CompiledWorkflow::compile(def)?;
            println!("{} ({} steps)", compiled.def.name, compiled.def.steps.len());
            for (i, unit) in compiled.plan.iter().enumerate() {
                if unit.requires.is_empty() {
                    println!("{:>3}. {}", i + 1, unit.key);
                } else {
                    println!("{:>3}. {}  <- {}", i + 1, unit.key, unit.requires.join(", "));
                }
            }
        }
        Commands::Run {
            workflow,
            vars,
            approve_all,
            watch,
        } => {
            let status = run_workflow(config, &workflow, &vars, approve_all, watch).await?;
            if status != ExecutionStatus::Completed {
                std::process::exit(1);
            }
        }
        Commands::Completions { .. } => {}
    }
    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<EngineConfig> {
    if path.exists() {
        return Ok(EngineConfig::load(path)?);
    }
    let home_config = dirs_home().map(|h| h.join(".tessera").join("config.toml"));
    match home_config {
        Some(p) if p.exists() => Ok(EngineConfig::load(&p)?),
        _ => Ok(EngineConfig::default()),
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Parse `key=value` pairs. Values that parse as JSON keep their type.
fn parse_vars(pairs: &[String]) -> anyhow::Result<HashMap<String, serde_json::Value>> {
    let mut vars = HashMap::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("expected KEY=VALUE, got `{}`", pair))?;
        let value = serde_json::from_str(raw)
            .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
        vars.insert(key.trim().to_string(), value);
    }
    Ok(vars)
}

async fn run_workflow(
    config: EngineConfig,
    path: &Path,
    vars: &[String],
    approve_all: bool,
    watch: bool,
) -> anyhow::Result<ExecutionStatus> {
    let def = WorkflowDefinition::load(path)?;
    let inputs = parse_vars(vars)?;
    let store = tessera_store::from_config(&config.store)?;

    let engine = Engine::builder(config)
        .with_agents(AgentRegistry::with_builtins())
        .with_store(store)
        .build();

    let mut events = engine.subscribe();
    let workflow_id = engine.create_workflow(def).await?;
    let execution_id = engine.execute_workflow(&workflow_id, inputs).await?;
    info!(execution_id = %execution_id, "Execution submitted");

    let listener = {
        let engine = engine.clone();
        let execution_id = execution_id.clone();
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Event listener lagged");
                        continue;
                    }
                    Err(_) => break,
                };
                if watch {
                    if let Ok(line) = serde_json::to_string(&event) {
                        println!("{}", line);
                    }
                }
                match event {
                    EngineEvent::ApprovalRequested { request }
                        if approve_all && request.execution_id == execution_id =>
                    {
                        if let Err(e) = engine
                            .submit_approval(&request.id, "cli", ApprovalDecision::Approve)
                            .await
                        {
                            warn!(approval_id = %request.id, error = %e, "Auto-approval failed");
                        }
                    }
                    EngineEvent::ExecutionFinished { execution_id: id, .. }
                        if id == execution_id =>
                    {
                        break
                    }
                    _ => {}
                }
            }
        })
    };

    let execution = engine.wait_for_execution(&execution_id).await?;
    listener.abort();

    let summary = serde_json::json!({
        "execution_id": execution.id,
        "status": execution.status,
        "error": execution.error,
        "variables": execution.context.variables,
        "metrics": execution.metrics,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(execution.status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vars_keep_json_types() {
        let vars = parse_vars(&[
            "count=3".to_string(),
            "region=eu-west".to_string(),
            "flags=[1,2]".to_string(),
        ])
        .unwrap();
        assert_eq!(vars["count"], serde_json::json!(3));
        assert_eq!(vars["region"], serde_json::json!("eu-west"));
        assert_eq!(vars["flags"], serde_json::json!([1, 2]));
        assert!(parse_vars(&["novalue".to_string()]).is_err());
    }
}
