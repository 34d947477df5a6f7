//! opswarm CLI: plan and execute administrative tasks on a remote host.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use ops_agents::config::AgentConfig;
use ops_agents::coordinator::{Coordinator, TaskReport};
use ops_agents::model::OpenAiClient;
use ops_agents::transport;
use oversight::{StateChannel, StateManager, TaskStatus};

#[derive(Parser)]
#[command(
    name = "ops-agents",
    about = "LLM-planned, policy-guarded remote server administration"
)]
struct Cli {
    /// Path to a TOML config file (env vars are used when absent).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging (debug level).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Plan and execute a task described in natural language.
    Execute {
        /// The task, e.g. "install and enable nginx".
        task: String,
        /// Validate, plan, and record without touching the host.
        #[arg(long)]
        dry_run: bool,
    },
    /// Show the last persisted agent state.
    Status,
    /// Show recent state changes.
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Drop persisted state older than the retention window.
    Cleanup {
        #[arg(long)]
        days: Option<u32>,
    },
    /// Inspect or validate the configuration.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Write a starter state directory.
    Init,
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    Validate,
}

fn load_config(cli: &Cli) -> anyhow::Result<AgentConfig> {
    let config = match &cli.config {
        Some(path) => AgentConfig::load(path)?,
        None => {
            let config = AgentConfig::from_env();
            config.validate()?;
            config
        }
    };
    Ok(config)
}

fn print_report(report: &TaskReport) {
    println!("task:   {} ({})", report.title, report.task_id);
    println!(
        "status: {}{}",
        serde_json::to_value(report.status)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_default(),
        if report.dry_run { " [dry-run]" } else { "" }
    );
    for step in &report.steps {
        let status = serde_json::to_value(step.status)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_default();
        print!("  - {:<40} {}", step.title, status);
        if step.error_count > 0 {
            print!(" ({} errors)", step.error_count);
        }
        println!();
        if let Some(last_error) = &step.last_error {
            println!("      last error: {last_error}");
        }
    }
    for escalation in &report.escalations {
        println!(
            "  escalation: {} for step {} -> {:?}",
            escalation.kind, escalation.step_id, escalation.status
        );
    }
    println!("lifecycle: {}", report.lifecycle);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = load_config(&cli)?;

    match cli.command {
        Command::Execute { task, dry_run } => {
            let shell = transport::from_config(&config.transport);
            let model = Arc::new(OpenAiClient::new(&config.model));
            let coordinator = Coordinator::new(config, shell, model);

            coordinator
                .initialize()
                .await
                .context("initialization failed")?;
            let report = coordinator.execute_task(&task, None, dry_run).await?;
            print_report(&report);

            if report.status != TaskStatus::Completed {
                std::process::exit(1);
            }
        }
        Command::Status => {
            let state = StateManager::new(config.state_path.clone());
            if !state.load()? {
                println!("no persisted state at {}", config.state_path.display());
                return Ok(());
            }
            match state.get_state(StateChannel::Agent) {
                Some(agent) => println!("agent: {agent}"),
                None => println!("agent: (none)"),
            }
            if let Some(task) = state.get_state(StateChannel::Task) {
                println!(
                    "task:  {} — {}",
                    task.get("title").and_then(|v| v.as_str()).unwrap_or("?"),
                    task.get("status").and_then(|v| v.as_str()).unwrap_or("?"),
                );
            }
        }
        Command::History { limit } => {
            let state = StateManager::new(config.state_path.clone());
            if !state.load()? {
                println!("no persisted state at {}", config.state_path.display());
                return Ok(());
            }
            for change in state.history(limit) {
                println!(
                    "{} [{}] {}",
                    change.timestamp.to_rfc3339(),
                    change.channel,
                    change.reason
                );
            }
        }
        Command::Cleanup { days } => {
            // Records of non-terminal steps are never dropped; with no
            // live task every step is terminal.
            let mut policy = config.policy.clone();
            if let Some(days) = days {
                policy.max_retention_days = days;
                policy.validate()?;
            }
            let tracker = oversight::ErrorTracker::new(&policy);
            tracker.cleanup_old_records(&Default::default());
            info!("record cleanup complete");
        }
        Command::Config { action } => match action {
            ConfigAction::Show => {
                println!("{}", toml::to_string_pretty(&config)?);
            }
            ConfigAction::Validate => {
                config.validate()?;
                println!("configuration is valid");
            }
        },
        Command::Init => {
            if let Some(parent) = config.state_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let state = StateManager::new(config.state_path.clone());
            if state.load()? {
                println!("state already present at {}", config.state_path.display());
            } else {
                state.save()?;
                println!("initialized state at {}", config.state_path.display());
            }
        }
    }

    Ok(())
}
