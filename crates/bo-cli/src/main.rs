use std::path::Path;
use std::sync::Arc;

use bo_core::{Config, Store};
use bo_orchestrator::Orchestrator;
use clap::{Parser, Subcommand};

/// bo -- drive LLM worker agents through a staged build pipeline.
#[derive(Parser)]
#[command(name = "bo", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full build pipeline against a project.
    Build {
        /// Path to the target project (must contain a Cargo.toml).
        project_path: String,
        /// Natural-language description of the task.
        description: String,
    },
    /// Show recent tasks, or one task's full record.
    Status {
        /// Task id to show in detail; omit to list recent tasks.
        task_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;
    init_tracing(&config.log_level);

    let cli = Cli::parse();
    let store = Arc::new(Store::open(config.expanded_store_path()).await?);

    match cli.command {
        Commands::Build { project_path, description } => run_build(&config, store, &project_path, &description).await,
        Commands::Status { task_id } => run_status(store, task_id.as_deref()).await,
    }
}

async fn run_build(config: &Config, store: Arc<Store>, project_path: &str, description: &str) -> anyhow::Result<()> {
    let expanded = bo_core::config::expand_tilde(project_path);
    if !expanded.join("Cargo.toml").is_file() {
        anyhow::bail!("{} does not contain a Cargo.toml", expanded.display());
    }

    let orchestrator = Orchestrator::new(expanded.to_string_lossy().to_string(), config, store)
        .with_progress_callback(|dashboard| {
            println!(
                "[{}] {} -- ${:.2}/${:.2}",
                dashboard.status.icon(),
                dashboard.status.as_str(),
                dashboard.total_cost_usd,
                dashboard.budget_usd
            );
            for agent in &dashboard.agents {
                println!("  {}: {}", agent.role, agent.status);
            }
        });

    let dashboard = orchestrator.execute(description).await;
    println!("{}", serde_json::to_string_pretty(&dashboard)?);
    Ok(())
}

async fn run_status(store: Arc<Store>, task_id: Option<&str>) -> anyhow::Result<()> {
    match task_id {
        Some(id) => match store.get_task(id).await? {
            Some(task) => println!("{}", serde_json::to_string_pretty(&task)?),
            None => anyhow::bail!("no such task: {id}"),
        },
        None => {
            let tasks = store.list_recent_tasks(10).await?;
            for task in tasks {
                let short: String = task.description.chars().take(50).collect();
                println!("{} {} {short} ${:.2}", task.status.icon(), task.id, task.total_cost_usd);
            }
        }
    }
    Ok(())
}

fn init_tracing(log_level: &str) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[allow(dead_code)]
fn project_root_has_manifest(path: &Path) -> bool {
    path.join("Cargo.toml").is_file()
}
