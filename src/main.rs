//! Stevedore CLI entry point.
//!
//! Two entrypoints share the dispatcher core: when the isolated-goal
//! environment is present this process is a worker that fulfills exactly
//! one goal and exits; otherwise the CLI runs.

use anyhow::{Context, Result};
use clap::Parser;

use stevedore::cli::commands::{deploy, goal_sets, start};
use stevedore::cli::{Cli, Commands, DeployCommands, GoalSetCommands};
use stevedore::domain::models::Config;
use stevedore::infrastructure::config::ConfigLoader;
use stevedore::infrastructure::logging::LoggerImpl;
use stevedore::services::worker::WorkerEnv;

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    match path {
        Some(path) => ConfigLoader::load_from_file(path),
        None => ConfigLoader::load(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Worker mode is decided by the environment, before CLI parsing: the
    // scheduler re-executes this binary with the goal coordinates set.
    if let Some(worker_env) = WorkerEnv::from_env() {
        let config = load_config(None).context("Failed to load configuration")?;
        let _logger = LoggerImpl::init(&config.logging)?;
        let code = start::handle_isolated(config, worker_env).await?;
        std::process::exit(code);
    }

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Start => {
            let _logger = LoggerImpl::init(&config.logging)?;
            start::handle_start(config).await?;
        }
        Commands::GoalSets(cmd) => match cmd {
            GoalSetCommands::List => goal_sets::handle_list(&config, cli.json).await?,
            GoalSetCommands::Cancel { id, all } => {
                goal_sets::handle_cancel(&config, id, all, cli.json).await?;
            }
        },
        Commands::Deploy(cmd) => match cmd {
            DeployCommands::Enable { repo } => deploy::handle_enable(&repo, cli.json).await?,
            DeployCommands::Disable { repo } => deploy::handle_disable(&repo, cli.json).await?,
        },
    }

    Ok(())
}
