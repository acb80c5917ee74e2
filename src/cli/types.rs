//! CLI type definitions.
//!
//! Clap command structures for the admin surface and the daemon.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "stevedore")]
#[command(about = "Stevedore - Delivery Goal Orchestrator", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output in JSON format
    #[arg(short, long, global = true)]
    pub json: bool,

    /// Path to a configuration file (defaults to .stevedore/config.yaml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the delivery machine daemon
    Start,

    /// Goal set administration
    #[command(subcommand)]
    GoalSets(GoalSetCommands),

    /// Per-repository deploy enablement
    #[command(subcommand)]
    Deploy(DeployCommands),
}

#[derive(Subcommand)]
pub enum GoalSetCommands {
    /// List still-pending goal sets for this registration
    List,

    /// Cancel one goal set by id, or all pending sets
    Cancel {
        /// Goal set id to cancel
        #[arg(long, conflicts_with = "all")]
        id: Option<String>,

        /// Cancel every pending goal set
        #[arg(long)]
        all: bool,
    },
}

#[derive(Subcommand)]
pub enum DeployCommands {
    /// Enable deploy goals for a repository
    Enable {
        /// Repository as owner/name
        repo: String,
    },

    /// Disable deploy goals for a repository
    Disable {
        /// Repository as owner/name
        repo: String,
    },
}
