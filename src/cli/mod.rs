//! CLI interface: command definitions and handlers.

pub mod commands;
pub mod types;

pub use types::{Cli, Commands, DeployCommands, GoalSetCommands};
