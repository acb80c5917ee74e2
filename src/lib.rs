//! Stevedore - Delivery Goal Orchestration Core
//!
//! An event-driven control plane that plans delivery goals for every push
//! into a monitored workspace and drives each goal through its lifecycle:
//! - Push-test DSL deciding which goals apply to a push
//! - Goal planner producing signed goal sets with a dependency graph
//! - State/precondition engine advancing dependents as upstreams succeed
//! - Fulfillment dispatcher executing goals in-process or scheduling
//!   isolated workers (subprocess or Kubernetes Job)
//! - Buffered progress logs, completion reactions, and commit statuses

pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export key types for convenience
pub use domain::models::{Config, Goal, GoalEvent, GoalSet, GoalState, Push, RepoRef};
pub use services::machine::{DeliveryMachine, DeliveryMachineBuilder};
