//! Isolated-goal schedulers.
//!
//! A scheduler takes over a requested goal instead of in-process execution:
//! the subprocess strategy forks a worker re-entering this binary, the
//! Kubernetes strategy clones the SDM's own pod spec into a batch Job.

pub mod kubernetes;
pub mod subprocess;

use thiserror::Error;

use crate::services::dispatcher::GoalInvocation;

pub use kubernetes::KubernetesScheduler;
pub use subprocess::SubprocessScheduler;

/// Environment variable marking a process as an isolated-goal worker.
pub const ISOLATED_GOAL_ENV: &str = "ATOMIST_ISOLATED_GOAL";
/// Environment variable marking the repository-clone init container.
pub const ISOLATED_GOAL_INIT_ENV: &str = "ATOMIST_ISOLATED_GOAL_INIT";
/// Goal set the worker must fulfill.
pub const GOAL_SET_ID_ENV: &str = "ATOMIST_GOAL_SET_ID";
/// Unique name of the goal the worker must fulfill.
pub const GOAL_UNIQUE_NAME_ENV: &str = "ATOMIST_GOAL_UNIQUE_NAME";
/// Environment of the goal the worker must fulfill.
pub const GOAL_ENVIRONMENT_ENV: &str = "ATOMIST_GOAL_ID";
/// Correlation id propagated into the worker.
pub const CORRELATION_ID_ENV: &str = "ATOMIST_CORRELATION_ID";
/// Workspace id propagated into the worker.
pub const GOAL_TEAM_ENV: &str = "ATOMIST_GOAL_TEAM";
/// Workspace name propagated into the worker.
pub const GOAL_TEAM_NAME_ENV: &str = "ATOMIST_GOAL_TEAM_NAME";
/// Deployment name override for the Kubernetes scheduler.
pub const DEPLOYMENT_NAME_ENV: &str = "ATOMIST_DEPLOYMENT_NAME";
/// Deployment namespace override for the Kubernetes scheduler.
pub const DEPLOYMENT_NAMESPACE_ENV: &str = "ATOMIST_DEPLOYMENT_NAMESPACE";

/// Scheduling errors.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("Failed to launch worker: {0}")]
    LaunchFailed(String),

    #[error("Kubernetes scheduling failed: {0}")]
    Kubernetes(String),
}

/// Outcome of handing a goal to a scheduler.
#[derive(Debug, Clone, Default)]
pub struct ScheduleResult {
    /// Non-zero means the goal could not be scheduled.
    pub code: i32,
    pub phase: Option<String>,
    pub description: Option<String>,
}

impl ScheduleResult {
    pub fn scheduled(phase: impl Into<String>) -> Self {
        Self {
            code: 0,
            phase: Some(phase.into()),
            description: None,
        }
    }
}

/// A strategy for running a goal outside the dispatcher's process.
#[async_trait::async_trait]
pub trait GoalScheduler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this scheduler takes over the invocation. The first
    /// supporting scheduler wins.
    async fn supports(&self, invocation: &GoalInvocation) -> bool;

    /// Launch the isolated worker for the goal.
    async fn schedule(&self, invocation: &GoalInvocation) -> Result<ScheduleResult, ScheduleError>;
}
