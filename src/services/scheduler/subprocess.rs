//! Subprocess scheduler: forks a worker process that re-executes this
//! binary in isolated-goal mode.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;
use tokio::sync::Mutex;

use crate::services::dispatcher::GoalInvocation;

use super::{
    GoalScheduler, ScheduleError, ScheduleResult, CORRELATION_ID_ENV, GOAL_ENVIRONMENT_ENV,
    GOAL_SET_ID_ENV, GOAL_TEAM_ENV, GOAL_TEAM_NAME_ENV, GOAL_UNIQUE_NAME_ENV, ISOLATED_GOAL_ENV,
};

/// Forks isolated goals as worker subprocesses of the master.
pub struct SubprocessScheduler {
    binary: PathBuf,
    /// `goalSetId/uniqueName` → worker pid, for cancellation.
    workers: Arc<Mutex<HashMap<String, u32>>>,
}

impl SubprocessScheduler {
    /// Scheduler re-executing the current binary.
    pub fn current_exe() -> Result<Self, ScheduleError> {
        let binary =
            std::env::current_exe().map_err(|e| ScheduleError::LaunchFailed(e.to_string()))?;
        Ok(Self::with_binary(binary))
    }

    pub fn with_binary(binary: PathBuf) -> Self {
        Self {
            binary,
            workers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn worker_key(invocation: &GoalInvocation) -> String {
        format!(
            "{}/{}",
            invocation.goal.goal_set_id, invocation.goal.unique_name
        )
    }

    /// Send SIGTERM to the worker executing a goal, if one is running.
    pub async fn terminate(&self, goal_set_id: &str, unique_name: &str) -> bool {
        let key = format!("{goal_set_id}/{unique_name}");
        let pid = self.workers.lock().await.remove(&key);
        let Some(pid) = pid else { return false };
        #[allow(clippy::cast_possible_wrap)]
        let pid = nix::unistd::Pid::from_raw(pid as i32);
        match nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(%pid, error = %e, "Failed to signal worker");
                false
            }
        }
    }

    /// Number of tracked workers (running or not yet reaped).
    pub async fn worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }
}

#[async_trait::async_trait]
impl GoalScheduler for SubprocessScheduler {
    fn name(&self) -> &'static str {
        "SubprocessScheduler"
    }

    async fn supports(&self, invocation: &GoalInvocation) -> bool {
        invocation.isolated
    }

    async fn schedule(&self, invocation: &GoalInvocation) -> Result<ScheduleResult, ScheduleError> {
        let goal = &invocation.goal;
        let mut command = Command::new(&self.binary);
        command
            .env(ISOLATED_GOAL_ENV, "true")
            .env(GOAL_SET_ID_ENV, &goal.goal_set_id)
            .env(GOAL_UNIQUE_NAME_ENV, &goal.unique_name)
            .env(GOAL_ENVIRONMENT_ENV, &goal.environment)
            .env(CORRELATION_ID_ENV, invocation.correlation_id.to_string())
            .env(GOAL_TEAM_ENV, &invocation.workspace_id)
            .env(
                GOAL_TEAM_NAME_ENV,
                invocation
                    .workspace_name
                    .clone()
                    .unwrap_or_else(|| invocation.workspace_id.clone()),
            )
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        let mut child = command
            .spawn()
            .map_err(|e| ScheduleError::LaunchFailed(e.to_string()))?;
        let pid = child.id().unwrap_or(0);

        let key = Self::worker_key(invocation);
        self.workers.lock().await.insert(key.clone(), pid);
        tracing::info!(
            goal = %goal.key(),
            goal_set_id = %goal.goal_set_id,
            pid,
            "Forked isolated goal worker"
        );

        // Reap the worker in the background; the worker itself publishes
        // the goal's terminal state.
        let workers = self.workers.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {
                    tracing::debug!(%key, "Isolated goal worker exited cleanly");
                }
                Ok(status) => {
                    tracing::warn!(%key, %status, "Isolated goal worker exited abnormally");
                }
                Err(e) => {
                    tracing::warn!(%key, error = %e, "Failed to reap isolated goal worker");
                }
            }
            workers.lock().await.remove(&key);
        });

        Ok(ScheduleResult::scheduled("scheduled"))
    }
}
