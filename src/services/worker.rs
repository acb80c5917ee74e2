//! Isolated-goal worker bootstrap.
//!
//! Architecturally the same binary in a different mode: when the worker
//! environment is present, the process fetches exactly one goal event from
//! the store, runs the dispatcher on it, and exits 0.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::domain::models::{GoalEvent, GoalRef, GoalState};
use crate::domain::ports::{GoalStore, StoreError};
use crate::services::dispatcher::FulfillmentDispatcher;
use crate::services::scheduler::{
    CORRELATION_ID_ENV, GOAL_ENVIRONMENT_ENV, GOAL_SET_ID_ENV, GOAL_TEAM_ENV, GOAL_TEAM_NAME_ENV,
    GOAL_UNIQUE_NAME_ENV, ISOLATED_GOAL_ENV,
};

/// Worker bootstrap errors.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Goal {unique_name} not found in set {goal_set_id}")]
    GoalNotFound {
        goal_set_id: String,
        unique_name: String,
    },

    #[error("Goal {0} is no longer requested")]
    NotRequested(GoalRef),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Worker environment decoded from the isolated-goal variables.
#[derive(Debug, Clone)]
pub struct WorkerEnv {
    pub goal_set_id: String,
    pub unique_name: String,
    pub environment: Option<String>,
    pub correlation_id: Option<Uuid>,
    pub workspace_id: String,
    pub workspace_name: Option<String>,
}

impl WorkerEnv {
    /// Decode the worker environment. `None` unless this process was
    /// launched as an isolated-goal worker.
    pub fn from_env() -> Option<Self> {
        if std::env::var(ISOLATED_GOAL_ENV).ok().as_deref() != Some("true") {
            return None;
        }
        let goal_set_id = std::env::var(GOAL_SET_ID_ENV).ok()?;
        let unique_name = std::env::var(GOAL_UNIQUE_NAME_ENV).ok()?;
        Some(Self {
            goal_set_id,
            unique_name,
            environment: std::env::var(GOAL_ENVIRONMENT_ENV).ok(),
            correlation_id: std::env::var(CORRELATION_ID_ENV)
                .ok()
                .and_then(|v| Uuid::parse_str(&v).ok()),
            workspace_id: std::env::var(GOAL_TEAM_ENV).unwrap_or_else(|_| "local".to_string()),
            workspace_name: std::env::var(GOAL_TEAM_NAME_ENV).ok(),
        })
    }
}

/// Fetch the exact goal event this worker was launched for. The store may
/// trail the scheduling master slightly, so lookups retry briefly.
pub async fn fetch_goal(env: &WorkerEnv, store: &dyn GoalStore) -> Result<GoalEvent, WorkerError> {
    let mut delay = Duration::from_millis(500);
    for attempt in 0..5 {
        if attempt > 0 {
            tokio::time::sleep(delay).await;
            delay *= 2;
        }

        let found = match &env.environment {
            Some(environment) => {
                let key = GoalRef::new(environment.clone(), env.unique_name.clone());
                store.goal_event(&env.goal_set_id, &key).await?
            }
            None => store
                .goal_set_by_id(&env.goal_set_id)
                .await?
                .and_then(|set| {
                    set.goals
                        .iter()
                        .find(|g| g.unique_name == env.unique_name)
                        .cloned()
                }),
        };

        if let Some(goal) = found {
            return Ok(goal);
        }
        tracing::debug!(
            goal_set_id = %env.goal_set_id,
            unique_name = %env.unique_name,
            attempt,
            "Goal event not visible yet; retrying"
        );
    }
    Err(WorkerError::GoalNotFound {
        goal_set_id: env.goal_set_id.clone(),
        unique_name: env.unique_name.clone(),
    })
}

/// Run the isolated goal to completion and return the process exit code.
///
/// The dispatcher records the goal outcome on the store; the worker exits 0
/// even when the goal failed, so the job scheduler never retries.
pub async fn run_isolated_goal(
    env: &WorkerEnv,
    store: Arc<dyn GoalStore>,
    dispatcher: Arc<FulfillmentDispatcher>,
) -> Result<i32, WorkerError> {
    let goal = fetch_goal(env, store.as_ref()).await?;

    // The event the worker re-enters with must be the requested one; a goal
    // already past requested was picked up elsewhere.
    if goal.state != GoalState::Requested {
        tracing::info!(
            goal = %goal.key(),
            state = %goal.state,
            "Goal no longer requested; worker exiting"
        );
        return Ok(0);
    }

    tracing::info!(
        goal = %goal.key(),
        goal_set_id = %goal.goal_set_id,
        "Worker fulfilling isolated goal"
    );

    let correlation = env.correlation_id.unwrap_or_else(Uuid::new_v4);
    if let Err(e) = dispatcher.dispatch(&goal, correlation).await {
        // Processing errors are logged; the worker still exits 0 so the
        // outer job is not retried (the goal state carries the outcome).
        tracing::error!(goal = %goal.key(), error = %e, "Isolated goal dispatch failed");
    }
    Ok(0)
}
