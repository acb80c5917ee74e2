//! External goal/job store port.
//!
//! The external event store owns durable goal history; the core only reads
//! and writes through this interface. Writes are last-writer-wins under the
//! state-transition rules enforced by the callers.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::models::{GoalEvent, GoalRef, GoalSet, Job, JobTaskState, RepoRef};

/// Store operation errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Transient transport failure; callers surface this so the bus retries.
    #[error("Store request failed: {0}")]
    RequestFailed(String),

    #[error("Store returned unexpected payload: {0}")]
    InvalidPayload(String),

    #[error("Goal set {0} not found")]
    GoalSetNotFound(String),
}

/// Interface to the external goal/job store.
#[async_trait]
pub trait GoalStore: Send + Sync {
    /// Fetch the latest version of one goal event by `(goalSetId, key)`.
    async fn goal_event(
        &self,
        goal_set_id: &str,
        key: &GoalRef,
    ) -> Result<Option<GoalEvent>, StoreError>;

    /// Fetch the full goal set for `(sha, goalSetId)`.
    async fn goal_set(&self, sha: &str, goal_set_id: &str) -> Result<Option<GoalSet>, StoreError>;

    /// Fetch a goal set by id alone.
    async fn goal_set_by_id(&self, goal_set_id: &str) -> Result<Option<GoalSet>, StoreError>;

    /// List still-pending goal sets created by `registration`.
    async fn pending_goal_sets(&self, registration: &str) -> Result<Vec<GoalSet>, StoreError>;

    /// Latest goal events recorded for a SHA, across sets. Used by the
    /// prior-goal push test.
    async fn goals_for_sha(&self, repo: &RepoRef, sha: &str)
        -> Result<Vec<GoalEvent>, StoreError>;

    /// Upsert one goal event (the `UpdateSdmGoal` mutation).
    async fn update_goal(&self, event: &GoalEvent) -> Result<(), StoreError>;

    /// Record a goal set (custom event; the persisted state field is a
    /// cache of the derived state).
    async fn store_goal_set(&self, set: &GoalSet) -> Result<(), StoreError>;

    /// Create a job with its tasks (the `CreateAtmJob` mutation).
    async fn create_job(&self, job: &Job) -> Result<(), StoreError>;

    /// Fetch a job by name.
    async fn job(&self, name: &str) -> Result<Option<Job>, StoreError>;

    /// Update one job task's state (the `SetJobTaskState` mutation).
    async fn set_job_task_state(
        &self,
        job_name: &str,
        task_name: &str,
        state: JobTaskState,
        message: &str,
    ) -> Result<(), StoreError>;
}
