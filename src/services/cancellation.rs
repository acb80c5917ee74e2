//! Goal-set cancellation service.
//!
//! Admin surface for listing still-pending goal sets of this registration
//! and canceling one or all of them. Cancellation is idempotent: goals
//! already terminal are never rewritten.

use std::sync::Arc;

use thiserror::Error;

use crate::domain::models::{GoalSet, GoalSetState};
use crate::domain::ports::{GoalStore, StoreError};
use crate::services::state_engine::{cancel_set, GoalUpdater, UpdateError};

/// Cancellation errors.
#[derive(Debug, Error)]
pub enum CancelError {
    #[error("Goal set {0} not found")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Update(#[from] UpdateError),
}

/// Outcome of canceling one goal set.
#[derive(Debug, Clone)]
pub struct CancelOutcome {
    pub goal_set_id: String,
    /// Goals moved to `canceled` by this call.
    pub goals_canceled: usize,
}

/// Lists and cancels pending goal sets for this registration.
pub struct GoalSetCancellation {
    store: Arc<dyn GoalStore>,
    updater: Arc<GoalUpdater>,
}

impl GoalSetCancellation {
    pub fn new(store: Arc<dyn GoalStore>, updater: Arc<GoalUpdater>) -> Self {
        Self { store, updater }
    }

    /// Still-pending goal sets created by this registration.
    pub async fn list_pending(&self) -> Result<Vec<GoalSet>, CancelError> {
        Ok(self
            .store
            .pending_goal_sets(self.updater.registration())
            .await?)
    }

    /// Cancel one goal set by id. Idempotent: canceling an already-terminal
    /// set cancels zero goals.
    pub async fn cancel(&self, goal_set_id: &str) -> Result<CancelOutcome, CancelError> {
        let set = self
            .store
            .goal_set_by_id(goal_set_id)
            .await?
            .ok_or_else(|| CancelError::NotFound(goal_set_id.to_string()))?;

        let goals_canceled = cancel_set(&self.updater, &set, "CancelGoalSets").await?;

        // Emit the set record with the canceled state cached on it.
        let mut record = set;
        record.state = GoalSetState::Canceled;
        record.goals.clear();
        self.store.store_goal_set(&record).await?;

        tracing::info!(goal_set_id, goals_canceled, "Canceled goal set");
        Ok(CancelOutcome {
            goal_set_id: goal_set_id.to_string(),
            goals_canceled,
        })
    }

    /// Cancel every pending goal set.
    pub async fn cancel_all(&self) -> Result<Vec<CancelOutcome>, CancelError> {
        let pending = self.list_pending().await?;
        let mut outcomes = Vec::with_capacity(pending.len());
        for set in pending {
            outcomes.push(self.cancel(&set.goal_set_id).await?);
        }
        Ok(outcomes)
    }
}
