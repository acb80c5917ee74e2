//! Source-control commit status port.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::models::{GoalState, RepoRef};

/// External commit status state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitStatusState {
    Pending,
    Success,
    Failure,
}

impl CommitStatusState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

impl std::fmt::Display for CommitStatusState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Map a goal state onto the external status vocabulary.
pub fn external_status_for(state: GoalState) -> CommitStatusState {
    match state {
        GoalState::Planned
        | GoalState::Requested
        | GoalState::InProcess
        | GoalState::WaitingForApproval
        | GoalState::WaitingForPreApproval
        | GoalState::Approved
        | GoalState::PreApproved => CommitStatusState::Pending,
        GoalState::Success => CommitStatusState::Success,
        GoalState::Failure | GoalState::Skipped | GoalState::Stopped | GoalState::Canceled => {
            CommitStatusState::Failure
        }
    }
}

/// Payload of a commit status PUT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitStatus {
    /// Status context; format `sdm/<registration>`.
    pub context: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,
    pub state: CommitStatusState,
}

/// Status publishing errors.
#[derive(Debug, Error)]
pub enum StatusError {
    #[error("Status update for {repo}@{sha} failed: {reason}")]
    PublishFailed {
        repo: String,
        sha: String,
        reason: String,
    },
}

/// Publishes commit statuses to the source-control provider.
#[async_trait]
pub trait StatusPublisher: Send + Sync {
    async fn publish(
        &self,
        repo: &RepoRef,
        sha: &str,
        status: &CommitStatus,
    ) -> Result<(), StatusError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn goal_state_maps_to_external_status() {
        assert_eq!(external_status_for(GoalState::Planned), CommitStatusState::Pending);
        assert_eq!(external_status_for(GoalState::Requested), CommitStatusState::Pending);
        assert_eq!(external_status_for(GoalState::WaitingForApproval), CommitStatusState::Pending);
        assert_eq!(external_status_for(GoalState::Approved), CommitStatusState::Pending);
        assert_eq!(external_status_for(GoalState::Success), CommitStatusState::Success);
        assert_eq!(external_status_for(GoalState::Failure), CommitStatusState::Failure);
        assert_eq!(external_status_for(GoalState::Skipped), CommitStatusState::Failure);
        assert_eq!(external_status_for(GoalState::Stopped), CommitStatusState::Failure);
        assert_eq!(external_status_for(GoalState::Canceled), CommitStatusState::Failure);
    }
}
