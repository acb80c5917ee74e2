//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use stevedore::domain::models::{
    Config, Fulfillment, GoalEvent, GoalState, Provenance, Push, RepoRef,
};
use stevedore::domain::ports::{
    CommitStatus, ProjectError, ProjectReader, StatusError, StatusPublisher,
};

/// ProjectReader stub with a fixed changed-file list and no tree.
pub struct StaticProject {
    pub changed: Vec<String>,
}

impl StaticProject {
    pub fn empty() -> Self {
        Self { changed: vec![] }
    }
}

#[async_trait]
impl ProjectReader for StaticProject {
    async fn files_matching(
        &self,
        _push: &Push,
        _globs: &[String],
    ) -> Result<Vec<String>, ProjectError> {
        Ok(vec![])
    }

    async fn file_content(
        &self,
        _push: &Push,
        _path: &str,
    ) -> Result<Option<String>, ProjectError> {
        Ok(None)
    }

    async fn changed_files(&self, _push: &Push) -> Result<Vec<String>, ProjectError> {
        Ok(self.changed.clone())
    }
}

/// StatusPublisher recording everything it is asked to publish.
#[derive(Default)]
pub struct RecordingStatus {
    pub published: Mutex<Vec<(String, CommitStatus)>>,
}

impl RecordingStatus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn states(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(_, s)| s.state.to_string())
            .collect()
    }
}

#[async_trait]
impl StatusPublisher for RecordingStatus {
    async fn publish(
        &self,
        _repo: &RepoRef,
        sha: &str,
        status: &CommitStatus,
    ) -> Result<(), StatusError> {
        self.published
            .lock()
            .unwrap()
            .push((sha.to_string(), status.clone()));
        Ok(())
    }
}

pub fn test_repo() -> RepoRef {
    RepoRef::new("octo", "widgets", "gh-1")
}

pub fn test_push() -> Push {
    Push::new(test_repo(), "main", "abc123def456").with_default_branch("main")
}

pub fn test_config() -> Config {
    Config {
        registration: "my-sdm".to_string(),
        version: "0.1.0".to_string(),
        workspace_id: "ws-1".to_string(),
        ..Config::default()
    }
}

/// A bare goal event for component-level tests.
pub fn goal_event(set_id: &str, name: &str, state: GoalState) -> GoalEvent {
    GoalEvent {
        goal_set_id: set_id.to_string(),
        unique_name: name.to_string(),
        environment: "0-code".to_string(),
        name: name.to_string(),
        sha: "abc123def456".to_string(),
        branch: "main".to_string(),
        repo: test_repo(),
        state,
        ts: 1_000,
        version: 1,
        description: String::new(),
        pre_conditions: vec![],
        fulfillment: Fulfillment::sdm("my-sdm"),
        data: None,
        url: None,
        external_urls: vec![],
        provenance: vec![Provenance {
            registration: "my-sdm".to_string(),
            version: "0.1.0".to_string(),
            name: "PlanGoals".to_string(),
            user_id: None,
            channel_id: None,
            ts: 1_700_000_000_000,
        }],
        phase: None,
        retry_feasible: false,
        approval_required: false,
        approval: None,
        pre_approval_required: false,
        pre_approval: None,
        signature: None,
    }
}
