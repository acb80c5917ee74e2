//! Job domain model.
//!
//! A job is the durable handle for an isolated out-of-process execution:
//! the external store persists it, workers claim its tasks, and task state
//! is reported back via `SetJobTaskState`.

use serde::{Deserialize, Serialize};

/// State of a single job task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobTaskState {
    Created,
    Running,
    Success,
    Failed,
}

impl JobTaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl std::fmt::Display for JobTaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One unit of work within a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobTask {
    pub name: String,
    /// Serialized task parameters, interpreted by the claiming worker.
    pub parameters: serde_json::Value,
    #[serde(default = "default_task_state")]
    pub state: JobTaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

fn default_task_state() -> JobTaskState {
    JobTaskState::Created
}

impl JobTask {
    pub fn new(name: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            parameters,
            state: JobTaskState::Created,
            message: None,
        }
    }
}

/// A durable handle for an isolated out-of-process execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub name: String,
    /// Registration that owns the job.
    pub owner: String,
    /// Serialized trigger payload.
    pub data: serde_json::Value,
    #[serde(default)]
    pub tasks: Vec<JobTask>,
}

impl Job {
    pub fn new(name: impl Into<String>, owner: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            owner: owner.into(),
            data,
            tasks: Vec::new(),
        }
    }

    pub fn with_task(mut self, task: JobTask) -> Self {
        self.tasks.push(task);
        self
    }
}
