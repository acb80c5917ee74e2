//! Kubernetes API port.
//!
//! Only the narrow slice the isolated-goal scheduler needs: reading the
//! SDM's own deployment spec and managing batch Jobs.

use async_trait::async_trait;
use thiserror::Error;

use crate::infrastructure::kube::manifest::{Deployment, JobManifest};

/// Kubernetes API errors.
#[derive(Debug, Error)]
pub enum KubeError {
    #[error("Kubernetes API request failed: {0}")]
    RequestFailed(String),

    #[error("Deployment {namespace}/{name} not found")]
    DeploymentNotFound { namespace: String, name: String },

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),
}

/// Summary of a listed job, enough for the cleanup sweep.
#[derive(Debug, Clone)]
pub struct JobSummary {
    pub name: String,
    pub succeeded: u32,
}

/// Narrow Kubernetes API surface used by the scheduler.
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Read a deployment spec.
    async fn read_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, KubeError>;

    /// Whether a job with this name already exists.
    async fn job_exists(&self, namespace: &str, name: &str) -> Result<bool, KubeError>;

    /// Create the job.
    async fn apply_job(&self, manifest: &JobManifest) -> Result<(), KubeError>;

    /// Forcefully replace an existing job of the same name.
    async fn replace_job(&self, manifest: &JobManifest) -> Result<(), KubeError>;

    /// List jobs in a namespace.
    async fn list_jobs(&self, namespace: &str) -> Result<Vec<JobSummary>, KubeError>;

    /// Delete a job.
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), KubeError>;
}
