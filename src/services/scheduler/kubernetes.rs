//! Kubernetes scheduler: runs isolated goals as batch Jobs cloned from the
//! SDM's own deployment spec.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::domain::models::KubernetesConfig;
use crate::domain::ports::KubeClient;
use crate::infrastructure::kube::manifest::{job_for_goal, GoalJobParams};
use crate::services::dispatcher::GoalInvocation;

use super::{
    GoalScheduler, ScheduleError, ScheduleResult, DEPLOYMENT_NAMESPACE_ENV, DEPLOYMENT_NAME_ENV,
};

/// Schedules isolated goals as Kubernetes Jobs.
pub struct KubernetesScheduler {
    kube: Arc<dyn KubeClient>,
    deployment_name: String,
    namespace: String,
    cleanup_interval: Duration,
}

impl KubernetesScheduler {
    /// Build from configuration. Environment variables override the
    /// configured deployment name and namespace; returns `None` when no
    /// deployment name is known at all.
    pub fn from_config(config: &KubernetesConfig, kube: Arc<dyn KubeClient>) -> Option<Self> {
        let deployment_name = std::env::var(DEPLOYMENT_NAME_ENV)
            .ok()
            .or_else(|| config.deployment_name.clone())?;
        let namespace = std::env::var(DEPLOYMENT_NAMESPACE_ENV)
            .unwrap_or_else(|_| config.namespace.clone());
        Some(Self {
            kube,
            deployment_name,
            namespace,
            cleanup_interval: Duration::from_secs(config.cleanup_interval_secs),
        })
    }

    pub fn new(
        kube: Arc<dyn KubeClient>,
        deployment_name: impl Into<String>,
        namespace: impl Into<String>,
        cleanup_interval: Duration,
    ) -> Self {
        Self {
            kube,
            deployment_name: deployment_name.into(),
            namespace: namespace.into(),
            cleanup_interval,
        }
    }

    /// Delete succeeded jobs created by this deployment. Returns how many
    /// were deleted.
    pub async fn cleanup(&self) -> Result<usize, ScheduleError> {
        let prefix = format!("{}-job-", self.deployment_name);
        let jobs = self
            .kube
            .list_jobs(&self.namespace)
            .await
            .map_err(|e| ScheduleError::Kubernetes(e.to_string()))?;

        let mut deleted = 0;
        for job in jobs {
            if !job.name.starts_with(&prefix) || job.succeeded == 0 {
                continue;
            }
            match self.kube.delete_job(&self.namespace, &job.name).await {
                Ok(()) => deleted += 1,
                Err(e) => {
                    tracing::warn!(job = %job.name, error = %e, "Failed to delete finished job");
                }
            }
        }
        if deleted > 0 {
            tracing::info!(deleted, "Cleaned up finished goal jobs");
        }
        Ok(deleted)
    }

    /// Start the periodic cleanup sweep. Run only on the master instance.
    pub fn spawn_cleanup(self: Arc<Self>) -> JoinHandle<()> {
        let scheduler = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so a fresh master
            // does not race startup.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = scheduler.cleanup().await {
                    tracing::warn!(error = %e, "Goal job cleanup sweep failed");
                }
            }
        })
    }
}

#[async_trait::async_trait]
impl GoalScheduler for KubernetesScheduler {
    fn name(&self) -> &'static str {
        "KubernetesScheduler"
    }

    async fn supports(&self, invocation: &GoalInvocation) -> bool {
        invocation.isolated
    }

    async fn schedule(&self, invocation: &GoalInvocation) -> Result<ScheduleResult, ScheduleError> {
        let goal = &invocation.goal;
        let deployment = self
            .kube
            .read_deployment(&self.namespace, &self.deployment_name)
            .await
            .map_err(|e| ScheduleError::Kubernetes(e.to_string()))?
            .ok_or_else(|| {
                ScheduleError::Kubernetes(format!(
                    "deployment {}/{} not found",
                    self.namespace, self.deployment_name
                ))
            })?;

        let params = GoalJobParams {
            goal_set_id: goal.goal_set_id.clone(),
            goal_unique_name: goal.unique_name.clone(),
            goal_environment: goal.environment.clone(),
            workspace_id: invocation.workspace_id.clone(),
            workspace_name: invocation.workspace_name.clone(),
            correlation_id: invocation.correlation_id,
        };
        let manifest = job_for_goal(&deployment, &self.namespace, &params)
            .map_err(|e| ScheduleError::Kubernetes(e.to_string()))?;

        // Same name replaces rather than duplicating: re-delivered events
        // are idempotent.
        let exists = self
            .kube
            .job_exists(&self.namespace, &manifest.metadata.name)
            .await
            .map_err(|e| ScheduleError::Kubernetes(e.to_string()))?;
        if exists {
            tracing::info!(job = %manifest.metadata.name, "Job exists; replacing");
            self.kube
                .replace_job(&manifest)
                .await
                .map_err(|e| ScheduleError::Kubernetes(e.to_string()))?;
        } else {
            self.kube
                .apply_job(&manifest)
                .await
                .map_err(|e| ScheduleError::Kubernetes(e.to_string()))?;
        }

        tracing::info!(
            goal = %goal.key(),
            job = %manifest.metadata.name,
            namespace = %self.namespace,
            "Scheduled goal as Kubernetes job"
        );
        Ok(ScheduleResult::scheduled("scheduled"))
    }
}
