//! In-memory Kubernetes client for tests and dry runs.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

use crate::domain::ports::{JobSummary, KubeClient, KubeError};

use super::manifest::{Deployment, JobManifest};

/// Records applied/replaced jobs keyed by `(namespace, name)`.
#[derive(Default)]
pub struct FakeKubeClient {
    deployments: RwLock<HashMap<(String, String), Deployment>>,
    jobs: RwLock<HashMap<(String, String), JobManifest>>,
    /// Succeeded counts injected by tests, keyed like jobs.
    succeeded: RwLock<HashMap<(String, String), u32>>,
    pub applies: AtomicUsize,
    pub replaces: AtomicUsize,
    pub deletes: AtomicUsize,
}

impl FakeKubeClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_deployment(&self, namespace: &str, deployment: Deployment) {
        self.deployments.write().await.insert(
            (namespace.to_string(), deployment.metadata.name.clone()),
            deployment,
        );
    }

    pub async fn job(&self, namespace: &str, name: &str) -> Option<JobManifest> {
        self.jobs
            .read()
            .await
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub async fn mark_succeeded(&self, namespace: &str, name: &str) {
        self.succeeded
            .write()
            .await
            .insert((namespace.to_string(), name.to_string()), 1);
    }
}

#[async_trait]
impl KubeClient for FakeKubeClient {
    async fn read_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, KubeError> {
        Ok(self
            .deployments
            .read()
            .await
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn job_exists(&self, namespace: &str, name: &str) -> Result<bool, KubeError> {
        Ok(self
            .jobs
            .read()
            .await
            .contains_key(&(namespace.to_string(), name.to_string())))
    }

    async fn apply_job(&self, manifest: &JobManifest) -> Result<(), KubeError> {
        self.applies.fetch_add(1, Ordering::SeqCst);
        self.jobs.write().await.insert(
            (
                manifest.metadata.namespace.clone(),
                manifest.metadata.name.clone(),
            ),
            manifest.clone(),
        );
        Ok(())
    }

    async fn replace_job(&self, manifest: &JobManifest) -> Result<(), KubeError> {
        self.replaces.fetch_add(1, Ordering::SeqCst);
        self.jobs.write().await.insert(
            (
                manifest.metadata.namespace.clone(),
                manifest.metadata.name.clone(),
            ),
            manifest.clone(),
        );
        Ok(())
    }

    async fn list_jobs(&self, namespace: &str) -> Result<Vec<JobSummary>, KubeError> {
        let succeeded = self.succeeded.read().await;
        Ok(self
            .jobs
            .read()
            .await
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|((ns, name), _)| JobSummary {
                name: name.clone(),
                succeeded: succeeded
                    .get(&(ns.clone(), name.clone()))
                    .copied()
                    .unwrap_or(0),
            })
            .collect())
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), KubeError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.jobs
            .write()
            .await
            .remove(&(namespace.to_string(), name.to_string()));
        self.succeeded
            .write()
            .await
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }
}
