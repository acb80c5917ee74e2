//! Kubernetes API client over the cluster REST endpoint.

use async_trait::async_trait;
use serde::Deserialize;

use crate::domain::ports::{JobSummary, KubeClient, KubeError};

use super::manifest::{Deployment, JobManifest};

/// Default in-cluster API server address.
const IN_CLUSTER_API: &str = "https://kubernetes.default.svc";
/// Service-account token path inside a pod.
const SERVICE_ACCOUNT_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// REST client for the narrow API slice the scheduler needs.
pub struct HttpKubeClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpKubeClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self, KubeError> {
        let client = reqwest::Client::builder()
            // The in-cluster CA is not in the default roots.
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| KubeError::RequestFailed(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Client for the in-cluster API server using the pod's service-account
    /// token.
    pub fn in_cluster() -> Result<Self, KubeError> {
        let token = std::fs::read_to_string(SERVICE_ACCOUNT_TOKEN)
            .ok()
            .map(|t| t.trim().to_string());
        Self::new(IN_CLUSTER_API, token)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{path}", self.base_url));
        if let Some(ref token) = self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, KubeError> {
        let response = builder
            .send()
            .await
            .map_err(|e| KubeError::RequestFailed(e.to_string()))?;
        if response.status().is_success() || response.status() == reqwest::StatusCode::NOT_FOUND {
            Ok(response)
        } else {
            Err(KubeError::RequestFailed(format!(
                "{} {}",
                response.status(),
                response.text().await.unwrap_or_default()
            )))
        }
    }
}

#[derive(Deserialize)]
struct JobList {
    #[serde(default)]
    items: Vec<JobItem>,
}

#[derive(Deserialize)]
struct JobItem {
    metadata: JobItemMeta,
    #[serde(default)]
    status: JobItemStatus,
}

#[derive(Deserialize)]
struct JobItemMeta {
    name: String,
}

#[derive(Deserialize, Default)]
struct JobItemStatus {
    #[serde(default)]
    succeeded: u32,
}

#[async_trait]
impl KubeClient for HttpKubeClient {
    async fn read_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, KubeError> {
        let path = format!("/apis/apps/v1/namespaces/{namespace}/deployments/{name}");
        let response = self.send(self.request(reqwest::Method::GET, &path)).await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        response
            .json::<Deployment>()
            .await
            .map(Some)
            .map_err(|e| KubeError::RequestFailed(e.to_string()))
    }

    async fn job_exists(&self, namespace: &str, name: &str) -> Result<bool, KubeError> {
        let path = format!("/apis/batch/v1/namespaces/{namespace}/jobs/{name}");
        let response = self.send(self.request(reqwest::Method::GET, &path)).await?;
        Ok(response.status().is_success())
    }

    async fn apply_job(&self, manifest: &JobManifest) -> Result<(), KubeError> {
        let path = format!(
            "/apis/batch/v1/namespaces/{}/jobs",
            manifest.metadata.namespace
        );
        self.send(self.request(reqwest::Method::POST, &path).json(manifest))
            .await?;
        Ok(())
    }

    async fn replace_job(&self, manifest: &JobManifest) -> Result<(), KubeError> {
        self.delete_job(&manifest.metadata.namespace, &manifest.metadata.name)
            .await?;
        self.apply_job(manifest).await
    }

    async fn list_jobs(&self, namespace: &str) -> Result<Vec<JobSummary>, KubeError> {
        let path = format!("/apis/batch/v1/namespaces/{namespace}/jobs");
        let response = self.send(self.request(reqwest::Method::GET, &path)).await?;
        let list: JobList = response
            .json()
            .await
            .map_err(|e| KubeError::RequestFailed(e.to_string()))?;
        Ok(list
            .items
            .into_iter()
            .map(|item| JobSummary {
                name: item.metadata.name,
                succeeded: item.status.succeeded,
            })
            .collect())
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), KubeError> {
        let path = format!(
            "/apis/batch/v1/namespaces/{namespace}/jobs/{name}?propagationPolicy=Background"
        );
        self.send(self.request(reqwest::Method::DELETE, &path))
            .await?;
        Ok(())
    }
}
