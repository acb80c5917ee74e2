//! HTTP client for the external goal/job store.
//!
//! The store owns durable goal history; this client speaks its REST surface
//! (`UpdateSdmGoal`, `CreateAtmJob`, `SetJobTaskState` and the matching
//! queries). Transient failures are retried with exponential backoff before
//! surfacing to the caller.

use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

use crate::domain::models::{
    GoalEvent, GoalRef, GoalSet, Job, JobTaskState, RepoRef, StoreConfig,
};
use crate::domain::ports::{GoalStore, StoreError};

/// Retry policy with exponential backoff for store requests.
///
/// Backoff doubles per retry: 500ms → 1s → 2s, capped by `max_backoff_ms`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    /// Execute an async operation, retrying transient failures.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0;
        let mut backoff = self.initial_backoff_ms;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e @ StoreError::RequestFailed(_)) if attempt < self.max_retries => {
                    attempt += 1;
                    tracing::warn!(attempt, error = %e, "Store request failed; retrying");
                    sleep(Duration::from_millis(backoff)).await;
                    backoff = (backoff * 2).min(self.max_backoff_ms);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// REST client for the external store.
pub struct HttpGoalStore {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    retry: RetryPolicy,
}

impl HttpGoalStore {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            retry: RetryPolicy::default(),
        }
    }

    /// Build from configuration; `None` when no store endpoint is set.
    pub fn from_config(config: &StoreConfig) -> Option<Self> {
        config
            .base_url
            .as_ref()
            .map(|url| Self::new(url.clone(), config.api_key.clone()))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{path}", self.base_url));
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }

    /// GET a JSON document, mapping 404 to `None`.
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<Option<T>, StoreError> {
        self.retry
            .execute(|| async {
                let response = self
                    .request(reqwest::Method::GET, path)
                    .send()
                    .await
                    .map_err(|e| StoreError::RequestFailed(e.to_string()))?;
                if response.status() == reqwest::StatusCode::NOT_FOUND {
                    return Ok(None);
                }
                if !response.status().is_success() {
                    return Err(StoreError::RequestFailed(format!(
                        "GET {path}: {}",
                        response.status()
                    )));
                }
                response
                    .json::<T>()
                    .await
                    .map(Some)
                    .map_err(|e| StoreError::InvalidPayload(e.to_string()))
            })
            .await
    }

    async fn send_json<B: Serialize + Sync>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: &B,
    ) -> Result<(), StoreError> {
        self.retry
            .execute(|| async {
                let response = self
                    .request(method.clone(), path)
                    .json(body)
                    .send()
                    .await
                    .map_err(|e| StoreError::RequestFailed(e.to_string()))?;
                if response.status().is_success() {
                    Ok(())
                } else {
                    Err(StoreError::RequestFailed(format!(
                        "{method} {path}: {}",
                        response.status()
                    )))
                }
            })
            .await
    }
}

#[async_trait]
impl GoalStore for HttpGoalStore {
    async fn goal_event(
        &self,
        goal_set_id: &str,
        key: &GoalRef,
    ) -> Result<Option<GoalEvent>, StoreError> {
        self.get_json(&format!(
            "/goals/{goal_set_id}/{}/{}",
            key.environment, key.unique_name
        ))
        .await
    }

    async fn goal_set(&self, sha: &str, goal_set_id: &str) -> Result<Option<GoalSet>, StoreError> {
        let set: Option<GoalSet> = self.get_json(&format!("/goal-sets/{goal_set_id}")).await?;
        Ok(set.filter(|s| s.sha == sha))
    }

    async fn goal_set_by_id(&self, goal_set_id: &str) -> Result<Option<GoalSet>, StoreError> {
        self.get_json(&format!("/goal-sets/{goal_set_id}")).await
    }

    async fn pending_goal_sets(&self, registration: &str) -> Result<Vec<GoalSet>, StoreError> {
        let sets: Option<Vec<GoalSet>> = self
            .get_json(&format!(
                "/goal-sets?registration={registration}&state=pending"
            ))
            .await?;
        Ok(sets.unwrap_or_default())
    }

    async fn goals_for_sha(
        &self,
        repo: &RepoRef,
        sha: &str,
    ) -> Result<Vec<GoalEvent>, StoreError> {
        let goals: Option<Vec<GoalEvent>> = self
            .get_json(&format!(
                "/goals?owner={}&repo={}&providerId={}&sha={sha}",
                repo.owner, repo.name, repo.provider_id
            ))
            .await?;
        Ok(goals.unwrap_or_default())
    }

    async fn update_goal(&self, event: &GoalEvent) -> Result<(), StoreError> {
        self.send_json(reqwest::Method::PUT, "/goals", event).await
    }

    async fn store_goal_set(&self, set: &GoalSet) -> Result<(), StoreError> {
        self.send_json(reqwest::Method::PUT, "/goal-sets", set).await
    }

    async fn create_job(&self, job: &Job) -> Result<(), StoreError> {
        self.send_json(reqwest::Method::POST, "/jobs", job).await
    }

    async fn job(&self, name: &str) -> Result<Option<Job>, StoreError> {
        self.get_json(&format!("/jobs/{name}")).await
    }

    async fn set_job_task_state(
        &self,
        job_name: &str,
        task_name: &str,
        state: JobTaskState,
        message: &str,
    ) -> Result<(), StoreError> {
        #[derive(Serialize)]
        struct TaskStateBody<'a> {
            state: JobTaskState,
            message: &'a str,
        }
        self.send_json(
            reqwest::Method::POST,
            &format!("/jobs/{job_name}/tasks/{task_name}/state"),
            &TaskStateBody { state, message },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{Fulfillment, GoalState, Provenance};

    fn goal_event() -> GoalEvent {
        GoalEvent {
            goal_set_id: "set-1".to_string(),
            unique_name: "build".to_string(),
            environment: "0-code".to_string(),
            name: "build".to_string(),
            sha: "abc123".to_string(),
            branch: "main".to_string(),
            repo: RepoRef::new("octo", "widgets", "gh-1"),
            state: GoalState::Requested,
            ts: 1_000,
            version: 1,
            description: String::new(),
            pre_conditions: vec![],
            fulfillment: Fulfillment::sdm("my-sdm"),
            data: None,
            url: None,
            external_urls: vec![],
            provenance: vec![Provenance::now("my-sdm", "0.1.0", "PlanGoals")],
            phase: None,
            retry_feasible: false,
            approval_required: false,
            approval: None,
            pre_approval_required: false,
            pre_approval: None,
            signature: None,
        }
    }

    #[tokio::test]
    async fn goal_event_fetch_and_404() {
        let mut server = mockito::Server::new_async().await;
        let found = server
            .mock("GET", "/goals/set-1/0-code/build")
            .with_status(200)
            .with_body(serde_json::to_string(&goal_event()).unwrap())
            .create_async()
            .await;
        let missing = server
            .mock("GET", "/goals/set-1/0-code/missing")
            .with_status(404)
            .create_async()
            .await;

        let store = HttpGoalStore::new(server.url(), None);
        let fetched = store
            .goal_event("set-1", &GoalRef::new("0-code", "build"))
            .await
            .unwrap();
        assert_eq!(fetched.unwrap().unique_name, "build");

        let none = store
            .goal_event("set-1", &GoalRef::new("0-code", "missing"))
            .await
            .unwrap();
        assert!(none.is_none());

        found.assert_async().await;
        missing.assert_async().await;
    }

    #[tokio::test]
    async fn update_goal_puts_camel_case_payload() {
        let mut server = mockito::Server::new_async().await;
        let put = server
            .mock("PUT", "/goals")
            .match_body(mockito::Matcher::PartialJsonString(
                r#"{"goalSetId": "set-1", "uniqueName": "build"}"#.to_string(),
            ))
            .with_status(200)
            .create_async()
            .await;

        let store = HttpGoalStore::new(server.url(), None);
        store.update_goal(&goal_event()).await.unwrap();
        put.assert_async().await;
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_exhausted() {
        let mut server = mockito::Server::new_async().await;
        let flaky = server
            .mock("PUT", "/goals")
            .with_status(503)
            // Initial attempt plus one retry.
            .expect(2)
            .create_async()
            .await;

        let store = HttpGoalStore::new(server.url(), None).with_retry(RetryPolicy {
            max_retries: 1,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        });
        assert!(matches!(
            store.update_goal(&goal_event()).await,
            Err(StoreError::RequestFailed(_))
        ));
        flaky.assert_async().await;
    }
}
