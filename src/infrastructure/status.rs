//! Commit status publishing to the source-control provider.

use async_trait::async_trait;

use crate::domain::models::{RepoRef, StatusConfig};
use crate::domain::ports::{CommitStatus, StatusError, StatusPublisher};

/// Publishes commit statuses with an HTTP PUT against the provider's
/// status endpoint.
pub struct HttpStatusPublisher {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpStatusPublisher {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    /// Build from configuration; `None` when disabled or not configured.
    pub fn from_config(config: &StatusConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        config
            .base_url
            .as_ref()
            .map(|url| Self::new(url.clone(), config.token.clone()))
    }
}

#[async_trait]
impl StatusPublisher for HttpStatusPublisher {
    async fn publish(
        &self,
        repo: &RepoRef,
        sha: &str,
        status: &CommitStatus,
    ) -> Result<(), StatusError> {
        let url = format!(
            "{}/repos/{}/{}/statuses/{sha}",
            self.base_url, repo.owner, repo.name
        );
        let mut builder = self.client.put(&url).json(status);
        if let Some(ref token) = self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|e| StatusError::PublishFailed {
            repo: repo.slug(),
            sha: sha.to_string(),
            reason: e.to_string(),
        })?;
        if !response.status().is_success() {
            return Err(StatusError::PublishFailed {
                repo: repo.slug(),
                sha: sha.to_string(),
                reason: response.status().to_string(),
            });
        }
        tracing::debug!(
            repo = %repo,
            sha,
            context = %status.context,
            state = %status.state,
            "Published commit status"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::CommitStatusState;

    #[tokio::test]
    async fn puts_status_with_sdm_context() {
        let mut server = mockito::Server::new_async().await;
        let put = server
            .mock("PUT", "/repos/octo/widgets/statuses/abc123")
            .match_body(mockito::Matcher::PartialJsonString(
                r#"{"context": "sdm/my-sdm", "state": "pending"}"#.to_string(),
            ))
            .with_status(201)
            .create_async()
            .await;

        let publisher = HttpStatusPublisher::new(server.url(), Some("token".to_string()));
        publisher
            .publish(
                &RepoRef::new("octo", "widgets", "gh-1"),
                "abc123",
                &CommitStatus {
                    context: "sdm/my-sdm".to_string(),
                    description: "Delivery goals in progress".to_string(),
                    target_url: None,
                    state: CommitStatusState::Pending,
                },
            )
            .await
            .unwrap();
        put.assert_async().await;
    }

    #[tokio::test]
    async fn non_success_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("PUT", "/repos/octo/widgets/statuses/abc123")
            .with_status(500)
            .create_async()
            .await;

        let publisher = HttpStatusPublisher::new(server.url(), None);
        let result = publisher
            .publish(
                &RepoRef::new("octo", "widgets", "gh-1"),
                "abc123",
                &CommitStatus {
                    context: "sdm/my-sdm".to_string(),
                    description: "x".to_string(),
                    target_url: None,
                    state: CommitStatusState::Failure,
                },
            )
            .await;
        assert!(matches!(result, Err(StatusError::PublishFailed { .. })));
    }

    #[test]
    fn disabled_config_builds_no_publisher() {
        let config = StatusConfig {
            enabled: false,
            base_url: Some("https://api.example.com".to_string()),
            token: None,
        };
        assert!(HttpStatusPublisher::from_config(&config).is_none());
    }
}
