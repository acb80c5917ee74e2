//! Remote progress log sink.
//!
//! Posts buffered log chunks to the external log service and exposes the
//! public URL consumers follow. When the service is unreachable the
//! first-available selection falls through to local logging.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::domain::models::GoalEvent;
use crate::services::progress::ProgressLog;

/// Progress log writing to the remote log service.
pub struct RemoteProgressLog {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    path: String,
    closed: AtomicBool,
}

impl RemoteProgressLog {
    pub fn new(base_url: impl Into<String>, token: Option<String>, goal: &GoalEvent) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            path: format!("log/{}/{}/{}", goal.goal_set_id, goal.environment, goal.unique_name),
            closed: AtomicBool::new(false),
        }
    }

    async fn post(&self, body: String) -> bool {
        let mut builder = self
            .client
            .post(format!("{}/{}", self.base_url, self.path))
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(body);
        if let Some(ref token) = self.token {
            builder = builder.bearer_auth(token);
        }
        match builder.send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                tracing::warn!(status = %response.status(), "Log service rejected chunk");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "Log service unreachable");
                false
            }
        }
    }
}

#[async_trait::async_trait]
impl ProgressLog for RemoteProgressLog {
    fn name(&self) -> &str {
        "remote-log-service"
    }

    fn url(&self) -> Option<String> {
        Some(format!("{}/{}", self.base_url, self.path))
    }

    async fn is_available(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        // A HEAD probe decides availability; failures route callers to the
        // local fallback sink.
        let probe = self
            .client
            .head(format!("{}/health", self.base_url))
            .send()
            .await;
        matches!(probe, Ok(r) if r.status().is_success())
    }

    async fn write(&self, line: &str) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.post(format!("{line}\n")).await;
    }

    async fn flush(&self) {}

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
