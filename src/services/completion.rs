//! Goal-completion reactor.
//!
//! Listens for terminal goal states: runs registered completion listeners
//! with the full set, publishes a failure status linking the goal log on
//! failure, and publishes a success status once every goal in the set
//! succeeded.

use std::sync::Arc;

use crate::domain::models::{FulfillmentMethod, GoalEvent, GoalSet, GoalState};
use crate::domain::ports::{CommitStatus, CommitStatusState, GoalStore, StatusPublisher};
use crate::services::event_bus::{DeliveryEvent, EventEnvelope, EventHandler, HandlerError};

/// Listener invoked for every completed goal with the full set context.
#[async_trait::async_trait]
pub trait GoalCompletionListener: Send + Sync {
    async fn on_completion(&self, completed: &GoalEvent, all_goals: &GoalSet);
}

/// Reacts to goals entering terminal states.
pub struct GoalCompletionReactor {
    store: Arc<dyn GoalStore>,
    status: Option<Arc<dyn StatusPublisher>>,
    listeners: Vec<Arc<dyn GoalCompletionListener>>,
    registration: String,
}

impl GoalCompletionReactor {
    pub fn new(store: Arc<dyn GoalStore>, registration: impl Into<String>) -> Self {
        Self {
            store,
            status: None,
            listeners: Vec::new(),
            registration: registration.into(),
        }
    }

    pub fn with_status_publisher(mut self, status: Arc<dyn StatusPublisher>) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn GoalCompletionListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    fn relevant(&self, goal: &GoalEvent) -> bool {
        match goal.fulfillment.method {
            FulfillmentMethod::SideEffect => goal.fulfillment.name == self.registration,
            FulfillmentMethod::Sdm | FulfillmentMethod::Other => {
                goal.provenance
                    .first()
                    .is_none_or(|p| p.registration == self.registration)
            }
        }
    }

    async fn publish_status(&self, goal: &GoalEvent, status: CommitStatus) {
        let Some(ref publisher) = self.status else {
            return;
        };
        if let Err(e) = publisher.publish(&goal.repo, &goal.sha, &status).await {
            tracing::warn!(
                repo = %goal.repo,
                sha = %goal.sha,
                error = %e,
                "Failed to publish commit status"
            );
        }
    }

    async fn react(&self, completed: &GoalEvent) -> Result<(), HandlerError> {
        if !self.relevant(completed) {
            return Ok(());
        }

        let set = self
            .store
            .goal_set(&completed.sha, &completed.goal_set_id)
            .await
            .map_err(|e| HandlerError::transient("GoalCompletionReactor", e))?;
        let Some(set) = set else {
            tracing::warn!(
                goal_set_id = %completed.goal_set_id,
                "Goal set not found for completed goal"
            );
            return Ok(());
        };

        // One listener failing must not starve the rest; panics aside,
        // listeners are infallible by contract.
        for listener in &self.listeners {
            listener.on_completion(completed, &set).await;
        }

        let context = format!("sdm/{}", self.registration);
        if completed.state == GoalState::Failure {
            self.publish_status(
                completed,
                CommitStatus {
                    context,
                    description: completed.description.clone(),
                    target_url: completed.url.clone(),
                    state: CommitStatusState::Failure,
                },
            )
            .await;
            return Ok(());
        }

        if set.goals.iter().all(|g| g.state == GoalState::Success) {
            self.publish_status(
                completed,
                CommitStatus {
                    context,
                    description: "All delivery goals succeeded".to_string(),
                    target_url: None,
                    state: CommitStatusState::Success,
                },
            )
            .await;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl EventHandler for GoalCompletionReactor {
    fn name(&self) -> &'static str {
        "GoalCompletionReactor"
    }

    fn subscriptions(&self) -> &'static [&'static str] {
        &["GoalCompleted"]
    }

    async fn handle(&self, event: &EventEnvelope) -> Result<(), HandlerError> {
        let DeliveryEvent::GoalCompleted { goal } = &event.payload else {
            return Ok(());
        };
        self.react(goal).await
    }
}
