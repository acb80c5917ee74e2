//! Job-task execution.
//!
//! Jobs are durable handles for out-of-process work. The handler here
//! claims `created` tasks that carry a goal-fulfillment request, drives the
//! referenced goal through the dispatcher, and reports task state back to
//! the store.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::models::{GoalRef, JobTaskState};
use crate::domain::ports::GoalStore;
use crate::services::dispatcher::FulfillmentDispatcher;
use crate::services::event_bus::{DeliveryEvent, EventEnvelope, EventHandler, HandlerError};

/// Task parameter payload requesting fulfillment of one goal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FulfillGoalParameters {
    pub goal_set_id: String,
    pub environment: String,
    pub unique_name: String,
}

/// Task name used for goal-fulfillment job tasks.
pub const FULFILL_GOAL_TASK: &str = "fulfill-goal";

/// Executes goal-fulfillment job tasks.
pub struct JobTaskHandler {
    store: Arc<dyn GoalStore>,
    dispatcher: Arc<FulfillmentDispatcher>,
}

impl JobTaskHandler {
    pub fn new(store: Arc<dyn GoalStore>, dispatcher: Arc<FulfillmentDispatcher>) -> Self {
        Self { store, dispatcher }
    }

    async fn set_state(&self, job: &str, task: &str, state: JobTaskState, message: &str) {
        if let Err(e) = self
            .store
            .set_job_task_state(job, task, state, message)
            .await
        {
            tracing::warn!(job, task, error = %e, "Failed to update job task state");
        }
    }

    async fn run_task(&self, job_name: &str, task_name: &str) -> Result<(), HandlerError> {
        let job = self
            .store
            .job(job_name)
            .await
            .map_err(|e| HandlerError::transient("JobTaskHandler", e))?;
        let Some(job) = job else {
            tracing::warn!(job = job_name, "Job not found for task event");
            return Ok(());
        };
        let Some(task) = job.tasks.iter().find(|t| t.name == task_name) else {
            return Ok(());
        };
        let Ok(params) = serde_json::from_value::<FulfillGoalParameters>(task.parameters.clone())
        else {
            self.set_state(
                job_name,
                task_name,
                JobTaskState::Failed,
                "Unrecognized task parameters",
            )
            .await;
            return Ok(());
        };

        self.set_state(job_name, task_name, JobTaskState::Running, "Fulfilling goal")
            .await;

        let key = GoalRef::new(params.environment, params.unique_name);
        let goal = self
            .store
            .goal_event(&params.goal_set_id, &key)
            .await
            .map_err(|e| HandlerError::transient("JobTaskHandler", e))?;
        let Some(goal) = goal else {
            self.set_state(job_name, task_name, JobTaskState::Failed, "Goal not found")
                .await;
            return Ok(());
        };

        match self.dispatcher.dispatch(&goal, Uuid::new_v4()).await {
            Ok(()) => {
                self.set_state(job_name, task_name, JobTaskState::Success, "Goal fulfilled")
                    .await;
            }
            Err(e) => {
                self.set_state(job_name, task_name, JobTaskState::Failed, &e.to_string())
                    .await;
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl EventHandler for JobTaskHandler {
    fn name(&self) -> &'static str {
        "JobTaskHandler"
    }

    fn subscriptions(&self) -> &'static [&'static str] {
        &["JobTaskChanged"]
    }

    async fn handle(&self, event: &EventEnvelope) -> Result<(), HandlerError> {
        let DeliveryEvent::JobTaskChanged {
            job_name,
            task_name,
            state,
            ..
        } = &event.payload
        else {
            return Ok(());
        };
        // Only fresh tasks are claimed; running/terminal updates are
        // somebody's progress reports.
        if *state != JobTaskState::Created {
            return Ok(());
        }
        self.run_task(job_name, task_name).await
    }
}
