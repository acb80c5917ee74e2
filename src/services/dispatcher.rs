//! Fulfillment dispatcher.
//!
//! Takes `requested` goal events through admission (relevance, signature,
//! cancellation re-check, fulfillment method), resolves the registered
//! implementation, and either executes in-process or hands the invocation
//! to the first supporting goal scheduler.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::domain::models::{FulfillmentMethod, Goal, GoalEvent, GoalRef, GoalSetState, GoalState};
use crate::domain::ports::GoalStore;
use crate::infrastructure::logging::redaction::redact;
use crate::services::event_bus::{DeliveryEvent, EventEnvelope, EventHandler, HandlerError};
use crate::services::progress::ProgressLog;
use crate::services::scheduler::GoalScheduler;
use crate::services::signing::GoalVerifier;
use crate::services::state_engine::{GoalUpdate, GoalUpdater};

/// Result of executing a goal.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Zero means success; non-zero infers `failure` unless `state` says
    /// otherwise.
    pub code: i32,
    pub message: Option<String>,
    /// Explicit target state; wins over the inferred one.
    pub state: Option<GoalState>,
    pub phase: Option<String>,
    pub url: Option<String>,
    pub external_urls: Vec<String>,
}

impl ExecutionResult {
    pub fn success() -> Self {
        Self {
            code: 0,
            message: None,
            state: None,
            phase: None,
            url: None,
            external_urls: Vec::new(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            code: 1,
            message: Some(message.into()),
            state: None,
            phase: None,
            url: None,
            external_urls: Vec::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Executes one kind of goal.
#[async_trait::async_trait]
pub trait GoalExecutor: Send + Sync {
    /// Execute the goal. A returned error is captured as a failed result
    /// with a redacted message; it does not fail event processing.
    async fn execute(&self, invocation: &GoalInvocation) -> Result<ExecutionResult, String>;
}

/// Observes goal execution before start and after completion.
#[async_trait::async_trait]
pub trait ExecutionListener: Send + Sync {
    async fn on_start(&self, invocation: &GoalInvocation);
    async fn on_complete(&self, invocation: &GoalInvocation, result: &ExecutionResult);
}

/// Everything an executor needs to run one goal.
pub struct GoalInvocation {
    pub goal: GoalEvent,
    /// Parameters parsed from the goal event's `data` payload.
    pub parameters: serde_json::Value,
    pub progress_log: Arc<dyn ProgressLog>,
    pub workspace_id: String,
    pub workspace_name: Option<String>,
    pub correlation_id: Uuid,
    /// Whether the goal was registered for isolated execution.
    pub isolated: bool,
}

struct Implementation {
    executor: Arc<dyn GoalExecutor>,
    listeners: Vec<Arc<dyn ExecutionListener>>,
    isolated: bool,
    approval_required: bool,
}

/// Registry resolving goal keys to their implementations.
#[derive(Default)]
pub struct ImplementationMap {
    implementations: HashMap<GoalRef, Implementation>,
}

impl ImplementationMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the implementation for a goal template.
    pub fn register(
        &mut self,
        goal: &Goal,
        executor: Arc<dyn GoalExecutor>,
        listeners: Vec<Arc<dyn ExecutionListener>>,
    ) {
        self.implementations.insert(
            goal.key(),
            Implementation {
                executor,
                listeners,
                isolated: goal.isolated,
                approval_required: goal.approval_required,
            },
        );
    }

    fn get(&self, key: &GoalRef) -> Option<&Implementation> {
        self.implementations.get(key)
    }
}

/// Creates the progress log for an invocation.
#[async_trait::async_trait]
pub trait ProgressLogFactory: Send + Sync {
    async fn create(&self, goal: &GoalEvent) -> Arc<dyn ProgressLog>;
}

/// Factory producing plain ephemeral logs.
pub struct EphemeralLogFactory;

#[async_trait::async_trait]
impl ProgressLogFactory for EphemeralLogFactory {
    async fn create(&self, _goal: &GoalEvent) -> Arc<dyn ProgressLog> {
        Arc::new(crate::services::progress::EphemeralProgressLog::new())
    }
}

/// Dispatches requested goal events to executors or schedulers.
pub struct FulfillmentDispatcher {
    store: Arc<dyn GoalStore>,
    updater: Arc<GoalUpdater>,
    implementations: Arc<ImplementationMap>,
    schedulers: Vec<Arc<dyn GoalScheduler>>,
    verifier: Option<Arc<GoalVerifier>>,
    log_factory: Arc<dyn ProgressLogFactory>,
    registration: String,
    workspace_id: String,
    workspace_name: Option<String>,
}

impl FulfillmentDispatcher {
    pub fn new(
        store: Arc<dyn GoalStore>,
        updater: Arc<GoalUpdater>,
        implementations: Arc<ImplementationMap>,
        registration: impl Into<String>,
        workspace_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            updater,
            implementations,
            schedulers: Vec::new(),
            verifier: None,
            log_factory: Arc::new(EphemeralLogFactory),
            registration: registration.into(),
            workspace_id: workspace_id.into(),
            workspace_name: None,
        }
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn GoalScheduler>) -> Self {
        self.schedulers.push(scheduler);
        self
    }

    pub fn with_verifier(mut self, verifier: Arc<GoalVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn with_log_factory(mut self, factory: Arc<dyn ProgressLogFactory>) -> Self {
        self.log_factory = factory;
        self
    }

    pub fn with_workspace_name(mut self, name: impl Into<String>) -> Self {
        self.workspace_name = Some(name.into());
        self
    }

    /// Process one requested goal event through admission and execution.
    pub async fn dispatch(
        &self,
        goal: &GoalEvent,
        correlation_id: Uuid,
    ) -> Result<(), HandlerError> {
        // 1. Relevance: never execute a side effect owned by another
        //    registration.
        if goal.fulfillment.method == FulfillmentMethod::SideEffect
            && goal.fulfillment.name != self.registration
        {
            tracing::debug!(
                goal = %goal.key(),
                fulfiller = %goal.fulfillment.name,
                "Ignoring foreign side-effect goal"
            );
            return Ok(());
        }

        // 2. Signature verification.
        if let Some(ref verifier) = self.verifier {
            if let Err(rejection) = verifier.verify(goal) {
                tracing::warn!(goal = %goal.key(), %rejection, "Rejected goal event");
                let update = GoalUpdate::default().with_description(rejection.description());
                if let Err(e) = self
                    .updater
                    .transition(goal, GoalState::Failure, "FulfillmentDispatcher", update)
                    .await
                {
                    tracing::warn!(goal = %goal.key(), error = %e, "Failed to record rejection");
                }
                return Ok(());
            }
        }

        // 3. Cancellation re-check against the latest stored state.
        if self.canceled_since_requested(goal).await? {
            tracing::info!(goal = %goal.key(), "Goal canceled since requested; skipping");
            return Ok(());
        }

        // 4. Fulfillment method.
        if goal.fulfillment.method == FulfillmentMethod::Other {
            let update = GoalUpdate::default().with_description("No fulfillment".to_string());
            if let Err(e) = self
                .updater
                .transition(goal, GoalState::Failure, "FulfillmentDispatcher", update)
                .await
            {
                tracing::warn!(goal = %goal.key(), error = %e, "Failed to record missing fulfillment");
            }
            return Ok(());
        }

        let Some(implementation) = self.implementations.get(&goal.key()) else {
            return Err(HandlerError::validation(
                "FulfillmentDispatcher",
                format!("no implementation registered for goal {}", goal.key()),
            ));
        };

        let invocation = GoalInvocation {
            goal: goal.clone(),
            parameters: goal
                .data
                .as_deref()
                .and_then(|d| serde_json::from_str(d).ok())
                .unwrap_or(serde_json::Value::Null),
            progress_log: self.log_factory.create(goal).await,
            workspace_id: self.workspace_id.clone(),
            workspace_name: self.workspace_name.clone(),
            correlation_id,
            isolated: implementation.isolated,
        };

        // 5. Scheduler consultation: the first supporting scheduler wins.
        for scheduler in &self.schedulers {
            if scheduler.supports(&invocation).await {
                return self.schedule(scheduler.as_ref(), &invocation).await;
            }
        }

        // 6. In-process execution.
        self.execute(implementation, &invocation).await
    }

    async fn canceled_since_requested(&self, goal: &GoalEvent) -> Result<bool, HandlerError> {
        let set = self
            .store
            .goal_set(&goal.sha, &goal.goal_set_id)
            .await
            .map_err(|e| HandlerError::transient("FulfillmentDispatcher", e))?;
        let Some(set) = set else {
            return Ok(false);
        };
        if set.derived_state() == GoalSetState::Canceled {
            return Ok(true);
        }
        Ok(set
            .goal(&goal.key())
            .is_some_and(|g| g.state == GoalState::Canceled))
    }

    async fn schedule(
        &self,
        scheduler: &dyn GoalScheduler,
        invocation: &GoalInvocation,
    ) -> Result<(), HandlerError> {
        let goal = &invocation.goal;
        let outcome = scheduler.schedule(invocation).await;
        invocation.progress_log.close().await;

        match outcome {
            Ok(result) if result.code == 0 => {
                let phase = result.phase.unwrap_or_else(|| "scheduled".to_string());
                let update = GoalUpdate::default()
                    .with_phase(phase)
                    .with_description(
                        result
                            .description
                            .unwrap_or_else(|| format!("Scheduled: {}", goal.name)),
                    );
                if let Err(e) = self
                    .updater
                    .transition(goal, GoalState::InProcess, scheduler.name(), update)
                    .await
                {
                    tracing::warn!(goal = %goal.key(), error = %e, "Failed to mark goal scheduled");
                }
            }
            Ok(result) => {
                let description = result
                    .description
                    .unwrap_or_else(|| "Failed to schedule goal".to_string());
                self.record_schedule_failure(goal, scheduler.name(), &description)
                    .await;
            }
            Err(e) => {
                tracing::warn!(goal = %goal.key(), error = %e, "Goal scheduler failed");
                self.record_schedule_failure(goal, scheduler.name(), "Failed to schedule goal")
                    .await;
            }
        }
        Ok(())
    }

    async fn record_schedule_failure(&self, goal: &GoalEvent, actor: &str, description: &str) {
        let update = GoalUpdate::default().with_description(redact(description));
        if let Err(e) = self
            .updater
            .transition(goal, GoalState::Failure, actor, update)
            .await
        {
            tracing::warn!(goal = %goal.key(), error = %e, "Failed to record scheduling failure");
        }
    }

    async fn execute(
        &self,
        implementation: &Implementation,
        invocation: &GoalInvocation,
    ) -> Result<(), HandlerError> {
        let goal = &invocation.goal;

        let host = nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown-host".to_string());
        tracing::info!(
            goal = %goal.key(),
            goal_set_id = %goal.goal_set_id,
            repo = %goal.repo,
            sha = %goal.sha,
            branch = %goal.branch,
            host = %host,
            registration = %self.registration,
            "Executing goal in-process"
        );

        let mut start = GoalUpdate::default()
            .with_description(format!("Working: {}", goal.name));
        start.url = invocation.progress_log.url();
        let in_process = match self
            .updater
            .transition(goal, GoalState::InProcess, "FulfillmentDispatcher", start)
            .await
        {
            Ok(event) => event,
            Err(e) => {
                invocation.progress_log.close().await;
                return Err(HandlerError::transient("FulfillmentDispatcher", e));
            }
        };

        for listener in &implementation.listeners {
            listener.on_start(invocation).await;
        }

        let result = match implementation.executor.execute(invocation).await {
            Ok(result) => result,
            Err(message) => ExecutionResult::failure(redact(&message)),
        };

        for listener in &implementation.listeners {
            listener.on_complete(invocation, &result).await;
        }

        // The log must be closed before the terminal state goes out.
        invocation.progress_log.close().await;

        let inferred = if result.code == 0 {
            GoalState::Success
        } else {
            GoalState::Failure
        };
        let mut target = result.state.unwrap_or(inferred);
        if target == GoalState::Success && implementation.approval_required {
            target = GoalState::WaitingForApproval;
        }

        let mut update = GoalUpdate::default();
        update.description = Some(match (&result.message, target) {
            (Some(message), _) => redact(message),
            (None, GoalState::Success) => format!("Complete: {}", goal.name),
            (None, GoalState::WaitingForApproval) => format!("Approval required: {}", goal.name),
            (None, _) => format!("Failed: {}", goal.name),
        });
        update.url = result.url.or_else(|| invocation.progress_log.url());
        if !result.external_urls.is_empty() {
            update.external_urls = Some(result.external_urls.clone());
        }
        update.phase = result.phase.clone();

        if let Err(e) = self
            .updater
            .transition(&in_process, target, "FulfillmentDispatcher", update)
            .await
        {
            tracing::warn!(goal = %goal.key(), error = %e, "Failed to record goal outcome");
        }

        // Event processing succeeded even when the goal failed.
        Ok(())
    }
}

#[async_trait::async_trait]
impl EventHandler for FulfillmentDispatcher {
    fn name(&self) -> &'static str {
        "FulfillmentDispatcher"
    }

    fn subscriptions(&self) -> &'static [&'static str] {
        &["GoalRequested"]
    }

    async fn handle(&self, event: &EventEnvelope) -> Result<(), HandlerError> {
        let DeliveryEvent::GoalRequested { goal } = &event.payload else {
            return Ok(());
        };
        let correlation = event.correlation_id.unwrap_or_else(Uuid::new_v4);
        self.dispatch(goal, correlation).await
    }
}
