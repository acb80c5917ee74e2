//! State and precondition engine.
//!
//! [`GoalUpdater`] is the single write path for goal-state transitions: it
//! enforces the transition table, appends provenance, re-signs, stores, and
//! republishes the event. [`SuccessReactor`] advances dependent goals when
//! an upstream goal succeeds.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;

use crate::domain::models::{
    GoalEvent, GoalRef, GoalSet, GoalSetState, GoalState, Provenance,
};
use crate::domain::ports::{GoalStore, StoreError};
use crate::services::event_bus::{
    DeliveryEvent, EventBus, EventEnvelope, EventHandler, HandlerError,
};
use crate::services::signing::{GoalSigner, SigningError};

/// Goal update errors.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("Invalid goal transition {from} -> {to} for {goal}")]
    InvalidTransition {
        goal: String,
        from: GoalState,
        to: GoalState,
    },

    #[error("Goal {goal} is not retry-feasible")]
    RetryNotFeasible { goal: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Signing(#[from] SigningError),
}

/// Optional fields updated alongside a state transition.
#[derive(Debug, Clone, Default)]
pub struct GoalUpdate {
    pub description: Option<String>,
    pub url: Option<String>,
    pub external_urls: Option<Vec<String>>,
    pub data: Option<String>,
    pub phase: Option<String>,
}

impl GoalUpdate {
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }
}

/// The single write path for goal events.
pub struct GoalUpdater {
    store: Arc<dyn GoalStore>,
    bus: Arc<EventBus>,
    signer: Option<Arc<GoalSigner>>,
    registration: String,
    version: String,
    workspace_id: String,
}

impl GoalUpdater {
    pub fn new(
        store: Arc<dyn GoalStore>,
        bus: Arc<EventBus>,
        registration: impl Into<String>,
        version: impl Into<String>,
        workspace_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            bus,
            signer: None,
            registration: registration.into(),
            version: version.into(),
            workspace_id: workspace_id.into(),
        }
    }

    pub fn with_signer(mut self, signer: Arc<GoalSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn registration(&self) -> &str {
        &self.registration
    }

    /// Transition a goal through the ordinary table and persist the result.
    pub async fn transition(
        &self,
        goal: &GoalEvent,
        next: GoalState,
        actor: &str,
        update: GoalUpdate,
    ) -> Result<GoalEvent, UpdateError> {
        if !goal.state.can_transition_to(next) {
            return Err(UpdateError::InvalidTransition {
                goal: goal.key().to_string(),
                from: goal.state,
                to: next,
            });
        }
        self.write(goal, next, actor, update).await
    }

    /// Planner-initiated retry: the only escape from a terminal state.
    /// Permitted from `failure` when the goal is retry-feasible, and from
    /// `skipped`.
    pub async fn retry(
        &self,
        goal: &GoalEvent,
        actor: &str,
        update: GoalUpdate,
    ) -> Result<GoalEvent, UpdateError> {
        match goal.state {
            GoalState::Failure if goal.retry_feasible => {}
            GoalState::Skipped => {}
            GoalState::Failure => {
                return Err(UpdateError::RetryNotFeasible {
                    goal: goal.key().to_string(),
                })
            }
            from => {
                return Err(UpdateError::InvalidTransition {
                    goal: goal.key().to_string(),
                    from,
                    to: GoalState::Requested,
                })
            }
        }
        self.write(goal, GoalState::Requested, actor, update).await
    }

    /// Grant approval on a goal waiting for it, then finish it.
    pub async fn approve(
        &self,
        goal: &GoalEvent,
        approver: &str,
    ) -> Result<GoalEvent, UpdateError> {
        let approved = self
            .transition(goal, GoalState::Approved, approver, GoalUpdate::default())
            .await?;
        let mut approved = approved;
        approved.approval = Some(self.provenance(approver));
        self.transition(&approved, GoalState::Success, approver, GoalUpdate::default())
            .await
    }

    /// Grant pre-approval, moving the goal on to `requested`.
    pub async fn pre_approve(
        &self,
        goal: &GoalEvent,
        approver: &str,
    ) -> Result<GoalEvent, UpdateError> {
        let pre_approved = self
            .transition(goal, GoalState::PreApproved, approver, GoalUpdate::default())
            .await?;
        let mut pre_approved = pre_approved;
        pre_approved.pre_approval = Some(self.provenance(approver));
        self.transition(
            &pre_approved,
            GoalState::Requested,
            approver,
            GoalUpdate::default(),
        )
        .await
    }

    fn provenance(&self, actor: &str) -> Provenance {
        Provenance::now(self.registration.clone(), self.version.clone(), actor)
    }

    async fn write(
        &self,
        goal: &GoalEvent,
        next: GoalState,
        actor: &str,
        update: GoalUpdate,
    ) -> Result<GoalEvent, UpdateError> {
        let mut event = goal.clone();
        event.state = next;
        event.ts = chrono::Utc::now().timestamp_millis().max(goal.ts + 1);
        event.version = goal.version + 1;
        event.provenance.push(self.provenance(actor));
        if let Some(description) = update.description {
            event.description = description;
        }
        if let Some(url) = update.url {
            event.url = Some(url);
        }
        if let Some(external_urls) = update.external_urls {
            event.external_urls = external_urls;
        }
        if let Some(data) = update.data {
            event.data = Some(data);
        }
        event.phase = update.phase.or(event.phase);

        if let Some(ref signer) = self.signer {
            signer.sign(&mut event)?;
        } else {
            event.signature = None;
        }

        self.store.update_goal(&event).await?;

        tracing::info!(
            goal = %event.key(),
            goal_set_id = %event.goal_set_id,
            from = %goal.state,
            to = %next,
            "Goal state updated"
        );

        if next == GoalState::Requested {
            self.publish(DeliveryEvent::GoalRequested {
                goal: event.clone(),
            });
        }
        if next == GoalState::Success {
            self.publish(DeliveryEvent::GoalSucceeded {
                goal: event.clone(),
            });
        }
        if next.is_terminal() {
            self.publish(DeliveryEvent::GoalCompleted {
                goal: event.clone(),
            });
        }
        Ok(event)
    }

    fn publish(&self, payload: DeliveryEvent) {
        self.bus
            .publish(EventEnvelope::new(self.workspace_id.clone(), payload));
    }
}

/// Move every non-terminal goal of a set to `canceled`. Terminal goals are
/// untouched. Returns the number of goals canceled.
pub async fn cancel_set(
    updater: &GoalUpdater,
    set: &GoalSet,
    actor: &str,
) -> Result<usize, UpdateError> {
    let mut canceled = 0;
    for goal in &set.goals {
        if goal.state.is_terminal() {
            continue;
        }
        updater
            .transition(
                goal,
                GoalState::Canceled,
                actor,
                GoalUpdate::default().with_description(format!("Canceled: {}", goal.name)),
            )
            .await?;
        canceled += 1;
    }
    Ok(canceled)
}

/// Callback invoked while a goal advances to `requested`; may enrich the
/// goal's `data` payload.
#[async_trait::async_trait]
pub trait FulfillmentCallback: Send + Sync {
    async fn enrich(&self, goal: &GoalEvent, set: &GoalSet) -> Result<Option<String>, String>;
}

/// Advances dependent goals when an upstream goal reaches `success`.
pub struct SuccessReactor {
    store: Arc<dyn GoalStore>,
    updater: Arc<GoalUpdater>,
    /// Goals whose candidacy accepts skipped preconditions.
    skip_cascade: HashSet<GoalRef>,
    /// Fulfillment-callback chain per goal.
    callbacks: HashMap<GoalRef, Vec<Arc<dyn FulfillmentCallback>>>,
}

impl SuccessReactor {
    pub fn new(store: Arc<dyn GoalStore>, updater: Arc<GoalUpdater>) -> Self {
        Self {
            store,
            updater,
            skip_cascade: HashSet::new(),
            callbacks: HashMap::new(),
        }
    }

    pub fn accept_skipped_for(mut self, key: GoalRef) -> Self {
        self.skip_cascade.insert(key);
        self
    }

    pub fn with_callback(mut self, key: GoalRef, callback: Arc<dyn FulfillmentCallback>) -> Self {
        self.callbacks.entry(key).or_default().push(callback);
        self
    }

    /// Whether every precondition of `goal` is satisfied within `set`.
    ///
    /// A precondition is matched by `(environment, uniqueName)`; it is
    /// satisfied in state `success`, or `skipped` when the goal declares
    /// skip cascading.
    fn preconditions_met(&self, goal: &GoalEvent, set: &GoalSet) -> bool {
        let accepts_skipped = self.skip_cascade.contains(&goal.key());
        goal.pre_conditions.iter().all(|pre| {
            set.goal(pre).is_some_and(|upstream| {
                upstream.state == GoalState::Success
                    || (accepts_skipped && upstream.state == GoalState::Skipped)
            })
        })
    }

    /// Re-evaluate candidates after `upstream` succeeded, advancing each.
    async fn advance_candidates(&self, upstream: &GoalEvent) -> Result<(), HandlerError> {
        let set = self
            .store
            .goal_set(&upstream.sha, &upstream.goal_set_id)
            .await
            .map_err(|e| HandlerError::transient("SuccessReactor", e))?;
        let Some(set) = set else {
            tracing::warn!(
                goal_set_id = %upstream.goal_set_id,
                "Goal set not found while advancing dependents"
            );
            return Ok(());
        };

        if set.derived_state() == GoalSetState::Canceled {
            return Ok(());
        }

        let upstream_key = upstream.key();
        for goal in &set.goals {
            let candidate_state = matches!(goal.state, GoalState::Planned | GoalState::Skipped)
                || (goal.state == GoalState::Failure && goal.retry_feasible);
            if !candidate_state || !goal.is_directly_dependent_on(&upstream_key) {
                continue;
            }
            if !self.preconditions_met(goal, &set) {
                continue;
            }

            let result = if goal.pre_approval_required && goal.state == GoalState::Planned {
                self.updater
                    .transition(
                        goal,
                        GoalState::WaitingForPreApproval,
                        "SuccessReactor",
                        GoalUpdate::default(),
                    )
                    .await
            } else {
                let update = self.run_callbacks(goal, &set).await;
                match goal.state {
                    GoalState::Planned => {
                        self.updater
                            .transition(goal, GoalState::Requested, "SuccessReactor", update)
                            .await
                    }
                    // Skipped or retry-feasible failure: planner-sanctioned retry.
                    _ => self.updater.retry(goal, "SuccessReactor", update).await,
                }
            };

            if let Err(e) = result {
                tracing::warn!(goal = %goal.key(), error = %e, "Failed to advance goal");
            }
        }
        Ok(())
    }

    async fn run_callbacks(&self, goal: &GoalEvent, set: &GoalSet) -> GoalUpdate {
        let mut update = GoalUpdate::default();
        let Some(chain) = self.callbacks.get(&goal.key()) else {
            return update;
        };
        let mut enriched = goal.clone();
        for callback in chain {
            match callback.enrich(&enriched, set).await {
                Ok(Some(data)) => {
                    enriched.data = Some(data.clone());
                    update.data = Some(data);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(goal = %goal.key(), error = %e, "Fulfillment callback failed");
                }
            }
        }
        update
    }
}

#[async_trait::async_trait]
impl EventHandler for SuccessReactor {
    fn name(&self) -> &'static str {
        "SuccessReactor"
    }

    fn subscriptions(&self) -> &'static [&'static str] {
        &["GoalSucceeded"]
    }

    async fn handle(&self, event: &EventEnvelope) -> Result<(), HandlerError> {
        let DeliveryEvent::GoalSucceeded { goal } = &event.payload else {
            return Ok(());
        };
        self.advance_candidates(goal).await
    }
}
