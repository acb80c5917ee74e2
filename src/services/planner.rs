//! Goal planner.
//!
//! Applies ordered plan rules (push test → goals) to a push, producing a
//! goal set with a fresh id and a validated dependency graph. Leaves start
//! `requested` (or `waiting_for_pre_approval`), internal nodes `planned`.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use crate::domain::models::{
    Fulfillment, Goal, GoalEvent, GoalRef, GoalSet, GoalSetState, GoalState, MergePolicy,
    Provenance, PushContext,
};
use crate::domain::ports::{
    CommitStatus, CommitStatusState, GoalStore, StatusPublisher, StoreError,
};
use crate::services::event_bus::{
    DeliveryEvent, EventBus, EventEnvelope, EventHandler, HandlerError,
};
use crate::services::push_test::{PushTest, PushTestError, PushTestEvaluator};
use crate::services::signing::{GoalSigner, SigningError};

/// One ordered planning rule: when the test matches, contribute the goals.
#[derive(Clone)]
pub struct PlanRule {
    pub name: String,
    pub test: PushTest,
    pub goals: Vec<Goal>,
}

impl PlanRule {
    pub fn new(name: impl Into<String>, test: PushTest, goals: Vec<Goal>) -> Self {
        Self {
            name: name.into(),
            test,
            goals,
        }
    }
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error(transparent)]
    Evaluation(#[from] PushTestError),

    #[error("Goal {goal} declares unknown precondition {pre}")]
    UnknownPrecondition { goal: GoalRef, pre: GoalRef },

    #[error("Cyclic goal dependencies: {}", path.iter().map(std::string::ToString::to_string).collect::<Vec<_>>().join(" -> "))]
    Cycle { path: Vec<GoalRef> },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Signing(#[from] SigningError),
}

/// Listener notified with the full set after planning.
#[async_trait::async_trait]
pub trait GoalsSetListener: Send + Sync {
    async fn on_goals_set(&self, ctx: &PushContext, set: &GoalSet);
}

/// Turns a push plus ordered rules into a goal set.
pub struct GoalPlanner {
    rules: Vec<PlanRule>,
    merge_policy: MergePolicy,
    evaluator: Arc<PushTestEvaluator>,
    store: Arc<dyn GoalStore>,
    bus: Arc<EventBus>,
    signer: Option<Arc<GoalSigner>>,
    status: Option<Arc<dyn StatusPublisher>>,
    listeners: Vec<Arc<dyn GoalsSetListener>>,
    registration: String,
    version: String,
    workspace_id: String,
}

impl GoalPlanner {
    pub fn new(
        rules: Vec<PlanRule>,
        evaluator: Arc<PushTestEvaluator>,
        store: Arc<dyn GoalStore>,
        bus: Arc<EventBus>,
        registration: impl Into<String>,
        version: impl Into<String>,
        workspace_id: impl Into<String>,
    ) -> Self {
        Self {
            rules,
            merge_policy: MergePolicy::Additive,
            evaluator,
            store,
            bus,
            signer: None,
            status: None,
            listeners: Vec::new(),
            registration: registration.into(),
            version: version.into(),
            workspace_id: workspace_id.into(),
        }
    }

    pub fn with_merge_policy(mut self, policy: MergePolicy) -> Self {
        self.merge_policy = policy;
        self
    }

    pub fn with_signer(mut self, signer: Arc<GoalSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn with_status_publisher(mut self, status: Arc<dyn StatusPublisher>) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn GoalsSetListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Plan a goal set for a push. Returns `None` when no rule matched.
    pub async fn plan(&self, ctx: &PushContext) -> Result<Option<GoalSet>, PlanError> {
        let goals = self.select_goals(ctx).await?;
        if goals.is_empty() {
            tracing::debug!(
                repo = %ctx.push.repo,
                branch = %ctx.push.branch,
                "No plan rule matched; no goals planned"
            );
            return Ok(None);
        }

        validate_graph(&goals)?;

        let goal_set_id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp_millis();
        let events: Vec<GoalEvent> = goals
            .iter()
            .map(|goal| self.instantiate(goal, ctx, &goal_set_id, now))
            .collect::<Result<_, PlanError>>()?;

        let set = GoalSet {
            goal_set_id: goal_set_id.clone(),
            repo: ctx.push.repo.clone(),
            sha: ctx.push.after.clone(),
            branch: ctx.push.branch.clone(),
            goals: events.clone(),
            state: GoalSetState::Pending,
            created_at: now,
        };

        self.store.store_goal_set(&set).await?;
        for event in &events {
            self.store.update_goal(event).await?;
        }

        tracing::info!(
            goal_set_id = %goal_set_id,
            repo = %ctx.push.repo,
            sha = %ctx.push.after,
            goals = events.len(),
            "Planned goal set"
        );

        self.bus.publish(EventEnvelope::new(
            self.workspace_id.clone(),
            DeliveryEvent::GoalSetCreated { set: set.clone() },
        ));
        for event in &events {
            if event.state == GoalState::Requested {
                self.bus.publish(EventEnvelope::new(
                    self.workspace_id.clone(),
                    DeliveryEvent::GoalRequested {
                        goal: event.clone(),
                    },
                ));
            }
        }

        for listener in &self.listeners {
            listener.on_goals_set(ctx, &set).await;
        }

        if let Some(ref status) = self.status {
            let result = status
                .publish(
                    &ctx.push.repo,
                    &ctx.push.after,
                    &CommitStatus {
                        context: format!("sdm/{}", self.registration),
                        description: "Delivery goals in progress".to_string(),
                        target_url: None,
                        state: CommitStatusState::Pending,
                    },
                )
                .await;
            if let Err(e) = result {
                tracing::warn!(error = %e, "Failed to publish in-progress commit status");
            }
        }

        Ok(Some(set))
    }

    /// Evaluate rules in order, collecting contributed goals per the merge
    /// policy and deduplicating by `(environment, uniqueName)`.
    async fn select_goals(&self, ctx: &PushContext) -> Result<Vec<Goal>, PlanError> {
        let mut selected: Vec<Goal> = Vec::new();
        let mut seen: HashMap<GoalRef, usize> = HashMap::new();

        for rule in &self.rules {
            if !self.evaluator.evaluate(&rule.test, ctx).await? {
                continue;
            }
            tracing::debug!(rule = %rule.name, "Plan rule matched");
            for goal in &rule.goals {
                if seen.contains_key(&goal.key()) {
                    continue;
                }
                seen.insert(goal.key(), selected.len());
                selected.push(goal.clone());
            }
            if self.merge_policy == MergePolicy::Replace {
                break;
            }
        }
        Ok(selected)
    }

    fn instantiate(
        &self,
        goal: &Goal,
        ctx: &PushContext,
        goal_set_id: &str,
        now: i64,
    ) -> Result<GoalEvent, PlanError> {
        let is_leaf = goal.pre_conditions.is_empty();
        let state = if is_leaf {
            if goal.pre_approval_required {
                GoalState::WaitingForPreApproval
            } else {
                GoalState::Requested
            }
        } else {
            GoalState::Planned
        };

        let fulfillment = goal.side_effect_name.as_ref().map_or_else(
            || Fulfillment::sdm(self.registration.clone()),
            Fulfillment::side_effect,
        );

        let mut event = GoalEvent {
            goal_set_id: goal_set_id.to_string(),
            unique_name: goal.unique_name.clone(),
            environment: goal.environment.clone(),
            name: goal.display_name.clone(),
            sha: ctx.push.after.clone(),
            branch: ctx.push.branch.clone(),
            repo: ctx.push.repo.clone(),
            state,
            ts: now,
            version: 1,
            description: goal.description_for(state),
            pre_conditions: goal.pre_conditions.clone(),
            fulfillment,
            data: None,
            url: None,
            external_urls: Vec::new(),
            provenance: vec![Provenance::now(
                self.registration.clone(),
                self.version.clone(),
                "PlanGoals",
            )],
            phase: None,
            retry_feasible: goal.retry_feasible,
            approval_required: goal.approval_required,
            approval: None,
            pre_approval_required: goal.pre_approval_required,
            pre_approval: None,
            signature: None,
        };

        if let Some(ref signer) = self.signer {
            signer.sign(&mut event)?;
        }
        Ok(event)
    }
}

/// Reject unknown preconditions and cyclic dependency graphs. Cycles are
/// found with Tarjan's strongly-connected-components algorithm over the
/// precondition edges.
fn validate_graph(goals: &[Goal]) -> Result<(), PlanError> {
    let index: HashMap<GoalRef, usize> = goals
        .iter()
        .enumerate()
        .map(|(i, g)| (g.key(), i))
        .collect();

    for goal in goals {
        for pre in &goal.pre_conditions {
            if !index.contains_key(pre) {
                return Err(PlanError::UnknownPrecondition {
                    goal: goal.key(),
                    pre: pre.clone(),
                });
            }
        }
    }

    if let Some(cycle) = tarjan_cycle(goals, &index) {
        return Err(PlanError::Cycle { path: cycle });
    }
    Ok(())
}

/// Tarjan SCC over precondition edges; returns the members of the first
/// component of size > 1 (or a self-loop), which form a cycle.
fn tarjan_cycle(goals: &[Goal], index: &HashMap<GoalRef, usize>) -> Option<Vec<GoalRef>> {
    struct State<'a> {
        goals: &'a [Goal],
        index: &'a HashMap<GoalRef, usize>,
        counter: usize,
        indices: Vec<Option<usize>>,
        lowlink: Vec<usize>,
        on_stack: Vec<bool>,
        stack: Vec<usize>,
        cycle: Option<Vec<usize>>,
    }

    fn strongconnect(state: &mut State<'_>, v: usize) {
        state.indices[v] = Some(state.counter);
        state.lowlink[v] = state.counter;
        state.counter += 1;
        state.stack.push(v);
        state.on_stack[v] = true;

        let edges: Vec<usize> = state.goals[v]
            .pre_conditions
            .iter()
            .filter_map(|pre| state.index.get(pre).copied())
            .collect();
        for w in edges {
            if state.indices[w].is_none() {
                strongconnect(state, w);
                state.lowlink[v] = state.lowlink[v].min(state.lowlink[w]);
            } else if state.on_stack[w] {
                state.lowlink[v] = state.lowlink[v].min(state.indices[w].unwrap_or(0));
            }
        }

        if state.indices[v] == Some(state.lowlink[v]) {
            let mut component = Vec::new();
            while let Some(w) = state.stack.pop() {
                state.on_stack[w] = false;
                component.push(w);
                if w == v {
                    break;
                }
            }
            let self_loop = component.len() == 1
                && state.goals[v].pre_conditions.contains(&state.goals[v].key());
            if state.cycle.is_none() && (component.len() > 1 || self_loop) {
                component.reverse();
                state.cycle = Some(component);
            }
        }
    }

    let n = goals.len();
    let mut state = State {
        goals,
        index,
        counter: 0,
        indices: vec![None; n],
        lowlink: vec![0; n],
        on_stack: vec![false; n],
        stack: Vec::new(),
        cycle: None,
    };

    for v in 0..n {
        if state.indices[v].is_none() {
            strongconnect(&mut state, v);
        }
        if state.cycle.is_some() {
            break;
        }
    }

    state
        .cycle
        .map(|c| c.into_iter().map(|i| goals[i].key()).collect())
}

/// Event handler planning goal sets for observed pushes.
pub struct PushPlanningHandler {
    planner: Arc<GoalPlanner>,
    workspace_id: String,
    registration: String,
}

impl PushPlanningHandler {
    pub fn new(
        planner: Arc<GoalPlanner>,
        workspace_id: impl Into<String>,
        registration: impl Into<String>,
    ) -> Self {
        Self {
            planner,
            workspace_id: workspace_id.into(),
            registration: registration.into(),
        }
    }
}

#[async_trait::async_trait]
impl EventHandler for PushPlanningHandler {
    fn name(&self) -> &'static str {
        "PushPlanningHandler"
    }

    fn subscriptions(&self) -> &'static [&'static str] {
        &["PushObserved"]
    }

    async fn handle(&self, event: &EventEnvelope) -> Result<(), HandlerError> {
        let DeliveryEvent::PushObserved { push } = &event.payload else {
            return Ok(());
        };

        let mut push = push.clone();
        // A first push arrives without a branch; plan it against the repo
        // default branch, or skip when the provider never reported one.
        if push.branch.is_empty() {
            match push.default_branch.clone() {
                Some(default) => push.branch = default,
                None => {
                    tracing::debug!(
                        repo = %push.repo,
                        "First push without a known default branch; not planning"
                    );
                    return Ok(());
                }
            }
        }

        let ctx = PushContext::new(push, self.workspace_id.clone(), self.registration.clone());
        match self.planner.plan(&ctx).await {
            Ok(_) => Ok(()),
            Err(PlanError::Evaluation(PushTestError::InvalidRegex { .. }))
            | Err(PlanError::Evaluation(PushTestError::UnknownPredicate(_))) => Err(
                HandlerError::validation(self.name(), "malformed push test"),
            ),
            Err(e @ (PlanError::UnknownPrecondition { .. } | PlanError::Cycle { .. })) => {
                Err(HandlerError::validation(self.name(), e))
            }
            Err(e) => Err(HandlerError::transient(self.name(), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{Push, RepoRef, ResourceProviderConfig};
    use crate::domain::ports::{ConfiguredProviders, ProjectError, ProjectReader};
    use crate::infrastructure::store::memory::InMemoryGoalStore;
    use async_trait::async_trait;

    struct EmptyProject;

    #[async_trait]
    impl ProjectReader for EmptyProject {
        async fn files_matching(
            &self,
            _push: &Push,
            _globs: &[String],
        ) -> Result<Vec<String>, ProjectError> {
            Ok(vec![])
        }

        async fn file_content(
            &self,
            _push: &Push,
            _path: &str,
        ) -> Result<Option<String>, ProjectError> {
            Ok(None)
        }

        async fn changed_files(&self, _push: &Push) -> Result<Vec<String>, ProjectError> {
            Ok(vec![])
        }
    }

    fn evaluator() -> Arc<PushTestEvaluator> {
        Arc::new(PushTestEvaluator::new(
            Arc::new(EmptyProject),
            Arc::new(ConfiguredProviders::new(vec![ResourceProviderConfig {
                provider_type: "DockerRegistry".to_string(),
                name: None,
            }])),
        ))
    }

    fn ctx(branch: &str) -> PushContext {
        let repo = RepoRef::new("octo", "widgets", "gh-1");
        let push = Push::new(repo, branch, "abc123").with_default_branch("main");
        PushContext::new(push, "ws-1", "my-sdm")
    }

    fn planner(rules: Vec<PlanRule>, store: Arc<InMemoryGoalStore>) -> GoalPlanner {
        GoalPlanner::new(
            rules,
            evaluator(),
            store,
            Arc::new(EventBus::default()),
            "my-sdm",
            "0.1.0",
            "ws-1",
        )
    }

    fn build_and_deploy() -> Vec<Goal> {
        let build = Goal::new("build", "0-code");
        let deploy = Goal::new("deploy", "1-staging").requires(&build);
        vec![build, deploy]
    }

    #[tokio::test]
    async fn plans_leaves_requested_and_internal_planned() {
        let store = Arc::new(InMemoryGoalStore::new());
        let rules = vec![PlanRule::new(
            "on-main",
            PushTest::IsBranch { pattern: "^main$".into() },
            build_and_deploy(),
        )];
        let planner = planner(rules, store);

        let set = planner.plan(&ctx("main")).await.unwrap().unwrap();
        assert_eq!(set.goals.len(), 2);
        let build = set.goal(&GoalRef::new("0-code", "build")).unwrap();
        let deploy = set.goal(&GoalRef::new("1-staging", "deploy")).unwrap();
        assert_eq!(build.state, GoalState::Requested);
        assert_eq!(deploy.state, GoalState::Planned);
        assert_eq!(build.fulfillment, Fulfillment::sdm("my-sdm"));
        assert!(!set.goal_set_id.is_empty());
    }

    #[tokio::test]
    async fn no_matching_rule_plans_nothing() {
        let store = Arc::new(InMemoryGoalStore::new());
        let rules = vec![PlanRule::new(
            "on-release",
            PushTest::IsBranch { pattern: "^release$".into() },
            build_and_deploy(),
        )];
        let planner = planner(rules, store);
        assert!(planner.plan(&ctx("main")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn additive_policy_merges_later_rules() {
        let store = Arc::new(InMemoryGoalStore::new());
        let rules = vec![
            PlanRule::new(
                "base",
                PushTest::IsBranch { pattern: ".*".into() },
                vec![Goal::new("build", "0-code")],
            ),
            PlanRule::new(
                "extra",
                PushTest::IsDefaultBranch,
                vec![Goal::new("docs", "0-code")],
            ),
        ];
        let planner = planner(rules, store);

        let set = planner.plan(&ctx("main")).await.unwrap().unwrap();
        assert_eq!(set.goals.len(), 2);
    }

    #[tokio::test]
    async fn replace_policy_stops_at_first_match() {
        let store = Arc::new(InMemoryGoalStore::new());
        let rules = vec![
            PlanRule::new(
                "base",
                PushTest::IsBranch { pattern: ".*".into() },
                vec![Goal::new("build", "0-code")],
            ),
            PlanRule::new(
                "extra",
                PushTest::IsDefaultBranch,
                vec![Goal::new("docs", "0-code")],
            ),
        ];
        let planner = planner(rules, store).with_merge_policy(MergePolicy::Replace);

        let set = planner.plan(&ctx("main")).await.unwrap().unwrap();
        assert_eq!(set.goals.len(), 1);
        assert_eq!(set.goals[0].unique_name, "build");
    }

    #[tokio::test]
    async fn pre_approval_leaf_waits() {
        let store = Arc::new(InMemoryGoalStore::new());
        let rules = vec![PlanRule::new(
            "gated",
            PushTest::IsDefaultBranch,
            vec![Goal::new("prod-deploy", "2-prod").with_pre_approval()],
        )];
        let planner = planner(rules, store);

        let set = planner.plan(&ctx("main")).await.unwrap().unwrap();
        assert_eq!(set.goals[0].state, GoalState::WaitingForPreApproval);
    }

    #[tokio::test]
    async fn cyclic_graph_is_rejected() {
        let store = Arc::new(InMemoryGoalStore::new());
        let a = Goal::new("a", "0-code").requires_ref(GoalRef::new("0-code", "b"));
        let b = Goal::new("b", "0-code").requires_ref(GoalRef::new("0-code", "a"));
        let rules = vec![PlanRule::new("cyclic", PushTest::IsDefaultBranch, vec![a, b])];
        let planner = planner(rules, store);

        let result = planner.plan(&ctx("main")).await;
        assert!(matches!(result, Err(PlanError::Cycle { .. })));
    }

    #[tokio::test]
    async fn unknown_precondition_is_rejected() {
        let store = Arc::new(InMemoryGoalStore::new());
        let orphan = Goal::new("deploy", "1-staging")
            .requires_ref(GoalRef::new("0-code", "nonexistent"));
        let rules = vec![PlanRule::new("broken", PushTest::IsDefaultBranch, vec![orphan])];
        let planner = planner(rules, store);

        let result = planner.plan(&ctx("main")).await;
        assert!(matches!(result, Err(PlanError::UnknownPrecondition { .. })));
    }

    #[tokio::test]
    async fn side_effect_goals_carry_foreign_fulfillment() {
        let store = Arc::new(InMemoryGoalStore::new());
        let rules = vec![PlanRule::new(
            "external",
            PushTest::IsDefaultBranch,
            vec![Goal::new("scan", "0-code").side_effect("security-sdm")],
        )];
        let planner = planner(rules, store);

        let set = planner.plan(&ctx("main")).await.unwrap().unwrap();
        assert_eq!(set.goals[0].fulfillment, Fulfillment::side_effect("security-sdm"));
    }

    #[tokio::test]
    async fn first_push_without_default_branch_does_not_plan() {
        let store = Arc::new(InMemoryGoalStore::new());
        let rules = vec![PlanRule::new(
            "all",
            PushTest::IsBranch { pattern: ".*".into() },
            vec![Goal::new("build", "0-code")],
        )];
        let planner = Arc::new(planner(rules, store.clone()));
        let handler = PushPlanningHandler::new(planner, "ws-1", "my-sdm");

        let repo = RepoRef::new("octo", "widgets", "gh-1");
        let mut push = Push::new(repo, "", "abc123");
        push.default_branch = None;
        let envelope = EventEnvelope::new("ws-1", DeliveryEvent::PushObserved { push });
        handler.handle(&envelope).await.unwrap();

        assert!(store.pending_goal_sets("my-sdm").await.unwrap().is_empty());
    }
}
