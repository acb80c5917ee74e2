//! Goal domain model.
//!
//! A [`Goal`] is a declarative delivery step (a template); a [`GoalEvent`]
//! is the instance of a goal for one `(sha, goalSetId)` pair, carrying
//! state. Goal events within a set form a DAG via their preconditions.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::push::RepoRef;

/// State of a goal event in the delivery pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalState {
    /// Planned but upstream preconditions not yet met.
    Planned,
    /// Ready to be picked up by a dispatcher.
    Requested,
    /// Waiting for a human pre-approval before it may be requested.
    WaitingForPreApproval,
    /// Pre-approval granted; about to be requested.
    PreApproved,
    /// Waiting for a human approval of the produced result.
    WaitingForApproval,
    /// Approval granted; about to finish.
    Approved,
    /// An executor is working on the goal.
    InProcess,
    /// Goal completed successfully.
    Success,
    /// Goal failed during execution.
    Failure,
    /// Goal was skipped by the planner.
    Skipped,
    /// Executor stopped the goal deliberately without failing it.
    Stopped,
    /// Goal was canceled.
    Canceled,
}

impl Default for GoalState {
    fn default() -> Self {
        Self::Planned
    }
}

impl GoalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Requested => "requested",
            Self::WaitingForPreApproval => "waiting_for_pre_approval",
            Self::PreApproved => "pre_approved",
            Self::WaitingForApproval => "waiting_for_approval",
            Self::Approved => "approved",
            Self::InProcess => "in_process",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Skipped => "skipped",
            Self::Stopped => "stopped",
            Self::Canceled => "canceled",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "planned" => Some(Self::Planned),
            "requested" => Some(Self::Requested),
            "waiting_for_pre_approval" => Some(Self::WaitingForPreApproval),
            "pre_approved" => Some(Self::PreApproved),
            "waiting_for_approval" => Some(Self::WaitingForApproval),
            "approved" => Some(Self::Approved),
            "in_process" => Some(Self::InProcess),
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            "skipped" => Some(Self::Skipped),
            "stopped" => Some(Self::Stopped),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    /// Terminal states admit no transition except an explicit planner retry.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failure | Self::Canceled | Self::Skipped | Self::Stopped
        )
    }

    /// Valid transitions from this state.
    pub fn valid_transitions(&self) -> &'static [GoalState] {
        match self {
            Self::Planned => &[
                Self::Requested,
                Self::WaitingForPreApproval,
                Self::Skipped,
                Self::Canceled,
            ],
            Self::WaitingForPreApproval => &[Self::PreApproved, Self::Canceled],
            Self::PreApproved => &[Self::Requested, Self::Canceled],
            // Failure is reachable straight from requested: signature
            // rejections and scheduling failures happen before in_process.
            Self::Requested => &[Self::InProcess, Self::Failure, Self::Canceled],
            Self::InProcess => &[
                Self::Success,
                Self::Failure,
                Self::WaitingForApproval,
                Self::Stopped,
                Self::Canceled,
            ],
            Self::WaitingForApproval => &[Self::Approved, Self::Canceled],
            Self::Approved => &[Self::Success, Self::Failure, Self::Canceled],
            // Terminal: only the planner-initiated retry escapes, handled
            // separately by the state engine.
            Self::Success | Self::Failure | Self::Skipped | Self::Stopped | Self::Canceled => &[],
        }
    }

    pub fn can_transition_to(&self, next: Self) -> bool {
        self.valid_transitions().contains(&next)
    }
}

impl std::fmt::Display for GoalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// `(environment, uniqueName)` key identifying a goal within a set; also the
/// identity used by precondition edges.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalRef {
    pub environment: String,
    pub unique_name: String,
}

impl GoalRef {
    pub fn new(environment: impl Into<String>, unique_name: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            unique_name: unique_name.into(),
        }
    }
}

impl std::fmt::Display for GoalRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.environment, self.unique_name)
    }
}

/// Who executes a goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FulfillmentMethod {
    /// This process executes the goal.
    Sdm,
    /// Another registration executes the goal as a side effect.
    SideEffect,
    /// No fulfiller assigned.
    Other,
}

impl FulfillmentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sdm => "sdm",
            Self::SideEffect => "side-effect",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for FulfillmentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a goal event is fulfilled and by whom.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fulfillment {
    /// Registration (or fulfiller) name.
    pub name: String,
    pub method: FulfillmentMethod,
}

impl Fulfillment {
    pub fn sdm(registration: impl Into<String>) -> Self {
        Self {
            name: registration.into(),
            method: FulfillmentMethod::Sdm,
        }
    }

    pub fn side_effect(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            method: FulfillmentMethod::SideEffect,
        }
    }

    pub fn other() -> Self {
        Self {
            name: "n/a".to_string(),
            method: FulfillmentMethod::Other,
        }
    }
}

/// Provenance entry recorded on every goal-event mutation, and reused as the
/// approval/pre-approval record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    /// Registration that performed the mutation.
    pub registration: String,
    /// Registration version.
    pub version: String,
    /// Handler or actor name within the registration.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    /// Epoch milliseconds.
    pub ts: i64,
}

impl Provenance {
    pub fn now(
        registration: impl Into<String>,
        version: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            registration: registration.into(),
            version: version.into(),
            name: name.into(),
            user_id: None,
            channel_id: None,
            ts: Utc::now().timestamp_millis(),
        }
    }
}

/// A goal event: the instance of a [`Goal`] for one `(sha, goalSetId)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalEvent {
    pub goal_set_id: String,
    pub unique_name: String,
    pub environment: String,
    /// Human-readable display name.
    pub name: String,
    pub sha: String,
    pub branch: String,
    pub repo: RepoRef,
    pub state: GoalState,
    /// Epoch milliseconds of the last mutation; monotonic per goal.
    pub ts: i64,
    /// Mutation counter; the state engine always acts on the latest version.
    pub version: i64,
    pub description: String,
    #[serde(default)]
    pub pre_conditions: Vec<GoalRef>,
    pub fulfillment: Fulfillment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub external_urls: Vec<String>,
    #[serde(default)]
    pub provenance: Vec<Provenance>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default)]
    pub retry_feasible: bool,
    #[serde(default)]
    pub approval_required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<Provenance>,
    #[serde(default)]
    pub pre_approval_required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_approval: Option<Provenance>,
    /// Base64 RSA-SHA512 signature over the canonical serialization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl GoalEvent {
    /// The `(environment, uniqueName)` key of this goal within its set.
    pub fn key(&self) -> GoalRef {
        GoalRef::new(self.environment.clone(), self.unique_name.clone())
    }

    /// Whether `upstream` is a direct precondition of this goal.
    pub fn is_directly_dependent_on(&self, upstream: &GoalRef) -> bool {
        self.pre_conditions.contains(upstream)
    }
}

/// Description templates per state. Unset entries fall back to a default
/// derived from the display name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StateDescriptions {
    pub planned: Option<String>,
    pub requested: Option<String>,
    pub in_process: Option<String>,
    pub completed: Option<String>,
    pub failed: Option<String>,
    pub skipped: Option<String>,
    pub canceled: Option<String>,
    pub stopped: Option<String>,
    pub waiting_for_approval: Option<String>,
    pub waiting_for_pre_approval: Option<String>,
}

/// A declarative delivery step (template). Instantiated per push as a
/// [`GoalEvent`] by the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Goal {
    /// Stable identity of the goal across pushes.
    pub unique_name: String,
    /// Environment tag, e.g. `0-code`, `1-staging`, `2-prod`.
    pub environment: String,
    /// Human-readable display name.
    pub display_name: String,
    #[serde(default)]
    pub descriptions: StateDescriptions,
    #[serde(default)]
    pub pre_conditions: Vec<GoalRef>,
    #[serde(default)]
    pub retry_feasible: bool,
    #[serde(default)]
    pub approval_required: bool,
    #[serde(default)]
    pub pre_approval_required: bool,
    /// When set, the goal is fulfilled by another registration as a side
    /// effect instead of being executed here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side_effect_name: Option<String>,
    /// Candidacy accepts skipped preconditions (skip cascades downstream
    /// instead of wedging the set).
    #[serde(default)]
    pub accepts_skipped_preconditions: bool,
    /// Run this goal in an isolated worker rather than in-process.
    #[serde(default)]
    pub isolated: bool,
}

impl Goal {
    pub fn new(unique_name: impl Into<String>, environment: impl Into<String>) -> Self {
        let unique_name = unique_name.into();
        let display_name = unique_name.clone();
        Self {
            unique_name,
            environment: environment.into(),
            display_name,
            descriptions: StateDescriptions::default(),
            pre_conditions: Vec::new(),
            retry_feasible: false,
            approval_required: false,
            pre_approval_required: false,
            side_effect_name: None,
            accepts_skipped_preconditions: false,
            isolated: false,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Declare a precondition on another goal.
    pub fn requires(mut self, other: &Goal) -> Self {
        self.pre_conditions.push(other.key());
        self
    }

    pub fn requires_ref(mut self, key: GoalRef) -> Self {
        self.pre_conditions.push(key);
        self
    }

    pub fn retryable(mut self) -> Self {
        self.retry_feasible = true;
        self
    }

    pub fn with_approval(mut self) -> Self {
        self.approval_required = true;
        self
    }

    pub fn with_pre_approval(mut self) -> Self {
        self.pre_approval_required = true;
        self
    }

    pub fn side_effect(mut self, fulfiller: impl Into<String>) -> Self {
        self.side_effect_name = Some(fulfiller.into());
        self
    }

    pub fn accepting_skipped(mut self) -> Self {
        self.accepts_skipped_preconditions = true;
        self
    }

    pub fn isolate(mut self) -> Self {
        self.isolated = true;
        self
    }

    pub fn key(&self) -> GoalRef {
        GoalRef::new(self.environment.clone(), self.unique_name.clone())
    }

    /// Description for a goal event entering `state`.
    pub fn description_for(&self, state: GoalState) -> String {
        let template = match state {
            GoalState::Planned => self.descriptions.planned.as_deref(),
            GoalState::Requested | GoalState::PreApproved => {
                self.descriptions.requested.as_deref()
            }
            GoalState::InProcess | GoalState::Approved => self.descriptions.in_process.as_deref(),
            GoalState::Success => self.descriptions.completed.as_deref(),
            GoalState::Failure => self.descriptions.failed.as_deref(),
            GoalState::Skipped => self.descriptions.skipped.as_deref(),
            GoalState::Canceled => self.descriptions.canceled.as_deref(),
            GoalState::Stopped => self.descriptions.stopped.as_deref(),
            GoalState::WaitingForApproval => self.descriptions.waiting_for_approval.as_deref(),
            GoalState::WaitingForPreApproval => {
                self.descriptions.waiting_for_pre_approval.as_deref()
            }
        };
        template.map_or_else(|| default_description(&self.display_name, state), String::from)
    }
}

fn default_description(display_name: &str, state: GoalState) -> String {
    match state {
        GoalState::Planned => format!("Planned: {display_name}"),
        GoalState::Requested => format!("Ready: {display_name}"),
        GoalState::WaitingForPreApproval => format!("Start requires approval: {display_name}"),
        GoalState::PreApproved => format!("Start approved: {display_name}"),
        GoalState::WaitingForApproval => format!("Approval required: {display_name}"),
        GoalState::Approved => format!("Approved: {display_name}"),
        GoalState::InProcess => format!("Working: {display_name}"),
        GoalState::Success => format!("Complete: {display_name}"),
        GoalState::Failure => format!("Failed: {display_name}"),
        GoalState::Skipped => format!("Skipped: {display_name}"),
        GoalState::Stopped => format!("Stopped: {display_name}"),
        GoalState::Canceled => format!("Canceled: {display_name}"),
    }
}

/// Derived state of a goal set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalSetState {
    Pending,
    Success,
    Failure,
    Canceled,
}

impl std::fmt::Display for GoalSetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

/// All goal events planned for one SHA, sharing a `goalSetId`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalSet {
    pub goal_set_id: String,
    pub repo: RepoRef,
    pub sha: String,
    pub branch: String,
    pub goals: Vec<GoalEvent>,
    /// Persisted set state. A cache only: [`GoalSet::derived_state`] is
    /// authoritative whenever the two disagree.
    pub state: GoalSetState,
    pub created_at: i64,
}

impl GoalSet {
    /// Compute the set state from member goal states: pending while any goal
    /// is non-terminal, success when every goal succeeded, canceled when any
    /// goal was canceled, failure otherwise.
    pub fn derived_state(&self) -> GoalSetState {
        if self.goals.iter().any(|g| !g.state.is_terminal()) {
            GoalSetState::Pending
        } else if self.goals.iter().all(|g| g.state == GoalState::Success) {
            GoalSetState::Success
        } else if self.goals.iter().any(|g| g.state == GoalState::Canceled) {
            GoalSetState::Canceled
        } else {
            GoalSetState::Failure
        }
    }

    pub fn goal(&self, key: &GoalRef) -> Option<&GoalEvent> {
        self.goals.iter().find(|g| &g.key() == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_event(unique_name: &str, state: GoalState) -> GoalEvent {
        GoalEvent {
            goal_set_id: "set-1".to_string(),
            unique_name: unique_name.to_string(),
            environment: "0-code".to_string(),
            name: unique_name.to_string(),
            sha: "abc123".to_string(),
            branch: "main".to_string(),
            repo: RepoRef::new("octo", "widgets", "gh-1"),
            state,
            ts: 1_000,
            version: 1,
            description: String::new(),
            pre_conditions: Vec::new(),
            fulfillment: Fulfillment::sdm("my-sdm"),
            data: None,
            url: None,
            external_urls: Vec::new(),
            provenance: Vec::new(),
            phase: None,
            retry_feasible: false,
            approval_required: false,
            approval: None,
            pre_approval_required: false,
            pre_approval: None,
            signature: None,
        }
    }

    fn test_set(goals: Vec<GoalEvent>) -> GoalSet {
        GoalSet {
            goal_set_id: "set-1".to_string(),
            repo: RepoRef::new("octo", "widgets", "gh-1"),
            sha: "abc123".to_string(),
            branch: "main".to_string(),
            goals,
            state: GoalSetState::Pending,
            created_at: 1_000,
        }
    }

    #[test]
    fn terminal_states() {
        assert!(GoalState::Success.is_terminal());
        assert!(GoalState::Failure.is_terminal());
        assert!(GoalState::Canceled.is_terminal());
        assert!(GoalState::Skipped.is_terminal());
        assert!(GoalState::Stopped.is_terminal());
        assert!(!GoalState::Planned.is_terminal());
        assert!(!GoalState::InProcess.is_terminal());
    }

    #[test]
    fn transition_table_matches_lifecycle() {
        assert!(GoalState::Planned.can_transition_to(GoalState::Requested));
        assert!(GoalState::Planned.can_transition_to(GoalState::WaitingForPreApproval));
        assert!(GoalState::WaitingForPreApproval.can_transition_to(GoalState::PreApproved));
        assert!(GoalState::PreApproved.can_transition_to(GoalState::Requested));
        assert!(GoalState::Requested.can_transition_to(GoalState::InProcess));
        assert!(GoalState::InProcess.can_transition_to(GoalState::Success));
        assert!(GoalState::InProcess.can_transition_to(GoalState::WaitingForApproval));
        assert!(GoalState::WaitingForApproval.can_transition_to(GoalState::Approved));
        assert!(GoalState::Approved.can_transition_to(GoalState::Success));

        // No transition out of a terminal state through the ordinary table.
        assert!(!GoalState::Success.can_transition_to(GoalState::Requested));
        assert!(!GoalState::Failure.can_transition_to(GoalState::Requested));

        // Every non-terminal state may be canceled.
        for state in [
            GoalState::Planned,
            GoalState::Requested,
            GoalState::WaitingForPreApproval,
            GoalState::PreApproved,
            GoalState::WaitingForApproval,
            GoalState::Approved,
            GoalState::InProcess,
        ] {
            assert!(state.can_transition_to(GoalState::Canceled), "{state}");
        }
    }

    #[test]
    fn goal_builder_wires_preconditions() {
        let build = Goal::new("build", "0-code");
        let deploy = Goal::new("deploy", "1-staging").requires(&build).retryable();
        assert_eq!(deploy.pre_conditions, vec![build.key()]);
        assert!(deploy.retry_feasible);
    }

    #[test]
    fn goal_ref_display_is_env_slash_name() {
        assert_eq!(GoalRef::new("1-staging", "deploy").to_string(), "1-staging/deploy");
    }

    #[test]
    fn derived_set_state() {
        let set = test_set(vec![
            test_event("build", GoalState::Success),
            test_event("deploy", GoalState::Planned),
        ]);
        assert_eq!(set.derived_state(), GoalSetState::Pending);

        let set = test_set(vec![
            test_event("build", GoalState::Success),
            test_event("deploy", GoalState::Success),
        ]);
        assert_eq!(set.derived_state(), GoalSetState::Success);

        let set = test_set(vec![
            test_event("build", GoalState::Success),
            test_event("deploy", GoalState::Canceled),
        ]);
        assert_eq!(set.derived_state(), GoalSetState::Canceled);

        let set = test_set(vec![
            test_event("build", GoalState::Success),
            test_event("deploy", GoalState::Failure),
        ]);
        assert_eq!(set.derived_state(), GoalSetState::Failure);
    }

    #[test]
    fn direct_dependency_check_uses_env_and_name() {
        let mut deploy = test_event("deploy", GoalState::Planned);
        deploy.pre_conditions = vec![GoalRef::new("0-code", "build")];
        assert!(deploy.is_directly_dependent_on(&GoalRef::new("0-code", "build")));
        assert!(!deploy.is_directly_dependent_on(&GoalRef::new("1-staging", "build")));
    }

    #[test]
    fn state_serialization_round_trip() {
        let json = serde_json::to_string(&GoalState::WaitingForPreApproval).unwrap();
        assert_eq!(json, "\"waiting_for_pre_approval\"");
        let state: GoalState = serde_json::from_str(&json).unwrap();
        assert_eq!(state, GoalState::WaitingForPreApproval);
    }

    #[test]
    fn goal_event_wire_format_is_camel_case() {
        let event = test_event("build", GoalState::Requested);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"goalSetId\""));
        assert!(json.contains("\"uniqueName\""));
        assert!(json.contains("\"preConditions\""));
        assert!(json.contains("\"retryFeasible\""));
    }

    #[test]
    fn description_defaults_derive_from_display_name() {
        let goal = Goal::new("build", "0-code").with_display_name("build widgets");
        assert_eq!(goal.description_for(GoalState::InProcess), "Working: build widgets");
        assert_eq!(goal.description_for(GoalState::Failure), "Failed: build widgets");
    }
}
