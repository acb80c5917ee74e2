//! End-to-end pipeline tests: push → plan → dispatch → state engine →
//! completion, against the in-memory store.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{test_config, test_push, RecordingStatus, StaticProject};
use stevedore::domain::models::{Goal, GoalRef, GoalSetState, GoalState};
use stevedore::domain::ports::GoalStore;
use stevedore::infrastructure::store::InMemoryGoalStore;
use stevedore::services::dispatcher::{ExecutionResult, GoalExecutor, GoalInvocation};
use stevedore::services::planner::PlanRule;
use stevedore::services::push_test::PushTest;
use stevedore::DeliveryMachine;

/// Executor succeeding unconditionally while counting invocations.
struct CountingExecutor {
    calls: AtomicUsize,
    result: fn() -> Result<ExecutionResult, String>,
}

impl CountingExecutor {
    fn succeeding() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            result: || Ok(ExecutionResult::success()),
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            result: || Ok(ExecutionResult::failure("tests failed")),
        })
    }
}

#[async_trait::async_trait]
impl GoalExecutor for CountingExecutor {
    async fn execute(&self, _invocation: &GoalInvocation) -> Result<ExecutionResult, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.result)()
    }
}

fn on_main_rule(goals: Vec<Goal>) -> PlanRule {
    PlanRule::new(
        "on-main",
        PushTest::IsBranch {
            pattern: "^main$".to_string(),
        },
        goals,
    )
}

#[tokio::test]
async fn leaf_goal_runs_to_success_and_publishes_success_status() {
    let store = Arc::new(InMemoryGoalStore::new());
    let status = RecordingStatus::new();
    let executor = CountingExecutor::succeeding();

    let build = Goal::new("build", "0-code");
    let machine = DeliveryMachine::builder(
        test_config(),
        store.clone(),
        Arc::new(StaticProject::empty()),
    )
    .with_status_publisher(status.clone())
    .with_rule(on_main_rule(vec![build.clone()]))
    .with_implementation(&build, executor.clone(), vec![])
    .build()
    .unwrap();

    machine.observe_push(test_push());
    machine.drain().await;

    assert_eq!(executor.calls.load(Ordering::SeqCst), 1);

    let sets = store.pending_goal_sets("my-sdm").await.unwrap();
    assert!(sets.is_empty(), "set should no longer be pending");

    // Planner published pending, completion reactor published success.
    let states = status.states();
    assert_eq!(states.first().map(String::as_str), Some("pending"));
    assert_eq!(states.last().map(String::as_str), Some("success"));
}

#[tokio::test]
async fn dependency_chain_executes_in_precondition_order() {
    let store = Arc::new(InMemoryGoalStore::new());
    let executor = CountingExecutor::succeeding();

    let build = Goal::new("build", "0-code");
    let test = Goal::new("test", "0-code").requires(&build);
    let deploy = Goal::new("deploy", "1-staging").requires(&test);

    let machine = DeliveryMachine::builder(
        test_config(),
        store.clone(),
        Arc::new(StaticProject::empty()),
    )
    .with_rule(on_main_rule(vec![build.clone(), test.clone(), deploy.clone()]))
    .with_implementation(&build, executor.clone(), vec![])
    .with_implementation(&test, executor.clone(), vec![])
    .with_implementation(&deploy, executor.clone(), vec![])
    .build()
    .unwrap();

    machine.observe_push(test_push());
    machine.drain().await;

    assert_eq!(executor.calls.load(Ordering::SeqCst), 3);

    let sets = store.pending_goal_sets("my-sdm").await.unwrap();
    assert!(sets.is_empty());
}

#[tokio::test]
async fn failing_goal_blocks_dependents_and_publishes_failure() {
    let store = Arc::new(InMemoryGoalStore::new());
    let status = RecordingStatus::new();
    let failing = CountingExecutor::failing();
    let downstream = CountingExecutor::succeeding();

    let build = Goal::new("build", "0-code");
    let deploy = Goal::new("deploy", "1-staging").requires(&build);

    let machine = DeliveryMachine::builder(
        test_config(),
        store.clone(),
        Arc::new(StaticProject::empty()),
    )
    .with_status_publisher(status.clone())
    .with_rule(on_main_rule(vec![build.clone(), deploy.clone()]))
    .with_implementation(&build, failing.clone(), vec![])
    .with_implementation(&deploy, downstream.clone(), vec![])
    .build()
    .unwrap();

    machine.observe_push(test_push());
    machine.drain().await;

    assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
    assert_eq!(downstream.calls.load(Ordering::SeqCst), 0);

    let set = &store.pending_goal_sets("my-sdm").await.unwrap()[0];
    let build_goal = set.goal(&GoalRef::new("0-code", "build")).unwrap();
    let deploy_goal = set.goal(&GoalRef::new("1-staging", "deploy")).unwrap();
    assert_eq!(build_goal.state, GoalState::Failure);
    assert_eq!(deploy_goal.state, GoalState::Planned);

    assert!(status.states().contains(&"failure".to_string()));
    assert!(!status.states().contains(&"success".to_string()));
}

#[tokio::test]
async fn canceled_set_stops_downstream_goals() {
    // Chain A -> B; A succeeds, the set is canceled before B is requested.
    use stevedore::services::cancellation::GoalSetCancellation;
    use stevedore::services::completion::GoalCompletionReactor;
    use stevedore::services::event_bus::EventBus;
    use stevedore::services::planner::GoalPlanner;
    use stevedore::services::push_test::PushTestEvaluator;
    use stevedore::services::state_engine::{GoalUpdater, SuccessReactor};
    use stevedore::domain::models::PushContext;
    use stevedore::domain::ports::ConfiguredProviders;

    let store = Arc::new(InMemoryGoalStore::new());
    let bus = Arc::new(EventBus::default());
    let status = RecordingStatus::new();
    let updater = Arc::new(GoalUpdater::new(
        store.clone(),
        bus.clone(),
        "my-sdm",
        "0.1.0",
        "ws-1",
    ));

    let a = Goal::new("a", "0-code");
    let b = Goal::new("b", "0-code").requires(&a);
    let evaluator = Arc::new(PushTestEvaluator::new(
        Arc::new(StaticProject::empty()),
        Arc::new(ConfiguredProviders::default()),
    ));
    let planner = GoalPlanner::new(
        vec![on_main_rule(vec![a.clone(), b.clone()])],
        evaluator,
        store.clone(),
        bus.clone(),
        "my-sdm",
        "0.1.0",
        "ws-1",
    );

    let ctx = PushContext::new(test_push(), "ws-1", "my-sdm");
    let set = planner.plan(&ctx).await.unwrap().unwrap();

    // A succeeds.
    let a_event = set.goal(&a.key()).unwrap();
    let a_in_process = updater
        .transition(a_event, GoalState::InProcess, "test", Default::default())
        .await
        .unwrap();
    let a_success = updater
        .transition(&a_in_process, GoalState::Success, "test", Default::default())
        .await
        .unwrap();

    // The user cancels the set before B is requested.
    let cancellation = GoalSetCancellation::new(store.clone(), updater.clone());
    cancellation.cancel(&set.goal_set_id).await.unwrap();

    // The late success reaction finds a canceled set and does nothing.
    let reactor = SuccessReactor::new(store.clone(), updater.clone());
    use stevedore::services::event_bus::{DeliveryEvent, EventEnvelope, EventHandler};
    reactor
        .handle(&EventEnvelope::new(
            "ws-1",
            DeliveryEvent::GoalSucceeded {
                goal: a_success.clone(),
            },
        ))
        .await
        .unwrap();

    let stored = store.goal_set_by_id(&set.goal_set_id).await.unwrap().unwrap();
    let b_goal = stored.goal(&b.key()).unwrap();
    assert_eq!(b_goal.state, GoalState::Canceled);
    assert_eq!(stored.derived_state(), GoalSetState::Canceled);

    // The completion reactor must not report set success.
    let completion = GoalCompletionReactor::new(store.clone(), "my-sdm")
        .with_status_publisher(status.clone());
    completion
        .handle(&EventEnvelope::new(
            "ws-1",
            DeliveryEvent::GoalCompleted {
                goal: b_goal.clone(),
            },
        ))
        .await
        .unwrap();
    assert!(!status.states().contains(&"success".to_string()));
}

#[tokio::test]
async fn retry_feasible_goal_is_rerequested_after_upstream_success() {
    // X (retryable, depends on build) fails once; a later success of
    // build re-requests and re-executes it.
    let store = Arc::new(InMemoryGoalStore::new());

    struct FailOnce {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl GoalExecutor for FailOnce {
        async fn execute(&self, _invocation: &GoalInvocation) -> Result<ExecutionResult, String> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(ExecutionResult::failure("flaky"))
            } else {
                Ok(ExecutionResult::success())
            }
        }
    }

    let build = Goal::new("build", "0-code");
    let flaky = Goal::new("integration-test", "0-code")
        .requires(&build)
        .retryable();
    let build_executor = CountingExecutor::succeeding();
    let flaky_executor = Arc::new(FailOnce {
        calls: AtomicUsize::new(0),
    });

    let machine = DeliveryMachine::builder(
        test_config(),
        store.clone(),
        Arc::new(StaticProject::empty()),
    )
    .with_rule(on_main_rule(vec![build.clone(), flaky.clone()]))
    .with_implementation(&build, build_executor, vec![])
    .with_implementation(&flaky, flaky_executor.clone(), vec![])
    .build()
    .unwrap();

    machine.observe_push(test_push());
    machine.drain().await;

    // First round: build success, flaky failure.
    let goals = store
        .goals_for_sha(&common::test_repo(), "abc123def456")
        .await
        .unwrap();
    let flaky_goal = goals
        .iter()
        .find(|g| g.unique_name == "integration-test")
        .unwrap()
        .clone();
    assert_eq!(flaky_goal.state, GoalState::Failure);

    // A later upstream success re-evaluates candidacy.
    let build_goal = goals
        .iter()
        .find(|g| g.unique_name == "build")
        .unwrap()
        .clone();
    machine.bus().publish(stevedore::services::event_bus::EventEnvelope::new(
        "ws-1",
        stevedore::services::event_bus::DeliveryEvent::GoalSucceeded { goal: build_goal },
    ));
    machine.drain().await;

    assert_eq!(flaky_executor.calls.load(Ordering::SeqCst), 2);
    let set = store
        .goal_set_by_id(&flaky_goal.goal_set_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(set.goal(&flaky.key()).unwrap().state, GoalState::Success);
}

#[tokio::test]
async fn pre_approval_gate_holds_goal_until_approved() {
    let store = Arc::new(InMemoryGoalStore::new());
    let executor = CountingExecutor::succeeding();

    let deploy = Goal::new("prod-deploy", "2-prod").with_pre_approval();
    let machine = DeliveryMachine::builder(
        test_config(),
        store.clone(),
        Arc::new(StaticProject::empty()),
    )
    .with_rule(on_main_rule(vec![deploy.clone()]))
    .with_implementation(&deploy, executor.clone(), vec![])
    .build()
    .unwrap();

    machine.observe_push(test_push());
    machine.drain().await;

    // Held at the gate; nothing executed.
    assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    let set = &store.pending_goal_sets("my-sdm").await.unwrap()[0];
    let held = set.goal(&deploy.key()).unwrap().clone();
    assert_eq!(held.state, GoalState::WaitingForPreApproval);

    // Pre-approval releases it through requested into execution.
    use stevedore::services::state_engine::GoalUpdater;
    let updater = GoalUpdater::new(store.clone(), machine.bus(), "my-sdm", "0.1.0", "ws-1");
    updater.pre_approve(&held, "alex").await.unwrap();
    machine.drain().await;

    assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
}
