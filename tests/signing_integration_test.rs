//! Signature enforcement across planner and dispatcher.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::goal_event;
use stevedore::domain::models::{Goal, GoalState};
use stevedore::domain::ports::GoalStore;
use stevedore::infrastructure::store::InMemoryGoalStore;
use stevedore::services::dispatcher::{
    ExecutionResult, FulfillmentDispatcher, GoalExecutor, GoalInvocation, ImplementationMap,
};
use stevedore::services::event_bus::EventBus;
use stevedore::services::signing::{GoalSigner, GoalVerifier};
use stevedore::services::state_engine::GoalUpdater;

struct CountingExecutor {
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl GoalExecutor for CountingExecutor {
    async fn execute(&self, _invocation: &GoalInvocation) -> Result<ExecutionResult, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ExecutionResult::success())
    }
}

fn fixture(name: &str) -> String {
    let path = format!("{}/tests/fixtures/{name}", env!("CARGO_MANIFEST_DIR"));
    std::fs::read_to_string(path).expect("fixture should exist")
}

struct Setup {
    store: Arc<InMemoryGoalStore>,
    dispatcher: FulfillmentDispatcher,
    executor: Arc<CountingExecutor>,
    signer: GoalSigner,
}

async fn setup() -> Setup {
    let store = Arc::new(InMemoryGoalStore::new());
    let bus = Arc::new(EventBus::default());
    let updater = Arc::new(GoalUpdater::new(
        store.clone(),
        bus,
        "my-sdm",
        "0.1.0",
        "ws-1",
    ));

    let executor = Arc::new(CountingExecutor {
        calls: AtomicUsize::new(0),
    });
    let mut map = ImplementationMap::new();
    map.register(&Goal::new("build", "0-code"), executor.clone(), vec![]);

    let verifier = GoalVerifier::from_pems(&[fixture("verify-key.pem")]).unwrap();
    let dispatcher = FulfillmentDispatcher::new(
        store.clone(),
        updater,
        Arc::new(map),
        "my-sdm",
        "ws-1",
    )
    .with_verifier(Arc::new(verifier));

    Setup {
        store,
        dispatcher,
        executor,
        signer: GoalSigner::from_pkcs8_pem(&fixture("signing-key.pem")).unwrap(),
    }
}

async fn seed(store: &InMemoryGoalStore, goal: &stevedore::domain::models::GoalEvent) {
    store
        .store_goal_set(&stevedore::domain::models::GoalSet {
            goal_set_id: goal.goal_set_id.clone(),
            repo: goal.repo.clone(),
            sha: goal.sha.clone(),
            branch: goal.branch.clone(),
            goals: vec![],
            state: stevedore::domain::models::GoalSetState::Pending,
            created_at: 1_000,
        })
        .await
        .unwrap();
    store.update_goal(goal).await.unwrap();
}

#[tokio::test]
async fn properly_signed_goal_executes() {
    let setup = setup().await;
    let mut goal = goal_event("set-1", "build", GoalState::Requested);
    setup.signer.sign(&mut goal).unwrap();
    seed(&setup.store, &goal).await;

    setup
        .dispatcher
        .dispatch(&goal, uuid::Uuid::new_v4())
        .await
        .unwrap();

    assert_eq!(setup.executor.calls.load(Ordering::SeqCst), 1);
    let stored = setup
        .store
        .goal_event("set-1", &goal.key())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.state, GoalState::Success);
}

#[tokio::test]
async fn tampered_goal_is_rejected_with_invalid_signature() {
    let setup = setup().await;
    let mut goal = goal_event("set-1", "build", GoalState::Requested);
    setup.signer.sign(&mut goal).unwrap();
    // Alter the SHA after signing.
    goal.sha = "0000000000000000".to_string();
    seed(&setup.store, &goal).await;

    // Event processing still succeeds.
    setup
        .dispatcher
        .dispatch(&goal, uuid::Uuid::new_v4())
        .await
        .unwrap();

    assert_eq!(setup.executor.calls.load(Ordering::SeqCst), 0);
    let stored = setup
        .store
        .goal_event("set-1", &goal.key())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.state, GoalState::Failure);
    assert_eq!(stored.description, "Rejected because signature was invalid");
}

#[tokio::test]
async fn unsigned_goal_is_rejected_with_missing_signature() {
    let setup = setup().await;
    let goal = goal_event("set-1", "build", GoalState::Requested);
    seed(&setup.store, &goal).await;

    setup
        .dispatcher
        .dispatch(&goal, uuid::Uuid::new_v4())
        .await
        .unwrap();

    assert_eq!(setup.executor.calls.load(Ordering::SeqCst), 0);
    let stored = setup
        .store
        .goal_event("set-1", &goal.key())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.state, GoalState::Failure);
    assert_eq!(stored.description, "Rejected because signature was missing");
}

#[tokio::test]
async fn state_transitions_resign_the_event() {
    // A signed goal stays verifiable after the updater rewrites it.
    let store = Arc::new(InMemoryGoalStore::new());
    let bus = Arc::new(EventBus::default());
    let signer = Arc::new(GoalSigner::from_pkcs8_pem(&fixture("signing-key.pem")).unwrap());
    let verifier = GoalVerifier::from_pems(&[fixture("verify-key.pem")]).unwrap();
    let updater = GoalUpdater::new(store.clone(), bus, "my-sdm", "0.1.0", "ws-1")
        .with_signer(signer.clone());

    let mut goal = goal_event("set-1", "build", GoalState::Requested);
    signer.sign(&mut goal).unwrap();

    let updated = updater
        .transition(&goal, GoalState::InProcess, "Dispatcher", Default::default())
        .await
        .unwrap();
    assert!(verifier.verify(&updated).is_ok());
    assert_ne!(updated.signature, goal.signature);
}
