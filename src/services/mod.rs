//! Delivery services: the event-driven pipeline from push to completed
//! goal set.

pub mod cancellation;
pub mod completion;
pub mod dispatcher;
pub mod event_bus;
pub mod jobs;
pub mod machine;
pub mod planner;
pub mod progress;
pub mod scheduler;
pub mod signing;
pub mod state_engine;
pub mod worker;

pub use cancellation::{CancelError, CancelOutcome, GoalSetCancellation};
pub use completion::{GoalCompletionListener, GoalCompletionReactor};
pub use dispatcher::{
    ExecutionListener, ExecutionResult, FulfillmentDispatcher, GoalExecutor, GoalInvocation,
    ImplementationMap, ProgressLogFactory,
};
pub use event_bus::{
    DeliveryEvent, EventBus, EventBusConfig, EventEnvelope, EventHandler, EventId, EventLoop,
    HandlerError, SequenceNumber,
};
pub use jobs::{FulfillGoalParameters, JobTaskHandler, FULFILL_GOAL_TASK};
pub use machine::{DeliveryMachine, DeliveryMachineBuilder};
pub use planner::{GoalPlanner, GoalsSetListener, PlanError, PlanRule, PushPlanningHandler};
pub use progress::{EphemeralProgressLog, ProgressLog, WriteToAllProgressLog};
pub use push_test::{
    DeployEnabledPredicate, NamedPredicate, PredicateRegistry, PushTest, PushTestError,
    PushTestEvaluator,
};
pub use scheduler::{
    GoalScheduler, KubernetesScheduler, ScheduleError, ScheduleResult, SubprocessScheduler,
};
pub use signing::{canonical_form, GoalSigner, GoalVerifier, Rejection, SigningError};
pub use state_engine::{
    cancel_set, FulfillmentCallback, GoalUpdate, GoalUpdater, SuccessReactor, UpdateError,
};
pub use worker::{run_isolated_goal, WorkerEnv, WorkerError};
