//! Delivery machine assembly.
//!
//! One explicit context value wires the whole pipeline (evaluator,
//! planner, state engine, dispatcher, completion reactor, cancellation)
//! against a configuration and a set of ports. Both the daemon entrypoint
//! and the isolated worker build from here; nothing reaches for process
//! globals.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::{broadcast, Mutex};

use crate::domain::models::{Config, Goal, GoalRef, Push, SchedulerMode};
use crate::domain::ports::{
    ConfiguredProviders, GoalStore, KubeClient, PreferencesStore, ProjectReader,
    ResourceProviderRegistry, StatusPublisher,
};
use crate::services::cancellation::GoalSetCancellation;
use crate::services::completion::{GoalCompletionListener, GoalCompletionReactor};
use crate::services::dispatcher::{
    ExecutionListener, FulfillmentDispatcher, GoalExecutor, ImplementationMap, ProgressLogFactory,
};
use crate::services::event_bus::{DeliveryEvent, EventBus, EventEnvelope, EventLoop};
use crate::services::jobs::JobTaskHandler;
use crate::services::planner::{GoalPlanner, GoalsSetListener, PlanRule, PushPlanningHandler};
use crate::services::push_test::{
    DeployEnabledPredicate, NamedPredicate, PredicateRegistry, PushTestEvaluator,
};
use crate::services::scheduler::{GoalScheduler, KubernetesScheduler, SubprocessScheduler};
use crate::services::signing::{decode_rsa_public_pem, GoalSigner, GoalVerifier};
use crate::services::state_engine::{FulfillmentCallback, GoalUpdater, SuccessReactor};
use crate::services::worker::{run_isolated_goal, WorkerEnv};

/// Builder for a [`DeliveryMachine`].
pub struct DeliveryMachineBuilder {
    config: Config,
    store: Arc<dyn GoalStore>,
    project: Arc<dyn ProjectReader>,
    status: Option<Arc<dyn StatusPublisher>>,
    kube: Option<Arc<dyn KubeClient>>,
    preferences: Option<Arc<dyn PreferencesStore>>,
    rules: Vec<PlanRule>,
    implementations: ImplementationMap,
    predicates: PredicateRegistry,
    goals_set_listeners: Vec<Arc<dyn GoalsSetListener>>,
    completion_listeners: Vec<Arc<dyn GoalCompletionListener>>,
    callbacks: Vec<(GoalRef, Arc<dyn FulfillmentCallback>)>,
    skip_cascade: Vec<GoalRef>,
    log_factory: Option<Arc<dyn ProgressLogFactory>>,
}

impl DeliveryMachineBuilder {
    pub fn new(
        config: Config,
        store: Arc<dyn GoalStore>,
        project: Arc<dyn ProjectReader>,
    ) -> Self {
        Self {
            config,
            store,
            project,
            status: None,
            kube: None,
            preferences: None,
            rules: Vec::new(),
            implementations: ImplementationMap::new(),
            predicates: PredicateRegistry::new(),
            goals_set_listeners: Vec::new(),
            completion_listeners: Vec::new(),
            callbacks: Vec::new(),
            skip_cascade: Vec::new(),
            log_factory: None,
        }
    }

    pub fn with_status_publisher(mut self, status: Arc<dyn StatusPublisher>) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    pub fn with_preferences(mut self, preferences: Arc<dyn PreferencesStore>) -> Self {
        self.preferences = Some(preferences);
        self
    }

    pub fn with_rule(mut self, rule: PlanRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Register the implementation for a goal template.
    pub fn with_implementation(
        mut self,
        goal: &Goal,
        executor: Arc<dyn GoalExecutor>,
        listeners: Vec<Arc<dyn ExecutionListener>>,
    ) -> Self {
        self.implementations.register(goal, executor, listeners);
        if goal.accepts_skipped_preconditions {
            self.skip_cascade.push(goal.key());
        }
        self
    }

    pub fn with_predicate(mut self, name: &str, predicate: Arc<dyn NamedPredicate>) -> Self {
        self.predicates.register(name, predicate);
        self
    }

    pub fn with_goals_set_listener(mut self, listener: Arc<dyn GoalsSetListener>) -> Self {
        self.goals_set_listeners.push(listener);
        self
    }

    pub fn with_completion_listener(
        mut self,
        listener: Arc<dyn GoalCompletionListener>,
    ) -> Self {
        self.completion_listeners.push(listener);
        self
    }

    pub fn with_fulfillment_callback(
        mut self,
        key: GoalRef,
        callback: Arc<dyn FulfillmentCallback>,
    ) -> Self {
        self.callbacks.push((key, callback));
        self
    }

    pub fn with_log_factory(mut self, factory: Arc<dyn ProgressLogFactory>) -> Self {
        self.log_factory = Some(factory);
        self
    }

    fn build_signer(config: &Config) -> Result<Option<Arc<GoalSigner>>> {
        let (true, Some(path)) = (config.signing.enabled, &config.signing.signing_key_path)
        else {
            return Ok(None);
        };
        let pem = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read signing key {}", path.display()))?;
        Ok(Some(Arc::new(GoalSigner::from_pkcs8_pem(&pem)?)))
    }

    fn build_verifier(
        config: &Config,
        signer: Option<&Arc<GoalSigner>>,
    ) -> Result<Option<Arc<GoalVerifier>>> {
        if !config.signing.enabled {
            return Ok(None);
        }
        let mut ders = Vec::new();
        if let Some(signer) = signer {
            ders.push(signer.public_key_der());
        }
        for path in &config.signing.verification_key_paths {
            let pem = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read verification key {}", path.display()))?;
            ders.extend(decode_rsa_public_pem(&pem)?);
        }
        Ok(Some(Arc::new(GoalVerifier::from_ders(ders)?)))
    }

    /// Assemble the machine. Fails on unreadable signing keys or a
    /// scheduler mode whose collaborator is missing.
    pub fn build(mut self) -> Result<DeliveryMachine> {
        let config = self.config;
        let bus = Arc::new(EventBus::default());
        // Subscribe before anything can publish so the machine's own
        // receiver observes every event.
        let receiver = bus.subscribe();

        let signer = Self::build_signer(&config)?;
        let verifier = Self::build_verifier(&config, signer.as_ref())?;

        let providers: Arc<dyn ResourceProviderRegistry> = Arc::new(ConfiguredProviders::new(
            config.resource_providers.clone(),
        ));

        if let Some(ref preferences) = self.preferences {
            self.predicates.register(
                DeployEnabledPredicate::NAME,
                Arc::new(DeployEnabledPredicate::new(preferences.clone())),
            );
        }

        let evaluator = Arc::new(
            PushTestEvaluator::new(self.project.clone(), providers)
                .with_store(self.store.clone())
                .with_registry(self.predicates),
        );

        let mut updater = GoalUpdater::new(
            self.store.clone(),
            bus.clone(),
            config.registration.clone(),
            config.version.clone(),
            config.workspace_id.clone(),
        );
        if let Some(ref signer) = signer {
            updater = updater.with_signer(signer.clone());
        }
        let updater = Arc::new(updater);

        let mut planner = GoalPlanner::new(
            self.rules,
            evaluator,
            self.store.clone(),
            bus.clone(),
            config.registration.clone(),
            config.version.clone(),
            config.workspace_id.clone(),
        )
        .with_merge_policy(config.merge_policy);
        if let Some(ref signer) = signer {
            planner = planner.with_signer(signer.clone());
        }
        if let Some(ref status) = self.status {
            planner = planner.with_status_publisher(status.clone());
        }
        for listener in self.goals_set_listeners {
            planner = planner.with_listener(listener);
        }
        let planner = Arc::new(planner);

        let mut success_reactor = SuccessReactor::new(self.store.clone(), updater.clone());
        for key in self.skip_cascade {
            success_reactor = success_reactor.accept_skipped_for(key);
        }
        for (key, callback) in self.callbacks {
            success_reactor = success_reactor.with_callback(key, callback);
        }

        let mut subprocess_scheduler = None;
        let mut kubernetes_scheduler = None;
        let mut schedulers: Vec<Arc<dyn GoalScheduler>> = Vec::new();
        match config.scheduling.mode {
            SchedulerMode::InProcess => {}
            SchedulerMode::Subprocess => {
                let scheduler = Arc::new(SubprocessScheduler::current_exe()?);
                subprocess_scheduler = Some(scheduler.clone());
                schedulers.push(scheduler);
            }
            SchedulerMode::Kubernetes => {
                let kube = self
                    .kube
                    .clone()
                    .context("Kubernetes scheduling requires a cluster client")?;
                let scheduler = KubernetesScheduler::from_config(&config.kubernetes, kube)
                    .context("Kubernetes scheduling requires a deployment name")?;
                let scheduler = Arc::new(scheduler);
                kubernetes_scheduler = Some(scheduler.clone());
                schedulers.push(scheduler);
            }
        }

        let mut dispatcher = FulfillmentDispatcher::new(
            self.store.clone(),
            updater.clone(),
            Arc::new(self.implementations),
            config.registration.clone(),
            config.workspace_id.clone(),
        );
        if let Some(ref verifier) = verifier {
            dispatcher = dispatcher.with_verifier(verifier.clone());
        }
        if let Some(name) = config.workspace_name.clone() {
            dispatcher = dispatcher.with_workspace_name(name);
        }
        if let Some(factory) = self.log_factory {
            dispatcher = dispatcher.with_log_factory(factory);
        }
        for scheduler in &schedulers {
            dispatcher = dispatcher.with_scheduler(scheduler.clone());
        }
        let dispatcher = Arc::new(dispatcher);

        let mut completion_reactor =
            GoalCompletionReactor::new(self.store.clone(), config.registration.clone());
        if let Some(ref status) = self.status {
            completion_reactor = completion_reactor.with_status_publisher(status.clone());
        }
        for listener in self.completion_listeners {
            completion_reactor = completion_reactor.with_listener(listener);
        }

        let cancellation = Arc::new(GoalSetCancellation::new(
            self.store.clone(),
            updater.clone(),
        ));

        let mut event_loop = EventLoop::new(bus.clone());
        event_loop.register(Arc::new(PushPlanningHandler::new(
            planner.clone(),
            config.workspace_id.clone(),
            config.registration.clone(),
        )));
        event_loop.register(dispatcher.clone());
        event_loop.register(Arc::new(success_reactor));
        event_loop.register(Arc::new(completion_reactor));
        event_loop.register(Arc::new(JobTaskHandler::new(
            self.store.clone(),
            dispatcher.clone(),
        )));

        Ok(DeliveryMachine {
            config,
            bus,
            receiver: Mutex::new(receiver),
            event_loop: Arc::new(event_loop),
            store: self.store,
            planner,
            dispatcher,
            cancellation,
            subprocess_scheduler,
            kubernetes_scheduler,
        })
    }
}

/// The assembled delivery machine.
pub struct DeliveryMachine {
    config: Config,
    bus: Arc<EventBus>,
    receiver: Mutex<broadcast::Receiver<EventEnvelope>>,
    event_loop: Arc<EventLoop>,
    store: Arc<dyn GoalStore>,
    planner: Arc<GoalPlanner>,
    dispatcher: Arc<FulfillmentDispatcher>,
    cancellation: Arc<GoalSetCancellation>,
    subprocess_scheduler: Option<Arc<SubprocessScheduler>>,
    kubernetes_scheduler: Option<Arc<KubernetesScheduler>>,
}

impl DeliveryMachine {
    pub fn builder(
        config: Config,
        store: Arc<dyn GoalStore>,
        project: Arc<dyn ProjectReader>,
    ) -> DeliveryMachineBuilder {
        DeliveryMachineBuilder::new(config, store, project)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    pub fn store(&self) -> Arc<dyn GoalStore> {
        self.store.clone()
    }

    pub fn planner(&self) -> Arc<GoalPlanner> {
        self.planner.clone()
    }

    pub fn cancellation(&self) -> Arc<GoalSetCancellation> {
        self.cancellation.clone()
    }

    pub fn subprocess_scheduler(&self) -> Option<Arc<SubprocessScheduler>> {
        self.subprocess_scheduler.clone()
    }

    /// Inject an observed push into the pipeline.
    pub fn observe_push(&self, push: Push) {
        self.bus.publish(EventEnvelope::new(
            self.config.workspace_id.clone(),
            DeliveryEvent::PushObserved { push },
        ));
    }

    /// Run the event loop until the process shuts down. Starts the job
    /// cleanup sweep when this instance is the Kubernetes master.
    pub async fn run(&self) {
        let cleanup = self
            .kubernetes_scheduler
            .clone()
            .map(KubernetesScheduler::spawn_cleanup);

        tracing::info!(
            registration = %self.config.registration,
            workspace = %self.config.workspace_id,
            "Delivery machine running"
        );

        let mut receiver = self.receiver.lock().await;
        loop {
            match receiver.recv().await {
                Ok(event) => self.event_loop.dispatch(&event).await,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Delivery machine lagged behind the bus");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }

        if let Some(handle) = cleanup {
            handle.abort();
        }
    }

    /// Process every queued event, including events cascaded while
    /// draining, then return. Used by tests and one-shot tools.
    pub async fn drain(&self) {
        let mut receiver = self.receiver.lock().await;
        loop {
            match receiver.try_recv() {
                Ok(event) => self.event_loop.dispatch(&event).await,
                Err(TryRecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Delivery machine lagged behind the bus");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
    }

    /// Run in isolated-worker mode: fulfill exactly one goal and return
    /// the exit code.
    pub async fn run_isolated(&self, env: &WorkerEnv) -> Result<i32> {
        let code = run_isolated_goal(env, self.store.clone(), self.dispatcher.clone()).await?;
        // Work the dispatcher queued onto the bus (state updates) has
        // already been stored; nothing further to drain for exit.
        Ok(code)
    }
}
