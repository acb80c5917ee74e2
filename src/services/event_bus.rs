//! Event bus for the delivery pipeline.
//!
//! Broadcast-based, with sequence numbering and correlation tracking. The
//! bus is the in-process stand-in for the external subscription transport:
//! push observations enter here, goal-state changes fan out to the state
//! engine, dispatcher, and completion reactor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::domain::models::{GoalEvent, GoalSet, JobTaskState, Push, RepoRef};
use crate::domain::ports::CommitStatusState;

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonically increasing sequence number assigned by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SequenceNumber(pub u64);

impl std::fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Event payload carried on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum DeliveryEvent {
    /// A push into a monitored repository was observed.
    PushObserved { push: Push },

    /// A goal event reached `requested`.
    GoalRequested { goal: GoalEvent },

    /// A goal event reached `success`.
    GoalSucceeded { goal: GoalEvent },

    /// A goal event reached any terminal state.
    GoalCompleted { goal: GoalEvent },

    /// A goal set was planned.
    GoalSetCreated { set: GoalSet },

    /// A job task changed state.
    JobTaskChanged {
        job_name: String,
        task_name: String,
        state: JobTaskState,
        message: Option<String>,
    },

    /// A user joined a collaboration channel.
    UserJoinedChannel { user_id: String, channel_id: String },

    /// An external commit status was observed (e.g. a staging deploy
    /// endpoint reporting back).
    StatusObserved {
        repo: RepoRef,
        sha: String,
        context: String,
        state: CommitStatusState,
    },
}

impl DeliveryEvent {
    /// Discriminant name of this payload variant, used for subscription
    /// matching.
    pub fn variant_name(&self) -> &'static str {
        match self {
            Self::PushObserved { .. } => "PushObserved",
            Self::GoalRequested { .. } => "GoalRequested",
            Self::GoalSucceeded { .. } => "GoalSucceeded",
            Self::GoalCompleted { .. } => "GoalCompleted",
            Self::GoalSetCreated { .. } => "GoalSetCreated",
            Self::JobTaskChanged { .. } => "JobTaskChanged",
            Self::UserJoinedChannel { .. } => "UserJoinedChannel",
            Self::StatusObserved { .. } => "StatusObserved",
        }
    }
}

/// Envelope containing event metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: EventId,
    pub sequence: SequenceNumber,
    pub timestamp: DateTime<Utc>,
    pub workspace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    pub payload: DeliveryEvent,
}

impl EventEnvelope {
    /// Build an envelope for direct injection (workers, tests). Sequence is
    /// assigned by the bus on publish.
    pub fn new(workspace_id: impl Into<String>, payload: DeliveryEvent) -> Self {
        Self {
            id: EventId::new(),
            sequence: SequenceNumber(0),
            timestamp: Utc::now(),
            workspace_id: workspace_id.into(),
            correlation_id: None,
            payload,
        }
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

/// Configuration for the event bus.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Channel capacity for the broadcast channel.
    pub channel_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

/// Central event bus broadcasting delivery events to subscribers.
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
    sequence: AtomicU64,
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity);
        Self {
            sender,
            sequence: AtomicU64::new(0),
        }
    }

    /// Publish an envelope, assigning the next sequence number.
    pub fn publish(&self, mut event: EventEnvelope) {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        event.sequence = SequenceNumber(seq);
        // Ignore send errors: there may be no subscribers yet.
        let _ = self.sender.send(event);
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    pub fn current_sequence(&self) -> SequenceNumber {
        SequenceNumber(self.sequence.load(Ordering::SeqCst))
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}

/// Handler processing errors.
///
/// The distinction matters for the propagation policy: a handler that
/// completes (even when the goal it was driving failed) reports `Ok` so
/// the transport does not re-deliver; only transport-level trouble or
/// malformed events surface as errors.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Transient failure (store, provider, cluster API); the transport
    /// retries delivery.
    #[error("Transient failure in {handler}: {reason}")]
    Transient { handler: String, reason: String },

    /// The event or configuration is malformed; retrying cannot help.
    #[error("Validation failure in {handler}: {reason}")]
    Validation { handler: String, reason: String },
}

impl HandlerError {
    pub fn transient(handler: &str, reason: impl std::fmt::Display) -> Self {
        Self::Transient {
            handler: handler.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn validation(handler: &str, reason: impl std::fmt::Display) -> Self {
        Self::Validation {
            handler: handler.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Trait for delivery event handlers.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Payload variant names this handler subscribes to. Empty = all.
    fn subscriptions(&self) -> &'static [&'static str];

    async fn handle(&self, event: &EventEnvelope) -> Result<(), HandlerError>;
}

/// Dispatches bus events to registered handlers in registration order.
pub struct EventLoop {
    bus: Arc<EventBus>,
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventLoop {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            handlers: Vec::new(),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn EventHandler>) {
        tracing::debug!(handler = handler.name(), "Registered event handler");
        self.handlers.push(handler);
    }

    /// Dispatch one envelope to every subscribed handler.
    ///
    /// Handler failures are logged and do not stop other handlers; the
    /// envelope is considered processed either way (the external transport
    /// owns re-delivery).
    pub async fn dispatch(&self, event: &EventEnvelope) {
        let variant = event.payload.variant_name();
        for handler in &self.handlers {
            let subs = handler.subscriptions();
            if !subs.is_empty() && !subs.contains(&variant) {
                continue;
            }
            if let Err(e) = handler.handle(event).await {
                match e {
                    HandlerError::Transient { .. } => {
                        tracing::warn!(
                            handler = handler.name(),
                            event = variant,
                            sequence = %event.sequence,
                            error = %e,
                            "Event handler failed; transport will retry"
                        );
                    }
                    HandlerError::Validation { .. } => {
                        tracing::error!(
                            handler = handler.name(),
                            event = variant,
                            sequence = %event.sequence,
                            error = %e,
                            "Event handler rejected event"
                        );
                    }
                }
            }
        }
    }

    /// Run until the bus is dropped.
    pub async fn run(&self) {
        let mut rx = self.bus.subscribe();
        loop {
            match rx.recv().await {
                Ok(event) => self.dispatch(&event).await,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Event loop lagged behind the bus");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}
