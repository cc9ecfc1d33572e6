// Layer 1: Standard library imports
use std::error::Error;

// Layer 2: Third-party crate imports
use async_trait::async_trait;
use thiserror::Error as ThisError;
use tracing::warn;

// Layer 3: Internal module imports
use super::context::EntityContext;
use super::lifecycle::AutoShutdownPolicy;
use crate::dispatch::DispatchTable;
use crate::message::{BoxMessage, EntityMessage, NoResponse};
use crate::pubsub::{Subscriber, SubscriberLostReason, Subscription};
use crate::util::{EntityId, EntityKind};

/// Errors produced by entity handlers and lifecycle hooks.
#[derive(Debug, ThisError)]
pub enum EntityError {
    /// Typed, application-defined rejection. Keeps the entity alive; for an
    /// ask it is raised at the caller as
    /// [`AskError::Refused`](crate::ask::AskError::Refused).
    #[error("refused by entity")]
    Refusal(BoxMessage),

    /// Ad-hoc failure with a message. Non-refusal errors terminate the
    /// failing entity.
    #[error("{message}")]
    Failed {
        /// What went wrong.
        message: String,
    },

    /// Failure wrapping an underlying error.
    #[error("{source}")]
    Other {
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
}

impl EntityError {
    /// A typed refusal carrying an application-defined payload.
    pub fn refuse<M: EntityMessage>(payload: M) -> Self {
        EntityError::Refusal(Box::new(payload))
    }

    /// An ad-hoc failure.
    pub fn failed(message: impl Into<String>) -> Self {
        EntityError::Failed { message: message.into() }
    }

    /// Wrap an underlying error.
    pub fn other(err: impl Error + Send + Sync + 'static) -> Self {
        EntityError::Other { source: Box::new(err) }
    }

    /// Whether this is a refusal (soft) rather than a failure (fatal to the
    /// entity).
    pub fn is_refusal(&self) -> bool {
        matches!(self, EntityError::Refusal(_))
    }

    /// Error type name for unexpected-error reporting.
    pub(crate) fn type_name(&self) -> String {
        match self {
            EntityError::Refusal(_) => "Refusal".to_string(),
            EntityError::Failed { .. } => "Failed".to_string(),
            EntityError::Other { source } => format!("{source:?}").chars().take(64).collect(),
        }
    }
}

/// A sharded, stateful actor: the unit of state and behavior in the runtime.
///
/// Implementations declare their kind, register message handlers, and
/// override the lifecycle and pub/sub hooks they care about. Handlers and
/// hooks run strictly one at a time per entity; awaiting inside one is a
/// suspension point but never lets another message in.
///
/// # Example
/// ```rust,ignore
/// struct Counter { value: u64 }
///
/// impl Entity for Counter {
///     fn kind() -> EntityKind { COUNTER }
///     fn register(table: &mut DispatchTable<Self>) {
///         table.message::<Add>().ask::<Get>();
///     }
/// }
/// ```
#[allow(unused_variables)]
#[async_trait]
pub trait Entity: Sized + Send + 'static {
    /// The kind tag of this entity type.
    fn kind() -> EntityKind;

    /// Register message handlers for this type. Called once per kind at
    /// runtime registration; the resulting table is immutable.
    fn register(table: &mut DispatchTable<Self>);

    /// Idle-shutdown policy; defaults to staying resident.
    fn auto_shutdown(&self) -> AutoShutdownPolicy {
        AutoShutdownPolicy::Never
    }

    /// Runs once after construction/restore, before any message. An error
    /// kills the entity from `Starting`.
    async fn on_initialize(&mut self, ctx: &mut EntityContext<Self>) -> Result<(), EntityError> {
        Ok(())
    }

    /// Runs right before the entity dies on the ordinary shutdown path.
    async fn on_shutdown(&mut self, ctx: &mut EntityContext<Self>) -> Result<(), EntityError> {
        Ok(())
    }

    /// Runs when delivery has been gated; the mailbox up to this point has
    /// drained.
    async fn on_suspend(&mut self, ctx: &mut EntityContext<Self>) -> Result<(), EntityError> {
        Ok(())
    }

    /// Runs when delivery re-opens after a suspend.
    async fn on_resume(&mut self, ctx: &mut EntityContext<Self>) -> Result<(), EntityError> {
        Ok(())
    }

    /// A new subscriber wants in. Return the ack payload, or a
    /// [`EntityError::Refusal`] to reject the subscription (anything the
    /// entity published to the candidate meanwhile is dropped).
    async fn on_new_subscriber(
        &mut self,
        ctx: &mut EntityContext<Self>,
        subscriber: Subscriber,
        payload: BoxMessage,
    ) -> Result<BoxMessage, EntityError> {
        Ok(Box::new(NoResponse))
    }

    /// A subscriber unsubscribed cleanly (before [`Entity::on_subscriber_lost`]).
    async fn on_subscriber_unsubscribed(&mut self, ctx: &mut EntityContext<Self>, subscriber: Subscriber) {}

    /// We kicked this subscriber (before [`Entity::on_subscriber_lost`]).
    async fn on_subscriber_kicked(&mut self, ctx: &mut EntityContext<Self>, subscriber: Subscriber) {}

    /// A subscriber is gone, for whatever reason. Always runs last in the
    /// teardown sequence.
    async fn on_subscriber_lost(
        &mut self,
        ctx: &mut EntityContext<Self>,
        subscriber: Subscriber,
        reason: SubscriberLostReason,
    ) {
    }

    /// An entity we subscribed to terminated (or its node was lost).
    async fn on_subscription_lost(&mut self, ctx: &mut EntityContext<Self>, subscription: Subscription) {}

    /// A publisher evicted us; `payload` is its goodbye message.
    async fn on_kicked_from(
        &mut self,
        ctx: &mut EntityContext<Self>,
        subscription: Subscription,
        payload: BoxMessage,
    ) {
    }

    /// Fallback for message types with no registered handler.
    async fn on_unhandled_message(
        &mut self,
        ctx: &mut EntityContext<Self>,
        sender: Option<EntityId>,
        msg: BoxMessage,
    ) {
        warn!(
            entity = %ctx.id(),
            message_type = msg.message_type(),
            ?sender,
            "no handler registered for message type"
        );
    }
}

/// Plain construction for kinds without persisted state.
///
/// Persisted kinds skip this and restore through
/// [`PersistedEntity`](crate::persist::PersistedEntity) instead.
pub trait ConstructEntity: Entity {
    /// Build the entity for `id`. Runs on the entity's own task while the
    /// shard buffers its messages.
    fn construct(id: EntityId) -> Result<Self, EntityError>;
}

/// How a shard materializes an entity of its kind: plain construction or
/// load-migrate-restore. Implemented by the plain spawner and the persisted
/// harness.
#[async_trait]
pub(crate) trait EntitySpawner<E: Entity>: Send + Sync + 'static {
    /// Produce the entity, fully restored, ready for `on_initialize`.
    async fn spawn(&self, id: EntityId, ctx: &mut EntityContext<E>) -> Result<E, EntityError>;
}

/// Spawner for [`ConstructEntity`] kinds.
pub(crate) struct PlainSpawner;

#[async_trait]
impl<E: ConstructEntity> EntitySpawner<E> for PlainSpawner {
    async fn spawn(&self, id: EntityId, _ctx: &mut EntityContext<E>) -> Result<E, EntityError> {
        E::construct(id)
    }
}
