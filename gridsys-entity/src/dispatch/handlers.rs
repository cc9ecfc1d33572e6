// Layer 1: Standard library imports
// (none)

// Layer 2: Third-party crate imports
use async_trait::async_trait;

// Layer 3: Internal module imports
use crate::ask::AskHandle;
use crate::entity::{Entity, EntityContext, EntityError};
use crate::message::EntityMessage;
use crate::pubsub::{Subscriber, Subscription};
use crate::sync::SyncChannel;
use crate::util::EntityId;

/// Handler for fire-and-forget messages of type `M`.
///
/// `sender` is `None` for messages injected from outside the entity fabric.
#[async_trait]
pub trait Handler<M: EntityMessage>: Entity {
    /// Process one message.
    async fn handle(
        &mut self,
        ctx: &mut EntityContext<Self>,
        sender: Option<EntityId>,
        msg: M,
    ) -> Result<(), EntityError>;
}

/// Handler for node-local control commands of type `C`.
#[async_trait]
pub trait CommandHandler<C: EntityMessage>: Entity {
    /// Process one command.
    async fn handle_command(&mut self, ctx: &mut EntityContext<Self>, cmd: C) -> Result<(), EntityError>;
}

/// Implicit ask handler: the return value is the reply.
///
/// A [`EntityError::Refusal`] is delivered to the caller as a typed
/// refusal and keeps this entity alive; any other error fails the ask and
/// terminates this entity.
#[async_trait]
pub trait AskHandler<M: EntityMessage>: Entity {
    /// The reply type.
    type Reply: EntityMessage;

    /// Process one ask and produce the reply.
    async fn handle_ask(
        &mut self,
        ctx: &mut EntityContext<Self>,
        sender: Option<EntityId>,
        msg: M,
    ) -> Result<Self::Reply, EntityError>;
}

/// Explicit ask handler: replies through the [`AskHandle`], exactly once.
///
/// Use this when the reply is produced after further coordination rather
/// than as the handler's return value. Dropping the handle without replying
/// fails the ask at the caller.
#[async_trait]
pub trait ExplicitAskHandler<M: EntityMessage>: Entity {
    /// Process one ask; `handle` must be consumed by `reply` or `refuse`.
    async fn handle_explicit_ask(
        &mut self,
        ctx: &mut EntityContext<Self>,
        handle: AskHandle,
        msg: M,
    ) -> Result<(), EntityError>;
}

/// Handler for synchronize-channel opens whose first message is of type `M`.
///
/// The handler owns the channel for its duration; dropping it sends EOF.
#[async_trait]
pub trait SyncHandler<M: EntityMessage>: Entity {
    /// Run the synchronized exchange.
    async fn handle_synchronize(
        &mut self,
        ctx: &mut EntityContext<Self>,
        channel: SyncChannel,
        msg: M,
    ) -> Result<(), EntityError>;
}

/// Publisher-side handler for messages of type `M` sent upstream by a
/// subscriber.
#[async_trait]
pub trait SubscriberHandler<M: EntityMessage>: Entity {
    /// Process one upstream message.
    async fn handle_from_subscriber(
        &mut self,
        ctx: &mut EntityContext<Self>,
        subscriber: Subscriber,
        msg: M,
    ) -> Result<(), EntityError>;
}

/// Subscriber-side handler for messages of type `M` published to us.
#[async_trait]
pub trait SubscriptionHandler<M: EntityMessage>: Entity {
    /// Process one published message.
    async fn handle_published(
        &mut self,
        ctx: &mut EntityContext<Self>,
        subscription: Subscription,
        msg: M,
    ) -> Result<(), EntityError>;
}
