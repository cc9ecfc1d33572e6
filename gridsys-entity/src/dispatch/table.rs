// Layer 1: Standard library imports
use std::any::{type_name, TypeId};
use std::collections::HashMap;

// Layer 2: Third-party crate imports
use futures::future::BoxFuture;

// Layer 3: Internal module imports
use super::handlers::{
    AskHandler, CommandHandler, ExplicitAskHandler, Handler, SubscriberHandler, SubscriptionHandler,
    SyncHandler,
};
use crate::ask::AskHandle;
use crate::entity::{Entity, EntityContext, EntityError};
use crate::message::{downcast, BoxMessage, EntityMessage};
use crate::pubsub::{Subscriber, Subscription};
use crate::sync::SyncChannel;
use crate::util::EntityId;

pub(crate) type CastThunk<E> = for<'a> fn(
    &'a mut E,
    &'a mut EntityContext<E>,
    Option<EntityId>,
    BoxMessage,
) -> BoxFuture<'a, Result<(), EntityError>>;

pub(crate) type CommandThunk<E> =
    for<'a> fn(&'a mut E, &'a mut EntityContext<E>, BoxMessage) -> BoxFuture<'a, Result<(), EntityError>>;

pub(crate) type AskThunk<E> = for<'a> fn(
    &'a mut E,
    &'a mut EntityContext<E>,
    Option<EntityId>,
    BoxMessage,
) -> BoxFuture<'a, Result<BoxMessage, EntityError>>;

pub(crate) type ExplicitAskThunk<E> = for<'a> fn(
    &'a mut E,
    &'a mut EntityContext<E>,
    AskHandle,
    BoxMessage,
) -> BoxFuture<'a, Result<(), EntityError>>;

pub(crate) type SyncThunk<E> = for<'a> fn(
    &'a mut E,
    &'a mut EntityContext<E>,
    SyncChannel,
    BoxMessage,
) -> BoxFuture<'a, Result<(), EntityError>>;

pub(crate) type SubscriberThunk<E> = for<'a> fn(
    &'a mut E,
    &'a mut EntityContext<E>,
    Subscriber,
    BoxMessage,
) -> BoxFuture<'a, Result<(), EntityError>>;

pub(crate) type SubscriptionThunk<E> = for<'a> fn(
    &'a mut E,
    &'a mut EntityContext<E>,
    Subscription,
    BoxMessage,
) -> BoxFuture<'a, Result<(), EntityError>>;

fn cast_thunk<'a, E, M>(
    entity: &'a mut E,
    ctx: &'a mut EntityContext<E>,
    sender: Option<EntityId>,
    msg: BoxMessage,
) -> BoxFuture<'a, Result<(), EntityError>>
where
    E: Handler<M>,
    M: EntityMessage,
{
    match downcast::<M>(msg) {
        Ok(msg) => E::handle(entity, ctx, sender, msg),
        Err(mismatch) => Box::pin(async move { Err(EntityError::other(mismatch)) }),
    }
}

fn command_thunk<'a, E, C>(
    entity: &'a mut E,
    ctx: &'a mut EntityContext<E>,
    msg: BoxMessage,
) -> BoxFuture<'a, Result<(), EntityError>>
where
    E: CommandHandler<C>,
    C: EntityMessage,
{
    match downcast::<C>(msg) {
        Ok(cmd) => E::handle_command(entity, ctx, cmd),
        Err(mismatch) => Box::pin(async move { Err(EntityError::other(mismatch)) }),
    }
}

fn ask_thunk<'a, E, M>(
    entity: &'a mut E,
    ctx: &'a mut EntityContext<E>,
    sender: Option<EntityId>,
    msg: BoxMessage,
) -> BoxFuture<'a, Result<BoxMessage, EntityError>>
where
    E: AskHandler<M>,
    M: EntityMessage,
{
    match downcast::<M>(msg) {
        Ok(msg) => Box::pin(async move {
            let reply = E::handle_ask(entity, ctx, sender, msg).await?;
            Ok(Box::new(reply) as BoxMessage)
        }),
        Err(mismatch) => Box::pin(async move { Err(EntityError::other(mismatch)) }),
    }
}

fn explicit_ask_thunk<'a, E, M>(
    entity: &'a mut E,
    ctx: &'a mut EntityContext<E>,
    handle: AskHandle,
    msg: BoxMessage,
) -> BoxFuture<'a, Result<(), EntityError>>
where
    E: ExplicitAskHandler<M>,
    M: EntityMessage,
{
    match downcast::<M>(msg) {
        Ok(msg) => E::handle_explicit_ask(entity, ctx, handle, msg),
        // The handle drops unreplied here, failing the ask at the caller.
        Err(mismatch) => Box::pin(async move { Err(EntityError::other(mismatch)) }),
    }
}

fn sync_thunk<'a, E, M>(
    entity: &'a mut E,
    ctx: &'a mut EntityContext<E>,
    channel: SyncChannel,
    msg: BoxMessage,
) -> BoxFuture<'a, Result<(), EntityError>>
where
    E: SyncHandler<M>,
    M: EntityMessage,
{
    match downcast::<M>(msg) {
        Ok(msg) => E::handle_synchronize(entity, ctx, channel, msg),
        Err(mismatch) => Box::pin(async move { Err(EntityError::other(mismatch)) }),
    }
}

fn subscriber_thunk<'a, E, M>(
    entity: &'a mut E,
    ctx: &'a mut EntityContext<E>,
    subscriber: Subscriber,
    msg: BoxMessage,
) -> BoxFuture<'a, Result<(), EntityError>>
where
    E: SubscriberHandler<M>,
    M: EntityMessage,
{
    match downcast::<M>(msg) {
        Ok(msg) => E::handle_from_subscriber(entity, ctx, subscriber, msg),
        Err(mismatch) => Box::pin(async move { Err(EntityError::other(mismatch)) }),
    }
}

fn subscription_thunk<'a, E, M>(
    entity: &'a mut E,
    ctx: &'a mut EntityContext<E>,
    subscription: Subscription,
    msg: BoxMessage,
) -> BoxFuture<'a, Result<(), EntityError>>
where
    E: SubscriptionHandler<M>,
    M: EntityMessage,
{
    match downcast::<M>(msg) {
        Ok(msg) => E::handle_published(entity, ctx, subscription, msg),
        Err(mismatch) => Box::pin(async move { Err(EntityError::other(mismatch)) }),
    }
}

/// Per-kind registration builder and dispatch map.
///
/// [`Entity::register`] calls the builder methods once at kind
/// registration; the runtime then treats the table as immutable. Each entry
/// is a monomorphized thunk that downcasts the payload and invokes the
/// matching handler trait, so dispatch is one `HashMap` lookup plus a
/// vtable-free function call.
///
/// Registering two handlers for the same message type within one table (or
/// both an implicit and an explicit ask handler for one type) is a
/// configuration error surfaced when the kind is registered.
///
/// # Example
/// ```rust,ignore
/// fn register(table: &mut DispatchTable<Self>) {
///     table
///         .message::<SessionTick>()
///         .ask::<GetProfile>()
///         .synchronize::<TradeOpen>()
///         .subscription::<LobbyEvent>();
/// }
/// ```
pub struct DispatchTable<E> {
    casts: HashMap<TypeId, CastThunk<E>>,
    commands: HashMap<TypeId, CommandThunk<E>>,
    asks: HashMap<TypeId, AskThunk<E>>,
    explicit_asks: HashMap<TypeId, ExplicitAskThunk<E>>,
    syncs: HashMap<TypeId, SyncThunk<E>>,
    subscriber_msgs: HashMap<TypeId, SubscriberThunk<E>>,
    subscription_msgs: HashMap<TypeId, SubscriptionThunk<E>>,
    duplicates: Vec<&'static str>,
}

impl<E: Entity> Default for DispatchTable<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entity> DispatchTable<E> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            casts: HashMap::new(),
            commands: HashMap::new(),
            asks: HashMap::new(),
            explicit_asks: HashMap::new(),
            syncs: HashMap::new(),
            subscriber_msgs: HashMap::new(),
            subscription_msgs: HashMap::new(),
            duplicates: Vec::new(),
        }
    }

    fn record_duplicate<M: 'static>(&mut self) {
        self.duplicates.push(type_name::<M>());
    }

    /// Register the [`Handler`] for message type `M`.
    pub fn message<M>(&mut self) -> &mut Self
    where
        M: EntityMessage,
        E: Handler<M>,
    {
        if self.casts.insert(TypeId::of::<M>(), cast_thunk::<E, M> as CastThunk<E>).is_some() {
            self.record_duplicate::<M>();
        }
        self
    }

    /// Register the [`CommandHandler`] for command type `C`.
    pub fn command<C>(&mut self) -> &mut Self
    where
        C: EntityMessage,
        E: CommandHandler<C>,
    {
        if self.commands.insert(TypeId::of::<C>(), command_thunk::<E, C> as CommandThunk<E>).is_some() {
            self.record_duplicate::<C>();
        }
        self
    }

    /// Register the implicit [`AskHandler`] for message type `M`.
    pub fn ask<M>(&mut self) -> &mut Self
    where
        M: EntityMessage,
        E: AskHandler<M>,
    {
        let clash = self.explicit_asks.contains_key(&TypeId::of::<M>());
        if self.asks.insert(TypeId::of::<M>(), ask_thunk::<E, M> as AskThunk<E>).is_some() || clash {
            self.record_duplicate::<M>();
        }
        self
    }

    /// Register the [`ExplicitAskHandler`] for message type `M`.
    pub fn ask_explicit<M>(&mut self) -> &mut Self
    where
        M: EntityMessage,
        E: ExplicitAskHandler<M>,
    {
        let clash = self.asks.contains_key(&TypeId::of::<M>());
        if self
            .explicit_asks
            .insert(TypeId::of::<M>(), explicit_ask_thunk::<E, M> as ExplicitAskThunk<E>)
            .is_some()
            || clash
        {
            self.record_duplicate::<M>();
        }
        self
    }

    /// Register the [`SyncHandler`] for opening message type `M`.
    pub fn synchronize<M>(&mut self) -> &mut Self
    where
        M: EntityMessage,
        E: SyncHandler<M>,
    {
        if self.syncs.insert(TypeId::of::<M>(), sync_thunk::<E, M> as SyncThunk<E>).is_some() {
            self.record_duplicate::<M>();
        }
        self
    }

    /// Register the [`SubscriberHandler`] for upstream message type `M`.
    pub fn subscriber<M>(&mut self) -> &mut Self
    where
        M: EntityMessage,
        E: SubscriberHandler<M>,
    {
        if self
            .subscriber_msgs
            .insert(TypeId::of::<M>(), subscriber_thunk::<E, M> as SubscriberThunk<E>)
            .is_some()
        {
            self.record_duplicate::<M>();
        }
        self
    }

    /// Register the [`SubscriptionHandler`] for published message type `M`.
    pub fn subscription<M>(&mut self) -> &mut Self
    where
        M: EntityMessage,
        E: SubscriptionHandler<M>,
    {
        if self
            .subscription_msgs
            .insert(TypeId::of::<M>(), subscription_thunk::<E, M> as SubscriptionThunk<E>)
            .is_some()
        {
            self.record_duplicate::<M>();
        }
        self
    }

    /// Message types registered more than once; non-empty means the kind's
    /// registration is invalid.
    pub fn duplicates(&self) -> &[&'static str] {
        &self.duplicates
    }

    pub(crate) fn has_cast(&self, type_id: TypeId) -> bool {
        self.casts.contains_key(&type_id)
    }

    pub(crate) fn has_command(&self, type_id: TypeId) -> bool {
        self.commands.contains_key(&type_id)
    }

    pub(crate) fn has_subscriber_msg(&self, type_id: TypeId) -> bool {
        self.subscriber_msgs.contains_key(&type_id)
    }

    pub(crate) fn has_subscription_msg(&self, type_id: TypeId) -> bool {
        self.subscription_msgs.contains_key(&type_id)
    }

    pub(crate) fn dispatch_cast<'a>(
        &self,
        entity: &'a mut E,
        ctx: &'a mut EntityContext<E>,
        sender: Option<EntityId>,
        msg: BoxMessage,
    ) -> Option<BoxFuture<'a, Result<(), EntityError>>> {
        self.casts.get(&msg.as_any().type_id()).map(|thunk| thunk(entity, ctx, sender, msg))
    }

    pub(crate) fn dispatch_command<'a>(
        &self,
        entity: &'a mut E,
        ctx: &'a mut EntityContext<E>,
        msg: BoxMessage,
    ) -> Option<BoxFuture<'a, Result<(), EntityError>>> {
        self.commands.get(&msg.as_any().type_id()).map(|thunk| thunk(entity, ctx, msg))
    }

    pub(crate) fn has_ask(&self, type_id: TypeId) -> bool {
        self.asks.contains_key(&type_id)
    }

    pub(crate) fn has_explicit_ask(&self, type_id: TypeId) -> bool {
        self.explicit_asks.contains_key(&type_id)
    }

    pub(crate) fn has_sync(&self, type_id: TypeId) -> bool {
        self.syncs.contains_key(&type_id)
    }

    pub(crate) fn dispatch_ask<'a>(
        &self,
        entity: &'a mut E,
        ctx: &'a mut EntityContext<E>,
        sender: Option<EntityId>,
        msg: BoxMessage,
    ) -> Option<BoxFuture<'a, Result<BoxMessage, EntityError>>> {
        self.asks.get(&msg.as_any().type_id()).map(|thunk| thunk(entity, ctx, sender, msg))
    }

    pub(crate) fn dispatch_explicit_ask<'a>(
        &self,
        entity: &'a mut E,
        ctx: &'a mut EntityContext<E>,
        handle: AskHandle,
        msg: BoxMessage,
    ) -> Option<BoxFuture<'a, Result<(), EntityError>>> {
        self.explicit_asks.get(&msg.as_any().type_id()).map(|thunk| thunk(entity, ctx, handle, msg))
    }

    pub(crate) fn dispatch_sync<'a>(
        &self,
        entity: &'a mut E,
        ctx: &'a mut EntityContext<E>,
        channel: SyncChannel,
        msg: BoxMessage,
    ) -> Option<BoxFuture<'a, Result<(), EntityError>>> {
        self.syncs.get(&msg.as_any().type_id()).map(|thunk| thunk(entity, ctx, channel, msg))
    }

    pub(crate) fn dispatch_subscriber_msg<'a>(
        &self,
        entity: &'a mut E,
        ctx: &'a mut EntityContext<E>,
        subscriber: Subscriber,
        msg: BoxMessage,
    ) -> Option<BoxFuture<'a, Result<(), EntityError>>> {
        self.subscriber_msgs.get(&msg.as_any().type_id()).map(|thunk| thunk(entity, ctx, subscriber, msg))
    }

    pub(crate) fn dispatch_subscription_msg<'a>(
        &self,
        entity: &'a mut E,
        ctx: &'a mut EntityContext<E>,
        subscription: Subscription,
        msg: BoxMessage,
    ) -> Option<BoxFuture<'a, Result<(), EntityError>>> {
        self.subscription_msgs.get(&msg.as_any().type_id()).map(|thunk| thunk(entity, ctx, subscription, msg))
    }
}
