// Layer 1: Standard library imports
// (none)

// Layer 2: Third-party crate imports
use async_trait::async_trait;
use tracing::debug;

// Layer 3: Internal module imports
use super::types::{ChannelId, Subscription};
use crate::entity::{Entity, EntityContext, EntityHandle, EntityTask};

/// Unsubscribes a set of channels on the owning entity, in the given order.
struct UnsubscribeTask {
    channels: Vec<ChannelId>,
}

#[async_trait]
impl<E: Entity> EntityTask<E> for UnsubscribeTask {
    async fn run(self: Box<Self>, _entity: &mut E, ctx: &mut EntityContext<E>) {
        for channel in self.channels {
            let Some(subscription) = ctx.subscription(channel).cloned() else {
                continue;
            };
            if let Err(err) = ctx.unsubscribe(&subscription).await {
                debug!(entity = %ctx.id(), %channel, error = %err, "guard unsubscribe failed");
            }
        }
    }
}

/// Scoped ownership of one subscription: dropping the guard unsubscribes.
///
/// The unsubscribe runs as a deferred op on the owning entity (drop cannot
/// await), so it happens after the current handler returns.
///
/// # Example
/// ```rust,ignore
/// let (subscription, _ack): (Subscription, LobbyState) =
///     ctx.subscribe(lobby, Topic(0), JoinLobby { name }).await?;
/// let guard = SubscriptionGuard::new(ctx, &subscription);
/// // ... leaving scope unsubscribes, unless guard.release() was called.
/// ```
pub struct SubscriptionGuard<E: Entity> {
    channel: Option<ChannelId>,
    handle: EntityHandle<E>,
}

impl<E: Entity> SubscriptionGuard<E> {
    /// Guard `subscription`, owned by the entity behind `ctx`.
    pub fn new(ctx: &EntityContext<E>, subscription: &Subscription) -> Self {
        Self { channel: Some(subscription.in_channel), handle: ctx.handle() }
    }

    /// The guarded channel, if still owned.
    pub fn channel(&self) -> Option<ChannelId> {
        self.channel
    }

    /// Disown the subscription without unsubscribing.
    pub fn release(mut self) -> Option<ChannelId> {
        self.channel.take()
    }
}

impl<E: Entity> Drop for SubscriptionGuard<E> {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.take() {
            let _ = self.handle.run(Box::new(UnsubscribeTask { channels: vec![channel] }));
        }
    }
}

/// Scoped ownership of a set of subscriptions; dropping unsubscribes them
/// in reverse insertion order.
pub struct SubscriptionSetGuard<E: Entity> {
    channels: Vec<ChannelId>,
    handle: EntityHandle<E>,
}

impl<E: Entity> SubscriptionSetGuard<E> {
    /// An empty set owned by the entity behind `ctx`.
    pub fn new(ctx: &EntityContext<E>) -> Self {
        Self { channels: Vec::new(), handle: ctx.handle() }
    }

    /// Add a subscription to the set.
    pub fn push(&mut self, subscription: &Subscription) {
        self.channels.push(subscription.in_channel);
    }

    /// Number of owned subscriptions.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether the set owns nothing.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Disown everything without unsubscribing.
    pub fn release(mut self) -> Vec<ChannelId> {
        std::mem::take(&mut self.channels)
    }
}

impl<E: Entity> Drop for SubscriptionSetGuard<E> {
    fn drop(&mut self) {
        if self.channels.is_empty() {
            return;
        }
        let mut channels = std::mem::take(&mut self.channels);
        channels.reverse();
        let _ = self.handle.run(Box::new(UnsubscribeTask { channels }));
    }
}
