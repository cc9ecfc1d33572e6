// Layer 1: Standard library imports
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

// Layer 2: Third-party crate imports
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

// Layer 3: Internal module imports
use super::lifecycle::EntityStatus;
use super::ops::{ContinueTask, EntityOp, EntityTask, ExecuteTask, OpCancelled, TaskError};
use super::traits::Entity;
use crate::ask::{AskError, AskResolution, DEFAULT_ASK_TIMEOUT};
use crate::message::{downcast, BoxMessage, Codec, EntityMessage, Payload, RoutedEnvelope, RoutedKind};
use crate::metrics::RuntimeMetrics;
use crate::pubsub::{ChannelId, Subscriber, Subscription, Topic, TopicMask};
use crate::shard::{AskKind, ShardMsg, ShardRef, SyncShardMsg};
use crate::sync::{SyncChannel, SyncError, DEFAULT_SYNC_RECEIVE_TIMEOUT};
use crate::system::{RuntimeOptions, ShardRegistry};
use crate::util::{EntityId, ShardId};

/// A subscriber either waits for its ack (publishes buffer) or is live.
pub(crate) enum SubscriberPhase {
    Pending(Vec<(Topic, BoxMessage)>),
    Live,
}

pub(crate) struct SubscriberEntry {
    pub sub: Subscriber,
    pub phase: SubscriberPhase,
}

/// Hook invocations the context defers until the current handler returns,
/// because the entity itself is mutably borrowed while handlers run.
pub(crate) enum HookEvent {
    SubscriberKicked(Subscriber),
}

/// Persist bookkeeping shared between the context API and the runner.
pub(crate) struct PersistCtl {
    pub last_persisted: Instant,
    /// Whether this incarnation has written a snapshot yet; startup jitter
    /// only applies before the first one.
    pub has_persisted: bool,
    pub scheduled_pending: bool,
    pub running_id: u64,
}

impl Default for PersistCtl {
    fn default() -> Self {
        Self {
            last_persisted: Instant::now(),
            has_persisted: false,
            scheduled_pending: false,
            running_id: 0,
        }
    }
}

/// The on-actor API handed to every handler and hook.
///
/// Everything an entity does to the outside world goes through here:
/// casts, asks, pub/sub, synchronize channels, deferred and delayed
/// execution, suspension and shutdown requests. The context is owned by
/// the entity's runner task; its tables (subscribers, subscriptions) are
/// touched only from that task and need no locks.
pub struct EntityContext<E> {
    id: EntityId,
    shard: ShardRef,
    ops: mpsc::UnboundedSender<EntityOp<E>>,
    registry: ShardRegistry,
    codec: Arc<dyn Codec>,
    options: Arc<RuntimeOptions>,
    metrics: Arc<RuntimeMetrics>,
    status: EntityStatus,
    next_channel: u32,
    subscribers: HashMap<ChannelId, SubscriberEntry>,
    subscriptions: HashMap<ChannelId, Subscription>,
    /// Channels with a subscribe ask in flight; inbound pub/sub buffers here.
    pending_subscribes: HashMap<ChannelId, Vec<RoutedEnvelope>>,
    /// Buffered pub/sub released by a completed subscribe, dispatched by the
    /// runner before the next mailbox item.
    ready_pubsub: VecDeque<RoutedEnvelope>,
    deferred_hooks: Vec<HookEvent>,
    pub(crate) shutdown_on_suspend: bool,
    pub(crate) persist: PersistCtl,
}

impl<E: Entity> EntityContext<E> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: EntityId,
        shard: ShardRef,
        ops: mpsc::UnboundedSender<EntityOp<E>>,
        registry: ShardRegistry,
        codec: Arc<dyn Codec>,
        options: Arc<RuntimeOptions>,
        metrics: Arc<RuntimeMetrics>,
    ) -> Self {
        Self {
            id,
            shard,
            ops,
            registry,
            codec,
            options,
            metrics,
            status: EntityStatus::Starting,
            next_channel: 0,
            subscribers: HashMap::new(),
            subscriptions: HashMap::new(),
            pending_subscribes: HashMap::new(),
            ready_pubsub: VecDeque::new(),
            deferred_hooks: Vec::new(),
            shutdown_on_suspend: false,
            persist: PersistCtl::default(),
        }
    }

    /// This entity's id.
    pub fn id(&self) -> EntityId {
        self.id
    }

    /// The shard hosting this entity.
    pub fn shard_id(&self) -> ShardId {
        self.shard.id()
    }

    /// Current lifecycle status as seen from this entity's task.
    pub fn status(&self) -> EntityStatus {
        self.status
    }

    /// Runtime options this node was started with.
    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    /// A clonable handle for executing ops on this entity from outside.
    pub fn handle(&self) -> EntityHandle<E> {
        EntityHandle { id: self.id, ops: self.ops.clone() }
    }

    // ------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------

    /// Fire-and-forget message to another entity. Best-effort: routing
    /// failures are logged, not returned.
    pub fn cast<M: EntityMessage>(&self, target: EntityId, msg: M) {
        let envelope = RoutedEnvelope::new(
            target,
            RoutedKind::Cast { sender: Some(self.id) },
            Payload::Local(Box::new(msg)),
        );
        self.route(envelope);
    }

    /// Node-local control command to another entity.
    pub fn command<C: EntityMessage>(&self, target: EntityId, cmd: C) {
        let envelope = RoutedEnvelope::new(target, RoutedKind::Command, Payload::Local(Box::new(cmd)));
        self.route(envelope);
    }

    /// Correlated request with the default 10 s timeout.
    pub async fn ask<M: EntityMessage, R: EntityMessage>(
        &self,
        target: EntityId,
        msg: M,
    ) -> Result<R, AskError> {
        self.ask_with_timeout(target, msg, DEFAULT_ASK_TIMEOUT).await
    }

    /// Correlated request with an explicit timeout.
    pub async fn ask_with_timeout<M: EntityMessage, R: EntityMessage>(
        &self,
        target: EntityId,
        msg: M,
        limit: Duration,
    ) -> Result<R, AskError> {
        match self.begin_ask(target, AskKind::Plain, Box::new(msg), limit).await? {
            AskResolution::Reply(payload) => Ok(downcast::<R>(payload)?),
            AskResolution::SubscribeAck { response, .. } => Ok(downcast::<R>(response)?),
            AskResolution::UnsubscribeAck { .. } => Err(AskError::TargetUnavailable {
                target,
                reason: "unexpected unsubscribe ack for plain ask".to_string(),
            }),
        }
    }

    pub(crate) async fn begin_ask(
        &self,
        target: EntityId,
        kind: AskKind,
        payload: BoxMessage,
        limit: Duration,
    ) -> Result<AskResolution, AskError> {
        self.metrics.record_ask_sent();
        let (tx, rx) = oneshot::channel();
        let sent = self.shard.send(ShardMsg::AskRequest { from: self.id, target, kind, payload, reply: tx });
        if !sent {
            self.metrics.record_ask_failed();
            return Err(AskError::TargetUnavailable { target, reason: "owning shard is gone".to_string() });
        }
        match timeout(limit, rx).await {
            Err(_) => {
                self.metrics.record_ask_timeout();
                Err(AskError::Timeout { target, after: limit })
            }
            Ok(Err(_)) => {
                self.metrics.record_ask_failed();
                Err(AskError::TargetUnavailable { target, reason: "shard dropped the pending ask".to_string() })
            }
            Ok(Ok(result)) => {
                if result.is_err() {
                    self.metrics.record_ask_failed();
                }
                result
            }
        }
    }

    // ------------------------------------------------------------------
    // Publish/subscribe
    // ------------------------------------------------------------------

    /// Subscribe to `target` on `topic`. Resolves with the subscription and
    /// the publisher's typed ack payload.
    pub async fn subscribe<M: EntityMessage, R: EntityMessage>(
        &mut self,
        target: EntityId,
        topic: Topic,
        payload: M,
    ) -> Result<(Subscription, R), AskError> {
        let channel = self.alloc_channel();
        self.pending_subscribes.insert(channel, Vec::new());
        let kind = AskKind::Subscribe { topic, subscriber_channel: channel };
        match self.begin_ask(target, kind, Box::new(payload), DEFAULT_ASK_TIMEOUT).await {
            Ok(AskResolution::SubscribeAck { response, target_channel }) => {
                let response = match downcast::<R>(response) {
                    Ok(response) => response,
                    Err(mismatch) => {
                        self.pending_subscribes.remove(&channel);
                        return Err(mismatch.into());
                    }
                };
                let subscription = Subscription {
                    publisher: target,
                    publisher_shard: self.resolve_or_via(target),
                    topic,
                    in_channel: channel,
                    out_channel: target_channel,
                };
                self.subscriptions.insert(channel, subscription.clone());
                if let Some(buffered) = self.pending_subscribes.remove(&channel) {
                    self.ready_pubsub.extend(buffered);
                }
                Ok((subscription, response))
            }
            Ok(_) => {
                self.pending_subscribes.remove(&channel);
                Err(AskError::TargetUnavailable { target, reason: "subscribe resolved without an ack".to_string() })
            }
            Err(err) => {
                self.pending_subscribes.remove(&channel);
                Err(err)
            }
        }
    }

    /// Unsubscribe from a publisher. `Ok(false)` means the publisher no
    /// longer knew us (already kicked), which is a normal outcome.
    pub async fn unsubscribe(&mut self, subscription: &Subscription) -> Result<bool, AskError> {
        let kind = AskKind::Unsubscribe { target_channel: subscription.out_channel };
        let resolution = self
            .begin_ask(subscription.publisher, kind, Box::new(crate::message::NoResponse), DEFAULT_ASK_TIMEOUT)
            .await?;
        match resolution {
            AskResolution::UnsubscribeAck { found } => {
                self.subscriptions.remove(&subscription.in_channel);
                Ok(found)
            }
            _ => Err(AskError::TargetUnavailable {
                target: subscription.publisher,
                reason: "unsubscribe resolved without an ack".to_string(),
            }),
        }
    }

    /// Publish to every subscriber on `topic`. Returns the number of
    /// subscribers the message went to (including ack-pending ones, whose
    /// copies are buffered until their subscribe settles).
    pub fn publish<M: EntityMessage>(&mut self, topic: Topic, msg: M) -> usize {
        self.publish_mask(TopicMask::single(topic), msg)
    }

    /// Publish to every subscriber whose topic is in `mask`.
    ///
    /// Encoding for proxy-shard recipients happens at most once: the first
    /// such recipient triggers it and the blob is reused for the rest.
    pub fn publish_mask<M: EntityMessage>(&mut self, mask: TopicMask, msg: M) -> usize {
        let boxed: BoxMessage = Box::new(msg);
        let mut encoded = None;
        let mut delivered = 0;
        let sender = self.id;
        let codec = Arc::clone(&self.codec);
        for entry in self.subscribers.values_mut() {
            if !mask.contains(entry.sub.topic) {
                continue;
            }
            delivered += 1;
            match &mut entry.phase {
                SubscriberPhase::Pending(buffer) => {
                    buffer.push((entry.sub.topic, boxed.clone_boxed()));
                }
                SubscriberPhase::Live => {
                    let payload = if entry.sub.peer_shard.id().is_proxy() {
                        match encode_once(&mut encoded, codec.as_ref(), boxed.as_ref()) {
                            Some(enc) => Payload::Encoded(enc),
                            None => continue,
                        }
                    } else {
                        Payload::Local(boxed.clone_boxed())
                    };
                    let envelope = RoutedEnvelope::new(
                        entry.sub.peer,
                        RoutedKind::PubSub {
                            sender,
                            channel: entry.sub.out_channel,
                            topic: entry.sub.topic,
                        },
                        payload,
                    );
                    entry.sub.peer_shard.send(ShardMsg::Route(envelope));
                }
            }
        }
        if delivered > 0 {
            self.metrics.record_publish(delivered);
        }
        delivered
    }

    /// Send a message to one specific subscriber.
    pub fn send_to_subscriber<M: EntityMessage>(&mut self, subscriber: &Subscriber, msg: M) {
        let Some(entry) = self.subscribers.get_mut(&subscriber.in_channel) else {
            debug!(entity = %self.id, channel = %subscriber.in_channel, "send to unknown subscriber dropped");
            return;
        };
        match &mut entry.phase {
            SubscriberPhase::Pending(buffer) => buffer.push((entry.sub.topic, Box::new(msg))),
            SubscriberPhase::Live => {
                let envelope = RoutedEnvelope::new(
                    entry.sub.peer,
                    RoutedKind::PubSub { sender: self.id, channel: entry.sub.out_channel, topic: entry.sub.topic },
                    Payload::Local(Box::new(msg)),
                );
                entry.sub.peer_shard.send(ShardMsg::Route(envelope));
            }
        }
    }

    /// Send a message upstream to the publisher of one of our subscriptions.
    pub fn send_to_publisher<M: EntityMessage>(&self, subscription: &Subscription, msg: M) {
        let envelope = RoutedEnvelope::new(
            subscription.publisher,
            RoutedKind::PubSub { sender: self.id, channel: subscription.out_channel, topic: subscription.topic },
            Payload::Local(Box::new(msg)),
        );
        subscription.publisher_shard.send(ShardMsg::Route(envelope));
    }

    /// Evict a subscriber, sending it `goodbye`. Returns `false` if the
    /// subscriber was already gone.
    ///
    /// The subscriber record is removed immediately; the
    /// `on_subscriber_kicked` and `on_subscriber_lost` hooks run right
    /// after the current handler returns.
    pub fn kick_subscriber<M: EntityMessage>(&mut self, subscriber: &Subscriber, goodbye: M) -> bool {
        let Some(entry) = self.subscribers.remove(&subscriber.in_channel) else {
            return false;
        };
        let sub = entry.sub;
        let envelope = RoutedEnvelope::new(
            sub.peer,
            RoutedKind::SubscriberKicked { sender: self.id, subscriber_channel: sub.out_channel },
            Payload::Local(Box::new(goodbye)),
        );
        sub.peer_shard.send(ShardMsg::Route(envelope));
        // Our shard drops the watch now; the peer's shard does on delivery.
        self.shard.send(ShardMsg::WatchTeardown { local: self.id, peer: sub.peer });
        self.deferred_hooks.push(HookEvent::SubscriberKicked(sub));
        true
    }

    /// Live and pending subscribers of this entity.
    pub fn subscribers(&self) -> impl Iterator<Item = &Subscriber> {
        self.subscribers.values().map(|entry| &entry.sub)
    }

    /// Our subscriptions to other entities.
    pub fn subscriptions(&self) -> impl Iterator<Item = &Subscription> {
        self.subscriptions.values()
    }

    /// Look up one of our subscriptions by its channel id.
    pub fn subscription(&self, channel: ChannelId) -> Option<&Subscription> {
        self.subscriptions.get(&channel)
    }

    // ------------------------------------------------------------------
    // Synchronize
    // ------------------------------------------------------------------

    /// Open a synchronize channel to `target`, delivering `msg` as the
    /// opening message of the peer's synchronize handler.
    pub async fn synchronize<M: EntityMessage>(&self, target: EntityId, msg: M) -> Result<SyncChannel, SyncError> {
        let (tx, rx) = oneshot::channel();
        let sent = self.shard.send(ShardMsg::Sync(SyncShardMsg::BeginOpen {
            from: self.id,
            target,
            payload: Box::new(msg),
            open: tx,
        }));
        if !sent {
            return Err(SyncError::OpenFailed { target, reason: "owning shard is gone".to_string() });
        }
        match timeout(DEFAULT_SYNC_RECEIVE_TIMEOUT, rx).await {
            Err(_) => Err(SyncError::OpenFailed {
                target,
                reason: format!("open timed out after {DEFAULT_SYNC_RECEIVE_TIMEOUT:?}"),
            }),
            Ok(Err(_)) => Err(SyncError::OpenFailed { target, reason: "shard dropped the open".to_string() }),
            Ok(Ok(result)) => result,
        }
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    /// Run `f` on this entity after the current handler (and anything
    /// already queued) completes.
    pub fn defer<F>(&self, f: F)
    where
        F: FnOnce(&mut E, &mut EntityContext<E>) + Send + 'static,
    {
        let _ = self.ops.send(EntityOp::Execute(Box::new(ExecuteTask::detached(f))));
    }

    /// Run `f` on this entity no earlier than `delay` from now. The
    /// returned token cancels the task if it has not started yet.
    pub fn schedule<F>(&self, delay: Duration, f: F) -> CancellationToken
    where
        F: FnOnce(&mut E, &mut EntityContext<E>) + Send + 'static,
    {
        self.schedule_task(delay, Box::new(ExecuteTask::detached(f)))
    }

    /// Schedule an [`EntityTask`] to run no earlier than `delay` from now.
    pub fn schedule_task(&self, delay: Duration, task: Box<dyn EntityTask<E>>) -> CancellationToken {
        let cancel = CancellationToken::new();
        let _ = self.ops.send(EntityOp::Schedule { at: Instant::now() + delay, task, cancel: cancel.clone() });
        cancel
    }

    /// Run `background` off-actor; when it settles, run `then` on this
    /// entity with the outcome. A panicking task surfaces as a
    /// [`TaskError`] with its unwrapped panic message.
    pub fn continue_with<T, Fut, F>(&self, background: Fut, then: F)
    where
        T: Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        F: FnOnce(&mut E, &mut EntityContext<E>, Result<T, TaskError>) + Send + 'static,
    {
        let ops = self.ops.clone();
        tokio::spawn(async move {
            let handle = tokio::spawn(background);
            let outcome = match handle.await {
                Ok(value) => Ok(value),
                Err(join) => Err(TaskError::from_join(join)),
            };
            let _ = ops.send(EntityOp::Execute(Box::new(ContinueTask::new(outcome, then))));
        });
    }

    /// Request an intermediate persist, coalesced: if one is already
    /// scheduled this is a no-op, and persists are spaced at least the
    /// configured minimum apart. Meaningful only for persisted kinds.
    pub fn schedule_persist(&self) {
        let _ = self.ops.send(EntityOp::SchedulePersist);
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Ask the shard to gate delivery to this entity.
    pub fn request_suspend(&self) {
        self.shard.send(ShardMsg::RequestSuspend { id: self.id });
    }

    /// Ask the shard to re-open delivery and flush buffered messages.
    pub fn request_resume(&self) {
        self.shard.send(ShardMsg::RequestResume { id: self.id });
    }

    /// Ask the shard to shut this entity down (throttled per shard).
    pub fn request_shutdown(&self) {
        self.shard.send(ShardMsg::RequestShutdown { id: self.id });
    }

    // ------------------------------------------------------------------
    // Internal plumbing (runner side)
    // ------------------------------------------------------------------

    pub(crate) fn set_status(&mut self, status: EntityStatus) {
        self.status = status;
    }

    pub(crate) fn codec(&self) -> &dyn Codec {
        self.codec.as_ref()
    }

    pub(crate) fn shard_send(&self, msg: ShardMsg) -> bool {
        self.shard.send(msg)
    }

    pub(crate) fn alloc_channel(&mut self) -> ChannelId {
        let id = ChannelId(self.next_channel);
        self.next_channel += 1;
        id
    }

    /// Resolve the shard hosting `target`, falling back to our own shard
    /// (which forwards) when the registry has no entry yet.
    pub(crate) fn resolve_or_via(&self, target: EntityId) -> ShardRef {
        self.registry.resolve(target).unwrap_or_else(|| self.shard.clone())
    }

    fn route(&self, envelope: RoutedEnvelope) {
        if !self.shard.send(ShardMsg::Route(envelope)) {
            debug!(entity = %self.id, "dropping outbound message, owning shard is gone");
        }
    }

    pub(crate) fn insert_pending_subscriber(&mut self, sub: Subscriber) {
        self.subscribers
            .insert(sub.in_channel, SubscriberEntry { sub, phase: SubscriberPhase::Pending(Vec::new()) });
    }

    /// Flip a pending subscriber live, returning what buffered meanwhile.
    pub(crate) fn promote_subscriber(&mut self, channel: ChannelId) -> Vec<(Topic, BoxMessage)> {
        match self.subscribers.get_mut(&channel) {
            Some(entry) => match std::mem::replace(&mut entry.phase, SubscriberPhase::Live) {
                SubscriberPhase::Pending(buffered) => buffered,
                SubscriberPhase::Live => Vec::new(),
            },
            None => Vec::new(),
        }
    }

    pub(crate) fn remove_subscriber(&mut self, channel: ChannelId) -> Option<Subscriber> {
        self.subscribers.remove(&channel).map(|entry| entry.sub)
    }

    /// A subscriber record, only once its subscribe has been acked.
    pub(crate) fn live_subscriber(&self, channel: ChannelId) -> Option<Subscriber> {
        self.subscribers.get(&channel).and_then(|entry| match entry.phase {
            SubscriberPhase::Live => Some(entry.sub.clone()),
            SubscriberPhase::Pending(_) => None,
        })
    }

    pub(crate) fn remove_subscription(&mut self, channel: ChannelId) -> Option<Subscription> {
        self.pending_subscribes.remove(&channel);
        self.subscriptions.remove(&channel)
    }

    pub(crate) fn remove_subscribers_of(&mut self, peer: EntityId) -> Vec<Subscriber> {
        let channels: Vec<ChannelId> = self
            .subscribers
            .iter()
            .filter(|(_, entry)| entry.sub.peer == peer)
            .map(|(channel, _)| *channel)
            .collect();
        channels.into_iter().filter_map(|channel| self.remove_subscriber(channel)).collect()
    }

    pub(crate) fn remove_subscriptions_of(&mut self, publisher: EntityId) -> Vec<Subscription> {
        let channels: Vec<ChannelId> = self
            .subscriptions
            .iter()
            .filter(|(_, sub)| sub.publisher == publisher)
            .map(|(channel, _)| *channel)
            .collect();
        channels.into_iter().filter_map(|channel| self.remove_subscription(channel)).collect()
    }

    pub(crate) fn has_subscribers(&self) -> bool {
        !self.subscribers.is_empty()
    }

    pub(crate) fn is_pending_subscribe(&self, channel: ChannelId) -> bool {
        self.pending_subscribes.contains_key(&channel)
    }

    pub(crate) fn buffer_pending_subscribe(&mut self, channel: ChannelId, envelope: RoutedEnvelope) {
        if let Some(buffer) = self.pending_subscribes.get_mut(&channel) {
            buffer.push(envelope);
        }
    }

    pub(crate) fn take_ready_pubsub(&mut self) -> Option<RoutedEnvelope> {
        self.ready_pubsub.pop_front()
    }

    pub(crate) fn take_deferred_hooks(&mut self) -> Vec<HookEvent> {
        std::mem::take(&mut self.deferred_hooks)
    }
}

fn encode_once(
    cache: &mut Option<crate::message::EncodedMessage>,
    codec: &dyn Codec,
    msg: &dyn crate::message::AnyMessage,
) -> Option<crate::message::EncodedMessage> {
    if cache.is_none() {
        match codec.encode(msg) {
            Ok(enc) => *cache = Some(enc),
            Err(err) => {
                debug!(error = %err, message_type = msg.message_type(), "publish encode failed, remote recipients skipped");
                return None;
            }
        }
    }
    cache.clone()
}

/// Clonable handle for running operations on an entity from any task.
///
/// Obtained from [`EntityContext::handle`] or
/// [`EntityRuntime::entity_handle`](crate::system::EntityRuntime::entity_handle).
pub struct EntityHandle<E> {
    id: EntityId,
    ops: mpsc::UnboundedSender<EntityOp<E>>,
}

impl<E> Clone for EntityHandle<E> {
    fn clone(&self) -> Self {
        Self { id: self.id, ops: self.ops.clone() }
    }
}

impl<E: Entity> EntityHandle<E> {
    pub(crate) fn new(id: EntityId, ops: mpsc::UnboundedSender<EntityOp<E>>) -> Self {
        Self { id, ops }
    }

    pub(crate) fn ops(&self) -> mpsc::UnboundedSender<EntityOp<E>> {
        self.ops.clone()
    }

    /// The entity this handle addresses.
    pub fn id(&self) -> EntityId {
        self.id
    }

    /// Run `f` on the entity's task and wait for its result.
    ///
    /// # Errors
    ///
    /// [`OpCancelled`] when the entity shuts down before `f` runs.
    pub async fn execute<F, R>(&self, f: F) -> Result<R, OpCancelled>
    where
        F: FnOnce(&mut E, &mut EntityContext<E>) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (task, rx) = ExecuteTask::pair(f);
        if self.ops.send(EntityOp::Execute(Box::new(task))).is_err() {
            return Err(OpCancelled);
        }
        rx.await.map_err(|_| OpCancelled)
    }

    /// Enqueue an [`EntityTask`] without waiting for it.
    pub fn run(&self, task: Box<dyn EntityTask<E>>) -> Result<(), OpCancelled> {
        self.ops.send(EntityOp::Execute(task)).map_err(|_| OpCancelled)
    }

    /// Schedule a task for `delay` from now; the token cancels it before
    /// start.
    pub fn schedule_task(&self, delay: Duration, task: Box<dyn EntityTask<E>>) -> CancellationToken {
        let cancel = CancellationToken::new();
        let _ = self.ops.send(EntityOp::Schedule { at: Instant::now() + delay, task, cancel: cancel.clone() });
        cancel
    }
}
