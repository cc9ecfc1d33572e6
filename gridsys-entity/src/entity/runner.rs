// Layer 1: Standard library imports
use std::backtrace::{Backtrace, BacktraceStatus};
use std::sync::Arc;
use std::time::Duration;

// Layer 2: Third-party crate imports
use async_trait::async_trait;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

// Layer 3: Internal module imports
use super::context::{EntityContext, HookEvent};
use super::lifecycle::{AutoShutdownState, EntityStatus, TerminationReason, WaitKind};
use super::ops::{EntityOp, EntityTask};
use super::traits::{Entity, EntityError, EntitySpawner};
use crate::ask::{AskContext, AskHandle, AskOutcome, AskReplyEnvelope};
use crate::dispatch::DispatchTable;
use crate::message::{BoxMessage, NoResponse, Payload, RoutedEnvelope, RoutedKind};
use crate::persist::PersistDriver;
use crate::pubsub::{ChannelId, Subscriber, SubscriberLostReason, Topic};
use crate::scheduler::TaskQueue;
use crate::shard::{ShardMsg, SyncShardMsg};
use crate::util::EntityId;

/// Idle placeholder deadline; the timer branch is disabled when the task
/// queue is empty, this value is never actually slept on.
const FAR_FUTURE: Duration = Duration::from_secs(24 * 60 * 60);

enum Step<E> {
    Op(EntityOp<E>),
    Wake,
    Closed,
}

/// The per-entity task loop.
///
/// One runner per live entity drives restore, initialization, serialized
/// message dispatch, scheduled tasks, auto-shutdown, and the final persist.
/// Handlers run strictly one at a time: the loop awaits each to completion
/// before touching the op queue again.
pub(crate) struct EntityRunner<E: Entity> {
    id: EntityId,
    ctx: EntityContext<E>,
    ops: mpsc::UnboundedReceiver<EntityOp<E>>,
    table: Arc<DispatchTable<E>>,
    spawner: Arc<dyn EntitySpawner<E>>,
    persist: Option<Arc<dyn PersistDriver<E>>>,
    queue: TaskQueue<Box<dyn EntityTask<E>>>,
    auto: AutoShutdownState,
    rng: SmallRng,
}

impl<E: Entity> EntityRunner<E> {
    pub(crate) fn new(
        id: EntityId,
        ctx: EntityContext<E>,
        ops: mpsc::UnboundedReceiver<EntityOp<E>>,
        table: Arc<DispatchTable<E>>,
        spawner: Arc<dyn EntitySpawner<E>>,
        persist: Option<Arc<dyn PersistDriver<E>>>,
    ) -> Self {
        Self {
            id,
            ctx,
            ops,
            table,
            spawner,
            persist,
            queue: TaskQueue::new(),
            auto: AutoShutdownState::new(super::lifecycle::AutoShutdownPolicy::Never),
            rng: SmallRng::from_entropy(),
        }
    }

    pub(crate) async fn run(mut self) -> TerminationReason {
        let mut entity = match self.spawner.spawn(self.id, &mut self.ctx).await {
            Ok(entity) => entity,
            Err(err) => {
                error!(entity = %self.id, error = %err, "entity restore/construction failed");
                return TerminationReason::InitializeFailed { message: err.to_string() };
            }
        };
        if let Err(err) = entity.on_initialize(&mut self.ctx).await {
            error!(entity = %self.id, error = %err, "entity initialization failed");
            return TerminationReason::InitializeFailed { message: err.to_string() };
        }

        self.ctx.set_status(EntityStatus::Running);
        self.ctx.shard_send(ShardMsg::EntityReady { id: self.id });
        if let Some(driver) = self.persist.clone() {
            driver.on_start(&mut self.ctx, &mut self.rng);
        }
        self.auto = AutoShutdownState::new(entity.auto_shutdown());
        if self.auto.enabled() {
            self.arm_auto_shutdown(WaitKind::Initial);
        }

        let reason = 'run: loop {
            // Pub/sub released by a settled subscribe dispatches before the
            // next mailbox item, keeping per-link ordering intact.
            while let Some(envelope) = self.ctx.take_ready_pubsub() {
                if let Some(reason) = self.handle_envelope(&mut entity, envelope).await {
                    break 'run reason;
                }
            }
            self.run_deferred_hooks(&mut entity).await;
            self.reconcile_auto_shutdown();

            let deadline = self.queue.next_deadline();
            let step: Step<E> = tokio::select! {
                biased;
                op = self.ops.recv() => match op {
                    Some(op) => Step::Op(op),
                    None => Step::Closed,
                },
                _ = sleep_until(deadline.unwrap_or_else(|| Instant::now() + FAR_FUTURE)), if deadline.is_some() => {
                    Step::Wake
                }
            };
            match step {
                Step::Closed => break 'run TerminationReason::Shutdown,
                Step::Wake => {
                    // Early wakes are fine: only tasks actually due run.
                    let now = Instant::now();
                    while let Some(task) = self.queue.pop_due(now) {
                        task.run(&mut entity, &mut self.ctx).await;
                    }
                }
                Step::Op(op) => {
                    if let Some(reason) = self.handle_op(&mut entity, op).await {
                        break 'run reason;
                    }
                }
            }
        };

        self.shutdown_cleanup(&mut entity, &reason).await;
        reason
    }

    async fn shutdown_cleanup(&mut self, entity: &mut E, reason: &TerminationReason) {
        // Pending on-actor work is cancelled, resolving its promises as such.
        for entry in self.queue.drain() {
            entry.into_task().cancelled();
        }
        self.ops.close();
        while let Ok(op) = self.ops.try_recv() {
            match op {
                EntityOp::Execute(task) | EntityOp::Schedule { task, .. } => task.cancelled(),
                _ => {}
            }
        }
        if reason.is_expected() {
            if let Err(err) = entity.on_shutdown(&mut self.ctx).await {
                warn!(entity = %self.id, error = %err, "shutdown hook failed");
            }
            if let Some(driver) = self.persist.clone() {
                if let Err(err) = driver.persist(entity, &mut self.ctx, true).await {
                    error!(entity = %self.id, error = %err, "final persist failed");
                }
            }
        }
    }

    async fn handle_op(&mut self, entity: &mut E, op: EntityOp<E>) -> Option<TerminationReason> {
        match op {
            EntityOp::Deliver(envelope) => self.handle_envelope(entity, envelope).await,
            EntityOp::Execute(task) => {
                task.run(entity, &mut self.ctx).await;
                None
            }
            EntityOp::Schedule { at, task, cancel } => {
                self.queue.push(at, task, cancel);
                None
            }
            EntityOp::SchedulePersist => {
                self.schedule_persist();
                None
            }
            EntityOp::Suspend => {
                self.ctx.set_status(EntityStatus::Suspended);
                let result = entity.on_suspend(&mut self.ctx).await;
                let out = self.settle(result, "suspend hook");
                if out.is_none() && self.ctx.shutdown_on_suspend {
                    self.ctx.request_shutdown();
                }
                out
            }
            EntityOp::Resume => {
                self.ctx.set_status(EntityStatus::Running);
                let result = entity.on_resume(&mut self.ctx).await;
                self.settle(result, "resume hook")
            }
            EntityOp::Shutdown => Some(TerminationReason::Shutdown),
        }
    }

    async fn handle_envelope(&mut self, entity: &mut E, envelope: RoutedEnvelope) -> Option<TerminationReason> {
        // Pub/sub for a channel whose subscribe is still in flight buffers
        // until the ack settles the subscription.
        if let RoutedKind::PubSub { channel, .. } = &envelope.kind {
            if self.ctx.is_pending_subscribe(*channel) {
                let channel = *channel;
                self.ctx.buffer_pending_subscribe(channel, envelope);
                return None;
            }
        }

        let RoutedEnvelope { kind, payload, .. } = envelope;
        match kind {
            RoutedKind::Cast { sender } => {
                let msg = self.open_payload(payload)?;
                let result = if self.table.has_cast(msg.as_any().type_id()) {
                    match self.table.dispatch_cast(entity, &mut self.ctx, sender, msg) {
                        Some(fut) => fut.await,
                        None => Ok(()),
                    }
                } else {
                    entity.on_unhandled_message(&mut self.ctx, sender, msg).await;
                    Ok(())
                };
                self.settle(result, "message handler")
            }
            RoutedKind::Command => {
                let msg = self.open_payload(payload)?;
                let result = if self.table.has_command(msg.as_any().type_id()) {
                    match self.table.dispatch_command(entity, &mut self.ctx, msg) {
                        Some(fut) => fut.await,
                        None => Ok(()),
                    }
                } else {
                    entity.on_unhandled_message(&mut self.ctx, None, msg).await;
                    Ok(())
                };
                self.settle(result, "command handler")
            }
            RoutedKind::Ask(ask) => self.handle_ask(entity, ask, payload).await,
            RoutedKind::Subscribe { ask, topic, subscriber_channel } => {
                self.handle_subscribe(entity, ask, topic, subscriber_channel, payload).await
            }
            RoutedKind::Unsubscribe { ask, target_channel } => {
                self.handle_unsubscribe(entity, ask, target_channel).await
            }
            RoutedKind::SubscriberKicked { sender, subscriber_channel } => {
                let msg = self.open_payload(payload)?;
                match self.ctx.remove_subscription(subscriber_channel) {
                    Some(subscription) => entity.on_kicked_from(&mut self.ctx, subscription, msg).await,
                    None => {
                        debug!(entity = %self.id, from = %sender, "kick for unknown subscription dropped")
                    }
                }
                None
            }
            RoutedKind::PubSub { sender, channel, topic: _ } => {
                let msg = self.open_payload(payload)?;
                if let Some(subscription) = self.ctx.subscription(channel).cloned() {
                    let result = if self.table.has_subscription_msg(msg.as_any().type_id()) {
                        match self.table.dispatch_subscription_msg(entity, &mut self.ctx, subscription, msg) {
                            Some(fut) => fut.await,
                            None => Ok(()),
                        }
                    } else {
                        entity.on_unhandled_message(&mut self.ctx, Some(sender), msg).await;
                        Ok(())
                    };
                    self.settle(result, "subscription handler")
                } else if let Some(subscriber) = self.ctx.live_subscriber(channel) {
                    let result = if self.table.has_subscriber_msg(msg.as_any().type_id()) {
                        match self.table.dispatch_subscriber_msg(entity, &mut self.ctx, subscriber, msg) {
                            Some(fut) => fut.await,
                            None => Ok(()),
                        }
                    } else {
                        entity.on_unhandled_message(&mut self.ctx, Some(sender), msg).await;
                        Ok(())
                    };
                    self.settle(result, "subscriber handler")
                } else {
                    debug!(entity = %self.id, %channel, "pub/sub message for unknown channel dropped");
                    None
                }
            }
            RoutedKind::WatchedTerminated { dead } => {
                for sub in self.ctx.remove_subscribers_of(dead) {
                    entity.on_subscriber_lost(&mut self.ctx, sub, SubscriberLostReason::Terminated).await;
                }
                for subscription in self.ctx.remove_subscriptions_of(dead) {
                    entity.on_subscription_lost(&mut self.ctx, subscription).await;
                }
                None
            }
            RoutedKind::SyncBegin { sender, channel } => {
                let local_channel = channel.channel_id();
                let Some(msg) = self.open_payload(payload) else {
                    self.ctx.shard_send(ShardMsg::Sync(SyncShardMsg::BeginAccept {
                        owner: self.id,
                        channel: local_channel,
                        accepted: false,
                    }));
                    channel.abandon();
                    return None;
                };
                if self.table.has_sync(msg.as_any().type_id()) {
                    self.ctx.shard_send(ShardMsg::Sync(SyncShardMsg::BeginAccept {
                        owner: self.id,
                        channel: local_channel,
                        accepted: true,
                    }));
                    let result = match self.table.dispatch_sync(entity, &mut self.ctx, channel, msg) {
                        Some(fut) => fut.await,
                        None => Ok(()),
                    };
                    self.settle(result, "synchronize handler")
                } else {
                    debug!(entity = %self.id, from = %sender, message_type = msg.message_type(), "no synchronize handler, rejecting open");
                    self.ctx.shard_send(ShardMsg::Sync(SyncShardMsg::BeginAccept {
                        owner: self.id,
                        channel: local_channel,
                        accepted: false,
                    }));
                    channel.abandon();
                    None
                }
            }
        }
    }

    async fn handle_ask(
        &mut self,
        entity: &mut E,
        ask: AskContext,
        payload: Payload,
    ) -> Option<TerminationReason> {
        let Some(msg) = self.open_payload_or(payload, &ask) else {
            return None;
        };
        let type_id = msg.as_any().type_id();
        if self.table.has_ask(type_id) {
            let result = match self.table.dispatch_ask(entity, &mut self.ctx, Some(ask.source), msg) {
                Some(fut) => fut.await,
                None => return None,
            };
            match result {
                Ok(reply) => {
                    self.send_reply(&ask, AskOutcome::Reply(reply));
                    None
                }
                Err(EntityError::Refusal(refusal)) => {
                    self.send_reply(&ask, AskOutcome::Refused(refusal));
                    None
                }
                Err(err) => {
                    let message = err.to_string();
                    self.send_reply(
                        &ask,
                        AskOutcome::Unexpected {
                            type_name: err.type_name(),
                            message: message.clone(),
                            stack_trace: capture_stack(),
                        },
                    );
                    error!(entity = %self.id, asker = %ask.source, error = %message, "ask handler failed, terminating entity");
                    Some(TerminationReason::UnexpectedError { message })
                }
            }
        } else if self.table.has_explicit_ask(type_id) {
            let handle = AskHandle::new(ask.clone(), self.id);
            let result = match self.table.dispatch_explicit_ask(entity, &mut self.ctx, handle, msg) {
                Some(fut) => fut.await,
                None => return None,
            };
            match result {
                Ok(()) => None,
                Err(EntityError::Refusal(_)) => {
                    warn!(entity = %self.id, "explicit ask handler returned a refusal; refuse through the handle instead");
                    None
                }
                Err(err) => {
                    let message = err.to_string();
                    error!(entity = %self.id, asker = %ask.source, error = %message, "explicit ask handler failed, terminating entity");
                    Some(TerminationReason::UnexpectedError { message })
                }
            }
        } else {
            let message = format!("no ask handler for {}", msg.message_type());
            debug!(entity = %self.id, asker = %ask.source, "{message}");
            self.send_reply(&ask, AskOutcome::Unexpected { type_name: "Unhandled".to_string(), message, stack_trace: None });
            None
        }
    }

    async fn handle_subscribe(
        &mut self,
        entity: &mut E,
        ask: AskContext,
        topic: Topic,
        subscriber_channel: ChannelId,
        payload: Payload,
    ) -> Option<TerminationReason> {
        let Some(msg) = self.open_payload_or(payload, &ask) else {
            return None;
        };
        let sub = Subscriber {
            peer: ask.source,
            peer_shard: self.ctx.resolve_or_via(ask.source),
            topic,
            in_channel: self.ctx.alloc_channel(),
            out_channel: subscriber_channel,
        };
        self.ctx.insert_pending_subscriber(sub.clone());
        match entity.on_new_subscriber(&mut self.ctx, sub.clone(), msg).await {
            Ok(response) => {
                // Flush what the entity published to the candidate during
                // the hook; it shares the ack's path, so it arrives first.
                for (topic, buffered) in self.ctx.promote_subscriber(sub.in_channel) {
                    let envelope = RoutedEnvelope::new(
                        sub.peer,
                        RoutedKind::PubSub { sender: self.id, channel: sub.out_channel, topic },
                        Payload::Local(buffered),
                    );
                    sub.peer_shard.send(ShardMsg::Route(envelope));
                }
                self.send_reply(&ask, AskOutcome::SubscribeAck { response, target_channel: sub.in_channel });
                None
            }
            Err(EntityError::Refusal(refusal)) => {
                // Refused: drop the record and whatever buffered.
                self.ctx.remove_subscriber(sub.in_channel);
                self.send_reply(&ask, AskOutcome::Refused(refusal));
                None
            }
            Err(err) => {
                self.ctx.remove_subscriber(sub.in_channel);
                let message = err.to_string();
                self.send_reply(
                    &ask,
                    AskOutcome::Unexpected {
                        type_name: err.type_name(),
                        message: message.clone(),
                        stack_trace: capture_stack(),
                    },
                );
                error!(entity = %self.id, subscriber = %ask.source, error = %message, "subscriber hook failed, terminating entity");
                Some(TerminationReason::UnexpectedError { message })
            }
        }
    }

    async fn handle_unsubscribe(
        &mut self,
        entity: &mut E,
        ask: AskContext,
        target_channel: ChannelId,
    ) -> Option<TerminationReason> {
        match self.ctx.remove_subscriber(target_channel) {
            Some(sub) => {
                entity.on_subscriber_unsubscribed(&mut self.ctx, sub.clone()).await;
                entity.on_subscriber_lost(&mut self.ctx, sub, SubscriberLostReason::Unsubscribed).await;
                self.send_reply(&ask, AskOutcome::UnsubscribeAck { found: true });
            }
            None => {
                // Already kicked or never known: a soft outcome.
                debug!(entity = %self.id, subscriber = %ask.source, "unsubscribe for unknown subscriber");
                self.send_reply(&ask, AskOutcome::UnsubscribeAck { found: false });
            }
        }
        None
    }

    async fn run_deferred_hooks(&mut self, entity: &mut E) {
        for event in self.ctx.take_deferred_hooks() {
            match event {
                HookEvent::SubscriberKicked(sub) => {
                    entity.on_subscriber_kicked(&mut self.ctx, sub.clone()).await;
                    entity.on_subscriber_lost(&mut self.ctx, sub, SubscriberLostReason::Kicked).await;
                }
            }
        }
    }

    fn schedule_persist(&mut self) {
        let Some(driver) = self.persist.clone() else {
            debug!(entity = %self.id, "schedule_persist on a non-persisted kind ignored");
            return;
        };
        if self.ctx.persist.scheduled_pending {
            return;
        }
        self.ctx.persist.scheduled_pending = true;
        self.ctx.persist.running_id += 1;
        let running_id = self.ctx.persist.running_id;
        let earliest = self.ctx.persist.last_persisted + self.ctx.options().min_scheduled_persist_interval;
        let at = earliest.max(Instant::now());
        self.queue.push(at, driver.scheduled_task(running_id), CancellationToken::new());
    }

    fn arm_auto_shutdown(&mut self, kind: WaitKind) {
        let token = CancellationToken::new();
        if let Some(wait) = self.auto.arm(kind, token.clone(), &mut self.rng) {
            debug!(entity = %self.id, ?kind, ?wait, "auto-shutdown timer armed");
            self.queue.push(Instant::now() + wait, Box::new(AutoShutdownFire), token);
        }
    }

    fn reconcile_auto_shutdown(&mut self) {
        if !self.auto.enabled() {
            return;
        }
        if self.ctx.has_subscribers() {
            self.auto.cancel();
        } else if !self.auto.is_armed() {
            self.arm_auto_shutdown(WaitKind::Linger);
        }
    }

    fn settle(&self, result: Result<(), EntityError>, what: &'static str) -> Option<TerminationReason> {
        match result {
            Ok(()) => None,
            Err(EntityError::Refusal(payload)) => {
                warn!(entity = %self.id, what, ?payload, "refusal outside an ask ignored");
                None
            }
            Err(err) => {
                let message = err.to_string();
                error!(entity = %self.id, what, error = %message, "handler failed, terminating entity");
                Some(TerminationReason::UnexpectedError { message })
            }
        }
    }

    fn send_reply(&self, ask: &AskContext, outcome: AskOutcome) {
        let envelope = AskReplyEnvelope { ask_id: ask.ask_id, asker: ask.source, from: self.id, outcome };
        if !ask.reply_to.send(ShardMsg::AskReply(envelope)) {
            debug!(entity = %self.id, asker = %ask.source, "dropping ask reply, owner shard is gone");
        }
    }

    fn open_payload(&self, payload: Payload) -> Option<BoxMessage> {
        match payload {
            Payload::Local(msg) => Some(msg),
            Payload::Encoded(enc) => match self.ctx.codec().decode(&enc.bytes) {
                Ok(msg) => Some(msg),
                Err(err) => {
                    warn!(entity = %self.id, error = %err, "dropping undecodable payload");
                    None
                }
            },
            Payload::Empty => Some(Box::new(NoResponse)),
        }
    }

    /// Like `open_payload`, but a decode failure also fails the ask.
    fn open_payload_or(&self, payload: Payload, ask: &AskContext) -> Option<BoxMessage> {
        let opened = self.open_payload(payload);
        if opened.is_none() {
            self.send_reply(
                ask,
                AskOutcome::Unexpected {
                    type_name: "Codec".to_string(),
                    message: "ask payload could not be decoded".to_string(),
                    stack_trace: None,
                },
            );
        }
        opened
    }
}

/// Fired by the auto-shutdown timer: suspend first so the mailbox drains,
/// then the suspend hook requests the shutdown proper.
struct AutoShutdownFire;

#[async_trait]
impl<E: Entity> EntityTask<E> for AutoShutdownFire {
    async fn run(self: Box<Self>, _entity: &mut E, ctx: &mut EntityContext<E>) {
        if ctx.has_subscribers() {
            // A subscriber raced the timer; stand down.
            return;
        }
        debug!(entity = %ctx.id(), "auto-shutdown wait elapsed, suspending");
        ctx.shutdown_on_suspend = true;
        ctx.request_suspend();
    }
}

fn capture_stack() -> Option<String> {
    let backtrace = Backtrace::capture();
    match backtrace.status() {
        BacktraceStatus::Captured => Some(backtrace.to_string()),
        _ => None,
    }
}
