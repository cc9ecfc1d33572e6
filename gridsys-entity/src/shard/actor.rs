// Layer 1: Standard library imports
use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

// Layer 2: Third-party crate imports
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

// Layer 3: Internal module imports
use super::state::{EntityState, OpeningSync, SyncState};
use super::throttle::ShutdownThrottle;
use super::{AskKind, ShardError, ShardMsg, ShardPhase, ShardRef, SyncShardMsg};
use crate::ask::{AskContext, AskError, AskOutcome, AskReplyEnvelope, AskResolution, PendingAsk};
use crate::dispatch::DispatchTable;
use crate::entity::{
    EntityContext, EntityHandle, EntityOp, EntityRunner, EntitySpawner, EntityStatus, EntityTask,
    TerminationReason,
};
use crate::message::{BoxMessage, Codec, Payload, RoutedEnvelope, RoutedKind};
use crate::metrics::RuntimeMetrics;
use crate::persist::PersistDriver;
use crate::pubsub::{ChannelId, WatchGraph};
use crate::sync::{SyncChannel, SyncError, SyncFrame};
use crate::system::{
    EntitySpawnFailure, RuntimeOptions, ShardRegistry, ShardStartError,
};
use crate::util::{EntityId, ShardId};

/// Crash-restarts allowed per entity inside [`RESTART_WINDOW`].
const MAX_CRASH_RESTARTS: u32 = 5;

/// Sliding window for the crash-restart limit.
const RESTART_WINDOW: Duration = Duration::from_secs(60);

/// Sliding-window crash-restart limiter, per entity.
///
/// Old entries expire as the window slides, so a transient burst does not
/// lock an entity out forever.
#[derive(Debug, Default)]
struct RestartWindow {
    events: HashMap<EntityId, VecDeque<Instant>>,
}

impl RestartWindow {
    /// Record a crash-restart attempt; `false` means the limit is hit.
    fn allow(&mut self, id: EntityId, now: Instant) -> bool {
        let events = self.events.entry(id).or_default();
        while events.front().is_some_and(|at| now.duration_since(*at) > RESTART_WINDOW) {
            events.pop_front();
        }
        if events.len() >= MAX_CRASH_RESTARTS as usize {
            return false;
        }
        events.push_back(now);
        true
    }

    fn forget(&mut self, id: EntityId) {
        self.events.remove(&id);
    }
}

/// Everything a shard needs to host one kind: the dispatch table, the
/// spawner, persistence (if any), and the kind's policy knobs.
pub(crate) struct KindRuntime<E> {
    pub table: Arc<DispatchTable<E>>,
    pub spawner: Arc<dyn EntitySpawner<E>>,
    pub persist: Option<Arc<dyn PersistDriver<E>>>,
    pub transient: bool,
    pub max_concurrent_shutdowns: i32,
}

/// The shard supervisor task.
///
/// Owns the entity table, the watch graph, ask/sync correlation state, and
/// the shutdown throttle for one `(kind, index)` partition. The task never
/// awaits anything but its inbox, so every handler below is synchronous and
/// the shard can never deadlock on a child.
pub(crate) struct ShardActor<E: crate::entity::Entity> {
    id: ShardId,
    self_ref: ShardRef,
    rx: mpsc::UnboundedReceiver<ShardMsg>,
    kind: KindRuntime<E>,
    registry: ShardRegistry,
    codec: Arc<dyn Codec>,
    options: Arc<RuntimeOptions>,
    metrics: Arc<RuntimeMetrics>,
    phase: ShardPhase,
    entities: HashMap<EntityId, EntityState<E>>,
    watch: WatchGraph,
    throttle: ShutdownThrottle,
    restarts: RestartWindow,
    auto_spawn: HashSet<EntityId>,
    start_failures: Vec<EntitySpawnFailure>,
    start_waiters: Vec<oneshot::Sender<Result<(), ShardStartError>>>,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
}

impl<E: crate::entity::Entity> ShardActor<E> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: ShardId,
        self_ref: ShardRef,
        rx: mpsc::UnboundedReceiver<ShardMsg>,
        kind: KindRuntime<E>,
        registry: ShardRegistry,
        codec: Arc<dyn Codec>,
        options: Arc<RuntimeOptions>,
        metrics: Arc<RuntimeMetrics>,
    ) -> Self {
        let throttle = ShutdownThrottle::new(kind.max_concurrent_shutdowns);
        Self {
            id,
            self_ref,
            rx,
            kind,
            registry,
            codec,
            options,
            metrics,
            phase: ShardPhase::Starting,
            entities: HashMap::new(),
            watch: WatchGraph::new(),
            throttle,
            restarts: RestartWindow::default(),
            auto_spawn: HashSet::new(),
            start_failures: Vec::new(),
            start_waiters: Vec::new(),
            shutdown_waiters: Vec::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        self.start();
        while let Some(msg) = self.rx.recv().await {
            self.handle_msg(msg);
        }
        debug!(shard = %self.id, "shard inbox closed");
    }

    fn start(&mut self) {
        let ids = self
            .registry
            .kind_meta(self.id.kind())
            .map(|meta| meta.strategy.auto_spawn_ids(self.id))
            .unwrap_or_default();
        self.auto_spawn = ids.iter().copied().collect();
        info!(shard = %self.id, auto_spawn = ids.len(), "shard starting");
        for id in ids {
            self.spawn_entity(id);
        }
        self.check_start_complete();
    }

    fn handle_msg(&mut self, msg: ShardMsg) {
        if self.phase == ShardPhase::Stopped {
            // Terminal no-op sink; only coordination messages get answers.
            match msg {
                ShardMsg::WaitUntilRunning { reply } => {
                    let _ = reply.send(Ok(()));
                }
                ShardMsg::ShutdownSync { reply } => {
                    let _ = reply.send(());
                }
                ShardMsg::GetHandle { reply, .. } => {
                    let _ = reply.send(Err(ShardError::NotRunning { shard: self.id }));
                }
                _ => {}
            }
            return;
        }
        match msg {
            ShardMsg::Route(envelope) => self.route(envelope),
            ShardMsg::AskRequest { from, target, kind, payload, reply } => {
                self.handle_ask_request(from, target, kind, payload, reply)
            }
            ShardMsg::AskReply(envelope) => self.handle_ask_reply(envelope),
            ShardMsg::Sync(sync) => self.handle_sync(sync),
            ShardMsg::EntityReady { id } => self.handle_entity_ready(id),
            ShardMsg::RequestSuspend { id } => {
                if let Some(state) = self.entities.get_mut(&id) {
                    if state.status == EntityStatus::Running {
                        state.status = EntityStatus::Suspended;
                        let _ = state.send(EntityOp::Suspend);
                    }
                }
            }
            ShardMsg::RequestResume { id } => {
                if let Some(state) = self.entities.get_mut(&id) {
                    if state.status == EntityStatus::Suspended {
                        state.status = EntityStatus::Running;
                        // The resume hook runs before the buffered backlog.
                        let _ = state.send(EntityOp::Resume);
                        let pending: Vec<RoutedEnvelope> = state.pending.drain(..).collect();
                        for envelope in pending {
                            let _ = state.send(EntityOp::Deliver(envelope));
                        }
                    }
                }
            }
            ShardMsg::RequestShutdown { id } => self.request_entity_shutdown(id),
            ShardMsg::WatchTeardown { local, peer } => {
                if !self.watch.unregister_pair(local, peer) {
                    debug!(shard = %self.id, %local, %peer, "watch teardown found no edges");
                }
            }
            ShardMsg::EntityTerminated { id, reason } => self.handle_termination(id, reason),
            ShardMsg::WatchedFanout { dead, watchers } => {
                for watcher in watchers {
                    self.watch.unregister_pair(watcher, dead);
                    self.notify_watcher(watcher, dead);
                }
            }
            ShardMsg::NodeLost { lost } => self.handle_node_lost(&lost),
            ShardMsg::WaitUntilRunning { reply } => match self.phase {
                ShardPhase::Running | ShardPhase::Stopping => {
                    let _ = reply.send(Ok(()));
                }
                ShardPhase::StartingFailed => {
                    let _ = reply.send(Err(ShardStartError {
                        shard: self.id,
                        failures: self.start_failures.clone(),
                    }));
                }
                ShardPhase::Starting => self.start_waiters.push(reply),
                ShardPhase::Stopped => {
                    let _ = reply.send(Ok(()));
                }
            },
            ShardMsg::ShutdownSync { reply } => self.begin_shutdown(reply),
            ShardMsg::GetHandle { id, reply } => {
                let _ = reply.send(self.get_handle(id));
            }
            ShardMsg::ExecuteOn { id, task } => self.execute_on(id, task),
        }
    }

    // ------------------------------------------------------------------
    // Spawning
    // ------------------------------------------------------------------

    fn spawn_entity(&mut self, id: EntityId) {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let ctx = EntityContext::new(
            id,
            self.self_ref.clone(),
            ops_tx.clone(),
            self.registry.clone(),
            Arc::clone(&self.codec),
            Arc::clone(&self.options),
            Arc::clone(&self.metrics),
        );
        let runner = EntityRunner::new(
            id,
            ctx,
            ops_rx,
            Arc::clone(&self.kind.table),
            Arc::clone(&self.kind.spawner),
            self.kind.persist.clone(),
        );
        let shard = self.self_ref.clone();
        tokio::spawn(async move {
            let reason = match AssertUnwindSafe(runner.run()).catch_unwind().await {
                Ok(reason) => reason,
                Err(panic) => TerminationReason::Panicked { message: panic_message(panic) },
            };
            shard.send(ShardMsg::EntityTerminated { id, reason });
        });
        self.metrics.record_entity_spawned();
        self.entities.insert(id, EntityState::new(id, ops_tx));
        debug!(shard = %self.id, entity = %id, "entity spawned");
    }

    /// Make sure `id` has a live (possibly still starting) entity.
    fn ensure_entity(&mut self, id: EntityId) -> bool {
        if self.entities.contains_key(&id) {
            return true;
        }
        if self.id.is_proxy() || !matches!(self.phase, ShardPhase::Starting | ShardPhase::Running) {
            return false;
        }
        self.spawn_entity(id);
        true
    }

    fn get_handle(&mut self, id: EntityId) -> Result<Box<dyn Any + Send>, ShardError> {
        if self.registry.shard_id_for(id) != Some(self.id) {
            return Err(ShardError::WrongShard { entity: id, shard: self.id });
        }
        if !self.ensure_entity(id) {
            return Err(ShardError::NotRunning { shard: self.id });
        }
        match self.entities.get(&id) {
            Some(state) => Ok(Box::new(EntityHandle::new(id, state.ops())) as Box<dyn Any + Send>),
            None => Err(ShardError::NotRunning { shard: self.id }),
        }
    }

    fn execute_on(&mut self, id: EntityId, task: Box<dyn Any + Send>) {
        let task = match task.downcast::<Box<dyn EntityTask<E>>>() {
            Ok(task) => *task,
            Err(_) => {
                warn!(shard = %self.id, entity = %id, "execute-on task of foreign entity type dropped");
                return;
            }
        };
        if !self.ensure_entity(id) {
            task.cancelled();
            return;
        }
        if let Some(state) = self.entities.get(&id) {
            let _ = state.send(EntityOp::Execute(task));
        }
    }

    // ------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------

    fn route(&mut self, envelope: RoutedEnvelope) {
        let target = envelope.target;
        if !self.registry.is_registered(target.kind()) {
            warn!(shard = %self.id, %target, "dropping envelope for unregistered kind");
            return;
        }
        let Some(shard_id) = self.registry.shard_id_for(target) else {
            warn!(shard = %self.id, %target, "dropping unroutable envelope");
            return;
        };
        if shard_id == self.id {
            self.deliver_local(envelope);
            return;
        }
        // A kick forwarded on behalf of a local publisher drops our side of
        // the watch as it passes through.
        if let RoutedKind::SubscriberKicked { sender, .. } = &envelope.kind {
            self.watch.unregister_pair(*sender, target);
        }
        match self.registry.shard_ref(shard_id) {
            Some(peer) => {
                peer.send(ShardMsg::Route(envelope));
            }
            None => {
                warn!(shard = %self.id, %target, peer = %shard_id, "no route to peer shard, dropping envelope");
                self.fail_routed_ask(envelope, "no route to target shard".to_string(), false);
            }
        }
    }

    fn deliver_local(&mut self, envelope: RoutedEnvelope) {
        let target = envelope.target;
        // Watch side effects of the pub/sub control plane happen on the
        // delivery path, so the graph is current before the entity runs.
        match &envelope.kind {
            RoutedKind::Subscribe { ask, .. } => {
                self.watch.register_pair(ask.source, target);
            }
            RoutedKind::Unsubscribe { ask, .. } => {
                self.watch.unregister_pair(ask.source, target);
            }
            RoutedKind::SubscriberKicked { sender, .. } => {
                self.watch.unregister_pair(*sender, target);
            }
            _ => {}
        }
        if !self.ensure_entity(target) {
            self.fail_routed_ask(envelope, "shard is not accepting new entities".to_string(), false);
            return;
        }
        let reply_like = envelope.is_reply_like();
        let Some(state) = self.entities.get_mut(&target) else {
            return;
        };
        if state.status.accepts(reply_like) && state.is_open() {
            let _ = state.send(EntityOp::Deliver(envelope));
        } else {
            state.pending.push_back(envelope);
        }
    }

    /// If the undeliverable envelope was an ask, fail it back to the owner
    /// shard; casts and notifications just drop.
    fn fail_routed_ask(&self, envelope: RoutedEnvelope, reason: String, unexpected: bool) {
        let target = envelope.target;
        let ask = match envelope.kind {
            RoutedKind::Ask(ask)
            | RoutedKind::Subscribe { ask, .. }
            | RoutedKind::Unsubscribe { ask, .. } => ask,
            _ => return,
        };
        let outcome = if unexpected {
            AskOutcome::Unexpected {
                type_name: "EntityTerminated".to_string(),
                message: reason,
                stack_trace: None,
            }
        } else {
            AskOutcome::Unavailable { reason }
        };
        let reply = AskReplyEnvelope { ask_id: ask.ask_id, asker: ask.source, from: target, outcome };
        if !ask.reply_to.send(ShardMsg::AskReply(reply)) {
            debug!(shard = %self.id, asker = %ask.source, "owner shard gone while failing ask");
        }
    }

    // ------------------------------------------------------------------
    // Asks
    // ------------------------------------------------------------------

    fn handle_ask_request(
        &mut self,
        from: EntityId,
        target: EntityId,
        kind: AskKind,
        payload: BoxMessage,
        reply: oneshot::Sender<Result<AskResolution, AskError>>,
    ) {
        if !self.registry.is_registered(target.kind()) {
            let _ = reply.send(Err(AskError::TargetUnavailable {
                target,
                reason: format!("kind {} is not registered", target.kind()),
            }));
            return;
        }
        let self_ref = self.self_ref.clone();
        let Some(state) = self.entities.get_mut(&from) else {
            // The asker raced its own termination; the promise dies with it.
            return;
        };
        state.sweep_abandoned_asks();
        let ask_id = state.alloc_ask_id();
        state.asks.insert(ask_id, PendingAsk { target, promise: reply });
        let ask = AskContext { ask_id, source: from, reply_to: self_ref };
        let routed_kind = match kind {
            AskKind::Plain => RoutedKind::Ask(ask),
            AskKind::Subscribe { topic, subscriber_channel } => {
                RoutedKind::Subscribe { ask, topic, subscriber_channel }
            }
            AskKind::Unsubscribe { target_channel } => RoutedKind::Unsubscribe { ask, target_channel },
        };
        self.route(RoutedEnvelope::new(target, routed_kind, Payload::Local(payload)));
    }

    fn handle_ask_reply(&mut self, envelope: AskReplyEnvelope) {
        let AskReplyEnvelope { ask_id, asker, from, outcome } = envelope;
        // Subscribe/unsubscribe acks observed on the reply path keep our
        // side of the watch graph in step with the target's.
        match &outcome {
            AskOutcome::SubscribeAck { .. } => {
                self.watch.register_pair(asker, from);
            }
            AskOutcome::UnsubscribeAck { .. } => {
                self.watch.unregister_pair(asker, from);
            }
            _ => {}
        }
        let Some(state) = self.entities.get_mut(&asker) else {
            debug!(shard = %self.id, %asker, %ask_id, "ask reply for terminated asker dropped");
            return;
        };
        let Some(pending) = state.asks.remove(&ask_id) else {
            debug!(shard = %self.id, %asker, %ask_id, "unknown or expired ask reply dropped");
            return;
        };
        let result = match outcome {
            AskOutcome::Reply(msg) => Ok(AskResolution::Reply(msg)),
            AskOutcome::SubscribeAck { response, target_channel } => {
                Ok(AskResolution::SubscribeAck { response, target_channel })
            }
            AskOutcome::UnsubscribeAck { found } => Ok(AskResolution::UnsubscribeAck { found }),
            AskOutcome::Refused(payload) => Err(AskError::Refused { target: from, payload }),
            AskOutcome::Unexpected { type_name, message, stack_trace } => {
                Err(AskError::RemoteUnexpected { target: from, type_name, message, stack_trace })
            }
            AskOutcome::Unavailable { reason } => Err(AskError::TargetUnavailable { target: from, reason }),
        };
        if pending.promise.send(result).is_err() {
            debug!(shard = %self.id, %asker, %ask_id, "asker stopped waiting for reply");
        }
    }

    // ------------------------------------------------------------------
    // Synchronize channels
    // ------------------------------------------------------------------

    fn handle_sync(&mut self, msg: SyncShardMsg) {
        match msg {
            SyncShardMsg::BeginOpen { from, target, payload, open } => {
                if !self.registry.is_registered(target.kind()) {
                    let _ = open.send(Err(SyncError::OpenFailed {
                        target,
                        reason: format!("kind {} is not registered", target.kind()),
                    }));
                    return;
                }
                let Some(peer) = self.registry.resolve(target) else {
                    let _ = open.send(Err(SyncError::OpenFailed {
                        target,
                        reason: "no route to target shard".to_string(),
                    }));
                    return;
                };
                let self_ref = self.self_ref.clone();
                let Some(state) = self.entities.get_mut(&from) else {
                    return;
                };
                let channel = state.alloc_sync_channel();
                let (frame_tx, frame_rx) = mpsc::unbounded_channel();
                state.syncs.insert(
                    channel,
                    SyncState {
                        local_channel: channel,
                        peer: target,
                        remote_channel: None,
                        peer_shard: None,
                        frames: frame_tx,
                        opening: Some(OpeningSync { open, reader: frame_rx }),
                        local_closed: false,
                        remote_closed: false,
                    },
                );
                peer.send(ShardMsg::Sync(SyncShardMsg::BeginRequest {
                    target,
                    from,
                    source_shard: self_ref,
                    source_channel: channel,
                    payload: Payload::Local(payload),
                }));
            }
            SyncShardMsg::BeginRequest { target, from, source_shard, source_channel, payload } => {
                if !self.ensure_entity(target) {
                    source_shard.send(ShardMsg::Sync(SyncShardMsg::BeginResponse {
                        target: from,
                        target_channel: source_channel,
                        source_channel: ChannelId(0),
                        peer_shard: None,
                        accepted: false,
                    }));
                    return;
                }
                let self_ref = self.self_ref.clone();
                let Some(state) = self.entities.get_mut(&target) else {
                    return;
                };
                let channel = state.alloc_sync_channel();
                let (frame_tx, frame_rx) = mpsc::unbounded_channel();
                state.syncs.insert(
                    channel,
                    SyncState {
                        local_channel: channel,
                        peer: from,
                        remote_channel: Some(source_channel),
                        peer_shard: Some(source_shard),
                        frames: frame_tx,
                        opening: None,
                        local_closed: false,
                        remote_closed: false,
                    },
                );
                let sync_channel = SyncChannel::new(target, from, channel, frame_rx, self_ref);
                let envelope =
                    RoutedEnvelope::new(target, RoutedKind::SyncBegin { sender: from, channel: sync_channel }, payload);
                if state.status.accepts(false) && state.is_open() {
                    let _ = state.send(EntityOp::Deliver(envelope));
                } else {
                    state.pending.push_back(envelope);
                }
            }
            SyncShardMsg::BeginAccept { owner, channel, accepted } => {
                let self_ref = self.self_ref.clone();
                let Some(state) = self.entities.get_mut(&owner) else {
                    return;
                };
                let Some(sync) = state.syncs.get(&channel) else {
                    return;
                };
                let (peer, remote, peer_shard) = match (sync.remote_channel, sync.peer_shard.clone()) {
                    (Some(remote), Some(peer_shard)) => (sync.peer, remote, peer_shard),
                    _ => return,
                };
                if !accepted {
                    state.syncs.remove(&channel);
                }
                peer_shard.send(ShardMsg::Sync(SyncShardMsg::BeginResponse {
                    target: peer,
                    target_channel: remote,
                    source_channel: channel,
                    peer_shard: Some(self_ref),
                    accepted,
                }));
            }
            SyncShardMsg::BeginResponse { target, target_channel, source_channel, peer_shard, accepted } => {
                let self_ref = self.self_ref.clone();
                let Some(state) = self.entities.get_mut(&target) else {
                    return;
                };
                let Some(sync) = state.syncs.get_mut(&target_channel) else {
                    debug!(shard = %self.id, entity = %target, "sync open response for unknown channel");
                    return;
                };
                let Some(opening) = sync.opening.take() else {
                    return;
                };
                if accepted {
                    sync.remote_channel = Some(source_channel);
                    sync.peer_shard = peer_shard;
                    let peer = sync.peer;
                    let channel = SyncChannel::new(target, peer, target_channel, opening.reader, self_ref);
                    let _ = opening.open.send(Ok(channel));
                } else {
                    let peer = sync.peer;
                    state.syncs.remove(&target_channel);
                    let _ = opening.open.send(Err(SyncError::Rejected { target: peer }));
                }
            }
            SyncShardMsg::LocalFrame { from, channel, payload } => {
                let Some(state) = self.entities.get_mut(&from) else {
                    return;
                };
                let Some(sync) = state.syncs.get_mut(&channel) else {
                    warn!(shard = %self.id, entity = %from, %channel, "write to closed synchronize channel dropped");
                    return;
                };
                if payload.is_none() {
                    sync.local_closed = true;
                }
                let forward = match (sync.remote_channel, sync.peer_shard.clone()) {
                    (Some(remote), Some(peer_shard)) => Some((sync.peer, remote, peer_shard)),
                    _ => None,
                };
                if sync.is_drained() {
                    state.syncs.remove(&channel);
                }
                match forward {
                    Some((peer, remote, peer_shard)) => {
                        peer_shard.send(ShardMsg::Sync(SyncShardMsg::RemoteFrame {
                            target: peer,
                            channel: remote,
                            payload,
                        }));
                    }
                    None => {
                        debug!(shard = %self.id, entity = %from, %channel, "frame before open completed dropped")
                    }
                }
            }
            SyncShardMsg::RemoteFrame { target, channel, payload } => {
                let Some(state) = self.entities.get_mut(&target) else {
                    return;
                };
                let Some(sync) = state.syncs.get_mut(&channel) else {
                    warn!(shard = %self.id, entity = %target, %channel, "frame for closed synchronize channel dropped");
                    return;
                };
                let frame = match payload {
                    Some(msg) => SyncFrame::Message(msg),
                    None => {
                        sync.remote_closed = true;
                        SyncFrame::Eof
                    }
                };
                let _ = sync.frames.send(frame);
                if sync.is_drained() {
                    state.syncs.remove(&channel);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    fn handle_entity_ready(&mut self, id: EntityId) {
        let mut drain_immediately = false;
        if let Some(state) = self.entities.get_mut(&id) {
            if state.status != EntityStatus::Starting {
                return;
            }
            state.status = EntityStatus::Running;
            let pending: Vec<RoutedEnvelope> = state.pending.drain(..).collect();
            for envelope in pending {
                let _ = state.send(EntityOp::Deliver(envelope));
            }
            debug!(shard = %self.id, entity = %id, "entity running");
            if matches!(self.phase, ShardPhase::Stopping | ShardPhase::StartingFailed) {
                drain_immediately = true;
            }
        } else {
            return;
        }
        if drain_immediately {
            self.request_entity_shutdown(id);
            return;
        }
        if self.phase == ShardPhase::Starting && self.auto_spawn.contains(&id) {
            self.check_start_complete();
        }
    }

    /// An auto-spawn entity cannot be kept alive: record the failure, fail
    /// pending start waiters, and drain whatever is left.
    fn fail_shard(&mut self, entity: EntityId, message: &str) {
        self.start_failures.push(EntitySpawnFailure { entity, message: message.to_string() });
        if self.phase != ShardPhase::StartingFailed {
            self.phase = ShardPhase::StartingFailed;
            error!(shard = %self.id, %entity, "auto-spawn entity failed, shard disabled");
        }
        let err = ShardStartError { shard: self.id, failures: self.start_failures.clone() };
        for waiter in self.start_waiters.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
        let ids: Vec<EntityId> = self.entities.keys().copied().collect();
        for other in ids {
            self.request_entity_shutdown(other);
        }
    }

    fn check_start_complete(&mut self) {
        if self.phase != ShardPhase::Starting {
            return;
        }
        let all_running = self
            .auto_spawn
            .iter()
            .all(|id| self.entities.get(id).is_some_and(|state| state.status == EntityStatus::Running));
        if all_running {
            self.phase = ShardPhase::Running;
            info!(shard = %self.id, "shard running");
            for waiter in self.start_waiters.drain(..) {
                let _ = waiter.send(Ok(()));
            }
        }
    }

    fn request_entity_shutdown(&mut self, id: EntityId) {
        let Some(state) = self.entities.get_mut(&id) else {
            return;
        };
        if state.status == EntityStatus::Stopping {
            return;
        }
        state.status = EntityStatus::Stopping;
        state.shutdown_started_at = Some(Instant::now());
        self.throttle.enqueue(id);
        self.pump_shutdowns();
    }

    fn pump_shutdowns(&mut self) {
        while let Some(id) = self.throttle.pop() {
            match self.entities.get(&id) {
                Some(state) => {
                    // A closed channel means the runner is already on its way
                    // out; the termination message completes the slot.
                    let _ = state.send(EntityOp::Shutdown);
                }
                None => {
                    self.throttle.complete(id);
                }
            }
        }
    }

    fn handle_termination(&mut self, id: EntityId, reason: TerminationReason) {
        let Some(mut state) = self.entities.remove(&id) else {
            return;
        };
        self.throttle.complete(id);
        let expected = reason.is_expected();
        self.metrics.record_entity_terminated(expected);
        let was_starting = state.status == EntityStatus::Starting;

        if expected {
            let took = state.shutdown_started_at.map(|at| at.elapsed());
            debug!(shard = %self.id, entity = %id, ?took, "entity shut down");
        } else {
            error!(shard = %self.id, entity = %id, reason = reason.message(), "entity terminated unexpectedly");
        }

        // Half-open synchronize endpoints close toward their peers.
        for sync in state.syncs.values() {
            if sync.remote_closed {
                continue;
            }
            if let (Some(remote), Some(peer_shard)) = (sync.remote_channel, sync.peer_shard.clone()) {
                debug!(shard = %self.id, entity = %id, channel = %sync.local_channel, "closing synchronize endpoint of dead entity");
                peer_shard.send(ShardMsg::Sync(SyncShardMsg::RemoteFrame {
                    target: sync.peer,
                    channel: remote,
                    payload: None,
                }));
            }
        }
        state.syncs.clear();

        // A crash while Starting drops the buffered backlog (failing its
        // asks) so a respawn cannot loop on the same poison message.
        if !expected && was_starting {
            let pending: Vec<RoutedEnvelope> = state.pending.drain(..).collect();
            for envelope in pending {
                self.fail_routed_ask(envelope, reason.message().to_string(), true);
            }
            if self.phase == ShardPhase::Starting && self.auto_spawn.contains(&id) {
                self.fail_shard(id, reason.message());
            }
        }

        // Watchers hear about the death exactly once; edges are erased.
        let watchers = self.watch.remove_entity(id);
        self.fan_out_termination(id, watchers);

        // Restart policy: auto-spawn entities come back while the shard is
        // healthy; otherwise only to drain a leftover backlog.
        let shard_active = matches!(self.phase, ShardPhase::Starting | ShardPhase::Running);
        let is_auto_spawn = self.auto_spawn.contains(&id);
        let mut should_restart =
            shard_active && (is_auto_spawn || (!self.kind.transient && !state.pending.is_empty()));
        if should_restart && !expected && !self.restarts.allow(id, Instant::now()) {
            should_restart = false;
            error!(
                shard = %self.id,
                entity = %id,
                max = MAX_CRASH_RESTARTS,
                window = ?RESTART_WINDOW,
                "crash-restart limit exceeded"
            );
            if is_auto_spawn {
                // A looping service entity is fatal for the whole shard.
                self.fail_shard(id, reason.message());
            }
        }
        if expected {
            self.restarts.forget(id);
        }
        if should_restart {
            self.metrics.record_entity_restarted();
            info!(shard = %self.id, entity = %id, "restarting entity");
            let pending = std::mem::take(&mut state.pending);
            self.spawn_entity(id);
            if let Some(fresh) = self.entities.get_mut(&id) {
                fresh.pending = pending;
            }
        } else {
            for envelope in state.pending.drain(..) {
                self.fail_routed_ask(envelope, "entity terminated".to_string(), false);
            }
        }

        self.pump_shutdowns();
        if self.phase == ShardPhase::Stopping && self.entities.is_empty() {
            self.finish_shutdown();
        }
    }

    // ------------------------------------------------------------------
    // Watch fan-out & node loss
    // ------------------------------------------------------------------

    fn notify_watcher(&mut self, watcher: EntityId, dead: EntityId) {
        let envelope =
            RoutedEnvelope::new(watcher, RoutedKind::WatchedTerminated { dead }, Payload::Empty);
        self.deliver_local(envelope);
    }

    fn fan_out_termination(&mut self, dead: EntityId, watchers: Vec<EntityId>) {
        let mut remote: HashMap<ShardId, Vec<EntityId>> = HashMap::new();
        for watcher in watchers {
            match self.registry.shard_id_for(watcher) {
                Some(shard_id) if shard_id == self.id => self.notify_watcher(watcher, dead),
                Some(shard_id) => remote.entry(shard_id).or_default().push(watcher),
                None => {}
            }
        }
        // One batched message per remote shard holding watchers.
        for (shard_id, watchers) in remote {
            match self.registry.shard_ref(shard_id) {
                Some(peer) => {
                    peer.send(ShardMsg::WatchedFanout { dead, watchers });
                }
                None => warn!(shard = %self.id, peer = %shard_id, "no route for watch fan-out"),
            }
        }
    }

    fn handle_node_lost(&mut self, lost: &HashSet<ShardId>) {
        let dead_ids: Vec<EntityId> = self
            .watch
            .watched_ids()
            .into_iter()
            .filter(|id| self.registry.shard_id_for(*id).is_some_and(|shard| lost.contains(&shard)))
            .collect();
        if dead_ids.is_empty() {
            return;
        }
        info!(shard = %self.id, dead = dead_ids.len(), "node loss severs watched entities");
        for dead in dead_ids {
            let watchers = self.watch.remove_entity(dead);
            for watcher in watchers {
                // Peers of the lost node run the same sweep themselves; we
                // only notify our own entities.
                if self.registry.shard_id_for(watcher) == Some(self.id) {
                    self.notify_watcher(watcher, dead);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Shard shutdown
    // ------------------------------------------------------------------

    fn begin_shutdown(&mut self, reply: oneshot::Sender<()>) {
        match self.phase {
            ShardPhase::Stopped => {
                let _ = reply.send(());
                return;
            }
            ShardPhase::Stopping => {
                self.shutdown_waiters.push(reply);
                return;
            }
            _ => {}
        }
        info!(shard = %self.id, entities = self.entities.len(), "shard stopping");
        self.phase = ShardPhase::Stopping;
        self.shutdown_waiters.push(reply);
        if self.entities.is_empty() {
            self.finish_shutdown();
            return;
        }
        let ids: Vec<EntityId> = self.entities.keys().copied().collect();
        for id in ids {
            self.request_entity_shutdown(id);
        }
    }

    fn finish_shutdown(&mut self) {
        info!(shard = %self.id, "shard drained");
        self.phase = ShardPhase::Stopped;
        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "entity task panicked".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::EntityKind;

    const KIND: EntityKind = EntityKind::new(1, "Player");

    #[test]
    fn test_restart_window_limits_then_slides() {
        let id = EntityId::new(KIND, 1);
        let mut window = RestartWindow::default();
        let base = Instant::now();

        for n in 0..MAX_CRASH_RESTARTS {
            assert!(window.allow(id, base + Duration::from_secs(n as u64)), "restart {n} should pass");
        }
        assert!(!window.allow(id, base + Duration::from_secs(5)));

        // Once the early crashes fall out of the window, restarts resume.
        assert!(window.allow(id, base + RESTART_WINDOW + Duration::from_secs(3)));
    }

    #[test]
    fn test_restart_window_is_per_entity() {
        let mut window = RestartWindow::default();
        let base = Instant::now();
        let a = EntityId::new(KIND, 1);
        let b = EntityId::new(KIND, 2);

        for _ in 0..MAX_CRASH_RESTARTS {
            assert!(window.allow(a, base));
        }
        assert!(!window.allow(a, base));
        assert!(window.allow(b, base), "an unrelated entity is not limited");

        window.forget(a);
        assert!(window.allow(a, base), "a clean shutdown resets the window");
    }
}
