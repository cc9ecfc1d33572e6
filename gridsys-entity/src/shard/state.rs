// Layer 1: Standard library imports
use std::collections::{HashMap, VecDeque};

// Layer 2: Third-party crate imports
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

// Layer 3: Internal module imports
use crate::ask::{AskId, PendingAsk};
use crate::entity::{EntityOp, EntityStatus};
use crate::message::RoutedEnvelope;
use crate::pubsub::ChannelId;
use crate::shard::ShardRef;
use crate::sync::{SyncChannel, SyncError, SyncFrame};
use crate::util::EntityId;

/// Source-side bookkeeping of a synchronize open still in flight.
pub(crate) struct OpeningSync {
    /// Resolves the caller's `synchronize` future.
    pub open: oneshot::Sender<Result<SyncChannel, SyncError>>,
    /// The reader wired up at open time so early frames buffer.
    pub reader: mpsc::UnboundedReceiver<SyncFrame>,
}

/// Shard-side state of one synchronize channel endpoint.
pub(crate) struct SyncState {
    /// Channel id on our entity's side.
    pub local_channel: ChannelId,
    /// The entity on the other end.
    pub peer: EntityId,
    /// The peer side's channel id, once the handshake fixed it.
    pub remote_channel: Option<ChannelId>,
    /// Shard hosting the peer endpoint.
    pub peer_shard: Option<ShardRef>,
    /// Feed into our entity's reader.
    pub frames: mpsc::UnboundedSender<SyncFrame>,
    /// Present on the opening side until the peer responds.
    pub opening: Option<OpeningSync>,
    /// Our entity sent EOF.
    pub local_closed: bool,
    /// The peer sent EOF.
    pub remote_closed: bool,
}

impl SyncState {
    /// Both directions closed; the state can be dropped.
    pub fn is_drained(&self) -> bool {
        self.local_closed && self.remote_closed
    }
}

/// Shard-side bookkeeping for one live (or starting) entity.
pub(crate) struct EntityState<E> {
    pub id: EntityId,
    pub status: EntityStatus,
    ops: mpsc::UnboundedSender<EntityOp<E>>,
    /// Envelopes buffered while the entity is Starting/Suspended/Stopping.
    pub pending: VecDeque<RoutedEnvelope>,
    next_ask_id: u64,
    /// Outstanding asks this entity initiated.
    pub asks: HashMap<AskId, PendingAsk>,
    next_sync_channel: u32,
    /// Open synchronize endpoints of this entity.
    pub syncs: HashMap<ChannelId, SyncState>,
    /// Set when the shard moved the entity into `Stopping`.
    pub shutdown_started_at: Option<Instant>,
}

impl<E> EntityState<E> {
    pub fn new(id: EntityId, ops: mpsc::UnboundedSender<EntityOp<E>>) -> Self {
        Self {
            id,
            status: EntityStatus::Starting,
            ops,
            pending: VecDeque::new(),
            next_ask_id: 0,
            asks: HashMap::new(),
            next_sync_channel: 0,
            syncs: HashMap::new(),
            shutdown_started_at: None,
        }
    }

    /// Clone of the op sender, for handing out entity handles.
    pub fn ops(&self) -> mpsc::UnboundedSender<EntityOp<E>> {
        self.ops.clone()
    }

    /// Enqueue an op; `false` when the entity task is gone.
    pub fn send(&self, op: EntityOp<E>) -> bool {
        self.ops.send(op).is_ok()
    }

    /// Whether the entity task still consumes ops.
    pub fn is_open(&self) -> bool {
        !self.ops.is_closed()
    }

    pub fn alloc_ask_id(&mut self) -> AskId {
        let id = AskId(self.next_ask_id);
        self.next_ask_id += 1;
        id
    }

    pub fn alloc_sync_channel(&mut self) -> ChannelId {
        let id = ChannelId(self.next_sync_channel);
        self.next_sync_channel += 1;
        id
    }

    /// Drop pending asks whose caller stopped waiting (timed out); returns
    /// how many were swept.
    pub fn sweep_abandoned_asks(&mut self) -> usize {
        let entity = self.id;
        let before = self.asks.len();
        self.asks.retain(|ask_id, pending| {
            let keep = !pending.is_abandoned();
            if !keep {
                tracing::debug!(%entity, %ask_id, target = %pending.target, "sweeping abandoned ask");
            }
            keep
        });
        before - self.asks.len()
    }
}
