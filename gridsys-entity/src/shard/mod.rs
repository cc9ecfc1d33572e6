//! The entity shard: supervisor and router for one kind's entities.
//!
//! # Components
//!
//! - [`ShardRef`] - Cheap clonable handle addressing one shard's inbox
//! - [`ShardPhase`] - Shard lifecycle phases
//! - `ShardActor` - The supervisor task: spawning, routing, watch
//!   bookkeeping, shutdown throttling, node-loss fan-out
//! - `ShutdownThrottle` - Bounded concurrent entity shutdowns per shard

pub(crate) mod actor;
pub(crate) mod state;
pub(crate) mod throttle;

// Layer 1: Standard library imports
use std::any::Any;
use std::collections::HashSet;
use std::fmt;

// Layer 2: Third-party crate imports
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

// Layer 3: Internal module imports
use crate::ask::{AskError, AskReplyEnvelope, AskResolution};
use crate::entity::TerminationReason;
use crate::message::{BoxMessage, Payload, RoutedEnvelope};
use crate::pubsub::{ChannelId, Topic};
use crate::system::ShardStartError;
use crate::util::{EntityId, ShardId};

/// Shard lifecycle phase.
///
/// ```text
/// Starting --(all auto-spawns Running)--> Running --(shutdown)--> Stopping --> Stopped
///     |
///     v (auto-spawn init failure)
/// StartingFailed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardPhase {
    /// Auto-spawn entities are initializing.
    Starting,
    /// One or more auto-spawn entities failed to initialize; draining.
    StartingFailed,
    /// Accepting all operations.
    Running,
    /// Coordinated shutdown in progress.
    Stopping,
    /// Terminal no-op sink.
    Stopped,
}

/// Cheap clonable handle addressing one shard's inbox.
///
/// This is the universal currency for routing: entity contexts talk to
/// their owning shard through one, peer shards forward envelopes through
/// each other's, and subscriber records carry the peer shard's ref for
/// direct pub/sub delivery.
#[derive(Clone)]
pub struct ShardRef {
    id: ShardId,
    tx: mpsc::UnboundedSender<ShardMsg>,
}

impl ShardRef {
    pub(crate) fn new(id: ShardId, tx: mpsc::UnboundedSender<ShardMsg>) -> Self {
        Self { id, tx }
    }

    /// The shard this handle addresses.
    pub fn id(&self) -> ShardId {
        self.id
    }

    /// Enqueue a message; returns `false` when the shard task is gone.
    pub(crate) fn send(&self, msg: ShardMsg) -> bool {
        self.tx.send(msg).is_ok()
    }
}

impl fmt::Debug for ShardRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShardRef({})", self.id)
    }
}

impl PartialEq for ShardRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ShardRef {}

/// Errors surfaced by direct shard requests (handles, execute-on).
#[derive(Debug, Error)]
pub enum ShardError {
    /// The shard is not accepting new work.
    #[error("shard {shard} is not running")]
    NotRunning {
        /// The shard that refused.
        shard: ShardId,
    },

    /// The entity id does not belong to the kind this shard hosts.
    #[error("entity {entity} does not belong to shard {shard}")]
    WrongShard {
        /// The offending entity id.
        entity: EntityId,
        /// The shard that received it.
        shard: ShardId,
    },

    /// An erased handle or task had an unexpected concrete type.
    #[error("type-erased payload did not match the shard's entity type")]
    TypeMismatch,

    /// The shard task is gone.
    #[error("shard {shard} is unreachable")]
    Unreachable {
        /// The shard that could not be reached.
        shard: ShardId,
    },
}

/// How an ask should be interpreted by the routing layer.
///
/// Subscribe and unsubscribe ride the ask machinery; their kinds make the
/// shard register or tear down watch edges while the envelope flows by.
#[derive(Debug)]
pub(crate) enum AskKind {
    Plain,
    Subscribe { topic: Topic, subscriber_channel: ChannelId },
    Unsubscribe { target_channel: ChannelId },
}

/// Synchronize-channel traffic between entities and shards.
pub(crate) enum SyncShardMsg {
    /// Entity asks its own shard to open a channel to `target`.
    BeginOpen {
        from: EntityId,
        target: EntityId,
        payload: BoxMessage,
        open: oneshot::Sender<Result<crate::sync::SyncChannel, crate::sync::SyncError>>,
    },
    /// Source shard to target shard: open request.
    BeginRequest {
        target: EntityId,
        from: EntityId,
        source_shard: ShardRef,
        source_channel: ChannelId,
        payload: Payload,
    },
    /// Accepting entity to its own shard: handler found (or not).
    BeginAccept {
        owner: EntityId,
        channel: ChannelId,
        accepted: bool,
    },
    /// Target shard back to source shard: open outcome.
    BeginResponse {
        target: EntityId,
        target_channel: ChannelId,
        source_channel: ChannelId,
        peer_shard: Option<ShardRef>,
        accepted: bool,
    },
    /// Entity to its own shard: outbound frame (`None` payload is EOF).
    LocalFrame {
        from: EntityId,
        channel: ChannelId,
        payload: Option<BoxMessage>,
    },
    /// Peer shard to hosting shard: inbound frame for a local entity.
    RemoteFrame {
        target: EntityId,
        channel: ChannelId,
        payload: Option<BoxMessage>,
    },
}

/// Everything a shard task can receive.
pub(crate) enum ShardMsg {
    /// A routed envelope, local or forwarded from a peer shard.
    Route(RoutedEnvelope),
    /// An entity starts an ask; the shard assigns the ask id and routes.
    AskRequest {
        from: EntityId,
        target: EntityId,
        kind: AskKind,
        payload: BoxMessage,
        reply: oneshot::Sender<Result<AskResolution, AskError>>,
    },
    /// A reply for an ask owned by this shard, sent directly by the target.
    AskReply(AskReplyEnvelope),
    /// Synchronize-channel plumbing.
    Sync(SyncShardMsg),
    /// A child finished initializing and is accepting messages.
    EntityReady { id: EntityId },
    /// Gate delivery for a child (bulk operations, auto-shutdown).
    RequestSuspend { id: EntityId },
    /// Re-open delivery for a suspended child and flush its buffer.
    RequestResume { id: EntityId },
    /// Queue a child for throttled shutdown.
    RequestShutdown { id: EntityId },
    /// Drop the two-way watch between a local entity and a peer (kicks).
    WatchTeardown { local: EntityId, peer: EntityId },
    /// A child task finished; `reason` says how.
    EntityTerminated { id: EntityId, reason: TerminationReason },
    /// A peer shard reports a death our local watchers care about.
    WatchedFanout { dead: EntityId, watchers: Vec<EntityId> },
    /// Cluster topology: these shards are gone.
    NodeLost { lost: HashSet<ShardId> },
    /// Resolve once the shard reaches `Running` (or fails to).
    WaitUntilRunning { reply: oneshot::Sender<Result<(), ShardStartError>> },
    /// Coordinated shutdown; reply fires when the shard is drained.
    ShutdownSync { reply: oneshot::Sender<()> },
    /// Fetch (spawning if needed) a type-erased handle to an entity.
    GetHandle { id: EntityId, reply: oneshot::Sender<Result<Box<dyn Any + Send>, ShardError>> },
    /// Run a type-erased task on an entity (spawning if needed).
    ExecuteOn { id: EntityId, task: Box<dyn Any + Send> },
}
