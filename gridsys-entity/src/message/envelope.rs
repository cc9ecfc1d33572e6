// Layer 1: Standard library imports
// (none)

// Layer 2: Third-party crate imports
// (none)

// Layer 3: Internal module imports
use super::codec::EncodedMessage;
use super::traits::BoxMessage;
use crate::ask::AskContext;
use crate::pubsub::{ChannelId, Topic};
use crate::sync::SyncChannel;
use crate::util::EntityId;

/// The payload of a routed envelope.
///
/// Payloads stay [`Payload::Local`] while an envelope moves inside one
/// process; the routing layer encodes them lazily the first time a remote
/// hop requires bytes and reuses the blob for further recipients.
#[derive(Debug)]
pub enum Payload {
    /// In-process payload, delivered by move or clone.
    Local(BoxMessage),
    /// Wire form produced by the configured [`Codec`](super::Codec).
    Encoded(EncodedMessage),
    /// No payload (e.g. watched-entity termination notices).
    Empty,
}

impl Payload {
    /// Clone the payload for fan-out to another recipient.
    pub fn clone_for_fanout(&self) -> Payload {
        match self {
            Payload::Local(msg) => Payload::Local(msg.clone_boxed()),
            Payload::Encoded(enc) => Payload::Encoded(enc.clone()),
            Payload::Empty => Payload::Empty,
        }
    }
}

/// Routing metadata attached to a payload flowing through shards.
#[derive(Debug)]
pub enum RoutedKind {
    /// Fire-and-forget message from another entity (or from outside when
    /// `sender` is `None`).
    Cast {
        /// Originating entity, if any.
        sender: Option<EntityId>,
    },
    /// Node-local control command without a sender.
    Command,
    /// Correlated request expecting a reply (see [`crate::ask`]).
    Ask(AskContext),
    /// Subscribe request; an ask whose delivery also registers the two-way
    /// death watch on the hosting shard.
    Subscribe {
        /// Correlation for the subscribe ack.
        ask: AskContext,
        /// Topic the subscriber wants.
        topic: Topic,
        /// Channel id the subscriber allocated on its own side.
        subscriber_channel: ChannelId,
    },
    /// Unsubscribe request; tears the watch down on delivery.
    Unsubscribe {
        /// Correlation for the unsubscribe ack.
        ask: AskContext,
        /// The target-side channel id identifying the subscriber record.
        target_channel: ChannelId,
    },
    /// Cast from a publisher evicting a subscriber.
    SubscriberKicked {
        /// The kicking publisher.
        sender: EntityId,
        /// The subscriber-side channel id of the evicted subscription.
        subscriber_channel: ChannelId,
    },
    /// Pub/sub traffic in either direction; the receiver resolves the
    /// channel id against its subscriber or subscription tables.
    PubSub {
        /// Peer entity the message came from.
        sender: EntityId,
        /// Receiver-side channel id.
        channel: ChannelId,
        /// Topic the message was published on.
        topic: Topic,
    },
    /// A watched peer terminated (or its node was lost).
    WatchedTerminated {
        /// The dead entity.
        dead: EntityId,
    },
    /// Open handshake of a synchronize channel, delivered through the
    /// mailbox; the channel itself then bypasses it.
    SyncBegin {
        /// The opening peer.
        sender: EntityId,
        /// Pre-wired channel for the accepting side.
        channel: SyncChannel,
    },
}

/// A payload plus routing metadata, addressed to one entity.
#[derive(Debug)]
pub struct RoutedEnvelope {
    /// Destination entity.
    pub target: EntityId,
    /// Routing metadata.
    pub kind: RoutedKind,
    /// The payload.
    pub payload: Payload,
}

impl RoutedEnvelope {
    /// Create an envelope.
    pub fn new(target: EntityId, kind: RoutedKind, payload: Payload) -> Self {
        Self { target, kind, payload }
    }

    /// Reply-like envelopes are delivered even while the target is still
    /// `Starting` or already `Stopping`; everything else is buffered.
    pub fn is_reply_like(&self) -> bool {
        matches!(self.kind, RoutedKind::SubscriberKicked { .. })
    }

    /// The originating entity, when the kind carries one.
    pub fn sender(&self) -> Option<EntityId> {
        match &self.kind {
            RoutedKind::Cast { sender } => *sender,
            RoutedKind::Command => None,
            RoutedKind::Ask(ask)
            | RoutedKind::Subscribe { ask, .. }
            | RoutedKind::Unsubscribe { ask, .. } => Some(ask.source),
            RoutedKind::SubscriberKicked { sender, .. }
            | RoutedKind::PubSub { sender, .. }
            | RoutedKind::SyncBegin { sender, .. } => Some(*sender),
            RoutedKind::WatchedTerminated { .. } => None,
        }
    }
}
