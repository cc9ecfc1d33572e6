// Layer 1: Standard library imports
use std::fmt::{self, Display};

// Layer 2: Third-party crate imports
// (none)

// Layer 3: Internal module imports
use crate::shard::ShardRef;
use crate::util::EntityId;

/// Pub/sub channel id, monotonic within one entity.
///
/// Each side of a link allocates its own id; envelopes carry the receiver's
/// id so lookups stay local.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u32);

impl Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

/// One of up to 32 notification topics a publisher exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Topic(pub u32);

impl Topic {
    const MAX: u32 = 31;
}

impl Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "topic{}", self.0)
    }
}

/// Bit set of topics, for masked publishes.
///
/// # Example
/// ```rust
/// use gridsys_entity::pubsub::{Topic, TopicMask};
///
/// let mask = TopicMask::single(Topic(0)).with(Topic(3));
/// assert!(mask.contains(Topic(0)));
/// assert!(mask.contains(Topic(3)));
/// assert!(!mask.contains(Topic(1)));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicMask(pub u32);

impl TopicMask {
    /// Mask matching every topic.
    pub const ALL: TopicMask = TopicMask(u32::MAX);

    /// Mask matching exactly one topic.
    pub const fn single(topic: Topic) -> Self {
        TopicMask(1 << (topic.0 & Topic::MAX))
    }

    /// Add a topic to the mask.
    pub const fn with(self, topic: Topic) -> Self {
        TopicMask(self.0 | TopicMask::single(topic).0)
    }

    /// Whether the mask covers `topic`.
    pub const fn contains(self, topic: Topic) -> bool {
        self.0 & TopicMask::single(topic).0 != 0
    }
}

/// Why a publisher lost a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberLostReason {
    /// The subscriber unsubscribed.
    Unsubscribed,
    /// We kicked it.
    Kicked,
    /// The subscriber (or its node) died.
    Terminated,
}

/// Publisher-side record of one subscriber.
#[derive(Debug, Clone)]
pub struct Subscriber {
    /// The subscribing entity.
    pub peer: EntityId,
    /// Shard hosting the subscriber; publishes are delivered through it.
    pub(crate) peer_shard: ShardRef,
    /// Topic the subscriber listens on.
    pub topic: Topic,
    /// Our channel id for this subscriber (the key in our table).
    pub in_channel: ChannelId,
    /// The subscriber's own channel id, stamped on outgoing envelopes.
    pub out_channel: ChannelId,
}

/// Subscriber-side record of one subscription.
#[derive(Debug, Clone)]
pub struct Subscription {
    /// The publishing entity.
    pub publisher: EntityId,
    /// Shard hosting the publisher; upstream messages go through it.
    pub(crate) publisher_shard: ShardRef,
    /// Topic subscribed to.
    pub topic: Topic,
    /// Our channel id for this subscription (the key in our table).
    pub in_channel: ChannelId,
    /// The publisher's channel id for us, stamped on upstream envelopes.
    pub out_channel: ChannelId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_topic_mask() {
        let mask = TopicMask::single(Topic(5));
        assert!(mask.contains(Topic(5)));
        assert!(!mask.contains(Topic(4)));
    }

    #[test]
    fn test_all_mask_covers_everything() {
        for topic in 0..32 {
            assert!(TopicMask::ALL.contains(Topic(topic)));
        }
    }

    #[test]
    fn test_mask_composition() {
        let mask = TopicMask::single(Topic(1)).with(Topic(2)).with(Topic(31));
        assert!(mask.contains(Topic(1)));
        assert!(mask.contains(Topic(2)));
        assert!(mask.contains(Topic(31)));
        assert!(!mask.contains(Topic(0)));
    }
}
