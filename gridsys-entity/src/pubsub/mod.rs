//! Publish/subscribe links and the shard-side death-watch graph.
//!
//! # Components
//!
//! - [`Topic`] / [`TopicMask`] - Channel addressing within one publisher
//! - [`Subscriber`] / [`Subscription`] - The two sides of a pub/sub link
//! - [`WatchGraph`] - Symmetric adjacency maps backing "peer died"
//!   notifications
//! - [`SubscriptionGuard`] / [`SubscriptionSetGuard`] - Scoped subscriptions
//!   that unsubscribe on drop

mod guard;
mod types;
mod watch;

pub use guard::{SubscriptionGuard, SubscriptionSetGuard};
pub use types::{ChannelId, Subscriber, SubscriberLostReason, Subscription, Topic, TopicMask};
pub use watch::WatchGraph;
