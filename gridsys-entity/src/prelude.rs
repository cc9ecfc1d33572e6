//! Convenience re-exports of the working set.
//!
//! ```rust
//! use gridsys_entity::prelude::*;
//! ```

pub use std::sync::Arc;

pub use async_trait::async_trait;

pub use crate::ask::{AskError, AskHandle};
pub use crate::cluster::{ClusterConfig, ClusterEvent, StaticClusterConfig};
pub use crate::dispatch::{
    AskHandler, CommandHandler, DispatchTable, ExplicitAskHandler, Handler, SubscriberHandler,
    SubscriptionHandler, SyncHandler,
};
pub use crate::entity::{
    AutoShutdownPolicy, ConstructEntity, Entity, EntityContext, EntityError, EntityHandle,
    EntityTask,
};
pub use crate::message::{downcast, BoxMessage, EntityMessage, NoResponse};
pub use crate::persist::{
    InMemoryStore, MigrationChain, PersistedEntity, PersistedStore, SchemaVersion,
};
pub use crate::pubsub::{Subscriber, SubscriberLostReason, Subscription, Topic, TopicMask};
pub use crate::sync::{SyncChannel, SyncError};
pub use crate::system::{EntityRuntime, KindConfig, RuntimeOptions};
pub use crate::util::{EntityId, EntityKind, NodeAddress, ShardId};
