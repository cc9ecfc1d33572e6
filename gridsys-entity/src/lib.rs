//! # gridsys-entity - Sharded Entity-Actor Runtime
//!
//! Per-node runtime for a distributed game backend: sharded, stateful
//! actors ("entities") that exchange typed messages, form
//! publish/subscribe relationships with bidirectional death-watch, perform
//! correlated asks, synchronize pair-wise execution phases over dedicated
//! channels, persist periodically to a store, and auto-shut down when idle.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use gridsys_entity::prelude::*;
//!
//! const COUNTER: EntityKind = EntityKind::new(1, "Counter");
//!
//! #[derive(Debug, Clone)]
//! struct Add(u64);
//!
//! #[derive(Debug, Clone)]
//! struct Get;
//!
//! struct Counter { value: u64 }
//!
//! impl Entity for Counter {
//!     fn kind() -> EntityKind { COUNTER }
//!     fn register(table: &mut DispatchTable<Self>) {
//!         table.message::<Add>().ask::<Get>();
//!     }
//! }
//!
//! impl ConstructEntity for Counter {
//!     fn construct(_id: EntityId) -> Result<Self, EntityError> {
//!         Ok(Counter { value: 0 })
//!     }
//! }
//!
//! #[async_trait]
//! impl Handler<Add> for Counter {
//!     async fn handle(&mut self, _ctx: &mut EntityContext<Self>, _sender: Option<EntityId>, msg: Add)
//!         -> Result<(), EntityError>
//!     {
//!         self.value += msg.0;
//!         Ok(())
//!     }
//! }
//!
//! #[async_trait]
//! impl AskHandler<Get> for Counter {
//!     type Reply = u64;
//!     async fn handle_ask(&mut self, _ctx: &mut EntityContext<Self>, _sender: Option<EntityId>, _msg: Get)
//!         -> Result<u64, EntityError>
//!     {
//!         Ok(self.value)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let node = NodeAddress::new("127.0.0.1", 6000);
//!     let cluster = Arc::new(StaticClusterConfig::single_node(node.clone()));
//!     let runtime = EntityRuntime::builder(node, cluster)
//!         .register::<Counter>(KindConfig::default())
//!         .start()
//!         .await?;
//!     runtime.wait_until_running().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Core Guarantees
//!
//! - **Per-entity serialization**: one handler at a time per entity;
//!   awaiting inside a handler suspends it without letting another message
//!   in.
//! - **Ask correlation**: monotonic ask ids per entity, promises owned by
//!   the asking shard, replies delivered directly (bypassing the mailbox).
//! - **Watch symmetry**: a completed subscribe leaves both death-watch
//!   edges in place; unsubscribe, kick, termination, and node loss remove
//!   both.
//! - **Sync channel order**: frames are in-order per channel with explicit
//!   half-close; an empty payload is EOF.
//! - **Jittered idle shutdown**: the observed idle-to-shutdown delay lies
//!   in `[wait, 1.5 * wait)` of the configured wait.
//!
//! # Module Organization
//!
//! ## Core
//! - [`entity`] - Entity trait, context, lifecycle, per-entity runner
//! - [`dispatch`] - Handler registration and typed dispatch
//! - [`message`] - Message traits, envelopes, codec seam
//! - [`shard`] - The shard supervisor/router
//! - [`sharding`] - Entity placement strategies
//!
//! ## Interaction patterns
//! - [`ask`] - Correlated request/reply with timeouts
//! - [`pubsub`] - Publish/subscribe and the death-watch graph
//! - [`sync`] - Paired in-order synchronize channels
//! - [`scheduler`] - On-actor deferred/delayed execution
//!
//! ## Infrastructure
//! - [`system`] - Node runtime, registration, configuration
//! - [`persist`] - Persisted entities, migration, compression
//! - [`cluster`] - Cluster membership seam
//! - [`metrics`] - Runtime counters
//! - [`util`] - Ids and addresses

pub mod ask;
pub mod cluster;
pub mod dispatch;
pub mod entity;
pub mod message;
pub mod metrics;
pub mod persist;
pub mod prelude;
pub mod pubsub;
pub mod scheduler;
pub mod shard;
pub mod sharding;
pub mod sync;
pub mod system;
pub mod util;

// Re-export commonly used types
pub use ask::{AskError, AskHandle, AskId, DEFAULT_ASK_TIMEOUT};
pub use cluster::{ClusterConfig, ClusterEvent, StaticClusterConfig};
pub use dispatch::{
    AskHandler, CommandHandler, DispatchTable, ExplicitAskHandler, Handler, SubscriberHandler,
    SubscriptionHandler, SyncHandler,
};
pub use entity::{
    AutoShutdownPolicy, ConstructEntity, Entity, EntityContext, EntityError, EntityHandle,
    EntityStatus, EntityTask, OpCancelled, TaskError, TerminationReason,
};
pub use message::{downcast, BoxMessage, Codec, EntityMessage, JsonCodec, NoResponse};
pub use metrics::{MetricsSnapshot, RuntimeMetrics};
pub use persist::{
    CompressionAlgorithm, InMemoryStore, MigrationChain, PersistedEntity, PersistedStore,
    SchemaVersion,
};
pub use pubsub::{
    ChannelId, Subscriber, SubscriberLostReason, Subscription, SubscriptionGuard,
    SubscriptionSetGuard, Topic, TopicMask,
};
pub use shard::{ShardPhase, ShardRef};
pub use sharding::{ServicePlacement, ShardingStrategy};
pub use sync::{SyncChannel, SyncChannelState, SyncError, DEFAULT_SYNC_RECEIVE_TIMEOUT};
pub use system::{
    EntityRuntime, EntityRuntimeBuilder, KindConfig, RuntimeOptions, ShardStartError, SystemError,
};
pub use util::{EntityId, EntityKind, NodeAddress, ShardId};
