//! Shared utility types for the entity runtime.
//!
//! # Components
//!
//! - [`EntityKind`] - Type tag identifying an entity's class and placement rules
//! - [`EntityId`] - Globally unique entity identifier `(kind, value)`
//! - [`ShardId`] - Shard identifier `(kind, index)` with proxy marker
//! - [`NodeAddress`] - Cluster node address with well-known shard paths

mod ids;

pub use ids::{EntityId, EntityKind, NodeAddress, ShardId};
