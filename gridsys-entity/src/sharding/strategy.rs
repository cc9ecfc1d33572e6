// Layer 1: Standard library imports
// (none)

// Layer 2: Third-party crate imports
// (none)

// Layer 3: Internal module imports
use crate::util::{EntityId, ShardId};

/// Auto-spawn layout for [`ShardingStrategy::Service`] kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServicePlacement {
    /// One service entity per shard; entity value equals the shard index.
    PerShard,
    /// A single service entity, hosted on shard 0 with value 0.
    Singleton,
}

/// Pure mapping from entity ids to shard indices.
///
/// The strategy is replicated on every node: any node can resolve the owning
/// shard of any entity without coordination. Each kind carries exactly one
/// strategy, fixed at registration.
///
/// # Variants
///
/// - `Modulo`: `shard = value mod N` where `N` is the node count for the kind.
/// - `Service`: same modulo mapping, plus auto-spawn entities per
///   [`ServicePlacement`].
/// - `Manual`: callers construct ids with the shard index packed into the top
///   bits of the value (see [`EntityId::new_manual`]).
///
/// # Example
/// ```rust
/// use gridsys_entity::sharding::ShardingStrategy;
/// use gridsys_entity::util::{EntityId, EntityKind};
///
/// const PLAYER: EntityKind = EntityKind::new(1, "Player");
///
/// let strategy = ShardingStrategy::Modulo;
/// assert_eq!(strategy.shard_index(EntityId::new(PLAYER, 7), 4), 3);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardingStrategy {
    /// `shard = value mod node_count`.
    Modulo,
    /// Modulo placement plus auto-spawned service entities.
    Service {
        /// How service entities are laid out across shards.
        placement: ServicePlacement,
    },
    /// Shard index packed into the top bits of the entity value.
    Manual,
}

impl ShardingStrategy {
    /// Resolve the shard index owning `id`.
    ///
    /// `node_count` must be at least 1; registration validates this before
    /// any routing happens.
    pub fn shard_index(&self, id: EntityId, node_count: usize) -> i32 {
        match self {
            ShardingStrategy::Modulo | ShardingStrategy::Service { .. } => {
                (id.value() % node_count.max(1) as u64) as i32
            }
            ShardingStrategy::Manual => i32::from(id.manual_shard_index()),
        }
    }

    /// Entities this strategy spawns on `shard` at shard start.
    ///
    /// Empty for everything except `Service` kinds.
    pub fn auto_spawn_ids(&self, shard: ShardId) -> Vec<EntityId> {
        if shard.is_proxy() {
            return Vec::new();
        }
        match self {
            ShardingStrategy::Service { placement: ServicePlacement::PerShard } => {
                vec![EntityId::new(shard.kind(), shard.index() as u64)]
            }
            ShardingStrategy::Service { placement: ServicePlacement::Singleton } if shard.index() == 0 => {
                vec![EntityId::new(shard.kind(), 0)]
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::EntityKind;

    const PLAYER: EntityKind = EntityKind::new(1, "Player");
    const MATCHER: EntityKind = EntityKind::new(2, "Matcher");
    const ROOM: EntityKind = EntityKind::new(3, "Room");

    #[test]
    fn test_modulo_placement() {
        let s = ShardingStrategy::Modulo;
        assert_eq!(s.shard_index(EntityId::new(PLAYER, 0), 4), 0);
        assert_eq!(s.shard_index(EntityId::new(PLAYER, 7), 4), 3);
        assert_eq!(s.shard_index(EntityId::new(PLAYER, 8), 4), 0);
        assert!(s.auto_spawn_ids(ShardId::new(PLAYER, 1)).is_empty());
    }

    #[test]
    fn test_manual_placement_uses_packed_index() {
        let s = ShardingStrategy::Manual;
        let id = EntityId::new_manual(ROOM, 12, 555);
        assert_eq!(s.shard_index(id, 16), 12);
    }

    #[test]
    fn test_service_per_shard_spawns_one_per_shard() {
        let s = ShardingStrategy::Service { placement: ServicePlacement::PerShard };
        let ids = s.auto_spawn_ids(ShardId::new(MATCHER, 2));
        assert_eq!(ids, vec![EntityId::new(MATCHER, 2)]);
        // The auto-spawn id maps back to its own shard.
        assert_eq!(s.shard_index(ids[0], 3), 2);
    }

    #[test]
    fn test_service_singleton_only_on_shard_zero() {
        let s = ShardingStrategy::Service { placement: ServicePlacement::Singleton };
        assert_eq!(s.auto_spawn_ids(ShardId::new(MATCHER, 0)), vec![EntityId::new(MATCHER, 0)]);
        assert!(s.auto_spawn_ids(ShardId::new(MATCHER, 1)).is_empty());
    }

    #[test]
    fn test_proxy_shards_spawn_nothing() {
        let s = ShardingStrategy::Service { placement: ServicePlacement::PerShard };
        assert!(s.auto_spawn_ids(ShardId::proxy(MATCHER)).is_empty());
    }
}
