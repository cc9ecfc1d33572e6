// Layer 1: Standard library imports
use std::collections::HashSet;
use std::sync::Arc;

// Layer 2: Third-party crate imports
use dashmap::DashMap;

// Layer 3: Internal module imports
use crate::sharding::ShardingStrategy;
use crate::shard::ShardRef;
use crate::util::{EntityId, EntityKind, NodeAddress, ShardId};

/// Placement metadata of one registered kind.
#[derive(Debug, Clone)]
pub(crate) struct KindMeta {
    pub kind: EntityKind,
    pub strategy: ShardingStrategy,
    /// Hosting node per shard index; the length is the shard count.
    pub nodes: Vec<NodeAddress>,
}

/// Process-wide shard registry, initialized during startup registration and
/// read-only afterwards.
///
/// Maps kinds to their strategy/placement and shard ids to live shard
/// references. Runtimes simulating multiple nodes in one process share a
/// registry so cross-"node" routing stays plain message passing.
#[derive(Clone, Default)]
pub(crate) struct ShardRegistry {
    kinds: Arc<DashMap<u16, KindMeta>>,
    shards: Arc<DashMap<(u16, i32), ShardRef>>,
}

impl ShardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a kind's placement; `false` when the kind already exists.
    pub fn register_kind(&self, meta: KindMeta) -> bool {
        let code = meta.kind.code();
        if self.kinds.contains_key(&code) {
            return false;
        }
        self.kinds.insert(code, meta);
        true
    }

    /// Publish a live shard reference.
    pub fn publish_shard(&self, shard: ShardRef) {
        self.shards.insert((shard.id().kind().code(), shard.id().index()), shard);
    }

    pub fn is_registered(&self, kind: EntityKind) -> bool {
        self.kinds.contains_key(&kind.code())
    }

    pub fn kind_meta(&self, kind: EntityKind) -> Option<KindMeta> {
        self.kinds.get(&kind.code()).map(|entry| entry.value().clone())
    }

    /// The shard owning `id`, per its kind's strategy.
    pub fn shard_id_for(&self, id: EntityId) -> Option<ShardId> {
        let meta = self.kinds.get(&id.kind().code())?;
        let index = meta.strategy.shard_index(id, meta.nodes.len());
        Some(ShardId::new(id.kind(), index))
    }

    /// Live reference to a specific shard.
    pub fn shard_ref(&self, shard: ShardId) -> Option<ShardRef> {
        self.shards.get(&(shard.kind().code(), shard.index())).map(|entry| entry.value().clone())
    }

    /// Live reference to the shard owning `id`.
    pub fn resolve(&self, id: EntityId) -> Option<ShardRef> {
        self.shard_ref(self.shard_id_for(id)?)
    }

    /// Every shard id hosted by `node`, across kinds.
    pub fn shards_on(&self, node: &NodeAddress) -> HashSet<ShardId> {
        let mut out = HashSet::new();
        for entry in self.kinds.iter() {
            for (index, addr) in entry.nodes.iter().enumerate() {
                if addr == node {
                    out.insert(ShardId::new(entry.kind, index as i32));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    const PLAYER: EntityKind = EntityKind::new(1, "Player");

    fn meta(nodes: Vec<NodeAddress>) -> KindMeta {
        KindMeta { kind: PLAYER, strategy: ShardingStrategy::Modulo, nodes }
    }

    #[test]
    fn test_register_and_resolve() {
        let registry = ShardRegistry::new();
        let a = NodeAddress::new("a", 1);
        let b = NodeAddress::new("b", 1);
        assert!(registry.register_kind(meta(vec![a.clone(), b.clone()])));
        assert!(!registry.register_kind(meta(vec![a.clone()])));

        let (tx, _rx) = unbounded_channel();
        registry.publish_shard(ShardRef::new(ShardId::new(PLAYER, 1), tx));

        // value 3 mod 2 == 1 -> the published shard
        let id = EntityId::new(PLAYER, 3);
        assert_eq!(registry.shard_id_for(id), Some(ShardId::new(PLAYER, 1)));
        assert!(registry.resolve(id).is_some());
        // value 2 mod 2 == 0 -> no ref published yet
        assert!(registry.resolve(EntityId::new(PLAYER, 2)).is_none());

        let lost = registry.shards_on(&b);
        assert_eq!(lost.len(), 1);
        assert!(lost.contains(&ShardId::new(PLAYER, 1)));
    }
}
