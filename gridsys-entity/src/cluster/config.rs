// Layer 1: Standard library imports
use std::collections::HashMap;

// Layer 2: Third-party crate imports
use tokio::sync::broadcast;

// Layer 3: Internal module imports
use crate::util::{EntityKind, NodeAddress};

/// Cluster topology events the runtime reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    /// A node dropped out; its shards' entities are gone.
    NodeLost(NodeAddress),
    /// A node joined. Informational; placement is fixed per kind.
    NodeJoined(NodeAddress),
}

/// Cluster membership and placement, injected at runtime construction.
///
/// `shards_for_kind` returns one address per shard index; the entry count
/// is the kind's shard count, and a node hosts exactly the indices whose
/// address equals its own. Remote shard references resolve by the
/// well-known path `"{project}@{host}:{port}/shard/{kind}"`
/// (see [`NodeAddress::shard_path`]).
pub trait ClusterConfig: Send + Sync + 'static {
    /// Number of shards (equivalently, placement slots) for `kind`.
    fn node_count_for_kind(&self, kind: EntityKind) -> usize {
        self.shards_for_kind(kind).len()
    }

    /// The node hosting each shard index of `kind`.
    fn shards_for_kind(&self, kind: EntityKind) -> Vec<NodeAddress>;

    /// Subscribe to topology events.
    fn subscribe(&self) -> broadcast::Receiver<ClusterEvent>;
}

/// Fixed-topology [`ClusterConfig`] for single-node deployments and tests.
///
/// # Example
/// ```rust
/// use gridsys_entity::cluster::StaticClusterConfig;
/// use gridsys_entity::util::{EntityKind, NodeAddress};
///
/// const PLAYER: EntityKind = EntityKind::new(1, "Player");
///
/// let node = NodeAddress::new("127.0.0.1", 6000);
/// // Two player shards, both on the one node.
/// let cluster = StaticClusterConfig::new(vec![node.clone(), node]);
/// ```
pub struct StaticClusterConfig {
    default_nodes: Vec<NodeAddress>,
    per_kind: HashMap<EntityKind, Vec<NodeAddress>>,
    events: broadcast::Sender<ClusterEvent>,
}

impl StaticClusterConfig {
    /// Topology placing every kind on `nodes` (one shard per entry).
    pub fn new(nodes: Vec<NodeAddress>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self { default_nodes: nodes, per_kind: HashMap::new(), events }
    }

    /// Single-node topology with one shard per kind.
    pub fn single_node(node: NodeAddress) -> Self {
        Self::new(vec![node])
    }

    /// Override the node set for one kind.
    pub fn with_kind(mut self, kind: EntityKind, nodes: Vec<NodeAddress>) -> Self {
        self.per_kind.insert(kind, nodes);
        self
    }

    /// Declare a node lost, notifying every subscribed runtime.
    pub fn node_lost(&self, node: NodeAddress) {
        let _ = self.events.send(ClusterEvent::NodeLost(node));
    }

    /// Declare a node joined.
    pub fn node_joined(&self, node: NodeAddress) {
        let _ = self.events.send(ClusterEvent::NodeJoined(node));
    }
}

impl ClusterConfig for StaticClusterConfig {
    fn shards_for_kind(&self, kind: EntityKind) -> Vec<NodeAddress> {
        self.per_kind.get(&kind).cloned().unwrap_or_else(|| self.default_nodes.clone())
    }

    fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }
}
