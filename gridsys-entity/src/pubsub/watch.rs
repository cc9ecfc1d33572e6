// Layer 1: Standard library imports
use std::collections::{HashMap, HashSet};

// Layer 2: Third-party crate imports
use tracing::debug;

// Layer 3: Internal module imports
use crate::util::EntityId;

/// Shard-local death-watch graph.
///
/// Watches come in symmetric pairs: when a subscribe/ack pair is routed for
/// `(S, T)`, both `S watches T` and `T watches S` are registered, so either
/// side's death notifies the other. The graph keeps two adjacency maps
/// (forward: watched → watchers, reverse: watcher → watched) and is mutated
/// only from the owning shard's task.
///
/// Entries may reference remote entities: a local watcher of a remote peer
/// is exactly what node-loss fan-out scans for.
#[derive(Debug, Default)]
pub struct WatchGraph {
    /// watched id → entities watching it.
    watchers: HashMap<EntityId, HashSet<EntityId>>,
    /// watcher id → entities it watches.
    watching: HashMap<EntityId, HashSet<EntityId>>,
}

impl WatchGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    fn add_edge(&mut self, watcher: EntityId, watched: EntityId) -> bool {
        let fresh = self.watchers.entry(watched).or_default().insert(watcher);
        self.watching.entry(watcher).or_default().insert(watched);
        fresh
    }

    fn remove_edge(&mut self, watcher: EntityId, watched: EntityId) -> bool {
        let mut removed = false;
        if let Some(set) = self.watchers.get_mut(&watched) {
            removed = set.remove(&watcher);
            if set.is_empty() {
                self.watchers.remove(&watched);
            }
        }
        if let Some(set) = self.watching.get_mut(&watcher) {
            set.remove(&watched);
            if set.is_empty() {
                self.watching.remove(&watcher);
            }
        }
        removed
    }

    /// Register the two-way watch between `a` and `b`.
    ///
    /// Returns `true` when at least one edge was new. Duplicate registration
    /// is routine when both endpoints live on the same shard (the subscribe
    /// delivery and the ack observation both land here), so it only logs at
    /// debug level.
    pub fn register_pair(&mut self, a: EntityId, b: EntityId) -> bool {
        let fresh_ab = self.add_edge(a, b);
        let fresh_ba = self.add_edge(b, a);
        if !fresh_ab && !fresh_ba {
            debug!(%a, %b, "watch pair already registered");
        }
        fresh_ab || fresh_ba
    }

    /// Tear down the two-way watch between `a` and `b`.
    ///
    /// Returns `true` when at least one edge existed.
    pub fn unregister_pair(&mut self, a: EntityId, b: EntityId) -> bool {
        let had_ab = self.remove_edge(a, b);
        let had_ba = self.remove_edge(b, a);
        had_ab || had_ba
    }

    /// Entities currently watching `id`.
    pub fn watchers_of(&self, id: EntityId) -> Vec<EntityId> {
        self.watchers.get(&id).map(|set| set.iter().copied().collect()).unwrap_or_default()
    }

    /// Whether `watcher` currently watches `watched`.
    pub fn is_watching(&self, watcher: EntityId, watched: EntityId) -> bool {
        self.watchers.get(&watched).is_some_and(|set| set.contains(&watcher))
    }

    /// All ids that have at least one watcher.
    pub fn watched_ids(&self) -> Vec<EntityId> {
        self.watchers.keys().copied().collect()
    }

    /// Erase every edge touching `id`, returning the entities that watched
    /// it (the fan-out list for termination notices).
    pub fn remove_entity(&mut self, id: EntityId) -> Vec<EntityId> {
        let watchers: Vec<EntityId> =
            self.watchers.remove(&id).map(|set| set.into_iter().collect()).unwrap_or_default();
        for watcher in &watchers {
            if let Some(set) = self.watching.get_mut(watcher) {
                set.remove(&id);
                if set.is_empty() {
                    self.watching.remove(watcher);
                }
            }
        }
        if let Some(watched) = self.watching.remove(&id) {
            for peer in watched {
                if let Some(set) = self.watchers.get_mut(&peer) {
                    set.remove(&id);
                    if set.is_empty() {
                        self.watchers.remove(&peer);
                    }
                }
            }
        }
        watchers
    }

    /// Whether the graph holds no edges.
    pub fn is_empty(&self) -> bool {
        self.watchers.is_empty() && self.watching.is_empty()
    }
}
