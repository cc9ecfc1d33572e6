//! Lock-free runtime counters.
//!
//! One [`RuntimeMetrics`] instance is shared across a node's shards and
//! entities. Counters use relaxed atomics; the per-step migration counters
//! sit behind a short mutex because their key space is dynamic. Telemetry
//! backends poll [`RuntimeMetrics::snapshot`].

// Layer 1: Standard library imports
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

// Layer 2: Third-party crate imports
use parking_lot::Mutex;

// Layer 3: Internal module imports
use crate::persist::SchemaVersion;

/// Node-wide runtime counters.
#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    entities_spawned: AtomicU64,
    entities_terminated: AtomicU64,
    entities_restarted: AtomicU64,
    unexpected_terminations: AtomicU64,
    live_entities: AtomicI64,
    asks_sent: AtomicU64,
    asks_failed: AtomicU64,
    asks_timed_out: AtomicU64,
    publishes: AtomicU64,
    snapshots_persisted: AtomicU64,
    final_persists: AtomicU64,
    non_final_restores: AtomicU64,
    schema_migrations: Mutex<HashMap<(SchemaVersion, SchemaVersion), u64>>,
}

impl RuntimeMetrics {
    /// Fresh, zeroed metrics.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_entity_spawned(&self) {
        self.entities_spawned.fetch_add(1, Ordering::Relaxed);
        self.live_entities.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_entity_terminated(&self, expected: bool) {
        self.entities_terminated.fetch_add(1, Ordering::Relaxed);
        self.live_entities.fetch_sub(1, Ordering::Relaxed);
        if !expected {
            self.unexpected_terminations.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_entity_restarted(&self) {
        self.entities_restarted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ask_sent(&self) {
        self.asks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ask_failed(&self) {
        self.asks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ask_timeout(&self) {
        self.asks_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_publish(&self, recipients: usize) {
        self.publishes.fetch_add(recipients as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_snapshot(&self, is_final: bool) {
        self.snapshots_persisted.fetch_add(1, Ordering::Relaxed);
        if is_final {
            self.final_persists.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_non_final_restore(&self) {
        self.non_final_restores.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_schema_migration(&self, from: SchemaVersion, to: SchemaVersion) {
        *self.schema_migrations.lock().entry((from, to)).or_insert(0) += 1;
    }

    /// Times the step `from -> to` ran on this node.
    pub fn schema_migrations(&self, from: SchemaVersion, to: SchemaVersion) -> u64 {
        self.schema_migrations.lock().get(&(from, to)).copied().unwrap_or(0)
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            entities_spawned: self.entities_spawned.load(Ordering::Relaxed),
            entities_terminated: self.entities_terminated.load(Ordering::Relaxed),
            entities_restarted: self.entities_restarted.load(Ordering::Relaxed),
            unexpected_terminations: self.unexpected_terminations.load(Ordering::Relaxed),
            live_entities: self.live_entities.load(Ordering::Relaxed),
            asks_sent: self.asks_sent.load(Ordering::Relaxed),
            asks_failed: self.asks_failed.load(Ordering::Relaxed),
            asks_timed_out: self.asks_timed_out.load(Ordering::Relaxed),
            publishes: self.publishes.load(Ordering::Relaxed),
            snapshots_persisted: self.snapshots_persisted.load(Ordering::Relaxed),
            final_persists: self.final_persists.load(Ordering::Relaxed),
            non_final_restores: self.non_final_restores.load(Ordering::Relaxed),
            schema_migrations: self.schema_migrations.lock().clone(),
        }
    }
}

/// Point-in-time counter values, for assertions and operational dumps.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Entities spawned since start.
    pub entities_spawned: u64,
    /// Entities terminated since start.
    pub entities_terminated: u64,
    /// Entities restarted by their shard.
    pub entities_restarted: u64,
    /// Terminations that were not orderly shutdowns.
    pub unexpected_terminations: u64,
    /// Currently live entities on this node.
    pub live_entities: i64,
    /// Asks initiated.
    pub asks_sent: u64,
    /// Asks that failed (refused, remote error, unreachable).
    pub asks_failed: u64,
    /// Asks that hit their wall-clock limit.
    pub asks_timed_out: u64,
    /// Per-recipient publish deliveries.
    pub publishes: u64,
    /// Snapshots written, periodic and final.
    pub snapshots_persisted: u64,
    /// Final (shutdown) persists.
    pub final_persists: u64,
    /// Restores that found a non-final snapshot (prior crash).
    pub non_final_restores: u64,
    /// Times each migration step ran.
    pub schema_migrations: HashMap<(SchemaVersion, SchemaVersion), u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = RuntimeMetrics::new();
        metrics.record_entity_spawned();
        metrics.record_entity_spawned();
        metrics.record_entity_terminated(true);
        metrics.record_entity_terminated(false);
        metrics.record_ask_sent();
        metrics.record_ask_timeout();
        metrics.record_publish(3);

        let snap = metrics.snapshot();
        assert_eq!(snap.entities_spawned, 2);
        assert_eq!(snap.entities_terminated, 2);
        assert_eq!(snap.unexpected_terminations, 1);
        assert_eq!(snap.live_entities, 0);
        assert_eq!(snap.asks_sent, 1);
        assert_eq!(snap.asks_timed_out, 1);
        assert_eq!(snap.publishes, 3);
    }

    #[test]
    fn test_migration_counters_per_step() {
        let metrics = RuntimeMetrics::new();
        metrics.record_schema_migration(SchemaVersion(2), SchemaVersion(3));
        metrics.record_schema_migration(SchemaVersion(3), SchemaVersion(4));
        metrics.record_schema_migration(SchemaVersion(2), SchemaVersion(3));

        assert_eq!(metrics.schema_migrations(SchemaVersion(2), SchemaVersion(3)), 2);
        assert_eq!(metrics.schema_migrations(SchemaVersion(3), SchemaVersion(4)), 1);
        assert_eq!(metrics.schema_migrations(SchemaVersion(4), SchemaVersion(5)), 0);
    }
}
