// Layer 1: Standard library imports
use std::collections::HashMap;
use std::time::Duration;

// Layer 2: Third-party crate imports
// (none)

// Layer 3: Internal module imports
use super::errors::SystemError;
use crate::persist::CompressionAlgorithm;
use crate::util::{EntityKind, NodeAddress};

/// Default interval a persisted entity may go without a snapshot.
pub const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(180);

/// Default minimum spacing between scheduled persists.
pub const DEFAULT_MIN_SCHEDULED_PERSIST_INTERVAL: Duration = Duration::from_secs(10);

/// Default limit on concurrent entity shutdowns per shard (negative =
/// unlimited).
pub const DEFAULT_MAX_CONCURRENT_ENTITY_SHUTDOWNS: i32 = -1;

/// Default shutdown concurrency for persisted kinds, bounding final-persist
/// write bursts.
pub const DEFAULT_PERSISTED_MAX_CONCURRENT_SHUTDOWNS: i32 = 50;

/// Default limit a coordinated shard shutdown may take.
pub const DEFAULT_SHARD_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Node-wide runtime configuration.
///
/// # Examples
///
/// ```rust
/// use gridsys_entity::system::RuntimeOptions;
/// use gridsys_entity::persist::CompressionAlgorithm;
/// use std::time::Duration;
///
/// let options = RuntimeOptions::builder()
///     .with_compression(CompressionAlgorithm::Deflate)
///     .with_snapshot_interval(Duration::from_secs(60))
///     .build()
///     .unwrap();
/// assert!(options.extra_persistence_checks == false);
/// ```
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Compression applied to persisted payloads.
    pub compression_algorithm: CompressionAlgorithm,
    /// Round-trip freshly serialized payloads before writing them.
    pub extra_persistence_checks: bool,
    /// Maximum age of a persisted entity's snapshot before the periodic
    /// tick persists again.
    pub snapshot_interval: Duration,
    /// Minimum spacing enforced on scheduled persists.
    pub min_scheduled_persist_interval: Duration,
    /// Concurrent entity shutdowns per shard (negative = unlimited).
    /// Per-kind [`KindConfig`](super::KindConfig) values override this.
    pub max_concurrent_entity_shutdowns_per_shard: i32,
    /// How long a coordinated shard shutdown may take before the runtime
    /// gives up waiting.
    pub shard_shutdown_timeout: Duration,
    /// Per-kind placement overriding the cluster config's node set.
    pub entity_placement_overrides: HashMap<EntityKind, Vec<NodeAddress>>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            compression_algorithm: CompressionAlgorithm::None,
            extra_persistence_checks: false,
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
            min_scheduled_persist_interval: DEFAULT_MIN_SCHEDULED_PERSIST_INTERVAL,
            max_concurrent_entity_shutdowns_per_shard: DEFAULT_MAX_CONCURRENT_ENTITY_SHUTDOWNS,
            shard_shutdown_timeout: DEFAULT_SHARD_SHUTDOWN_TIMEOUT,
            entity_placement_overrides: HashMap::new(),
        }
    }
}

impl RuntimeOptions {
    /// Create a configuration builder.
    pub fn builder() -> RuntimeOptionsBuilder {
        RuntimeOptionsBuilder::default()
    }
}

/// Validating builder for [`RuntimeOptions`].
#[derive(Debug, Default)]
pub struct RuntimeOptionsBuilder {
    options: RuntimeOptions,
}

impl RuntimeOptionsBuilder {
    /// Set the persisted-payload compression algorithm.
    pub fn with_compression(mut self, algorithm: CompressionAlgorithm) -> Self {
        self.options.compression_algorithm = algorithm;
        self
    }

    /// Enable or disable the extra persist round-trip check.
    pub fn with_extra_persistence_checks(mut self, enabled: bool) -> Self {
        self.options.extra_persistence_checks = enabled;
        self
    }

    /// Set the snapshot interval.
    pub fn with_snapshot_interval(mut self, interval: Duration) -> Self {
        self.options.snapshot_interval = interval;
        self
    }

    /// Set the minimum spacing between scheduled persists.
    pub fn with_min_scheduled_persist_interval(mut self, interval: Duration) -> Self {
        self.options.min_scheduled_persist_interval = interval;
        self
    }

    /// Set the per-shard shutdown concurrency limit (negative = unlimited).
    pub fn with_max_concurrent_entity_shutdowns(mut self, max: i32) -> Self {
        self.options.max_concurrent_entity_shutdowns_per_shard = max;
        self
    }

    /// Set the coordinated shard shutdown limit.
    pub fn with_shard_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.options.shard_shutdown_timeout = timeout;
        self
    }

    /// Override placement for one kind.
    pub fn with_placement_override(mut self, kind: EntityKind, nodes: Vec<NodeAddress>) -> Self {
        self.options.entity_placement_overrides.insert(kind, nodes);
        self
    }

    /// Validate and produce the options.
    pub fn build(self) -> Result<RuntimeOptions, SystemError> {
        if self.options.snapshot_interval.is_zero() {
            return Err(SystemError::InvalidConfiguration {
                reason: "snapshot_interval must be positive".to_string(),
            });
        }
        if self.options.min_scheduled_persist_interval.is_zero() {
            return Err(SystemError::InvalidConfiguration {
                reason: "min_scheduled_persist_interval must be positive".to_string(),
            });
        }
        if self.options.shard_shutdown_timeout.is_zero() {
            return Err(SystemError::InvalidConfiguration {
                reason: "shard_shutdown_timeout must be positive".to_string(),
            });
        }
        if let Some((kind, _)) =
            self.options.entity_placement_overrides.iter().find(|(_, nodes)| nodes.is_empty())
        {
            return Err(SystemError::InvalidConfiguration {
                reason: format!("placement override for {kind} has no nodes"),
            });
        }
        Ok(self.options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = RuntimeOptions::default();
        assert_eq!(options.compression_algorithm, CompressionAlgorithm::None);
        assert_eq!(options.snapshot_interval, DEFAULT_SNAPSHOT_INTERVAL);
        assert_eq!(options.max_concurrent_entity_shutdowns_per_shard, -1);
        assert!(!options.extra_persistence_checks);
    }

    #[test]
    fn test_builder_validates() {
        let err = RuntimeOptions::builder().with_snapshot_interval(Duration::ZERO).build();
        assert!(matches!(err, Err(SystemError::InvalidConfiguration { .. })));

        let err = RuntimeOptions::builder()
            .with_placement_override(EntityKind::new(1, "Player"), Vec::new())
            .build();
        assert!(matches!(err, Err(SystemError::InvalidConfiguration { .. })));

        let options = RuntimeOptions::builder()
            .with_compression(CompressionAlgorithm::Deflate)
            .with_max_concurrent_entity_shutdowns(10)
            .build()
            .unwrap();
        assert_eq!(options.compression_algorithm, CompressionAlgorithm::Deflate);
        assert_eq!(options.max_concurrent_entity_shutdowns_per_shard, 10);
    }
}
