// Layer 1: Standard library imports
use std::fmt::{self, Display};
use std::time::Duration;

// Layer 2: Third-party crate imports
use thiserror::Error;

// Layer 3: Internal module imports
use crate::persist::PersistError;
use crate::shard::ShardError;
use crate::util::{EntityId, EntityKind, ShardId};

/// One auto-spawn entity that failed to come up.
#[derive(Debug, Clone)]
pub struct EntitySpawnFailure {
    /// The entity that failed.
    pub entity: EntityId,
    /// Failure description.
    pub message: String,
}

impl Display for EntitySpawnFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.entity, self.message)
    }
}

/// A shard failed to reach `Running`: its auto-spawn entities' init errors,
/// collected.
#[derive(Debug, Clone)]
pub struct ShardStartError {
    /// The failing shard.
    pub shard: ShardId,
    /// Per-entity failures.
    pub failures: Vec<EntitySpawnFailure>,
}

impl Display for ShardStartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard {} failed to start", self.shard)?;
        for failure in &self.failures {
            write!(f, "; {failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ShardStartError {}

/// Errors surfaced by the node runtime.
#[derive(Debug, Error)]
pub enum SystemError {
    /// A kind was registered twice.
    #[error("kind {kind} is already registered")]
    KindAlreadyRegistered {
        /// The offending kind.
        kind: EntityKind,
    },

    /// An operation referenced a kind never registered on this node.
    #[error("kind {kind} is not registered")]
    UnknownKind {
        /// The unknown kind.
        kind: EntityKind,
    },

    /// A kind registered more than one handler for a message type.
    #[error("duplicate handlers registered for kind {kind}: {message_types:?}")]
    DuplicateHandler {
        /// The offending kind.
        kind: EntityKind,
        /// The message types registered twice.
        message_types: Vec<&'static str>,
    },

    /// Invalid runtime or kind configuration.
    #[error("invalid configuration: {reason}")]
    InvalidConfiguration {
        /// What is wrong.
        reason: String,
    },

    /// A persisted kind's configuration (e.g. its migration chain) is
    /// unusable.
    #[error("persisted kind {kind} configuration invalid")]
    PersistedKind {
        /// The offending kind.
        kind: EntityKind,
        #[source]
        source: PersistError,
    },

    /// One or more shards failed to reach `Running`.
    #[error("{} shard(s) failed to start", errors.len())]
    ShardStart {
        /// Per-shard start errors.
        errors: Vec<ShardStartError>,
    },

    /// A shard did not drain within the shutdown timeout.
    #[error("shard {shard} did not shut down within {timeout:?}")]
    ShutdownTimeout {
        /// The slow shard.
        shard: ShardId,
        /// The limit that elapsed.
        timeout: Duration,
    },

    /// A direct shard request failed.
    #[error(transparent)]
    Shard(#[from] ShardError),
}
