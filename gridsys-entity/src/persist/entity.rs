// Layer 1: Standard library imports
use std::time::Duration;

// Layer 2: Third-party crate imports
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

// Layer 3: Internal module imports
use super::migration::MigrationChain;
use super::store::SchemaVersion;
use crate::entity::{Entity, EntityContext, EntityError};
use crate::util::EntityId;

/// An entity whose state is periodically and finally serialized to a
/// [`PersistedStore`](super::PersistedStore) and restored on next spawn.
///
/// The runtime drives the whole pipeline: load, decompress, migrate from
/// the persisted schema version up to [`PersistedEntity::SCHEMA_MAX`],
/// deserialize, [`PersistedEntity::post_load`], then later periodic,
/// scheduled, and final persists of [`PersistedEntity::snapshot`].
///
/// A persisted version below [`PersistedEntity::SCHEMA_MIN`] reinitializes
/// fresh (and persists immediately); a version above `SCHEMA_MAX` refuses
/// to spawn.
#[allow(unused_variables)]
#[async_trait]
pub trait PersistedEntity: Entity {
    /// Serialized state of this entity.
    type State: Serialize + DeserializeOwned + Send + 'static;

    /// Oldest schema version restorable by migration.
    const SCHEMA_MIN: SchemaVersion;

    /// Schema version this build writes.
    const SCHEMA_MAX: SchemaVersion;

    /// Fresh state for an entity with no (usable) persisted record.
    fn initialize_new(id: EntityId) -> Self::State;

    /// Build the entity from restored state.
    fn from_state(id: EntityId, state: Self::State) -> Self;

    /// Snapshot the current state for persisting.
    fn snapshot(&self) -> Self::State;

    /// Migration steps covering `[SCHEMA_MIN, SCHEMA_MAX)`. The default
    /// empty chain is valid only when the range is empty.
    fn migrations() -> MigrationChain {
        MigrationChain::new()
    }

    /// Notification before the step migrating away from `from` runs.
    fn on_before_schema_migration(from: SchemaVersion) {}

    /// Notification after a step produced version `to`.
    fn on_schema_migrated(to: SchemaVersion) {}

    /// Runs after restore (or fresh initialization), before
    /// `on_initialize`. `persisted_at` is `None` for fresh state;
    /// `elapsed` is the wall-clock time since the record was written.
    async fn post_load(
        &mut self,
        ctx: &mut EntityContext<Self>,
        persisted_at: Option<DateTime<Utc>>,
        elapsed: Duration,
    ) -> Result<(), EntityError> {
        Ok(())
    }
}
