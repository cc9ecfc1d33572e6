// Layer 1: Standard library imports
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

// Layer 2: Third-party crate imports
use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::SmallRng;
use rand::Rng;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, error, warn};

// Layer 3: Internal module imports
use super::compress::{compress, decompress};
use super::entity::PersistedEntity;
use super::migration::MigrationChain;
use super::store::{PersistError, PersistedStore, SchemaVersion};
use crate::entity::{EntityContext, EntityError, EntitySpawner, EntityTask};
use crate::metrics::RuntimeMetrics;
use crate::system::RuntimeOptions;
use crate::util::EntityId;

/// Base cadence of the periodic snapshot check; each arm is randomized
/// around this by ±10% to avoid fleet-wide alignment.
pub(crate) const PERSIST_TICK_INTERVAL: Duration = Duration::from_secs(30);

/// Persist operations the entity runner drives without knowing the
/// concrete persisted type.
#[async_trait]
pub(crate) trait PersistDriver<E>: Send + Sync + 'static {
    /// Initialize persist bookkeeping (jittered `last_persisted`) and arm
    /// the first periodic tick.
    fn on_start(self: Arc<Self>, ctx: &mut EntityContext<E>, rng: &mut SmallRng);

    /// Build the task a coalesced `schedule_persist` enqueues.
    fn scheduled_task(self: Arc<Self>, running_id: u64) -> Box<dyn EntityTask<E>>;

    /// Serialize, frame, and write the entity's state.
    async fn persist(&self, entity: &mut E, ctx: &mut EntityContext<E>, is_final: bool) -> Result<(), PersistError>;
}

/// Per-kind persistence runtime: the store handle, the migration chain,
/// and the persist pipeline. Doubles as the kind's spawner.
pub(crate) struct PersistedKindRuntime<E: PersistedEntity> {
    store: Arc<dyn PersistedStore>,
    options: Arc<RuntimeOptions>,
    metrics: Arc<RuntimeMetrics>,
    migrations: MigrationChain,
    _marker: PhantomData<fn(E)>,
}

impl<E: PersistedEntity> PersistedKindRuntime<E> {
    pub(crate) fn new(
        store: Arc<dyn PersistedStore>,
        options: Arc<RuntimeOptions>,
        metrics: Arc<RuntimeMetrics>,
    ) -> Result<Self, PersistError> {
        let migrations = E::migrations();
        migrations.validate(E::SCHEMA_MIN, E::SCHEMA_MAX)?;
        Ok(Self { store, options, metrics, migrations, _marker: PhantomData })
    }

    async fn spawn_fresh(&self, id: EntityId, ctx: &mut EntityContext<E>) -> Result<E, EntityError> {
        let state = E::initialize_new(id);
        let mut entity = E::from_state(id, state);
        entity.post_load(ctx, None, Duration::ZERO).await?;
        // Fresh entities persist right away so a crash cannot lose the id.
        self.persist(&mut entity, ctx, false).await.map_err(EntityError::other)?;
        Ok(entity)
    }

    fn migrate(&self, value: &mut Value, from: SchemaVersion) -> Result<(), PersistError> {
        let mut version = from;
        while version < E::SCHEMA_MAX {
            E::on_before_schema_migration(version);
            let step = self.migrations.step_for(version).ok_or(PersistError::MigrationGap { from: version })?;
            step(value)?;
            let next = version.next();
            E::on_schema_migrated(next);
            self.metrics.record_schema_migration(version, next);
            debug!(from = %version, to = %next, "schema migrated");
            version = next;
        }
        Ok(())
    }
}

#[async_trait]
impl<E: PersistedEntity> EntitySpawner<E> for PersistedKindRuntime<E> {
    async fn spawn(&self, id: EntityId, ctx: &mut EntityContext<E>) -> Result<E, EntityError> {
        let record = match self.store.load(id).await.map_err(EntityError::other)? {
            None => return self.spawn_fresh(id, ctx).await,
            Some(record) => record,
        };

        if !record.is_final {
            self.metrics.record_non_final_restore();
            warn!(entity = %id, persisted_at = %record.persisted_at, "restoring from a non-final snapshot");
        }
        if record.schema_version < E::SCHEMA_MIN {
            warn!(
                entity = %id,
                persisted = %record.schema_version,
                supported_min = %E::SCHEMA_MIN,
                "persisted schema too old, reinitializing"
            );
            return self.spawn_fresh(id, ctx).await;
        }
        if record.schema_version > E::SCHEMA_MAX {
            return Err(EntityError::other(PersistError::SchemaTooNew {
                persisted: record.schema_version,
                supported: E::SCHEMA_MAX,
            }));
        }

        let raw = decompress(&record.payload).map_err(EntityError::other)?;
        let mut value: Value =
            serde_json::from_slice(&raw).map_err(|source| EntityError::other(PersistError::Codec { source }))?;
        self.migrate(&mut value, record.schema_version).map_err(EntityError::other)?;
        let state: E::State =
            serde_json::from_value(value).map_err(|source| EntityError::other(PersistError::Codec { source }))?;

        let mut entity = E::from_state(id, state);
        let elapsed = Utc::now().signed_duration_since(record.persisted_at).to_std().unwrap_or(Duration::ZERO);
        entity.post_load(ctx, Some(record.persisted_at), elapsed).await?;
        Ok(entity)
    }
}

#[async_trait]
impl<E: PersistedEntity> PersistDriver<E> for PersistedKindRuntime<E> {
    fn on_start(self: Arc<Self>, ctx: &mut EntityContext<E>, rng: &mut SmallRng) {
        // Spread a fleet restart: pretend the last persist happened up to
        // half a snapshot interval away from now, in either direction.
        // Fresh entities already persisted during spawn and keep that mark.
        if !ctx.persist.has_persisted {
            let interval = self.options.snapshot_interval;
            let shift = interval.mul_f64(rng.gen::<f64>() * 0.5);
            let now = Instant::now();
            ctx.persist.last_persisted =
                if rng.gen::<bool>() { now + shift } else { now.checked_sub(shift).unwrap_or(now) };
        }

        let first_tick = jittered_tick(rng);
        ctx.schedule_task(first_tick, Box::new(PersistTick { driver: self }));
    }

    fn scheduled_task(self: Arc<Self>, running_id: u64) -> Box<dyn EntityTask<E>> {
        Box::new(ScheduledPersist { driver: self, running_id })
    }

    async fn persist(&self, entity: &mut E, ctx: &mut EntityContext<E>, is_final: bool) -> Result<(), PersistError> {
        let state = entity.snapshot();
        let body = serde_json::to_vec(&state).map_err(|source| PersistError::Codec { source })?;
        let blob = compress(self.options.compression_algorithm, &body)?;
        if self.options.extra_persistence_checks {
            // Round-trip the framed payload to catch corruption before it
            // reaches the store.
            let raw = decompress(&blob)?;
            let _: Value = serde_json::from_slice(&raw).map_err(|source| PersistError::Codec { source })?;
        }
        self.store.save(ctx.id(), blob, E::SCHEMA_MAX, is_final).await?;
        ctx.persist.last_persisted = Instant::now();
        ctx.persist.has_persisted = true;
        self.metrics.record_snapshot(is_final);
        Ok(())
    }
}

fn jittered_tick(rng: &mut SmallRng) -> Duration {
    PERSIST_TICK_INTERVAL.mul_f64(rng.gen_range(0.9..1.1))
}

/// Periodic snapshot check; re-arms itself after every run.
struct PersistTick<E: PersistedEntity> {
    driver: Arc<PersistedKindRuntime<E>>,
}

#[async_trait]
impl<E: PersistedEntity> EntityTask<E> for PersistTick<E> {
    async fn run(self: Box<Self>, entity: &mut E, ctx: &mut EntityContext<E>) {
        let due = Instant::now()
            .checked_duration_since(ctx.persist.last_persisted)
            .is_some_and(|idle| idle > self.driver.options.snapshot_interval);
        if due {
            if let Err(err) = self.driver.persist(entity, ctx, false).await {
                error!(entity = %ctx.id(), error = %err, "periodic persist failed");
            }
        }
        let delay = PERSIST_TICK_INTERVAL.mul_f64(rand::thread_rng().gen_range(0.9..1.1));
        let driver = Arc::clone(&self.driver);
        ctx.schedule_task(delay, Box::new(PersistTick { driver }));
    }
}

/// Coalesced persist posted by `schedule_persist`; stale running ids are
/// discarded.
struct ScheduledPersist<E: PersistedEntity> {
    driver: Arc<PersistedKindRuntime<E>>,
    running_id: u64,
}

#[async_trait]
impl<E: PersistedEntity> EntityTask<E> for ScheduledPersist<E> {
    async fn run(self: Box<Self>, entity: &mut E, ctx: &mut EntityContext<E>) {
        if ctx.persist.running_id != self.running_id {
            debug!(entity = %ctx.id(), "stale scheduled persist discarded");
            return;
        }
        ctx.persist.scheduled_pending = false;
        if let Err(err) = self.driver.persist(entity, ctx, false).await {
            error!(entity = %ctx.id(), error = %err, "scheduled persist failed");
        }
    }
}
