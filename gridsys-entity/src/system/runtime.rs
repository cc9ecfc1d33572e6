// Layer 1: Standard library imports
use std::sync::Arc;

// Layer 2: Third-party crate imports
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

// Layer 3: Internal module imports
use super::config::{RuntimeOptions, DEFAULT_PERSISTED_MAX_CONCURRENT_SHUTDOWNS};
use super::errors::{ShardStartError, SystemError};
use super::registry::{KindMeta, ShardRegistry};
use crate::cluster::{ClusterConfig, ClusterEvent};
use crate::dispatch::DispatchTable;
use crate::entity::{ConstructEntity, Entity, EntityHandle, EntitySpawner, PlainSpawner};
use crate::message::{Codec, JsonCodec};
use crate::metrics::RuntimeMetrics;
use crate::persist::{PersistDriver, PersistedEntity, PersistedKindRuntime, PersistedStore};
use crate::shard::actor::{KindRuntime, ShardActor};
use crate::shard::{ShardMsg, ShardRef};
use crate::sharding::ShardingStrategy;
use crate::util::{EntityId, NodeAddress, ShardId};

/// Per-kind registration knobs.
#[derive(Debug, Clone)]
pub struct KindConfig {
    /// Placement strategy of the kind.
    pub strategy: ShardingStrategy,
    /// Transient kinds are never restarted to drain leftover messages.
    pub transient: bool,
    /// Per-kind shutdown concurrency; `None` falls back to the runtime
    /// default (50 for persisted kinds, the global option otherwise).
    pub max_concurrent_shutdowns: Option<i32>,
}

impl Default for KindConfig {
    fn default() -> Self {
        Self { strategy: ShardingStrategy::Modulo, transient: false, max_concurrent_shutdowns: None }
    }
}

impl KindConfig {
    /// Config with the given strategy and defaults otherwise.
    pub fn new(strategy: ShardingStrategy) -> Self {
        Self { strategy, ..Self::default() }
    }

    /// Mark the kind transient.
    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    /// Bound concurrent shutdowns for this kind.
    pub fn with_max_concurrent_shutdowns(mut self, max: i32) -> Self {
        self.max_concurrent_shutdowns = Some(max);
        self
    }
}

/// Opaque handle to a runtime's shard registry. Hand it to another
/// builder's [`EntityRuntimeBuilder::with_registry`] to run several
/// "nodes" of one logical cluster inside one process.
#[derive(Clone)]
pub struct RegistryHandle {
    pub(crate) registry: ShardRegistry,
}

struct StartState {
    node: NodeAddress,
    cluster: Arc<dyn ClusterConfig>,
    options: Arc<RuntimeOptions>,
    codec: Arc<dyn Codec>,
    store: Option<Arc<dyn PersistedStore>>,
    registry: ShardRegistry,
    metrics: Arc<RuntimeMetrics>,
    local_shards: Vec<ShardRef>,
}

type SpawnFn = Box<dyn FnOnce() + Send>;
type RegistrationFn = Box<dyn FnOnce(&mut StartState) -> Result<Vec<SpawnFn>, SystemError> + Send>;

/// Startup-time builder for an [`EntityRuntime`].
///
/// Kinds are registered here and nowhere else; after
/// [`EntityRuntimeBuilder::start`] the registration set is immutable.
pub struct EntityRuntimeBuilder {
    node: NodeAddress,
    cluster: Arc<dyn ClusterConfig>,
    options: RuntimeOptions,
    codec: Arc<dyn Codec>,
    store: Option<Arc<dyn PersistedStore>>,
    registry: ShardRegistry,
    metrics: Arc<RuntimeMetrics>,
    registrations: Vec<RegistrationFn>,
}

impl EntityRuntimeBuilder {
    /// Configure the runtime options (defaults otherwise).
    pub fn with_options(mut self, options: RuntimeOptions) -> Self {
        self.options = options;
        self
    }

    /// Configure the wire codec for remote payload encoding.
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Configure the persisted-entity store. Required before
    /// [`EntityRuntimeBuilder::register_persisted`] kinds can start.
    pub fn with_store(mut self, store: Arc<dyn PersistedStore>) -> Self {
        self.store = store.into();
        self
    }

    /// Share another runtime's shard registry, joining its in-process
    /// cluster.
    pub fn with_registry(mut self, handle: &RegistryHandle) -> Self {
        self.registry = handle.registry.clone();
        self
    }

    /// Register a plain (non-persisted) entity kind.
    pub fn register<Ent: ConstructEntity>(mut self, config: KindConfig) -> Self {
        self.registrations.push(Box::new(move |start: &mut StartState| {
            let spawner: Arc<dyn EntitySpawner<Ent>> = Arc::new(PlainSpawner);
            register_kind::<Ent>(start, config, spawner, None, false)
        }));
        self
    }

    /// Register a persisted entity kind.
    pub fn register_persisted<Ent: PersistedEntity>(mut self, config: KindConfig) -> Self {
        self.registrations.push(Box::new(move |start: &mut StartState| {
            let kind = Ent::kind();
            let Some(store) = start.store.clone() else {
                return Err(SystemError::InvalidConfiguration {
                    reason: format!("persisted kind {kind} registered without a store"),
                });
            };
            let harness = Arc::new(
                PersistedKindRuntime::<Ent>::new(store, Arc::clone(&start.options), Arc::clone(&start.metrics))
                    .map_err(|source| SystemError::PersistedKind { kind, source })?,
            );
            let spawner: Arc<dyn EntitySpawner<Ent>> = Arc::clone(&harness) as Arc<dyn EntitySpawner<Ent>>;
            let persist: Arc<dyn PersistDriver<Ent>> = harness;
            register_kind::<Ent>(start, config, spawner, Some(persist), true)
        }));
        self
    }

    /// Validate every registration, publish placement, spawn the local
    /// shards, and hook up cluster events.
    pub async fn start(self) -> Result<EntityRuntime, SystemError> {
        let options = Arc::new(self.options);
        let mut state = StartState {
            node: self.node.clone(),
            cluster: Arc::clone(&self.cluster),
            options: Arc::clone(&options),
            codec: self.codec,
            store: self.store,
            registry: self.registry.clone(),
            metrics: Arc::clone(&self.metrics),
            local_shards: Vec::new(),
        };
        // Two phases: every kind publishes placement and shard refs first,
        // then the shard tasks start, so early routing across kinds
        // resolves.
        let mut spawns = Vec::new();
        for registration in self.registrations {
            spawns.extend(registration(&mut state)?);
        }
        for spawn in spawns {
            spawn();
        }

        let pump = spawn_event_pump(
            self.cluster.subscribe(),
            self.node.clone(),
            self.registry.clone(),
            state.local_shards.clone(),
        );

        Ok(EntityRuntime {
            inner: Arc::new(RuntimeInner {
                node: self.node,
                options,
                registry: self.registry,
                metrics: self.metrics,
                local_shards: state.local_shards,
                _event_pump: pump,
            }),
        })
    }
}

fn register_kind<Ent: Entity>(
    start: &mut StartState,
    config: KindConfig,
    spawner: Arc<dyn EntitySpawner<Ent>>,
    persist: Option<Arc<dyn PersistDriver<Ent>>>,
    persisted: bool,
) -> Result<Vec<SpawnFn>, SystemError> {
    let kind = Ent::kind();
    let mut table = DispatchTable::new();
    Ent::register(&mut table);
    if !table.duplicates().is_empty() {
        return Err(SystemError::DuplicateHandler { kind, message_types: table.duplicates().to_vec() });
    }
    let table = Arc::new(table);

    let nodes = start
        .options
        .entity_placement_overrides
        .get(&kind)
        .cloned()
        .unwrap_or_else(|| start.cluster.shards_for_kind(kind));
    if nodes.is_empty() {
        return Err(SystemError::InvalidConfiguration { reason: format!("kind {kind} has no placement nodes") });
    }
    if !start.registry.register_kind(KindMeta { kind, strategy: config.strategy, nodes: nodes.clone() }) {
        return Err(SystemError::KindAlreadyRegistered { kind });
    }

    let default_max = if persisted {
        DEFAULT_PERSISTED_MAX_CONCURRENT_SHUTDOWNS
    } else {
        start.options.max_concurrent_entity_shutdowns_per_shard
    };
    let max_shutdowns = config.max_concurrent_shutdowns.unwrap_or(default_max);

    let mut spawns: Vec<SpawnFn> = Vec::new();
    for (index, addr) in nodes.iter().enumerate() {
        if *addr != start.node {
            continue;
        }
        let shard_id = ShardId::new(kind, index as i32);
        let (tx, rx) = mpsc::unbounded_channel();
        let shard_ref = ShardRef::new(shard_id, tx);
        start.registry.publish_shard(shard_ref.clone());
        start.local_shards.push(shard_ref.clone());

        let actor = ShardActor::new(
            shard_id,
            shard_ref,
            rx,
            KindRuntime {
                table: Arc::clone(&table),
                spawner: Arc::clone(&spawner),
                persist: persist.clone(),
                transient: config.transient,
                max_concurrent_shutdowns: max_shutdowns,
            },
            start.registry.clone(),
            Arc::clone(&start.codec),
            Arc::clone(&start.options),
            Arc::clone(&start.metrics),
        );
        spawns.push(Box::new(move || {
            tokio::spawn(actor.run());
        }));
    }
    Ok(spawns)
}

fn spawn_event_pump(
    mut events: tokio::sync::broadcast::Receiver<ClusterEvent>,
    node: NodeAddress,
    registry: ShardRegistry,
    local_shards: Vec<ShardRef>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ClusterEvent::NodeLost(addr)) => {
                    if addr == node {
                        continue;
                    }
                    let lost = registry.shards_on(&addr);
                    if lost.is_empty() {
                        continue;
                    }
                    warn!(%addr, shards = lost.len(), "cluster node lost");
                    for shard in &local_shards {
                        shard.send(ShardMsg::NodeLost { lost: lost.clone() });
                    }
                }
                Ok(ClusterEvent::NodeJoined(addr)) => {
                    debug!(%addr, "cluster node joined");
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "cluster event stream lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

struct RuntimeInner {
    node: NodeAddress,
    options: Arc<RuntimeOptions>,
    registry: ShardRegistry,
    metrics: Arc<RuntimeMetrics>,
    local_shards: Vec<ShardRef>,
    _event_pump: JoinHandle<()>,
}

/// Per-node entry point: owns the local shards of every registered kind.
///
/// # Example
/// ```rust,ignore
/// let node = NodeAddress::new("127.0.0.1", 6000);
/// let cluster = Arc::new(StaticClusterConfig::single_node(node.clone()));
/// let runtime = EntityRuntime::builder(node, cluster)
///     .with_store(Arc::new(InMemoryStore::new()))
///     .register::<SessionEntity>(KindConfig::default())
///     .register_persisted::<PlayerEntity>(KindConfig::default())
///     .start()
///     .await?;
/// runtime.wait_until_running().await?;
/// ```
#[derive(Clone)]
pub struct EntityRuntime {
    inner: Arc<RuntimeInner>,
}

impl EntityRuntime {
    /// Create a builder for a runtime on `node`.
    pub fn builder(node: NodeAddress, cluster: Arc<dyn ClusterConfig>) -> EntityRuntimeBuilder {
        EntityRuntimeBuilder {
            node,
            cluster,
            options: RuntimeOptions::default(),
            codec: Arc::new(JsonCodec::new()),
            store: None,
            registry: ShardRegistry::new(),
            metrics: Arc::new(RuntimeMetrics::new()),
            registrations: Vec::new(),
        }
    }

    /// This runtime's node address.
    pub fn node(&self) -> &NodeAddress {
        &self.inner.node
    }

    /// Runtime options in effect.
    pub fn options(&self) -> &RuntimeOptions {
        &self.inner.options
    }

    /// Node-wide counters.
    pub fn metrics(&self) -> &RuntimeMetrics {
        &self.inner.metrics
    }

    /// Shard ids hosted by this node.
    pub fn local_shards(&self) -> Vec<ShardId> {
        self.inner.local_shards.iter().map(|shard| shard.id()).collect()
    }

    /// Handle for joining further in-process runtimes to this registry.
    pub fn registry_handle(&self) -> RegistryHandle {
        RegistryHandle { registry: self.inner.registry.clone() }
    }

    /// Resolve once every local shard reached `Running`.
    ///
    /// # Errors
    ///
    /// [`SystemError::ShardStart`] collecting the start errors of every
    /// shard that failed.
    pub async fn wait_until_running(&self) -> Result<(), SystemError> {
        let mut errors: Vec<ShardStartError> = Vec::new();
        for shard in &self.inner.local_shards {
            let (tx, rx) = oneshot::channel();
            if !shard.send(ShardMsg::WaitUntilRunning { reply: tx }) {
                errors.push(ShardStartError { shard: shard.id(), failures: Vec::new() });
                continue;
            }
            match rx.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => errors.push(err),
                Err(_) => errors.push(ShardStartError { shard: shard.id(), failures: Vec::new() }),
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(SystemError::ShardStart { errors })
        }
    }

    /// Coordinated node shutdown: drive every local shard through
    /// `Stopping` and wait for each to drain, bounded per shard by
    /// [`RuntimeOptions::shard_shutdown_timeout`].
    pub async fn shutdown(&self) -> Result<(), SystemError> {
        let limit = self.inner.options.shard_shutdown_timeout;
        let mut slow: Option<ShardId> = None;
        for shard in &self.inner.local_shards {
            let (tx, rx) = oneshot::channel();
            if !shard.send(ShardMsg::ShutdownSync { reply: tx }) {
                continue;
            }
            if timeout(limit, rx).await.is_err() {
                warn!(shard = %shard.id(), ?limit, "shard did not drain in time");
                slow.get_or_insert(shard.id());
            }
        }
        match slow {
            None => Ok(()),
            Some(shard) => Err(SystemError::ShutdownTimeout { shard, timeout: limit }),
        }
    }

    /// Declare a node lost, as an out-of-band alternative to the cluster
    /// event stream.
    pub fn notify_node_lost(&self, node: &NodeAddress) {
        let lost = self.inner.registry.shards_on(node);
        if lost.is_empty() {
            return;
        }
        for shard in &self.inner.local_shards {
            shard.send(ShardMsg::NodeLost { lost: lost.clone() });
        }
    }

    /// Fetch (spawning on demand) a typed handle to a local entity.
    pub async fn entity_handle<Ent: Entity>(&self, id: EntityId) -> Result<EntityHandle<Ent>, SystemError> {
        if id.kind() != Ent::kind() {
            return Err(SystemError::InvalidConfiguration {
                reason: format!("entity {id} is not of kind {}", Ent::kind()),
            });
        }
        let Some(shard) = self.inner.registry.resolve(id) else {
            return Err(SystemError::UnknownKind { kind: id.kind() });
        };
        let shard_id = shard.id();
        let (tx, rx) = oneshot::channel();
        if !shard.send(ShardMsg::GetHandle { id, reply: tx }) {
            return Err(SystemError::Shard(crate::shard::ShardError::Unreachable { shard: shard_id }));
        }
        let boxed = rx
            .await
            .map_err(|_| SystemError::Shard(crate::shard::ShardError::Unreachable { shard: shard_id }))??;
        boxed
            .downcast::<EntityHandle<Ent>>()
            .map(|handle| *handle)
            .map_err(|_| SystemError::Shard(crate::shard::ShardError::TypeMismatch))
    }
}
