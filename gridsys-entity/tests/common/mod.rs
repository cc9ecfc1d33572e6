//! Shared fixtures for the end-to-end scenarios: a probe entity that
//! records everything that happens to it, a lobby publisher, a persisted
//! player, and on-actor driver tasks for the async operations.

#![allow(dead_code)]

// Layer 1: Standard library imports
use std::sync::Once;
use std::time::Duration;

// Layer 2: Third-party crate imports
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

// Layer 3: Internal module imports
use gridsys_entity::persist::PersistError;
use gridsys_entity::prelude::*;
use gridsys_entity::{AskError, AutoShutdownPolicy, SyncError};

pub const PROBE: EntityKind = EntityKind::new(1, "Probe");
pub const LOBBY: EntityKind = EntityKind::new(2, "Lobby");
pub const PLAYER: EntityKind = EntityKind::new(3, "Player");
pub const IDLER: EntityKind = EntityKind::new(4, "Idler");

static INIT_TRACING: Once = Once::new();

/// Route runtime logs through the test harness; `RUST_LOG` controls what
/// shows when a scenario needs debugging.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

// ---------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Note(pub String);

#[derive(Debug, Clone)]
pub struct Echo(pub String);

#[derive(Debug, Clone)]
pub struct RejectAsk;

#[derive(Debug, Clone, PartialEq)]
pub struct Denied(pub String);

#[derive(Debug, Clone)]
pub struct BoomAsk;

#[derive(Debug, Clone)]
pub struct SlowInc;

#[derive(Debug, Clone)]
pub struct JoinLobby {
    pub refuse: bool,
}

#[derive(Debug, Clone)]
pub struct Welcome {
    pub members: usize,
}

#[derive(Debug, Clone)]
pub struct LobbyEvent(pub String);

#[derive(Debug, Clone)]
pub struct Bye(pub String);

#[derive(Debug, Clone)]
pub struct DoPublish(pub String);

#[derive(Debug, Clone)]
pub struct DoKick {
    pub peer: EntityId,
    pub goodbye: String,
}

#[derive(Debug, Clone)]
pub struct TradeOpen;

// ---------------------------------------------------------------------
// Probe: records everything, drives asks/subscribes/syncs
// ---------------------------------------------------------------------

pub struct Probe {
    pub events: Vec<String>,
    pub counter: u64,
    pub subscriptions: Vec<Subscription>,
}

#[async_trait]
impl Entity for Probe {
    fn kind() -> EntityKind {
        PROBE
    }

    fn register(table: &mut DispatchTable<Self>) {
        table
            .message::<Note>()
            .message::<SlowInc>()
            .ask::<Echo>()
            .ask::<RejectAsk>()
            .ask::<BoomAsk>()
            .subscription::<LobbyEvent>();
    }

    async fn on_kicked_from(
        &mut self,
        _ctx: &mut EntityContext<Self>,
        subscription: Subscription,
        payload: BoxMessage,
    ) {
        let goodbye = downcast::<Bye>(payload).map(|bye| bye.0).unwrap_or_default();
        self.subscriptions.retain(|sub| sub.in_channel != subscription.in_channel);
        self.events.push(format!("kicked:{goodbye}"));
    }

    async fn on_subscription_lost(&mut self, _ctx: &mut EntityContext<Self>, subscription: Subscription) {
        self.subscriptions.retain(|sub| sub.in_channel != subscription.in_channel);
        self.events.push(format!("sub-lost:{}", subscription.publisher));
    }
}

impl ConstructEntity for Probe {
    fn construct(_id: EntityId) -> Result<Self, EntityError> {
        Ok(Probe { events: Vec::new(), counter: 0, subscriptions: Vec::new() })
    }
}

#[async_trait]
impl Handler<Note> for Probe {
    async fn handle(
        &mut self,
        _ctx: &mut EntityContext<Self>,
        _sender: Option<EntityId>,
        msg: Note,
    ) -> Result<(), EntityError> {
        self.events.push(format!("note:{}", msg.0));
        Ok(())
    }
}

#[async_trait]
impl Handler<SlowInc> for Probe {
    async fn handle(
        &mut self,
        _ctx: &mut EntityContext<Self>,
        _sender: Option<EntityId>,
        _msg: SlowInc,
    ) -> Result<(), EntityError> {
        // Read-sleep-write: lost updates would show if two handlers ever
        // overlapped on one entity.
        let read = self.counter;
        sleep(Duration::from_millis(5)).await;
        self.counter = read + 1;
        Ok(())
    }
}

#[async_trait]
impl AskHandler<Echo> for Probe {
    type Reply = String;

    async fn handle_ask(
        &mut self,
        _ctx: &mut EntityContext<Self>,
        _sender: Option<EntityId>,
        msg: Echo,
    ) -> Result<String, EntityError> {
        self.events.push(format!("echoed:{}", msg.0));
        Ok(msg.0)
    }
}

#[async_trait]
impl AskHandler<RejectAsk> for Probe {
    type Reply = String;

    async fn handle_ask(
        &mut self,
        _ctx: &mut EntityContext<Self>,
        _sender: Option<EntityId>,
        _msg: RejectAsk,
    ) -> Result<String, EntityError> {
        Err(EntityError::refuse(Denied("nope".to_string())))
    }
}

#[async_trait]
impl AskHandler<BoomAsk> for Probe {
    type Reply = String;

    async fn handle_ask(
        &mut self,
        _ctx: &mut EntityContext<Self>,
        _sender: Option<EntityId>,
        _msg: BoomAsk,
    ) -> Result<String, EntityError> {
        Err(EntityError::failed("boom"))
    }
}

#[async_trait]
impl SubscriptionHandler<LobbyEvent> for Probe {
    async fn handle_published(
        &mut self,
        _ctx: &mut EntityContext<Self>,
        _subscription: Subscription,
        msg: LobbyEvent,
    ) -> Result<(), EntityError> {
        self.events.push(format!("event:{}", msg.0));
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Lobby: publisher with subscribe/refuse/kick behavior and a doubling
// synchronize handler
// ---------------------------------------------------------------------

pub struct Lobby {
    pub joined: usize,
}

#[async_trait]
impl Entity for Lobby {
    fn kind() -> EntityKind {
        LOBBY
    }

    fn register(table: &mut DispatchTable<Self>) {
        table.message::<DoPublish>().message::<DoKick>().synchronize::<TradeOpen>();
    }

    async fn on_new_subscriber(
        &mut self,
        _ctx: &mut EntityContext<Self>,
        _subscriber: Subscriber,
        payload: BoxMessage,
    ) -> Result<BoxMessage, EntityError> {
        let join = downcast::<JoinLobby>(payload).map_err(EntityError::other)?;
        if join.refuse {
            return Err(EntityError::refuse(Denied("lobby is closed".to_string())));
        }
        self.joined += 1;
        Ok(Box::new(Welcome { members: self.joined }))
    }
}

impl ConstructEntity for Lobby {
    fn construct(_id: EntityId) -> Result<Self, EntityError> {
        Ok(Lobby { joined: 0 })
    }
}

#[async_trait]
impl Handler<DoPublish> for Lobby {
    async fn handle(
        &mut self,
        ctx: &mut EntityContext<Self>,
        _sender: Option<EntityId>,
        msg: DoPublish,
    ) -> Result<(), EntityError> {
        ctx.publish(Topic(0), LobbyEvent(msg.0));
        Ok(())
    }
}

#[async_trait]
impl Handler<DoKick> for Lobby {
    async fn handle(
        &mut self,
        ctx: &mut EntityContext<Self>,
        _sender: Option<EntityId>,
        msg: DoKick,
    ) -> Result<(), EntityError> {
        let found = ctx.subscribers().find(|sub| sub.peer == msg.peer).cloned();
        if let Some(subscriber) = found {
            ctx.kick_subscriber(&subscriber, Bye(msg.goodbye));
        }
        Ok(())
    }
}

#[async_trait]
impl SyncHandler<TradeOpen> for Lobby {
    async fn handle_synchronize(
        &mut self,
        _ctx: &mut EntityContext<Self>,
        mut channel: SyncChannel,
        _msg: TradeOpen,
    ) -> Result<(), EntityError> {
        loop {
            match channel.receive::<u32>().await {
                Ok(value) => {
                    channel.send(value * 2).map_err(EntityError::other)?;
                }
                Err(SyncError::ChannelClosed) => break,
                Err(err) => return Err(EntityError::other(err)),
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Player: persisted entity with a three-step migration history
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerState {
    pub name: String,
    pub coins: u64,
    pub season: u32,
    /// Set only by `initialize_new`; restored states never carry it.
    #[serde(default)]
    pub fresh: bool,
}

pub struct Player {
    pub state: PlayerState,
    pub restored_from: Option<chrono::DateTime<chrono::Utc>>,
}

#[async_trait]
impl Entity for Player {
    fn kind() -> EntityKind {
        PLAYER
    }

    fn register(table: &mut DispatchTable<Self>) {
        table.ask::<Echo>();
    }
}

#[async_trait]
impl AskHandler<Echo> for Player {
    type Reply = String;

    async fn handle_ask(
        &mut self,
        _ctx: &mut EntityContext<Self>,
        _sender: Option<EntityId>,
        msg: Echo,
    ) -> Result<String, EntityError> {
        Ok(msg.0)
    }
}

#[async_trait]
impl PersistedEntity for Player {
    type State = PlayerState;

    const SCHEMA_MIN: SchemaVersion = SchemaVersion(1);
    const SCHEMA_MAX: SchemaVersion = SchemaVersion(4);

    fn initialize_new(_id: EntityId) -> PlayerState {
        PlayerState { name: "newcomer".to_string(), coins: 0, season: 1, fresh: true }
    }

    fn from_state(_id: EntityId, state: PlayerState) -> Self {
        Player { state, restored_from: None }
    }

    fn snapshot(&self) -> PlayerState {
        self.state.clone()
    }

    fn migrations() -> MigrationChain {
        MigrationChain::new()
            // v1 -> v2: flat display name
            .step(SchemaVersion(1), |value| {
                value["name"] = value["display_name"].take();
                Ok(())
            })
            // v2 -> v3: gold became coins; leave a marker proving order
            .step(SchemaVersion(2), |value| {
                value["coins"] = value["gold"].take();
                value["migrated_v3"] = true.into();
                Ok(())
            })
            // v3 -> v4: seasons arrived; the marker must already be there
            .step(SchemaVersion(3), |value| {
                if value.get("migrated_v3").is_none() {
                    return Err(PersistError::MigrationGap { from: SchemaVersion(2) });
                }
                value["season"] = 1.into();
                Ok(())
            })
    }

    async fn post_load(
        &mut self,
        _ctx: &mut EntityContext<Self>,
        persisted_at: Option<chrono::DateTime<chrono::Utc>>,
        _elapsed: Duration,
    ) -> Result<(), EntityError> {
        self.restored_from = persisted_at;
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Idler: persisted entity that idles itself out of memory
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdlerState {
    pub wakes: u64,
}

pub struct Idler {
    pub state: IdlerState,
}

#[async_trait]
impl Entity for Idler {
    fn kind() -> EntityKind {
        IDLER
    }

    fn register(table: &mut DispatchTable<Self>) {
        table.message::<Note>();
    }

    fn auto_shutdown(&self) -> AutoShutdownPolicy {
        AutoShutdownPolicy::NoSubscribersAfter {
            linger: Duration::from_secs(60),
            initial: Duration::from_secs(30),
        }
    }
}

#[async_trait]
impl Handler<Note> for Idler {
    async fn handle(
        &mut self,
        _ctx: &mut EntityContext<Self>,
        _sender: Option<EntityId>,
        _msg: Note,
    ) -> Result<(), EntityError> {
        self.state.wakes += 1;
        Ok(())
    }
}

#[async_trait]
impl PersistedEntity for Idler {
    type State = IdlerState;

    const SCHEMA_MIN: SchemaVersion = SchemaVersion(1);
    const SCHEMA_MAX: SchemaVersion = SchemaVersion(1);

    fn initialize_new(_id: EntityId) -> IdlerState {
        IdlerState { wakes: 0 }
    }

    fn from_state(_id: EntityId, state: IdlerState) -> Self {
        Idler { state }
    }

    fn snapshot(&self) -> IdlerState {
        self.state.clone()
    }
}

// ---------------------------------------------------------------------
// Driver tasks: async operations that must run on the actor
// ---------------------------------------------------------------------

/// Runs `ctx.ask::<Echo, String>` on a probe and reports the outcome.
pub struct AskDriver {
    pub target: EntityId,
    pub text: String,
    pub reply: oneshot::Sender<Result<String, AskError>>,
}

#[async_trait]
impl EntityTask<Probe> for AskDriver {
    async fn run(self: Box<Self>, _entity: &mut Probe, ctx: &mut EntityContext<Probe>) {
        let result = ctx.ask::<Echo, String>(self.target, Echo(self.text)).await;
        let _ = self.reply.send(result);
    }
}

/// Sends an arbitrary ask message expecting a `String` reply.
pub struct RawAskDriver<M: EntityMessage> {
    pub target: EntityId,
    pub msg: M,
    pub reply: oneshot::Sender<Result<String, AskError>>,
}

#[async_trait]
impl<M: EntityMessage> EntityTask<Probe> for RawAskDriver<M> {
    async fn run(self: Box<Self>, _entity: &mut Probe, ctx: &mut EntityContext<Probe>) {
        let result = ctx.ask::<M, String>(self.target, self.msg).await;
        let _ = self.reply.send(result);
    }
}

/// Subscribes a probe to a lobby and records the subscription on success.
pub struct SubscribeDriver {
    pub target: EntityId,
    pub refuse: bool,
    pub reply: oneshot::Sender<Result<Welcome, AskError>>,
}

#[async_trait]
impl EntityTask<Probe> for SubscribeDriver {
    async fn run(self: Box<Self>, entity: &mut Probe, ctx: &mut EntityContext<Probe>) {
        let result = ctx
            .subscribe::<JoinLobby, Welcome>(self.target, Topic(0), JoinLobby { refuse: self.refuse })
            .await;
        let _ = self.reply.send(result.map(|(subscription, welcome)| {
            entity.subscriptions.push(subscription);
            welcome
        }));
    }
}

/// Unsubscribes a probe from its first recorded subscription.
pub struct UnsubscribeDriver {
    pub reply: oneshot::Sender<Result<bool, AskError>>,
}

#[async_trait]
impl EntityTask<Probe> for UnsubscribeDriver {
    async fn run(self: Box<Self>, entity: &mut Probe, ctx: &mut EntityContext<Probe>) {
        let Some(subscription) = entity.subscriptions.first().cloned() else {
            return;
        };
        let result = ctx.unsubscribe(&subscription).await;
        if result.is_ok() {
            entity.subscriptions.retain(|sub| sub.in_channel != subscription.in_channel);
        }
        let _ = self.reply.send(result);
    }
}

/// Opens a synchronize channel, pushes `inputs` through the doubling peer,
/// and reports what came back.
pub struct TradeDriver {
    pub target: EntityId,
    pub inputs: Vec<u32>,
    pub reply: oneshot::Sender<Result<Vec<u32>, String>>,
}

#[async_trait]
impl EntityTask<Probe> for TradeDriver {
    async fn run(self: Box<Self>, _entity: &mut Probe, ctx: &mut EntityContext<Probe>) {
        let outcome = async {
            let mut channel =
                ctx.synchronize(self.target, TradeOpen).await.map_err(|err| err.to_string())?;
            let mut outputs = Vec::new();
            for input in &self.inputs {
                channel.send(*input).map_err(|err| err.to_string())?;
                let doubled: u32 = channel.receive().await.map_err(|err| err.to_string())?;
                outputs.push(doubled);
            }
            channel.close();
            Ok(outputs)
        }
        .await;
        let _ = self.reply.send(outcome);
    }
}

// ---------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------

/// Poll a probe's event log until `pred` holds or the deadline passes.
pub async fn wait_for_events<F>(handle: &EntityHandle<Probe>, pred: F, limit: Duration) -> Vec<String>
where
    F: Fn(&[String]) -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let events = handle.execute(|probe, _| probe.events.clone()).await.unwrap_or_default();
        if pred(&events) || tokio::time::Instant::now() >= deadline {
            return events;
        }
        sleep(Duration::from_millis(10)).await;
    }
}
