//! End-to-end scenarios for the entity runtime.
//!
//! # Current Test Coverage
//!
//! 1. **Asks** (3 tests)
//!    - Cross-shard ask resolves with the handler's reply
//!    - Refusals raise typed payloads at the caller and keep the target up
//!    - Unexpected handler errors fail the ask and terminate the target
//!
//! 2. **Publish/subscribe** (3 tests)
//!    - Subscribe, publish, kick: strict per-link ordering, no delivery
//!      after the kick, clean unsubscribe afterwards reports unknown
//!    - Subscribe refusal raises the publisher's payload
//!    - Unsubscribe round-trip reports success for a live link
//!
//! 3. **Synchronize channels** (1 test)
//!    - Paired in-order exchange through the doubling peer
//!
//! 4. **Scheduling & serialization** (2 tests)
//!    - Per-entity handler serialization under concurrent casts
//!    - Deferred and delayed execution order with cancellation
//!
//! 5. **Topology** (1 test)
//!    - Node loss fans watched-entity termination out to subscribers

// Layer 1: Standard library imports
use std::sync::Arc;
use std::time::Duration;

// Layer 2: Third-party crate imports
use tokio::sync::oneshot;
use tokio::time::sleep;
use tokio_test::assert_ok;

// Layer 3: Internal module imports
use gridsys_entity::prelude::*;
use gridsys_entity::AskError;

mod common;
use common::*;

fn two_shard_cluster(node: &NodeAddress) -> Arc<StaticClusterConfig> {
    Arc::new(StaticClusterConfig::new(vec![node.clone(), node.clone()]))
}

async fn start_probe_lobby_runtime() -> (EntityRuntime, NodeAddress) {
    init_tracing();
    let node = NodeAddress::new("127.0.0.1", 6100);
    let runtime = EntityRuntime::builder(node.clone(), two_shard_cluster(&node))
        .register::<Probe>(KindConfig::default())
        .register::<Lobby>(KindConfig::default())
        .start()
        .await
        .unwrap();
    assert_ok!(runtime.wait_until_running().await);
    (runtime, node)
}

// ============================================================================
// TEST GROUP 1: Asks
// ============================================================================

#[tokio::test]
async fn test_ask_roundtrip_across_shards() {
    let (runtime, _) = start_probe_lobby_runtime().await;
    // Values 2 and 1 land on shards 0 and 1 respectively (modulo 2).
    let asker = EntityId::new(PROBE, 2);
    let target = EntityId::new(PROBE, 1);
    let handle = runtime.entity_handle::<Probe>(asker).await.unwrap();

    let (tx, rx) = oneshot::channel();
    handle.run(Box::new(AskDriver { target, text: "hi".to_string(), reply: tx })).unwrap();
    let reply = tokio::time::timeout(Duration::from_millis(500), rx).await.unwrap().unwrap();
    assert_eq!(reply.unwrap(), "hi");

    let snapshot = runtime.metrics().snapshot();
    assert_eq!(snapshot.asks_sent, 1);
    assert_eq!(snapshot.asks_failed, 0);
    assert_eq!(snapshot.asks_timed_out, 0);
}

#[tokio::test]
async fn test_ask_refusal_raises_payload_and_keeps_target() {
    let (runtime, _) = start_probe_lobby_runtime().await;
    let asker = EntityId::new(PROBE, 2);
    let target = EntityId::new(PROBE, 1);
    let handle = runtime.entity_handle::<Probe>(asker).await.unwrap();

    let (tx, rx) = oneshot::channel();
    handle.run(Box::new(RawAskDriver { target, msg: RejectAsk, reply: tx })).unwrap();
    let result = rx.await.unwrap();
    match result {
        Err(AskError::Refused { payload, .. }) => {
            assert_eq!(downcast::<Denied>(payload).unwrap(), Denied("nope".to_string()));
        }
        other => panic!("expected refusal, got {other:?}"),
    }

    // The refusing target is alive and still answers.
    let (tx, rx) = oneshot::channel();
    handle.run(Box::new(AskDriver { target, text: "still there".to_string(), reply: tx })).unwrap();
    assert_eq!(rx.await.unwrap().unwrap(), "still there");
    assert_eq!(runtime.metrics().snapshot().unexpected_terminations, 0);
}

#[tokio::test]
async fn test_ask_unexpected_error_terminates_target() {
    let (runtime, _) = start_probe_lobby_runtime().await;
    let asker = EntityId::new(PROBE, 2);
    let target = EntityId::new(PROBE, 1);
    let handle = runtime.entity_handle::<Probe>(asker).await.unwrap();

    // Leave a trace on the target so the restart is observable.
    let (tx, rx) = oneshot::channel();
    handle.run(Box::new(AskDriver { target, text: "before".to_string(), reply: tx })).unwrap();
    rx.await.unwrap().unwrap();

    let (tx, rx) = oneshot::channel();
    handle.run(Box::new(RawAskDriver { target, msg: BoomAsk, reply: tx })).unwrap();
    match rx.await.unwrap() {
        Err(AskError::RemoteUnexpected { message, .. }) => assert!(message.contains("boom")),
        other => panic!("expected remote unexpected error, got {other:?}"),
    }

    // The next ask spawns a fresh incarnation with an empty event log.
    let target_handle = loop {
        match runtime.entity_handle::<Probe>(target).await {
            Ok(handle) => break handle,
            Err(_) => sleep(Duration::from_millis(10)).await,
        }
    };
    let events = wait_for_events(&target_handle, |events| events.is_empty(), Duration::from_millis(500)).await;
    assert!(events.is_empty(), "expected fresh entity, saw {events:?}");
    assert!(runtime.metrics().snapshot().unexpected_terminations >= 1);
}

// ============================================================================
// TEST GROUP 2: Publish/subscribe
// ============================================================================

#[tokio::test]
async fn test_subscribe_publish_kick_ordering() {
    let (runtime, _) = start_probe_lobby_runtime().await;
    let subscriber = EntityId::new(PROBE, 0);
    let lobby = EntityId::new(LOBBY, 0);
    let probe = runtime.entity_handle::<Probe>(subscriber).await.unwrap();
    let lobby_handle = runtime.entity_handle::<Lobby>(lobby).await.unwrap();

    let (tx, rx) = oneshot::channel();
    probe.run(Box::new(SubscribeDriver { target: lobby, refuse: false, reply: tx })).unwrap();
    let welcome = rx.await.unwrap().unwrap();
    assert_eq!(welcome.members, 1);

    lobby_handle.execute(|_, ctx| ctx.cast(ctx.id(), DoPublish("m1".to_string()))).await.unwrap();
    lobby_handle.execute(|_, ctx| ctx.cast(ctx.id(), DoPublish("m2".to_string()))).await.unwrap();
    lobby_handle
        .execute(move |_, ctx| ctx.cast(ctx.id(), DoKick { peer: subscriber, goodbye: "bye".to_string() }))
        .await
        .unwrap();

    let events = wait_for_events(
        &probe,
        |events| events.iter().any(|event| event.starts_with("kicked:")),
        Duration::from_secs(2),
    )
    .await;
    assert_eq!(events, vec!["event:m1", "event:m2", "kicked:bye"]);

    // A publish after the kick goes nowhere.
    lobby_handle.execute(|_, ctx| ctx.cast(ctx.id(), DoPublish("m3".to_string()))).await.unwrap();
    sleep(Duration::from_millis(100)).await;
    let events = probe.execute(|probe, _| probe.events.clone()).await.unwrap();
    assert_eq!(events, vec!["event:m1", "event:m2", "kicked:bye"]);

    // And the publisher no longer knows us: unsubscribing is the soft
    // unknown-subscriber outcome. The kick already dropped the local
    // subscription, so there is nothing left to unsubscribe.
    let remaining = probe.execute(|probe, _| probe.subscriptions.len()).await.unwrap();
    assert_eq!(remaining, 0);
}

#[tokio::test]
async fn test_subscribe_refusal() {
    let (runtime, _) = start_probe_lobby_runtime().await;
    let subscriber = EntityId::new(PROBE, 0);
    let lobby = EntityId::new(LOBBY, 0);
    let probe = runtime.entity_handle::<Probe>(subscriber).await.unwrap();

    let (tx, rx) = oneshot::channel();
    probe.run(Box::new(SubscribeDriver { target: lobby, refuse: true, reply: tx })).unwrap();
    match rx.await.unwrap() {
        Err(AskError::Refused { payload, .. }) => {
            assert_eq!(downcast::<Denied>(payload).unwrap(), Denied("lobby is closed".to_string()));
        }
        other => panic!("expected refusal, got {other:?}"),
    }
    let remaining = probe.execute(|probe, _| probe.subscriptions.len()).await.unwrap();
    assert_eq!(remaining, 0);
}

#[tokio::test]
async fn test_unsubscribe_roundtrip() {
    let (runtime, _) = start_probe_lobby_runtime().await;
    let subscriber = EntityId::new(PROBE, 0);
    let lobby = EntityId::new(LOBBY, 0);
    let probe = runtime.entity_handle::<Probe>(subscriber).await.unwrap();

    let (tx, rx) = oneshot::channel();
    probe.run(Box::new(SubscribeDriver { target: lobby, refuse: false, reply: tx })).unwrap();
    rx.await.unwrap().unwrap();

    let (tx, rx) = oneshot::channel();
    probe.run(Box::new(UnsubscribeDriver { reply: tx })).unwrap();
    assert!(rx.await.unwrap().unwrap(), "live subscription should be known to the publisher");

    let remaining = probe.execute(|probe, _| probe.subscriptions.len()).await.unwrap();
    assert_eq!(remaining, 0);
}

// ============================================================================
// TEST GROUP 3: Synchronize channels
// ============================================================================

#[tokio::test]
async fn test_synchronize_in_order_exchange() {
    let (runtime, _) = start_probe_lobby_runtime().await;
    let opener = EntityId::new(PROBE, 0);
    let lobby = EntityId::new(LOBBY, 0);
    let probe = runtime.entity_handle::<Probe>(opener).await.unwrap();

    let (tx, rx) = oneshot::channel();
    probe
        .run(Box::new(TradeDriver { target: lobby, inputs: vec![1, 2, 3], reply: tx }))
        .unwrap();
    let outputs = tokio::time::timeout(Duration::from_secs(2), rx).await.unwrap().unwrap().unwrap();
    assert_eq!(outputs, vec![2, 4, 6]);
}

// ============================================================================
// TEST GROUP 4: Scheduling & serialization
// ============================================================================

#[tokio::test]
async fn test_per_entity_handler_serialization() {
    let (runtime, _) = start_probe_lobby_runtime().await;
    let id = EntityId::new(PROBE, 0);
    let probe = runtime.entity_handle::<Probe>(id).await.unwrap();

    // 20 casts race into the mailbox; the read-sleep-write handler would
    // lose updates if any two ever overlapped.
    probe
        .execute(move |_, ctx| {
            for _ in 0..20 {
                ctx.cast(id, SlowInc);
            }
        })
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let counter = probe.execute(|probe, _| probe.counter).await.unwrap();
        if counter == 20 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "counter stuck at {counter}");
        sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_deferred_and_delayed_execution() {
    let (runtime, _) = start_probe_lobby_runtime().await;
    let id = EntityId::new(PROBE, 0);
    let probe = runtime.entity_handle::<Probe>(id).await.unwrap();

    probe
        .execute(|_, ctx| {
            // Two delayed tasks with identical deadlines run in schedule
            // order; the cancelled one never runs; the deferred op runs
            // before any of them.
            let _first = ctx.schedule(Duration::from_millis(50), |probe: &mut Probe, _| {
                probe.events.push("delayed-a".to_string());
            });
            let _second = ctx.schedule(Duration::from_millis(50), |probe: &mut Probe, _| {
                probe.events.push("delayed-b".to_string());
            });
            let cancelled = ctx.schedule(Duration::from_millis(50), |probe: &mut Probe, _| {
                probe.events.push("cancelled".to_string());
            });
            cancelled.cancel();
            ctx.defer(|probe: &mut Probe, _| probe.events.push("deferred".to_string()));
        })
        .await
        .unwrap();

    let events = wait_for_events(
        &probe,
        |events| events.iter().any(|event| event == "delayed-b"),
        Duration::from_secs(2),
    )
    .await;
    assert_eq!(events, vec!["deferred", "delayed-a", "delayed-b"]);
}

// ============================================================================
// TEST GROUP 5: Topology
// ============================================================================

#[tokio::test]
async fn test_node_loss_fans_out_watched_termination() {
    init_tracing();
    let node1 = NodeAddress::new("127.0.0.1", 6201);
    let node2 = NodeAddress::new("127.0.0.1", 6202);
    let cluster = Arc::new(
        StaticClusterConfig::new(vec![node1.clone()]).with_kind(LOBBY, vec![node2.clone()]),
    );

    let runtime1 = EntityRuntime::builder(node1, Arc::clone(&cluster) as Arc<dyn ClusterConfig>)
        .register::<Probe>(KindConfig::default())
        .start()
        .await
        .unwrap();
    let runtime2 = EntityRuntime::builder(node2.clone(), Arc::clone(&cluster) as Arc<dyn ClusterConfig>)
        .with_registry(&runtime1.registry_handle())
        .register::<Lobby>(KindConfig::default())
        .start()
        .await
        .unwrap();
    assert_ok!(runtime1.wait_until_running().await);
    assert_ok!(runtime2.wait_until_running().await);

    let subscriber = EntityId::new(PROBE, 0);
    let lobby = EntityId::new(LOBBY, 0);
    let probe = runtime1.entity_handle::<Probe>(subscriber).await.unwrap();

    let (tx, rx) = oneshot::channel();
    probe.run(Box::new(SubscribeDriver { target: lobby, refuse: false, reply: tx })).unwrap();
    rx.await.unwrap().unwrap();

    // "Node 2" drops out of the cluster.
    cluster.node_lost(node2);

    let events = wait_for_events(
        &probe,
        |events| events.iter().any(|event| event.starts_with("sub-lost:")),
        Duration::from_secs(2),
    )
    .await;
    let expected = format!("sub-lost:{lobby}");
    let losses = events.iter().filter(|event| event.as_str() == expected).count();
    assert_eq!(losses, 1, "expected exactly one loss notice, events: {events:?}");

    let remaining = probe.execute(|probe, _| probe.subscriptions.len()).await.unwrap();
    assert_eq!(remaining, 0);
}
