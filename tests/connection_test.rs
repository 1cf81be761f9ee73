//! Connection Manager Integration Tests
//!
//! Reconnects, subscription replay, heartbeats and the reconnect budget,
//! driven through the loopback transport on a paused clock.

mod common;

use common::*;
use hass_mcp::{
    ConnectionConfig, ConnectionManager, ConnectionState, CoreError, EventFilter, LifecycleEvent,
    MemoryConnector, RemotePeer, Request,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

async fn connected(
    config: ConnectionConfig,
) -> (
    Arc<ConnectionManager>,
    MemoryConnector,
    RemotePeer,
    mpsc::UnboundedReceiver<RemotePeer>,
) {
    let (connector, mut peers) = MemoryConnector::new();
    let manager = Arc::new(ConnectionManager::new(config, Arc::new(connector.clone()), TOKEN));
    let (result, peer) = tokio::join!(manager.connect(), async {
        let mut peer = peers.recv().await.unwrap();
        accept(&mut peer).await;
        peer
    });
    result.unwrap();
    (manager, connector, peer, peers)
}

#[tokio::test(start_paused = true)]
async fn test_replay_restores_active_subscriptions_in_order() {
    let (manager, _connector, mut peer, mut peers) = connected(quiet_connection()).await;
    let mut lifecycle = manager.lifecycle();

    let mut subscriptions = Vec::new();
    for filter in [
        EventFilter::event_type("state_changed"),
        EventFilter::event_type("call_service"),
        EventFilter::All,
    ] {
        let (subscription, _) = tokio::join!(manager.subscribe(filter), async {
            let frame = expect(&mut peer, "subscribe_events").await;
            reply(&peer, &frame, Value::Null);
        });
        subscriptions.push(subscription.unwrap());
    }

    let removed = subscriptions.remove(1);
    let (result, _) = tokio::join!(manager.unsubscribe(removed.id), async {
        let frame = expect(&mut peer, "unsubscribe_events").await;
        reply(&peer, &frame, Value::Null);
    });
    result.unwrap();

    peer.close();
    assert_eq!(
        lifecycle.recv().await,
        Some(LifecycleEvent::Disconnected {
            reason: "closed by remote".to_string()
        })
    );

    let mut peer = peers.recv().await.unwrap();
    accept(&mut peer).await;

    let first = expect(&mut peer, "subscribe_events").await;
    assert_eq!(first["event_type"], "state_changed");
    reply(&peer, &first, Value::Null);

    let second = expect(&mut peer, "subscribe_events").await;
    assert!(second.get("event_type").is_none());
    assert!(second["id"].as_u64().unwrap() > first["id"].as_u64().unwrap());
    reply(&peer, &second, Value::Null);

    assert_eq!(
        lifecycle.recv().await,
        Some(LifecycleEvent::Connected { resumed: true })
    );

    // nothing else was replayed: the next frame is our own request
    let (pong, _) = tokio::join!(manager.send_request(Request::ping()), async {
        let frame = expect(&mut peer, "ping").await;
        peer.send_json(&json!({"id": frame["id"], "type": "pong"}));
    });
    assert_eq!(pong, Ok(Value::Null));

    // events on the new remote ids reach the original observers
    push_event(&peer, &second, json!({"event_type": "custom", "data": {"n": 1}}));
    let everything = &mut subscriptions[1];
    let delivered = everything.events.recv().await.unwrap();
    assert_eq!(delivered.subscription, everything.id);
    assert_eq!(delivered.event["data"]["n"], 1);

    let live = manager.subscriptions().await.unwrap();
    let ids: Vec<u64> = live.iter().map(|info| info.id).collect();
    assert_eq!(ids, vec![subscriptions[0].id, subscriptions[1].id]);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_replay_drops_only_that_subscription() {
    let (manager, _connector, mut peer, mut peers) = connected(quiet_connection()).await;
    let mut lifecycle = manager.lifecycle();

    for event_type in ["state_changed", "custom_event"] {
        let subscribe = manager.subscribe(EventFilter::event_type(event_type));
        let (subscription, _) = tokio::join!(subscribe, async {
            let frame = expect(&mut peer, "subscribe_events").await;
            reply(&peer, &frame, Value::Null);
        });
        subscription.unwrap();
    }

    peer.close();
    assert!(matches!(
        lifecycle.recv().await,
        Some(LifecycleEvent::Disconnected { .. })
    ));

    let mut peer = peers.recv().await.unwrap();
    accept(&mut peer).await;
    let first = expect(&mut peer, "subscribe_events").await;
    reject(&peer, &first, "unauthorized", "Not allowed");
    let second = expect(&mut peer, "subscribe_events").await;
    assert_eq!(second["event_type"], "custom_event");
    reply(&peer, &second, Value::Null);

    assert!(matches!(lifecycle.recv().await, Some(LifecycleEvent::Error { .. })));
    assert_eq!(
        lifecycle.recv().await,
        Some(LifecycleEvent::Connected { resumed: true })
    );
    assert_eq!(manager.subscriptions().await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_missed_heartbeat_triggers_reconnect() {
    let config = ConnectionConfig {
        heartbeat_interval: Duration::from_secs(1),
        heartbeat_timeout: Duration::from_millis(500),
        ..quiet_connection()
    };
    let (manager, _connector, mut peer, mut peers) = connected(config).await;
    let mut lifecycle = manager.lifecycle();

    let ping = expect(&mut peer, "ping").await;
    peer.send_json(&json!({"id": ping["id"], "type": "pong"}));

    // second ping goes unanswered
    let unanswered = expect(&mut peer, "ping").await;
    assert!(unanswered["id"].as_u64().unwrap() > ping["id"].as_u64().unwrap());

    assert_eq!(
        lifecycle.recv().await,
        Some(LifecycleEvent::Disconnected {
            reason: "heartbeat timeout".to_string()
        })
    );

    let mut peer = peers.recv().await.unwrap();
    accept(&mut peer).await;
    assert_eq!(
        lifecycle.recv().await,
        Some(LifecycleEvent::Connected { resumed: true })
    );
    assert_eq!(manager.state(), ConnectionState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_pending_requests_fail_when_connection_drops() {
    let (manager, _connector, mut peer, _peers) = connected(quiet_connection()).await;

    let call = tokio::spawn({
        let manager = manager.clone();
        async move { manager.send_request(Request::get_states()).await }
    });
    expect(&mut peer, "get_states").await;
    peer.close();

    assert_eq!(call.await.unwrap(), Err(CoreError::ConnectionLost));
    assert_eq!(manager.stats().pending_requests, 0);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_budget_exhaustion_is_permanent_until_connect() {
    let (manager, connector, mut peer, mut peers) = connected(quiet_connection()).await;
    let mut lifecycle = manager.lifecycle();

    connector.refuse_connections(true);
    peer.close();

    assert!(matches!(
        lifecycle.recv().await,
        Some(LifecycleEvent::Disconnected { .. })
    ));
    assert_eq!(
        lifecycle.recv().await,
        Some(LifecycleEvent::PermanentlyDisconnected { attempts: 5 })
    );
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(
        manager.send_request(Request::ping()).await,
        Err(CoreError::PermanentlyDisconnected(5))
    );

    // an explicit connect starts over
    connector.refuse_connections(false);
    let (result, _peer) = tokio::join!(manager.connect(), async {
        let mut peer = peers.recv().await.unwrap();
        accept(&mut peer).await;
        peer
    });
    result.unwrap();
    assert!(manager.is_connected());
    assert_eq!(manager.stats().reconnect_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_credentials_on_reconnect_stop_reconnecting() {
    let (manager, _connector, peer, mut peers) = connected(quiet_connection()).await;
    let mut lifecycle = manager.lifecycle();

    let mut old = peer;
    old.close();
    assert!(matches!(
        lifecycle.recv().await,
        Some(LifecycleEvent::Disconnected { .. })
    ));

    let mut peer = peers.recv().await.unwrap();
    peer.send_json(&json!({"type": "auth_required"}));
    expect(&mut peer, "auth").await;
    peer.send_json(&json!({"type": "auth_invalid", "message": "bad"}));

    assert_eq!(
        lifecycle.recv().await,
        Some(LifecycleEvent::Error {
            message: "authentication rejected: bad".to_string()
        })
    );

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(peers.try_recv().is_err());
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(
        manager.send_request(Request::ping()).await,
        Err(CoreError::NotConnected)
    );
    while let Ok(event) = lifecycle.try_recv() {
        assert!(!matches!(event, LifecycleEvent::PermanentlyDisconnected { .. }));
    }
}

#[tokio::test(start_paused = true)]
async fn test_commands_during_backoff_fail_fast() {
    let config = ConnectionConfig {
        backoff: hass_mcp::BackoffConfig {
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(60),
            ..hass_mcp::BackoffConfig::aggressive()
        },
        ..quiet_connection()
    };
    let (manager, _connector, mut peer, _peers) = connected(config).await;
    let mut lifecycle = manager.lifecycle();

    peer.close();
    assert!(matches!(
        lifecycle.recv().await,
        Some(LifecycleEvent::Disconnected { .. })
    ));

    assert_eq!(
        manager.send_request(Request::get_config()).await,
        Err(CoreError::NotConnected)
    );
    assert_eq!(manager.stats().reconnect_attempts, 1);
}
