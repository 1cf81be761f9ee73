//! Scripted Home Assistant peer helpers shared by the integration tests

#![allow(dead_code)]

use hass_mcp::{BackoffConfig, Config, ConnectionConfig, RemotePeer};
use serde_json::{json, Value};
use std::time::Duration;

pub const TOKEN: &str = "test-token";

/// Connection tuning without heartbeats and with fast reconnects
pub fn quiet_connection() -> ConnectionConfig {
    ConnectionConfig {
        heartbeat_interval: Duration::ZERO,
        request_timeout: Duration::from_secs(5),
        auth_timeout: Duration::from_secs(2),
        backoff: BackoffConfig::aggressive(),
        ..Default::default()
    }
}

pub fn client_config() -> Config {
    let mut config = Config::new("http://ha.test:8123", TOKEN);
    config.connection = quiet_connection();
    config.maintenance_interval = Duration::from_secs(3600);
    config
}

/// Play the remote side of a successful handshake
pub async fn accept(peer: &mut RemotePeer) {
    peer.send_json(&json!({"type": "auth_required", "ha_version": "2024.6.0"}));
    let auth = expect(peer, "auth").await;
    assert_eq!(auth["access_token"], TOKEN);
    peer.send_json(&json!({"type": "auth_ok", "ha_version": "2024.6.0"}));
}

/// Next client frame, which must have the given type
pub async fn expect(peer: &mut RemotePeer, command_type: &str) -> Value {
    let frame = peer.recv_json().await.expect("client closed the connection");
    assert_eq!(frame["type"], command_type, "unexpected frame {}", frame);
    frame
}

pub fn reply(peer: &RemotePeer, request: &Value, result: Value) {
    peer.send_json(&json!({
        "id": request["id"],
        "type": "result",
        "success": true,
        "result": result,
    }));
}

pub fn reject(peer: &RemotePeer, request: &Value, code: &str, message: &str) {
    peer.send_json(&json!({
        "id": request["id"],
        "type": "result",
        "success": false,
        "error": {"code": code, "message": message},
    }));
}

/// Push an event frame for the subscription created by `subscribe`
pub fn push_event(peer: &RemotePeer, subscribe: &Value, event: Value) {
    peer.send_json(&json!({"id": subscribe["id"], "type": "event", "event": event}));
}

pub fn entity_state(entity_id: &str, state: &str, updated: &str) -> Value {
    json!({
        "entity_id": entity_id,
        "state": state,
        "attributes": {"friendly_name": entity_id},
        "last_changed": updated,
        "last_updated": updated,
    })
}

pub fn state_changed(entity_id: &str, state: &str, updated: &str) -> Value {
    json!({
        "event_type": "state_changed",
        "data": {
            "entity_id": entity_id,
            "new_state": entity_state(entity_id, state, updated),
        },
    })
}
