//! Home Assistant WebSocket wire frames
//!
//! Only the shapes needed for the handshake, correlation and event routing
//! are modelled. Command payloads stay as free-form JSON objects.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CoreError, Result};

/// Error object carried by a failed `result` frame
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RemoteError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// Frame received from the remote
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    AuthRequired {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthOk {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthInvalid {
        #[serde(default)]
        message: Option<String>,
    },
    Result {
        id: u64,
        #[serde(default = "default_success")]
        success: bool,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<RemoteError>,
    },
    Pong {
        id: u64,
    },
    Event {
        id: u64,
        event: Value,
    },
    #[serde(other)]
    Unknown,
}

fn default_success() -> bool {
    true
}

/// Dispatch class of an inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    Handshake,
    Response(u64),
    Event(u64),
    Ignored,
}

impl ServerFrame {
    /// Parse one text frame
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| CoreError::Protocol(format!("bad frame: {}", e)))
    }

    pub fn class(&self) -> FrameClass {
        match self {
            Self::AuthRequired { .. } | Self::AuthOk { .. } | Self::AuthInvalid { .. } => {
                FrameClass::Handshake
            }
            Self::Result { id, .. } | Self::Pong { id } => FrameClass::Response(*id),
            Self::Event { id, .. } => FrameClass::Event(*id),
            Self::Unknown => FrameClass::Ignored,
        }
    }

    /// Convert a response frame into the caller-facing outcome
    pub fn into_outcome(self) -> Result<Value> {
        match self {
            Self::Result { success: true, result, .. } => Ok(result.unwrap_or(Value::Null)),
            Self::Result { success: false, error, .. } => {
                let error = error.unwrap_or(RemoteError {
                    code: "unknown_error".to_string(),
                    message: "Command failed".to_string(),
                });
                Err(CoreError::CommandFailed {
                    code: error.code,
                    message: error.message,
                })
            }
            Self::Pong { .. } => Ok(Value::Null),
            other => Err(CoreError::Protocol(format!(
                "not a response frame: {:?}",
                other.class()
            ))),
        }
    }
}

/// Handshake answer carrying the credential
#[derive(Serialize)]
struct AuthFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    access_token: &'a str,
}

/// Encode the `auth` frame
pub fn encode_auth(access_token: &str) -> Result<String> {
    Ok(serde_json::to_string(&AuthFrame {
        kind: "auth",
        access_token,
    })?)
}

/// Outbound command, minus the correlation id
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub command_type: String,
    pub payload: Map<String, Value>,
}

impl Request {
    pub fn new(command_type: impl Into<String>) -> Self {
        Self {
            command_type: command_type.into(),
            payload: Map::new(),
        }
    }

    /// Build from a type and a JSON payload; the payload must be an object or null
    pub fn from_value(command_type: impl Into<String>, payload: Value) -> Result<Self> {
        let payload = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(CoreError::Protocol(format!(
                    "command payload must be an object, got {}",
                    other
                )))
            }
        };
        Ok(Self {
            command_type: command_type.into(),
            payload,
        })
    }

    /// Add a payload field
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    pub fn ping() -> Self {
        Self::new("ping")
    }

    pub fn get_states() -> Self {
        Self::new("get_states")
    }

    pub fn get_config() -> Self {
        Self::new("get_config")
    }

    pub fn get_services() -> Self {
        Self::new("get_services")
    }

    pub fn get_panels() -> Self {
        Self::new("get_panels")
    }

    pub fn area_registry() -> Self {
        Self::new("config/area_registry/list")
    }

    pub fn device_registry() -> Self {
        Self::new("config/device_registry/list")
    }

    pub fn entity_registry() -> Self {
        Self::new("config/entity_registry/list")
    }

    /// Check automation parts without installing them; absent parts are
    /// left out of the request
    pub fn validate_config(
        trigger: Option<Value>,
        condition: Option<Value>,
        action: Option<Value>,
    ) -> Self {
        [("trigger", trigger), ("condition", condition), ("action", action)]
            .into_iter()
            .fold(Self::new("validate_config"), |request, (key, part)| match part {
                Some(part) => request.with(key, part),
                None => request,
            })
    }

    pub fn subscribe_events(event_type: Option<&str>) -> Self {
        let request = Self::new("subscribe_events");
        match event_type {
            Some(event_type) => request.with("event_type", event_type),
            None => request,
        }
    }

    pub fn subscribe_trigger(trigger: Value) -> Self {
        Self::new("subscribe_trigger").with("trigger", trigger)
    }

    pub fn unsubscribe_events(remote_id: u64) -> Self {
        Self::new("unsubscribe_events").with("subscription", remote_id)
    }

    pub fn fire_event(event_type: &str, event_data: Option<Value>) -> Self {
        let request = Self::new("fire_event").with("event_type", event_type);
        match event_data {
            Some(data) => request.with("event_data", data),
            None => request,
        }
    }

    /// Encode with the given correlation id. `id` and `type` always win over
    /// same-named payload keys.
    pub fn encode(&self, id: u64) -> Result<String> {
        let mut frame = self.payload.clone();
        frame.insert("id".to_string(), Value::from(id));
        frame.insert("type".to_string(), Value::String(self.command_type.clone()));
        Ok(serde_json::to_string(&Value::Object(frame))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_handshake_frames() {
        let frame =
            ServerFrame::parse(r#"{"type":"auth_required","ha_version":"2024.1.0"}"#).unwrap();
        assert_eq!(frame.class(), FrameClass::Handshake);

        let frame =
            ServerFrame::parse(r#"{"type":"auth_invalid","message":"Invalid password"}"#).unwrap();
        assert_eq!(
            frame,
            ServerFrame::AuthInvalid {
                message: Some("Invalid password".to_string())
            }
        );
    }

    #[test]
    fn test_result_outcomes() {
        let ok = ServerFrame::parse(r#"{"id":4,"type":"result","success":true,"result":[1,2]}"#)
            .unwrap();
        assert_eq!(ok.class(), FrameClass::Response(4));
        assert_eq!(ok.into_outcome().unwrap(), json!([1, 2]));

        let body = json!({
            "id": 5,
            "type": "result",
            "success": false,
            "error": {"code": "not_found", "message": "Service not found."},
        });
        let failed = ServerFrame::parse(&body.to_string()).unwrap();
        assert_eq!(
            failed.into_outcome(),
            Err(CoreError::CommandFailed {
                code: "not_found".to_string(),
                message: "Service not found.".to_string()
            })
        );

        let pong = ServerFrame::parse(r#"{"id":9,"type":"pong"}"#).unwrap();
        assert_eq!(pong.class(), FrameClass::Response(9));
        assert_eq!(pong.into_outcome().unwrap(), Value::Null);
    }

    #[test]
    fn test_unknown_and_event_frames() {
        let frame = ServerFrame::parse(r#"{"type":"something_new","id":3}"#).unwrap();
        assert_eq!(frame.class(), FrameClass::Ignored);

        let frame =
            ServerFrame::parse(r#"{"id":7,"type":"event","event":{"event_type":"state_changed"}}"#)
                .unwrap();
        assert_eq!(frame.class(), FrameClass::Event(7));

        assert!(ServerFrame::parse("not json").is_err());
    }

    #[test]
    fn test_validate_config_skips_absent_parts() {
        let request = Request::validate_config(
            Some(json!([{"platform": "state", "entity_id": "light.kitchen"}])),
            None,
            Some(json!([{"service": "light.turn_off"}])),
        );
        let encoded: Value = serde_json::from_str(&request.encode(3).unwrap()).unwrap();
        assert_eq!(encoded["type"], "validate_config");
        assert_eq!(encoded["trigger"][0]["platform"], "state");
        assert_eq!(encoded["action"][0]["service"], "light.turn_off");
        assert!(encoded.get("condition").is_none());

        assert_eq!(Request::area_registry().command_type, "config/area_registry/list");
    }

    #[test]
    fn test_request_encoding_keeps_id_and_type() {
        let request = Request::from_value(
            "call_service",
            json!({"domain": "light", "id": 99, "type": "spoof"}),
        )
        .unwrap();
        let encoded: Value = serde_json::from_str(&request.encode(12).unwrap()).unwrap();
        assert_eq!(encoded["id"], 12);
        assert_eq!(encoded["type"], "call_service");
        assert_eq!(encoded["domain"], "light");

        assert!(Request::from_value("x", json!([1])).is_err());
    }

    #[test]
    fn test_auth_frame() {
        let encoded: Value = serde_json::from_str(&encode_auth("secret").unwrap()).unwrap();
        assert_eq!(encoded, json!({"type": "auth", "access_token": "secret"}));
    }
}
