//! Bus wire format. Plain JSON, UTF-8, carried unopinionated by the message
//! bus and interpreted only by the correlation RPC layer and the domain
//! services that decode `data` against a [`crate::verb::Verb`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Everything a request carries beyond its `reply_to` topic lives here. The
/// struct exists (rather than a bare `String`) so the envelope can grow
/// metadata without breaking the wire shape.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Metadata {
    pub reply_to: String,
}

/// `{ "id", "type", "data", "metadata": { "reply_to" } }`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    pub metadata: Metadata,
}

impl RequestEnvelope {
    pub fn new(kind: impl Into<String>, data: Value, reply_to: impl Into<String>) -> Self {
        RequestEnvelope {
            id: Uuid::new_v4(),
            kind: kind.into(),
            data,
            metadata: Metadata {
                reply_to: reply_to.into(),
            },
        }
    }
}

/// `{ "event_id", "type", "success", "data", "error" }`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub event_id: Uuid,
    #[serde(rename = "type")]
    pub kind: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Empty string rather than `null` on success.
    #[serde(default)]
    pub error: String,
}

impl ResponseEnvelope {
    pub fn ok(event_id: Uuid, kind: impl Into<String>, data: Value) -> Self {
        ResponseEnvelope {
            event_id,
            kind: kind.into(),
            success: true,
            data: Some(data),
            error: String::new(),
        }
    }

    pub fn err(event_id: Uuid, kind: impl Into<String>, error: impl Into<String>) -> Self {
        ResponseEnvelope {
            event_id,
            kind: kind.into(),
            success: false,
            data: None,
            error: error.into(),
        }
    }
}

/// Literal topic strings used across the bus.
pub mod topics {
    pub const USERS_EVENTS: &str = "users_events";
    pub const USERS_EVENTS_RESPONSE: &str = "users_events_response";
    pub const EVENTS_RESPONSE: &str = "events_response";
    pub const GROUPS_EVENTS: &str = "groups_events";
    pub const GROUP_EVENTS_RESPONSE: &str = "group_events_response";
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_envelope_round_trips() {
        let req = RequestEnvelope::new("user.create", json!({"email": "a@b.c"}), topics::USERS_EVENTS_RESPONSE);
        let text = serde_json::to_string(&req).unwrap();
        let back: RequestEnvelope = serde_json::from_str(&text).unwrap();
        assert_eq!(back.kind, "user.create");
        assert_eq!(back.metadata.reply_to, topics::USERS_EVENTS_RESPONSE);
    }

    #[test]
    fn response_envelope_failure_has_empty_error_string_not_null() {
        let resp = ResponseEnvelope::ok(Uuid::new_v4(), "user.create", json!({"id": "x"}));
        let text = serde_json::to_string(&resp).unwrap();
        assert!(text.contains("\"error\":\"\""));
    }
}
