//! Realtime control-event wire model.
//!
//! Every message on the event channel is a JSON object with at least a
//! `type` string. Events are kept generic: the type-specific fields live in
//! `payload` and are passed through untouched.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value, json};

use crate::error::{LisanError, Result};

/// Client event that appends an item to the remote conversation.
pub const CONVERSATION_ITEM_CREATE: &str = "conversation.item.create";

/// Which side produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Client → remote.
    Outbound,
    /// Remote → client.
    Inbound,
}

/// A tagged control event.
///
/// `event_id` and `timestamp` are optional on construction; the protocol
/// handler fills them in at the point the event is observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlEvent {
    #[serde(rename = "type")]
    pub event_type: String,

    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub event_id: Option<String>,

    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<String>,

    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl ControlEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            event_id: None,
            timestamp: None,
            payload: Map::new(),
        }
    }

    /// Add a type-specific field.
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    /// A `conversation.item.create` carrying one user text message.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(CONVERSATION_ITEM_CREATE).with(
            "item",
            json!({
                "type": "message",
                "role": "user",
                "content": [
                    { "type": "input_text", "text": text.into() }
                ]
            }),
        )
    }

    /// Parse one wire message. Rejects non-objects and objects without a string `type`.
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| LisanError::Protocol(e.to_string()))
    }

    /// Serialize for the event channel.
    ///
    /// The timestamp is local bookkeeping and is not put on the wire.
    pub fn to_wire(&self) -> Result<String> {
        let mut object = Map::with_capacity(self.payload.len() + 2);
        object.insert("type".into(), Value::String(self.event_type.clone()));
        if let Some(id) = &self.event_id {
            object.insert("event_id".into(), Value::String(id.clone()));
        }
        for (key, value) in &self.payload {
            if key != "type" && key != "event_id" && key != "timestamp" {
                object.insert(key.clone(), value.clone());
            }
        }
        Ok(serde_json::to_string(&Value::Object(object))?)
    }

    /// Text of the first content part of a message item, if any.
    pub fn item_text(&self) -> Option<&str> {
        self.payload
            .get("item")?
            .get("content")?
            .get(0)?
            .get("text")?
            .as_str()
    }

    /// Transcript carried by transcript-bearing server events.
    pub fn transcript(&self) -> Option<&str> {
        self.payload.get("transcript")?.as_str()
    }
}

/// Accept any JSON value for an identity field. Non-string values keep their
/// JSON text; `null` counts as absent.
fn lenient_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

/// An event as seen by session observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedEvent {
    pub direction: Direction,
    pub event: ControlEvent,
}

/// Timestamp format used for every observed event.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_text_shape() {
        let event = ControlEvent::user_text("marhaba");
        let wire: Value = serde_json::from_str(&event.to_wire().unwrap()).unwrap();
        assert_eq!(wire["type"], "conversation.item.create");
        assert_eq!(wire["item"]["type"], "message");
        assert_eq!(wire["item"]["role"], "user");
        assert_eq!(wire["item"]["content"][0]["type"], "input_text");
        assert_eq!(wire["item"]["content"][0]["text"], "marhaba");
        assert!(wire.get("event_id").is_none());
        assert_eq!(event.item_text(), Some("marhaba"));
    }

    #[test]
    fn test_wire_omits_timestamp_keeps_event_id() {
        let mut event = ControlEvent::new("response.create").with_event_id("evt_1");
        event.timestamp = Some("2026-01-01T00:00:00.000Z".into());
        let wire: Value = serde_json::from_str(&event.to_wire().unwrap()).unwrap();
        assert_eq!(wire["event_id"], "evt_1");
        assert!(wire.get("timestamp").is_none());
        assert!(!event.to_wire().unwrap().contains('\n'));
    }

    #[test]
    fn test_parse_keeps_unknown_fields() {
        let event = ControlEvent::parse(
            r#"{"type":"response.audio_transcript.done","event_id":"e9","transcript":"ahlan","response_id":"r1"}"#,
        )
        .unwrap();
        assert_eq!(event.event_type, "response.audio_transcript.done");
        assert_eq!(event.event_id.as_deref(), Some("e9"));
        assert!(event.timestamp.is_none());
        assert_eq!(event.transcript(), Some("ahlan"));
        assert_eq!(event.payload["response_id"], "r1");
    }

    #[test]
    fn test_parse_accepts_non_string_identity_fields() {
        let event = ControlEvent::parse(
            r#"{"type":"rate_limits.updated","event_id":42,"timestamp":1760000000,"rate_limits":[]}"#,
        )
        .unwrap();
        assert_eq!(event.event_id.as_deref(), Some("42"));
        assert_eq!(event.timestamp.as_deref(), Some("1760000000"));
        assert!(event.payload["rate_limits"].is_array());

        let event = ControlEvent::parse(r#"{"type":"session.created","event_id":null}"#).unwrap();
        assert!(event.event_id.is_none());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["{not json", "[1,2]", "42", r#"{"event_id":"x"}"#, r#"{"type":7}"#] {
            let err = ControlEvent::parse(bad).unwrap_err();
            assert!(
                matches!(err, LisanError::Protocol(_)),
                "expected protocol error for {bad}, got {err:?}"
            );
        }
    }

    #[test]
    fn test_format_timestamp_is_rfc3339_millis() {
        let at = DateTime::parse_from_rfc3339("2026-10-15T08:30:00.123456Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(format_timestamp(at), "2026-10-15T08:30:00.123Z");
    }
}
