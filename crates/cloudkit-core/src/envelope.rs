//! Inbound event envelope.
//!
//! The publisher stamps `_publishedAt` (and optionally `_senderId`) on every
//! event, and the relay adds `_forwardedAt` before forwarding it to
//! subscribers. These fields exist only for latency accounting in transit and
//! are removed before the payload reaches application code.

use chrono::Utc;
use serde_json::{Map, Value};

/// Publish timestamp field (ms since epoch, set by the publisher).
pub const PUBLISHED_AT_FIELD: &str = "_publishedAt";
/// Forward timestamp field (ms since epoch, set by the relay).
pub const FORWARDED_AT_FIELD: &str = "_forwardedAt";
/// Sender identity field.
pub const SENDER_ID_FIELD: &str = "_senderId";

/// An inbound event split into the application payload and its transport
/// metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    /// Application payload with the envelope fields removed.
    pub payload: Value,
    /// When the publisher sent the event.
    pub published_at: Option<i64>,
    /// When the relay forwarded the event.
    pub forwarded_at: Option<i64>,
    /// Who sent the event, if the publisher identified itself.
    pub sender_id: Option<String>,
}

impl Envelope {
    /// Parse a text frame into an envelope.
    ///
    /// Returns `None` when the text is not a JSON object.
    pub fn parse(text: &str) -> Option<Self> {
        match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => Some(Self::from_map(map)),
            _ => None,
        }
    }

    /// Split a JSON object into payload and metadata.
    pub fn from_map(mut map: Map<String, Value>) -> Self {
        let published_at = map.remove(PUBLISHED_AT_FIELD).and_then(|v| as_millis(&v));
        let forwarded_at = map.remove(FORWARDED_AT_FIELD).and_then(|v| as_millis(&v));
        let sender_id = map
            .remove(SENDER_ID_FIELD)
            .and_then(|v| v.as_str().map(str::to_owned));
        Self {
            payload: Value::Object(map),
            published_at,
            forwarded_at,
            sender_id,
        }
    }

    /// Milliseconds between publish and `now_ms`.
    pub fn total_latency_ms(&self, now_ms: i64) -> Option<i64> {
        self.published_at.map(|t| now_ms - t)
    }

    /// Milliseconds between relay forward and `now_ms`.
    pub fn forward_latency_ms(&self, now_ms: i64) -> Option<i64> {
        self.forwarded_at.map(|t| now_ms - t)
    }
}

/// Remove the envelope fields from `event`, returning the cleaned payload
/// and the sender id.
///
/// Non-object values are returned unchanged with no sender.
pub fn strip_envelope(event: Value) -> (Value, Option<String>) {
    match event {
        Value::Object(map) => {
            let envelope = Envelope::from_map(map);
            (envelope.payload, envelope.sender_id)
        }
        other => (other, None),
    }
}

/// Stamp an outgoing event with the publish time and, optionally, the
/// sender id. Non-object events are returned unchanged.
pub fn stamp_published(event: Value, sender_id: Option<&str>) -> Value {
    match event {
        Value::Object(mut map) => {
            let _ = map.insert(PUBLISHED_AT_FIELD.into(), Value::from(now_millis()));
            if let Some(sender) = sender_id {
                let _ = map.insert(SENDER_ID_FIELD.into(), Value::from(sender));
            }
            Value::Object(map)
        }
        other => other,
    }
}

/// Current wall clock in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[allow(clippy::cast_possible_truncation)]
fn as_millis(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| value.as_f64().map(|f| f.round() as i64))
}
