//! Wire contract of the duplex connection.
//!
//! Requests are JSON objects `{ "action", "topic", "payload"? }`. Point to
//! point sends reuse the `topic` field for the recipient id.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Normal closure.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Close frame carried no status code.
pub const NO_STATUS_RECEIVED: u16 = 1005;
/// Connection dropped without a close handshake.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Control action of a [`SubscriberRequest`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Start receiving events for a topic.
    Subscribe,
    /// Stop receiving events for a topic.
    Unsubscribe,
    /// Publish an event to every subscriber of a topic.
    Broadcast,
    /// Deliver an event to a single recipient.
    P2p,
    /// Application-level keepalive.
    Ping,
}

impl Action {
    /// Wire name of the action.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Broadcast => "broadcast",
            Self::P2p => "p2p",
            Self::Ping => "ping",
        }
    }
}

/// A request sent from the client to the message server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubscriberRequest {
    /// What the server should do.
    pub action: Action,
    /// Topic, or recipient id for [`Action::P2p`].
    pub topic: String,
    /// Event body for publish-style actions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl SubscriberRequest {
    /// Subscribe to `topic`.
    pub fn subscribe(topic: impl Into<String>) -> Self {
        Self {
            action: Action::Subscribe,
            topic: topic.into(),
            payload: None,
        }
    }

    /// Unsubscribe from `topic`.
    pub fn unsubscribe(topic: impl Into<String>) -> Self {
        Self {
            action: Action::Unsubscribe,
            topic: topic.into(),
            payload: None,
        }
    }

    /// Keepalive ping with an empty topic.
    pub fn ping() -> Self {
        Self {
            action: Action::Ping,
            topic: String::new(),
            payload: None,
        }
    }

    /// Serialize to the JSON text sent over the connection.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Publish an event to every subscriber of a topic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BroadcastRequest {
    /// Destination topic.
    pub topic: String,
    /// Event body.
    pub event: Value,
}

impl BroadcastRequest {
    /// Create a broadcast request.
    pub fn new(topic: impl Into<String>, event: Value) -> Self {
        Self {
            topic: topic.into(),
            event,
        }
    }
}

impl From<BroadcastRequest> for SubscriberRequest {
    fn from(request: BroadcastRequest) -> Self {
        Self {
            action: Action::Broadcast,
            topic: request.topic,
            payload: Some(request.event),
        }
    }
}

/// Deliver an event to a single recipient.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendToRequest {
    /// Recipient identifier.
    pub recipient_id: String,
    /// Event body.
    pub event: Value,
}

impl SendToRequest {
    /// Create a point-to-point request.
    pub fn new(recipient_id: impl Into<String>, event: Value) -> Self {
        Self {
            recipient_id: recipient_id.into(),
            event,
        }
    }
}

impl From<SendToRequest> for SubscriberRequest {
    fn from(request: SendToRequest) -> Self {
        Self {
            action: Action::P2p,
            topic: request.recipient_id,
            payload: Some(request.event),
        }
    }
}

/// A connection closure as observed by the client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseEvent {
    /// Close status code.
    pub code: u16,
    /// Close reason text, possibly empty.
    pub reason: String,
}

impl CloseEvent {
    /// Create a close event.
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Closed with status 1000.
    pub fn is_normal(&self) -> bool {
        self.code == NORMAL_CLOSURE
    }

    /// Closed without a close handshake (1006).
    pub fn is_abnormal(&self) -> bool {
        self.code == ABNORMAL_CLOSURE
    }
}
