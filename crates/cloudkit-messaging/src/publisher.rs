//! HTTP publish path.
//!
//! Publishing does not need a subscription connection: the message service
//! accepts `POST /message/broadcast?topic=<t>` and
//! `POST /message/p2p?recipientId=<id>` with the event as the JSON body.

use async_trait::async_trait;
use cloudkit_core::envelope::stamp_published;
use cloudkit_core::{BroadcastRequest, MessagingError, Result, SendToRequest};
use cloudkit_settings::PublisherSettings;
use serde_json::Value;
use tracing::info;

/// Publishes events without a subscription.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish an event to every subscriber of a topic.
    async fn broadcast(&self, request: BroadcastRequest) -> Result<()>;

    /// Deliver an event to one recipient. Returns the response body
    /// (an empty object when the server sends none).
    async fn send_to(&self, request: SendToRequest) -> Result<Value>;
}

/// [`Publisher`] backed by `reqwest`.
pub struct HttpPublisher {
    client: reqwest::Client,
    base_url: String,
    sender_id: Option<String>,
}

impl HttpPublisher {
    /// Publisher for the service at `base_url`.
    pub fn new(settings: &PublisherSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout())
            .user_agent(concat!("cloudkit/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| MessagingError::Http {
                status: None,
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            sender_id: None,
        })
    }

    /// Stamp `_publishedAt` and this sender id on every published event.
    #[must_use]
    pub fn with_sender_id(mut self, sender_id: impl Into<String>) -> Self {
        self.sender_id = Some(sender_id.into());
        self
    }

    async fn post(&self, path: &str, query: (&str, &str), event: Value) -> Result<Value> {
        let event = stamp_published(event, self.sender_id.as_deref());
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .query(&[query])
            .json(&event)
            .send()
            .await
            .map_err(|e| MessagingError::Http {
                status: e.status().map(|s| s.as_u16()),
                message: format!("request to {path} failed: {e}"),
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| MessagingError::Http {
            status: Some(status.as_u16()),
            message: format!("failed to read response body: {e}"),
        })?;
        if !status.is_success() {
            return Err(MessagingError::Http {
                status: Some(status.as_u16()),
                message: format!("{path} returned {status}: {body}"),
            });
        }
        if body.trim().is_empty() {
            return Ok(Value::Object(serde_json::Map::new()));
        }
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl Publisher for HttpPublisher {
    async fn broadcast(&self, request: BroadcastRequest) -> Result<()> {
        info!(topic = %request.topic, "broadcast message to topic");
        let _ = self
            .post("/message/broadcast", ("topic", request.topic.as_str()), request.event)
            .await?;
        Ok(())
    }

    async fn send_to(&self, request: SendToRequest) -> Result<Value> {
        info!(recipient_id = %request.recipient_id, "send direct message to recipient");
        self.post(
            "/message/p2p",
            ("recipientId", request.recipient_id.as_str()),
            request.event,
        )
        .await
    }
}
