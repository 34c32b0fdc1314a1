//! One physical connection to the message server.
//!
//! A [`Transport`] lives for exactly one connection attempt. It reports
//! inbound events and its single close through a [`TransportSink`]; the
//! owner decides what to do next (the session replaces it with a fresh
//! instance).

pub mod keepalive;
pub mod mock;
pub mod sink;
pub mod websocket;

use std::sync::Arc;

use async_trait::async_trait;
use cloudkit_core::{BroadcastRequest, Result, SendToRequest, TransportId};

pub use keepalive::{Keepalive, Watchdog};
pub use sink::{TransportEvent, TransportNotice, TransportSink};
pub use websocket::{WsOptions, WsTransport, WsTransportProvider};

/// A single duplex connection and its request surface.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Identity of this instance.
    fn id(&self) -> &TransportId;

    /// Open the connection. Resolves once it is confirmed open.
    ///
    /// Fails with `InvalidState` if called twice or after [`close`], and with
    /// `Connection` if the handshake fails (a close is reported as well).
    ///
    /// [`close`]: Transport::close
    async fn init(&self) -> Result<()>;

    /// Ask the server to deliver events for `topic`.
    async fn subscribe(&self, topic: &str) -> Result<()>;

    /// Stop receiving events for `topic`.
    async fn unsubscribe(&self, topic: &str) -> Result<()>;

    /// Publish an event to a topic.
    async fn broadcast(&self, request: BroadcastRequest) -> Result<()>;

    /// Deliver an event to one recipient.
    async fn send_to(&self, request: SendToRequest) -> Result<()>;

    /// Close with status 1000. Idempotent.
    async fn close(&self);

    /// Whether the connection is currently open.
    fn is_connected(&self) -> bool;
}

/// Factory for fresh transport instances.
pub trait TransportProvider: Send + Sync {
    /// Create an unopened transport that reports through `sink`.
    fn create(&self, sink: TransportSink) -> Arc<dyn Transport>;
}

impl<F> TransportProvider for F
where
    F: Fn(TransportSink) -> Arc<dyn Transport> + Send + Sync,
{
    fn create(&self, sink: TransportSink) -> Arc<dyn Transport> {
        self(sink)
    }
}
