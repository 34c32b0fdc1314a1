//! # cloudkit-messaging
//!
//! Client side of the cloudkit message service.
//!
//! - [`Session`]: long-lived subscription that reconnects with backoff and
//!   replays its topics on every new connection
//! - [`transport`]: one physical connection ([`WsTransport`]) with a
//!   pluggable keepalive, plus an in-memory mock
//! - [`Backoff`]: geometric reconnect delay
//! - [`FanoutHub`]: dispatch one event to many local listeners
//! - [`HttpPublisher`]: publish without a subscription

#![deny(unsafe_code)]

pub mod backoff;
pub mod fanout;
pub mod publisher;
pub mod session;
pub mod topics;
pub mod transport;

pub use backoff::{Backoff, RetryBackoff};
pub use fanout::{Callback, FanoutHub, Listener};
pub use publisher::{HttpPublisher, Publisher};
pub use session::{ResubscribeReport, Session, SessionConfig, SessionState};
pub use topics::TopicSet;
pub use transport::{
    Keepalive, Transport, TransportProvider, TransportSink, Watchdog, WsOptions, WsTransport,
    WsTransportProvider,
};
