//! # cloudkit-core
//!
//! Foundation types shared by every cloudkit crate:
//!
//! - **Branded IDs**: [`ids::SessionId`], [`ids::TransportId`], [`ids::ListenerId`]
//! - **Wire types**: [`wire::SubscriberRequest`] and the publish requests that
//!   travel over the duplex connection, plus close codes
//! - **Envelope**: [`envelope::Envelope`] strips the relay-injected timing and
//!   sender fields from inbound events
//! - **Errors**: [`errors::MessagingError`] taxonomy via `thiserror`
//! - **Metrics**: the [`metrics::Metrics`] sink contract and metric names

#![deny(unsafe_code)]

pub mod envelope;
pub mod errors;
pub mod ids;
pub mod metrics;
pub mod wire;

pub use envelope::Envelope;
pub use errors::{MessagingError, Result};
pub use ids::{ListenerId, SessionId, TransportId};
pub use metrics::{Metrics, NoopMetrics};
pub use wire::{Action, BroadcastRequest, CloseEvent, SendToRequest, SubscriberRequest};
