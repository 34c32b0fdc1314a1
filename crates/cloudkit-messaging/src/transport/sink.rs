//! Channel a transport reports through.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cloudkit_core::{CloseEvent, TransportId};
use serde_json::Value;
use tokio::sync::mpsc;

/// Something that happened on a transport.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// An inbound application event with its envelope removed.
    Message {
        /// Cleaned payload.
        payload: Value,
        /// Sender id from the envelope.
        sender_id: Option<String>,
    },
    /// The connection ended.
    Closed(CloseEvent),
}

/// A [`TransportEvent`] tagged with the transport that produced it.
#[derive(Clone, Debug, PartialEq)]
pub struct TransportNotice {
    /// Originating transport.
    pub transport: TransportId,
    /// What happened.
    pub event: TransportEvent,
}

/// Reporting handle given to a transport at creation.
///
/// Clones share one close latch, so a transport reports at most one close no
/// matter how many paths observe the connection ending.
#[derive(Clone, Debug)]
pub struct TransportSink {
    id: TransportId,
    tx: mpsc::UnboundedSender<TransportNotice>,
    closed: Arc<AtomicBool>,
}

impl TransportSink {
    /// Sink for a new transport id.
    pub fn new(tx: mpsc::UnboundedSender<TransportNotice>) -> Self {
        Self {
            id: TransportId::new(),
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sink plus the receiving end of its channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransportNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Id of the transport this sink belongs to.
    pub fn id(&self) -> &TransportId {
        &self.id
    }

    /// Report an inbound event. Dropped after the close was reported.
    pub fn event(&self, payload: Value, sender_id: Option<String>) {
        if self.is_closed() {
            return;
        }
        self.send(TransportEvent::Message { payload, sender_id });
    }

    /// Report the close. Returns `false` if a close was already reported.
    pub fn closed(&self, code: u16, reason: impl Into<String>) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.send(TransportEvent::Closed(CloseEvent::new(code, reason)));
        true
    }

    /// Whether the close was reported.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn send(&self, event: TransportEvent) {
        let notice = TransportNotice {
            transport: self.id.clone(),
            event,
        };
        if self.tx.send(notice).is_err() {
            tracing::debug!(transport_id = %self.id, "transport notice dropped, receiver gone");
        }
    }
}
