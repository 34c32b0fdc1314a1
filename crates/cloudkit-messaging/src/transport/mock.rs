//! In-memory transport for tests and local development.
//!
//! [`MockProvider`] records every [`MockTransport`] it creates so a test can
//! inspect the requests each connection received and drive closes and
//! inbound events by hand.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use cloudkit_core::wire::{ABNORMAL_CLOSURE, NORMAL_CLOSURE};
use cloudkit_core::{
    Action, BroadcastRequest, MessagingError, Result, SendToRequest, SubscriberRequest,
    TransportId,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;

use super::sink::TransportSink;
use super::websocket::NORMAL_CLOSURE_REASON;
use super::{Transport, TransportProvider};

/// Behavior shared by every transport a provider creates.
#[derive(Default)]
struct Script {
    fail_inits: AtomicUsize,
    fail_topics: Mutex<HashSet<String>>,
    drop_on_topic: Mutex<Option<String>>,
    init_gate: Mutex<Option<Arc<Notify>>>,
}

impl Script {
    /// Consumes the one-shot drop trigger if it names `topic`.
    fn take_drop_trigger(&self, topic: &str) -> bool {
        let mut trigger = self.drop_on_topic.lock();
        if trigger.as_deref() == Some(topic) {
            *trigger = None;
            true
        } else {
            false
        }
    }
}

#[derive(Default)]
struct MockState {
    initialized: bool,
    connected: bool,
    terminated: bool,
    requests: Vec<SubscriberRequest>,
}

/// Transport that records requests instead of sending them.
pub struct MockTransport {
    id: TransportId,
    sink: TransportSink,
    script: Arc<Script>,
    state: Mutex<MockState>,
}

impl MockTransport {
    /// Standalone mock reporting through `sink`.
    pub fn new(sink: TransportSink) -> Self {
        Self::scripted(sink, Arc::default())
    }

    fn scripted(sink: TransportSink, script: Arc<Script>) -> Self {
        Self {
            id: sink.id().clone(),
            sink,
            script,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<SubscriberRequest> {
        self.state.lock().requests.clone()
    }

    /// Topics of the `subscribe` requests received, in order.
    pub fn subscribed_topics(&self) -> Vec<String> {
        self.topics_for(Action::Subscribe)
    }

    /// Topics of the `unsubscribe` requests received, in order.
    pub fn unsubscribed_topics(&self) -> Vec<String> {
        self.topics_for(Action::Unsubscribe)
    }

    /// Whether [`Transport::close`] was called.
    pub fn is_terminated(&self) -> bool {
        self.state.lock().terminated
    }

    /// Simulate the server or network ending the connection.
    pub fn drop_connection(&self, code: u16, reason: &str) {
        self.state.lock().connected = false;
        let _ = self.sink.closed(code, reason);
    }

    /// Simulate an inbound event.
    pub fn emit(&self, payload: Value, sender_id: Option<&str>) {
        self.sink.event(payload, sender_id.map(str::to_owned));
    }

    fn topics_for(&self, action: Action) -> Vec<String> {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| r.action == action)
            .map(|r| r.topic.clone())
            .collect()
    }

    fn record(&self, request: SubscriberRequest) -> Result<()> {
        let mut state = self.state.lock();
        if state.terminated {
            return Err(MessagingError::NotReady(
                "request failed because the connection has been terminated".into(),
            ));
        }
        if !state.connected {
            return Err(MessagingError::NotReady(
                "connection is not in a ready state".into(),
            ));
        }
        if request.action == Action::Subscribe
            && self.script.fail_topics.lock().contains(&request.topic)
        {
            return Err(MessagingError::Send(format!(
                "scripted failure for topic {}",
                request.topic
            )));
        }
        state.requests.push(request);
        Ok(())
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn id(&self) -> &TransportId {
        &self.id
    }

    async fn init(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.terminated {
                return Err(MessagingError::InvalidState(
                    "websocket is already terminated".into(),
                ));
            }
            if state.initialized {
                return Err(MessagingError::InvalidState(
                    "websocket is already initialized".into(),
                ));
            }
            state.initialized = true;
        }

        let should_fail = self
            .script
            .fail_inits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            let message = "scripted handshake failure";
            let _ = self.sink.closed(ABNORMAL_CLOSURE, message);
            return Err(MessagingError::Connection(message.into()));
        }

        self.state.lock().connected = true;

        let gate = self.script.init_gate.lock().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        if self.script.take_drop_trigger(topic) {
            self.drop_connection(ABNORMAL_CLOSURE, "dropped during subscribe");
        }
        self.record(SubscriberRequest::subscribe(topic))
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.record(SubscriberRequest::unsubscribe(topic))
    }

    async fn broadcast(&self, request: BroadcastRequest) -> Result<()> {
        self.record(request.into())
    }

    async fn send_to(&self, request: SendToRequest) -> Result<()> {
        self.record(request.into())
    }

    async fn close(&self) {
        let was_connected = {
            let mut state = self.state.lock();
            if state.terminated {
                return;
            }
            state.terminated = true;
            std::mem::replace(&mut state.connected, false)
        };
        if was_connected {
            let _ = self.sink.closed(NORMAL_CLOSURE, NORMAL_CLOSURE_REASON);
        }
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }
}

/// Provider of [`MockTransport`]s.
#[derive(Default)]
pub struct MockProvider {
    script: Arc<Script>,
    created: Mutex<Vec<Arc<MockTransport>>>,
    notify: Notify,
}

impl MockProvider {
    /// Provider whose transports connect successfully.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` transport inits fail.
    pub fn fail_next_inits(&self, n: usize) {
        self.script.fail_inits.store(n, Ordering::Release);
    }

    /// Make every subscribe to `topic` fail.
    pub fn fail_topic(&self, topic: &str) {
        let _ = self.script.fail_topics.lock().insert(topic.to_string());
    }

    /// The first subscribe to `topic` on any transport drops that
    /// connection with 1006 and fails.
    pub fn drop_on_subscribe(&self, topic: &str) {
        *self.script.drop_on_topic.lock() = Some(topic.to_string());
    }

    /// Hold the next successful init after it connects, until the returned
    /// gate is notified.
    pub fn hold_next_init(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.script.init_gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    /// Every transport created so far, oldest first.
    pub fn transports(&self) -> Vec<Arc<MockTransport>> {
        self.created.lock().clone()
    }

    /// The most recently created transport.
    pub fn latest(&self) -> Option<Arc<MockTransport>> {
        self.created.lock().last().cloned()
    }

    /// Number of transports created so far.
    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }

    /// Wait until at least `n` transports have been created.
    pub async fn wait_for_transports(&self, n: usize) -> Arc<MockTransport> {
        loop {
            let notified = self.notify.notified();
            if let Some(t) = self.created.lock().get(n.saturating_sub(1)).cloned() {
                return t;
            }
            notified.await;
        }
    }
}

impl TransportProvider for MockProvider {
    fn create(&self, sink: TransportSink) -> Arc<dyn Transport> {
        let transport = Arc::new(MockTransport::scripted(sink, Arc::clone(&self.script)));
        self.created.lock().push(Arc::clone(&transport));
        self.notify.notify_waiters();
        transport
    }
}
