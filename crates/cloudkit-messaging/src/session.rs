//! Resilient session: a long-lived subscription that survives reconnects.
//!
//! The session owns the set of subscribed topics and at most one active
//! [`Transport`]. When the active transport closes (for any reason other
//! than [`Session::close`]) it is discarded and a connect cycle runs:
//!
//! 1. wait for the backoff policy
//! 2. create a fresh transport through the provider and make it active
//! 3. open it; on failure the transport's own close drives the next cycle
//! 4. reset the backoff
//! 5. replay the topic set in batches, each batch concurrently
//!
//! Transport notices arrive on one channel and are handled by a dispatcher
//! task, so handlers see events and closes in the order the transport
//! produced them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use cloudkit_core::metrics::{ABNORMAL_CLOSE_COUNT, UNDESIRED_CLOSE_COUNT};
use cloudkit_core::{
    BroadcastRequest, CloseEvent, ListenerId, Metrics, MessagingError, NoopMetrics, Result,
    SendToRequest, SessionId, TransportId,
};
use cloudkit_settings::CloudkitSettings;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::backoff::{Backoff, RetryBackoff};
use crate::fanout::{FanoutHub, Listener};
use crate::topics::TopicSet;
use crate::transport::{Transport, TransportEvent, TransportNotice, TransportProvider, TransportSink};

/// Default number of topics replayed concurrently after a reconnect.
pub const DEFAULT_RESUBSCRIBE_BATCH_SIZE: usize = 30;

/// Lifecycle of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Created, `init` not called yet.
    Idle,
    /// A connect cycle is running.
    Connecting,
    /// The active transport is open.
    Connected,
    /// The active transport closed; a new cycle is about to start.
    Disconnected,
    /// `close` was called. Absorbing.
    Terminated,
}

/// Outcome of replaying the topic set on a fresh connection.
#[derive(Debug, Default)]
pub struct ResubscribeReport {
    /// Topics re-sent successfully.
    pub succeeded: usize,
    /// Topics that failed, with the error. They stay in the topic set.
    pub failed: Vec<(String, MessagingError)>,
}

impl ResubscribeReport {
    /// Whether every topic was re-sent.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Session tuning.
#[derive(Clone)]
pub struct SessionConfig {
    /// Delay policy before each connect attempt.
    pub backoff: Arc<dyn RetryBackoff>,
    /// Metrics sink for close classification.
    pub metrics: Arc<dyn Metrics>,
    /// Topics per resubscribe batch.
    pub resubscribe_batch_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backoff: Arc::new(Backoff::default()),
            metrics: Arc::new(NoopMetrics),
            resubscribe_batch_size: DEFAULT_RESUBSCRIBE_BATCH_SIZE,
        }
    }
}

impl SessionConfig {
    /// Config from settings.
    pub fn from_settings(settings: &CloudkitSettings, metrics: Arc<dyn Metrics>) -> Self {
        Self {
            backoff: Arc::new(Backoff::from_settings(&settings.backoff)),
            metrics,
            resubscribe_batch_size: settings.session.resubscribe_batch_size,
        }
    }
}

struct ActiveTransport {
    id: TransportId,
    transport: Arc<dyn Transport>,
    /// Set when the replay snapshot is taken. Direct subscribes before
    /// that point are left to the replay.
    replayed: bool,
}

struct Core {
    topics: TopicSet,
    active: Option<ActiveTransport>,
    state: SessionState,
    initialized: bool,
}

impl Core {
    fn set_state(&mut self, state: SessionState) {
        if self.state != SessionState::Terminated {
            self.state = state;
        }
    }

    fn is_active(&self, id: &TransportId) -> bool {
        self.active.as_ref().is_some_and(|a| &a.id == id)
    }

    fn connected_transport(&self) -> Option<Arc<dyn Transport>> {
        self.active
            .as_ref()
            .filter(|a| a.transport.is_connected())
            .map(|a| Arc::clone(&a.transport))
    }

    /// Connected transport whose topic replay has started.
    fn replayed_transport(&self) -> Option<Arc<dyn Transport>> {
        self.active
            .as_ref()
            .filter(|a| a.replayed && a.transport.is_connected())
            .map(|a| Arc::clone(&a.transport))
    }

    /// Mark `id` replayed and snapshot the topics it must receive. `None`
    /// once `id` is no longer active.
    fn take_replay(&mut self, id: &TransportId, batch_size: usize) -> Option<Vec<Vec<String>>> {
        let active = self.active.as_mut().filter(|a| &a.id == id)?;
        active.replayed = true;
        Some(self.topics.batches(batch_size))
    }
}

struct Inner {
    id: SessionId,
    provider: Arc<dyn TransportProvider>,
    backoff: Arc<dyn RetryBackoff>,
    metrics: Arc<dyn Metrics>,
    batch_size: usize,
    core: Mutex<Core>,
    terminated: AtomicBool,
    events: FanoutHub<Value>,
    closes: FanoutHub<CloseEvent>,
    notice_tx: mpsc::UnboundedSender<TransportNotice>,
    notice_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportNotice>>>,
}

/// A subscription identity that outlives individual connections.
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Create an idle session. Nothing connects until [`Session::init`].
    pub fn new(provider: Arc<dyn TransportProvider>, config: SessionConfig) -> Self {
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                id: SessionId::new(),
                provider,
                backoff: config.backoff,
                metrics: config.metrics,
                batch_size: config.resubscribe_batch_size.max(1),
                core: Mutex::new(Core {
                    topics: TopicSet::new(),
                    active: None,
                    state: SessionState::Idle,
                    initialized: false,
                }),
                terminated: AtomicBool::new(false),
                events: FanoutHub::new(),
                closes: FanoutHub::new(),
                notice_tx,
                notice_rx: Mutex::new(Some(notice_rx)),
            }),
        }
    }

    /// Session id.
    pub fn id(&self) -> &SessionId {
        &self.inner.id
    }

    /// Run the first connect cycle.
    ///
    /// Fails with `InvalidState` after [`Session::close`] or on a second
    /// call. A connection failure is returned as-is, but reconnecting
    /// continues in the background until the session is closed.
    pub async fn init(&self) -> Result<ResubscribeReport> {
        if self.inner.is_terminated() {
            let message = "session has been closed";
            warn!(session_id = %self.inner.id, "{message}");
            return Err(MessagingError::InvalidState(message.into()));
        }
        {
            let mut core = self.inner.core.lock();
            if core.initialized {
                let message = "session is already initialized";
                warn!(session_id = %self.inner.id, "{message}");
                return Err(MessagingError::InvalidState(message.into()));
            }
            core.initialized = true;
        }

        info!(session_id = %self.inner.id, "initializing session");
        self.start_dispatcher();
        self.inner.connect().await
    }

    /// Add `topic` to the set. It is sent now if the active connection has
    /// started its topic replay, and by the next replay otherwise.
    pub async fn subscribe(&self, topic: &str) -> Result<()> {
        info!(session_id = %self.inner.id, topic, "subscribe");
        let transport = {
            let mut core = self.inner.core.lock();
            if !core.topics.insert(topic) {
                return Ok(());
            }
            core.replayed_transport()
        };
        match transport {
            Some(t) => t.subscribe(topic).await,
            None => Ok(()),
        }
    }

    /// Remove `topic` from the set; unsubscribe only if it was present.
    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        info!(session_id = %self.inner.id, topic, "unsubscribe");
        let transport = {
            let mut core = self.inner.core.lock();
            if !core.topics.remove(topic) {
                return Ok(());
            }
            core.replayed_transport()
        };
        match transport {
            Some(t) => t.unsubscribe(topic).await,
            None => Ok(()),
        }
    }

    /// Deliver an event to one recipient over the active connection.
    pub async fn send_to(&self, request: SendToRequest) -> Result<()> {
        info!(session_id = %self.inner.id, recipient_id = %request.recipient_id, "send to recipient");
        self.inner.active_transport()?.send_to(request).await
    }

    /// Publish an event to a topic over the active connection.
    pub async fn broadcast(&self, request: BroadcastRequest) -> Result<()> {
        info!(session_id = %self.inner.id, topic = %request.topic, "broadcast");
        self.inner.active_transport()?.broadcast(request).await
    }

    /// Terminate: close the active transport and never reconnect. Idempotent.
    pub async fn close(&self) {
        if self.inner.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(session_id = %self.inner.id, "closing session");
        let active = {
            let mut core = self.inner.core.lock();
            core.state = SessionState::Terminated;
            core.active.take()
        };
        if let Some(active) = active {
            active.transport.close().await;
        }
    }

    /// Register an event handler. Receives the cleaned payload and sender id.
    pub fn on_event<F>(&self, handler: F) -> Listener<Value>
    where
        F: Fn(&Value, Option<&str>) + Send + Sync + 'static,
    {
        self.inner.events.register_fn(handler)
    }

    /// Register an event handler that deserializes the payload into `T`.
    ///
    /// Payloads that do not match `T` are logged and skipped.
    pub fn on_event_as<T, F>(&self, handler: F) -> Listener<Value>
    where
        T: DeserializeOwned,
        F: Fn(T, Option<&str>) + Send + Sync + 'static,
    {
        self.inner.events.register_fn(move |payload, sender| {
            match serde_json::from_value::<T>(payload.clone()) {
                Ok(event) => handler(event, sender),
                Err(error) => warn!(%error, "event payload does not match handler type"),
            }
        })
    }

    /// Remove an event handler.
    pub fn remove_event_handler(&self, id: &ListenerId) -> bool {
        self.inner.events.deregister(id)
    }

    /// Register a close handler. Called for every transport close, before
    /// any reconnect decision.
    pub fn on_close<F>(&self, handler: F) -> Listener<CloseEvent>
    where
        F: Fn(&CloseEvent) + Send + Sync + 'static,
    {
        self.inner
            .closes
            .register_fn(move |close, _sender| handler(close))
    }

    /// Remove a close handler.
    pub fn remove_close_handler(&self, id: &ListenerId) -> bool {
        self.inner.closes.deregister(id)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.inner.core.lock().state
    }

    /// Subscribed topics in first-subscribed order.
    pub fn topics(&self) -> Vec<String> {
        self.inner.core.lock().topics.snapshot()
    }

    /// Whether the active transport is open.
    pub fn is_connected(&self) -> bool {
        self.inner.core.lock().connected_transport().is_some()
    }

    fn start_dispatcher(&self) {
        let Some(mut rx) = self.inner.notice_rx.lock().take() else {
            return;
        };
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        drop(tokio::spawn(async move {
            while let Some(notice) = rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                inner.handle_notice(notice);
            }
        }));
    }
}

impl Inner {
    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    fn active_transport(&self) -> Result<Arc<dyn Transport>> {
        self.core
            .lock()
            .active
            .as_ref()
            .map(|a| Arc::clone(&a.transport))
            .ok_or_else(|| {
                let message = "publish failed because the session has no active connection";
                warn!(session_id = %self.id, "{message}");
                MessagingError::NotReady(message.into())
            })
    }

    async fn connect(self: &Arc<Self>) -> Result<ResubscribeReport> {
        self.core.lock().set_state(SessionState::Connecting);
        self.backoff.backoff().await;
        if self.is_terminated() {
            info!(session_id = %self.id, "session closed during backoff, not connecting");
            return Err(MessagingError::InvalidState("session has been closed".into()));
        }

        let sink = TransportSink::new(self.notice_tx.clone());
        let transport_id = sink.id().clone();
        let transport = self.provider.create(sink);
        {
            let mut core = self.core.lock();
            if self.is_terminated() {
                return Err(MessagingError::InvalidState("session has been closed".into()));
            }
            core.active = Some(ActiveTransport {
                id: transport_id.clone(),
                transport: Arc::clone(&transport),
                replayed: false,
            });
        }

        info!(session_id = %self.id, %transport_id, "opening transport");
        // A failed init also reports a close, which starts the next cycle.
        transport.init().await?;

        if self.is_terminated() {
            info!(session_id = %self.id, %transport_id, "session closed during handshake");
            transport.close().await;
            return Err(MessagingError::InvalidState("session has been closed".into()));
        }
        self.backoff.reset();
        {
            let mut core = self.core.lock();
            if core.is_active(&transport_id) {
                core.set_state(SessionState::Connected);
            }
        }

        let report = self.resubscribe(&transport_id, &transport).await;
        info!(
            session_id = %self.id,
            %transport_id,
            succeeded = report.succeeded,
            failed = report.failed.len(),
            "resubscribed previous topics"
        );
        Ok(report)
    }

    async fn resubscribe(
        &self,
        transport_id: &TransportId,
        transport: &Arc<dyn Transport>,
    ) -> ResubscribeReport {
        let mut report = ResubscribeReport::default();
        let Some(batches) = self.core.lock().take_replay(transport_id, self.batch_size) else {
            debug!(session_id = %self.id, %transport_id, "transport retired before replay");
            return report;
        };
        for batch in batches {
            let results = join_all(batch.iter().map(|topic| transport.subscribe(topic))).await;
            for (topic, result) in batch.into_iter().zip(results) {
                match result {
                    Ok(()) => report.succeeded += 1,
                    Err(error) => {
                        // The connection can drop again mid-replay; the next
                        // cycle replays the whole set.
                        warn!(
                            session_id = %self.id,
                            topic,
                            %error,
                            kind = error.error_kind(),
                            retryable = error.is_retryable(),
                            "failed to re-subscribe"
                        );
                        report.failed.push((topic, error));
                    }
                }
            }
        }
        report
    }

    fn handle_notice(self: &Arc<Self>, notice: TransportNotice) {
        match notice.event {
            TransportEvent::Message { payload, sender_id } => {
                if self.core.lock().is_active(&notice.transport) {
                    self.events.dispatch(&payload, sender_id.as_deref());
                } else {
                    debug!(session_id = %self.id, transport_id = %notice.transport, "dropping event from retired transport");
                }
            }
            TransportEvent::Closed(close) => self.handle_close(&notice.transport, &close),
        }
    }

    fn handle_close(self: &Arc<Self>, transport_id: &TransportId, close: &CloseEvent) {
        self.closes.dispatch(close, None);

        if self.is_terminated() {
            info!(session_id = %self.id, %transport_id, code = close.code, "transport closed and the session is terminated");
            return;
        }

        let retired = {
            let mut core = self.core.lock();
            if core.is_active(transport_id) {
                core.set_state(SessionState::Disconnected);
                core.active.take()
            } else {
                None
            }
        };
        let Some(retired) = retired else {
            debug!(session_id = %self.id, %transport_id, code = close.code, "close from retired transport ignored");
            return;
        };

        if close.is_abnormal() {
            warn!(session_id = %self.id, %transport_id, reason = %close.reason, "transport closed abnormally, reconnecting");
            self.metrics.increment_counter(ABNORMAL_CLOSE_COUNT);
        } else {
            warn!(session_id = %self.id, %transport_id, code = close.code, reason = %close.reason, "transport closed unexpectedly, reconnecting");
            self.metrics.increment_counter(UNDESIRED_CLOSE_COUNT);
        }

        let inner = Arc::clone(self);
        drop(tokio::spawn(async move {
            retired.transport.close().await;
            match inner.connect().await {
                Ok(_) => {}
                // Closed while the cycle was running; nothing left to do.
                Err(error) if !error.is_retryable() => {
                    debug!(session_id = %inner.id, %error, kind = error.error_kind(), "reconnect abandoned");
                }
                // The failed transport's own close starts the next cycle.
                Err(error) => {
                    warn!(session_id = %inner.id, %error, kind = error.error_kind(), "reconnect attempt failed");
                }
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use cloudkit_telemetry::MetricsRecorder;
    use serde_json::json;
    use tokio::time::Instant;

    use super::*;
    use crate::transport::mock::MockProvider;

    struct Harness {
        provider: Arc<MockProvider>,
        metrics: Arc<MetricsRecorder>,
        session: Session,
    }

    fn harness() -> Harness {
        let provider = Arc::new(MockProvider::new());
        let metrics = Arc::new(MetricsRecorder::new());
        let config = SessionConfig {
            backoff: Arc::new(Backoff::new(
                Duration::from_millis(100),
                Duration::from_millis(500),
                1.5,
            )),
            metrics: metrics.clone(),
            resubscribe_batch_size: 30,
        };
        let session = Session::new(provider.clone(), config);
        Harness {
            provider,
            metrics,
            session,
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn init_connects_and_replays_topics() {
        let h = harness();
        h.session.subscribe("a").await.unwrap();
        h.session.subscribe("b").await.unwrap();

        let report = h.session.init().await.unwrap();
        assert_eq!(report.succeeded, 2);
        assert!(report.is_complete());
        assert_eq!(h.session.state(), SessionState::Connected);
        assert!(h.session.is_connected());

        let transport = h.provider.latest().unwrap();
        assert_eq!(transport.subscribed_topics(), vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn init_twice_is_invalid() {
        let h = harness();
        h.session.init().await.unwrap();
        assert_matches!(h.session.init().await, Err(MessagingError::InvalidState(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn init_after_close_is_invalid() {
        let h = harness();
        h.session.close().await;
        assert_matches!(h.session.init().await, Err(MessagingError::InvalidState(_)));
        assert_eq!(h.session.state(), SessionState::Terminated);
        assert_eq!(h.provider.created_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_subscribe_sends_once() {
        let h = harness();
        h.session.init().await.unwrap();
        h.session.subscribe("x").await.unwrap();
        h.session.subscribe("x").await.unwrap();

        assert_eq!(h.session.topics(), vec!["x"]);
        assert_eq!(h.provider.latest().unwrap().subscribed_topics(), vec!["x"]);
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_unknown_topic_is_noop() {
        let h = harness();
        h.session.init().await.unwrap();
        h.session.unsubscribe("nope").await.unwrap();
        assert!(h.provider.latest().unwrap().requests().is_empty());

        h.session.subscribe("x").await.unwrap();
        h.session.unsubscribe("x").await.unwrap();
        assert_eq!(h.provider.latest().unwrap().unsubscribed_topics(), vec!["x"]);
        assert!(h.session.topics().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn abnormal_close_reconnects_and_resubscribes() {
        let h = harness();
        h.session.subscribe("a").await.unwrap();
        h.session.subscribe("b").await.unwrap();
        h.session.init().await.unwrap();

        let closes = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&closes);
        let _listener = h.session.on_close(move |c| seen.lock().push(c.clone()));

        let first = h.provider.latest().unwrap();
        first.drop_connection(1006, "dropped");

        let second = h.provider.wait_for_transports(2).await;
        settle().await;
        assert_ne!(first.id(), second.id());
        assert!(first.is_terminated());
        assert_eq!(second.subscribed_topics(), vec!["a", "b"]);
        assert_eq!(h.metrics.counter_get(ABNORMAL_CLOSE_COUNT), 1);
        assert_eq!(h.metrics.counter_get(UNDESIRED_CLOSE_COUNT), 0);
        assert_eq!(closes.lock()[0], CloseEvent::new(1006, "dropped"));
        assert_eq!(h.session.state(), SessionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_waits_for_the_backoff_delay() {
        let h = harness();
        h.session.init().await.unwrap();

        let dropped_at = Instant::now();
        h.provider.latest().unwrap().drop_connection(1006, "dropped");
        tokio::time::sleep(Duration::from_millis(99)).await;
        assert_eq!(h.provider.created_count(), 1);

        let _ = h.provider.wait_for_transports(2).await;
        let waited = dropped_at.elapsed();
        assert!(waited >= Duration::from_millis(100), "reconnected after {waited:?}");
        assert!(waited < Duration::from_millis(101), "reconnected after {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn drop_during_resubscribe_replays_whole_set_once_more() {
        let h = harness();
        h.provider.drop_on_subscribe("b");
        for t in ["a", "b", "c"] {
            h.session.subscribe(t).await.unwrap();
        }

        let report = h.session.init().await.unwrap();
        assert_eq!(report.succeeded, 1);
        let failed: Vec<&str> = report.failed.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(failed, vec!["b", "c"]);

        let second = h.provider.wait_for_transports(2).await;
        settle().await;
        assert_eq!(second.subscribed_topics(), vec!["a", "b", "c"]);

        tokio::time::sleep(Duration::from_secs(5)).await;
        let transports = h.provider.transports();
        assert_eq!(transports.len(), 2);
        assert_eq!(transports[0].subscribed_topics(), vec!["a"]);
        assert!(transports[0].is_terminated());
        assert_eq!(h.metrics.counter_get(ABNORMAL_CLOSE_COUNT), 1);
        assert_eq!(h.session.state(), SessionState::Connected);
        assert_eq!(h.session.topics(), vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_before_replay_is_left_to_the_replay() {
        let h = harness();
        h.session.subscribe("a").await.unwrap();
        let gate = h.provider.hold_next_init();

        let session = h.session.clone();
        let init = tokio::spawn(async move { session.init().await });
        let transport = h.provider.wait_for_transports(1).await;
        settle().await;
        assert!(transport.is_connected());

        h.session.subscribe("late").await.unwrap();
        assert!(transport.subscribed_topics().is_empty());

        gate.notify_one();
        let report = init.await.unwrap().unwrap();
        assert_eq!(report.succeeded, 2);
        assert_eq!(transport.subscribed_topics(), vec!["a", "late"]);

        h.session.subscribe("after").await.unwrap();
        assert_eq!(transport.subscribed_topics(), vec!["a", "late", "after"]);
    }

    #[tokio::test(start_paused = true)]
    async fn close_during_reconnect_backoff_creates_no_transport() {
        let h = harness();
        h.session.init().await.unwrap();
        h.provider.latest().unwrap().drop_connection(1006, "dropped");
        tokio::time::sleep(Duration::from_millis(50)).await;

        h.session.close().await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.provider.created_count(), 1);
        assert_eq!(h.session.state(), SessionState::Terminated);
        assert!(!h.session.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn normal_remote_close_counts_as_undesired() {
        let h = harness();
        h.session.init().await.unwrap();
        h.provider.latest().unwrap().drop_connection(1000, "server restart");

        let _ = h.provider.wait_for_transports(2).await;
        assert_eq!(h.metrics.counter_get(UNDESIRED_CLOSE_COUNT), 1);
        assert_eq!(h.metrics.counter_get(ABNORMAL_CLOSE_COUNT), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn close_after_terminate_does_not_reconnect() {
        let h = harness();
        h.session.init().await.unwrap();
        let transport = h.provider.latest().unwrap();

        let closes = Arc::new(Mutex::new(0u32));
        let count = Arc::clone(&closes);
        let _l = h.session.on_close(move |_| *count.lock() += 1);

        h.session.close().await;
        transport.drop_connection(1006, "late");
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(h.provider.created_count(), 1);
        assert_eq!(*closes.lock(), 1);
        assert_eq!(h.session.state(), SessionState::Terminated);
        assert_eq!(h.metrics.counter_get(ABNORMAL_CLOSE_COUNT), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn close_is_idempotent() {
        let h = harness();
        h.session.init().await.unwrap();
        h.session.close().await;
        h.session.close().await;
        assert!(h.provider.latest().unwrap().is_terminated());
        assert!(!h.session.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn send_without_transport_is_not_ready() {
        let h = harness();
        let result = h
            .session
            .send_to(SendToRequest::new("peer", json!({"hi": 1})))
            .await;
        assert_matches!(result, Err(MessagingError::NotReady(_)));
        assert_matches!(
            h.session
                .broadcast(BroadcastRequest::new("t", json!({})))
                .await,
            Err(MessagingError::NotReady(_))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn send_goes_through_active_transport() {
        let h = harness();
        h.session.init().await.unwrap();
        h.session
            .send_to(SendToRequest::new("peer", json!({"hi": 1})))
            .await
            .unwrap();
        let requests = h.provider.latest().unwrap().requests();
        assert_eq!(requests[0].topic, "peer");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_first_init_keeps_reconnecting() {
        let h = harness();
        h.provider.fail_next_inits(2);
        h.session.subscribe("a").await.unwrap();

        assert_matches!(h.session.init().await, Err(MessagingError::Connection(_)));

        let third = h.provider.wait_for_transports(3).await;
        settle().await;
        assert!(third.is_connected());
        assert_eq!(third.subscribed_topics(), vec!["a"]);
        assert_eq!(h.metrics.counter_get(ABNORMAL_CLOSE_COUNT), 2);
        assert!(h.session.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribe_failures_are_reported_not_propagated() {
        let h = harness();
        h.provider.fail_topic("bad");
        for t in ["a", "bad", "c"] {
            h.session.subscribe(t).await.unwrap();
        }
        let report = h.session.init().await.unwrap();
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "bad");
        assert_eq!(h.session.topics(), vec!["a", "bad", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn large_topic_sets_replay_in_batches() {
        let h = harness();
        for i in 0..75 {
            h.session.subscribe(&format!("t{i}")).await.unwrap();
        }
        let report = h.session.init().await.unwrap();
        assert_eq!(report.succeeded, 75);
        let sent = h.provider.latest().unwrap().subscribed_topics();
        assert_eq!(sent.len(), 75);
        assert_eq!(sent[0], "t0");
        assert_eq!(sent[74], "t74");
    }

    #[tokio::test(start_paused = true)]
    async fn events_reach_handlers_in_order() {
        let h = harness();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::clone(&seen);
        let second = Arc::clone(&seen);
        let l1 = h
            .session
            .on_event(move |e, s| first.lock().push(("l1", e.clone(), s.map(str::to_owned))));
        let _l2 = h
            .session
            .on_event(move |e, s| second.lock().push(("l2", e.clone(), s.map(str::to_owned))));
        h.session.init().await.unwrap();

        let transport = h.provider.latest().unwrap();
        transport.emit(json!({"v": 1}), Some("s1"));
        settle().await;
        assert_eq!(seen.lock().len(), 2);
        assert_eq!(seen.lock()[0].0, "l1");
        assert_eq!(seen.lock()[1].2.as_deref(), Some("s1"));

        assert!(h.session.remove_event_handler(&l1.id));
        assert!(!h.session.remove_event_handler(&l1.id));
        transport.emit(json!({"v": 2}), None);
        settle().await;
        assert_eq!(seen.lock().len(), 3);
        assert_eq!(seen.lock()[2].0, "l2");
    }

    #[tokio::test(start_paused = true)]
    async fn typed_handler_skips_mismatched_payloads() {
        #[derive(serde::Deserialize)]
        struct Price {
            value: f64,
        }

        let h = harness();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _l = h
            .session
            .on_event_as(move |p: Price, _| sink.lock().push(p.value));
        h.session.init().await.unwrap();

        let transport = h.provider.latest().unwrap();
        transport.emit(json!({"value": 1.5}), None);
        transport.emit(json!({"other": true}), None);
        settle().await;
        assert_eq!(*seen.lock(), vec![1.5]);
    }

    #[tokio::test(start_paused = true)]
    async fn events_from_retired_transport_are_dropped() {
        let h = harness();
        let seen = Arc::new(Mutex::new(0u32));
        let count = Arc::clone(&seen);
        let _l = h.session.on_event(move |_, _| *count.lock() += 1);
        h.session.init().await.unwrap();

        let first = h.provider.latest().unwrap();
        first.drop_connection(1006, "dropped");
        let _ = h.provider.wait_for_transports(2).await;
        first.emit(json!({"late": true}), None);
        settle().await;
        assert_eq!(*seen.lock(), 0);
    }
}
