//! WebSocket transport over `tokio-tungstenite`.
//!
//! `init` performs the handshake and spawns one connection task that owns
//! the socket, the keepalive ticker and the watchdog. Requests reach the
//! task through a command channel; every exit path of the task reports
//! exactly one close through the sink.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cloudkit_core::envelope::{Envelope, now_millis};
use cloudkit_core::metrics::{
    FORWARD_MESSAGE_LATENCY, OPEN_MESSAGE_WS_LATENCY, TOTAL_MESSAGE_LATENCY, WS_ERROR_COUNT,
    ws_close_count,
};
use cloudkit_core::wire::{ABNORMAL_CLOSURE, NO_STATUS_RECEIVED, NORMAL_CLOSURE};
use cloudkit_core::{
    BroadcastRequest, CloseEvent, Metrics, MessagingError, Result, SendToRequest,
    SubscriberRequest, TransportId,
};
use cloudkit_settings::CloudkitSettings;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use super::keepalive::{
    Keepalive, PING_PONG_CLOSE_REASON, Watchdog, watchdog_expired, write_stalled,
};
use super::sink::TransportSink;
use super::{Transport, TransportProvider};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

/// Reason sent with a client-initiated close.
pub const NORMAL_CLOSURE_REASON: &str = "Normal Closure";

/// How long a client-initiated close waits for the server's close frame.
const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

const COMMAND_BUFFER: usize = 64;

/// Connection options.
#[derive(Clone, Debug)]
pub struct WsOptions {
    /// Handshake deadline.
    pub connect_timeout: Duration,
    /// Keepalive strategy.
    pub keepalive: Keepalive,
}

impl Default for WsOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            keepalive: Keepalive::default(),
        }
    }
}

impl WsOptions {
    /// Options from settings.
    pub fn from_settings(settings: &CloudkitSettings) -> Self {
        Self {
            connect_timeout: settings.connection.connect_timeout(),
            keepalive: Keepalive::from_settings(&settings.keepalive),
        }
    }
}

enum Command {
    Send {
        text: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Close,
}

#[derive(Default)]
struct Flags {
    initialized: AtomicBool,
    connected: AtomicBool,
    terminated: AtomicBool,
}

/// One WebSocket connection.
pub struct WsTransport {
    id: TransportId,
    endpoint: String,
    options: WsOptions,
    sink: TransportSink,
    metrics: Arc<dyn Metrics>,
    flags: Arc<Flags>,
    commands: Mutex<Option<mpsc::Sender<Command>>>,
}

impl WsTransport {
    /// Create an unopened transport for `endpoint`.
    pub fn new(
        endpoint: impl Into<String>,
        options: WsOptions,
        sink: TransportSink,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        Self {
            id: sink.id().clone(),
            endpoint: endpoint.into(),
            options,
            sink,
            metrics,
            flags: Arc::new(Flags::default()),
            commands: Mutex::new(None),
        }
    }

    /// Endpoint URL.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn fail_handshake(&self, message: String) -> MessagingError {
        warn!(transport_id = %self.id, endpoint = %self.endpoint, error = %message, "websocket handshake failed");
        self.metrics.increment_counter(WS_ERROR_COUNT);
        self.metrics.increment_counter(&ws_close_count(ABNORMAL_CLOSURE));
        let _ = self.sink.closed(ABNORMAL_CLOSURE, message.clone());
        MessagingError::Connection(message)
    }

    async fn send_request(&self, request: SubscriberRequest) -> Result<()> {
        if self.flags.terminated.load(Ordering::Acquire) {
            let message = "request failed because the connection has been terminated";
            warn!(transport_id = %self.id, action = request.action.as_str(), "{message}");
            return Err(MessagingError::NotReady(message.into()));
        }
        let commands = self.commands.lock().clone();
        let Some(commands) = commands.filter(|_| self.flags.connected.load(Ordering::Acquire))
        else {
            let message = "connection is not in a ready state";
            warn!(transport_id = %self.id, action = request.action.as_str(), "{message}");
            return Err(MessagingError::NotReady(message.into()));
        };

        let text = request.to_json()?;
        let (reply, rx) = oneshot::channel();
        commands
            .send(Command::Send { text, reply })
            .await
            .map_err(|_| MessagingError::NotReady("connection task has exited".into()))?;
        rx.await.map_err(|_| {
            MessagingError::NotReady("connection closed before the request was written".into())
        })?
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn id(&self) -> &TransportId {
        &self.id
    }

    async fn init(&self) -> Result<()> {
        if self.flags.terminated.load(Ordering::Acquire) {
            let message = "websocket is already terminated";
            warn!(transport_id = %self.id, "{message}");
            return Err(MessagingError::InvalidState(message.into()));
        }
        if self.flags.initialized.swap(true, Ordering::AcqRel) {
            let message = "websocket is already initialized";
            warn!(transport_id = %self.id, "{message}");
            return Err(MessagingError::InvalidState(message.into()));
        }

        info!(transport_id = %self.id, endpoint = %self.endpoint, "opening websocket");
        let started = Instant::now();
        let ws = match tokio::time::timeout(
            self.options.connect_timeout,
            connect_async(self.endpoint.as_str()),
        )
        .await
        {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(error)) => return Err(self.fail_handshake(error.to_string())),
            Err(_) => {
                return Err(self.fail_handshake(format!(
                    "connect timed out after {} ms",
                    self.options.connect_timeout.as_millis()
                )));
            }
        };
        self.metrics.time(OPEN_MESSAGE_WS_LATENCY, elapsed_millis(started));

        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        *self.commands.lock() = Some(tx.clone());
        self.flags.connected.store(true, Ordering::Release);

        let connection = Connection {
            id: self.id.clone(),
            sink: self.sink.clone(),
            metrics: Arc::clone(&self.metrics),
            flags: Arc::clone(&self.flags),
        };
        drop(tokio::spawn(connection.run(ws, rx, self.options.keepalive)));
        info!(transport_id = %self.id, "websocket opened");

        if self.flags.terminated.load(Ordering::Acquire) {
            let _ = tx.send(Command::Close).await;
            return Err(MessagingError::Connection(
                "transport was closed during the handshake".into(),
            ));
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        info!(transport_id = %self.id, topic, "subscribe");
        self.send_request(SubscriberRequest::subscribe(topic)).await
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        info!(transport_id = %self.id, topic, "unsubscribe");
        self.send_request(SubscriberRequest::unsubscribe(topic)).await
    }

    async fn broadcast(&self, request: BroadcastRequest) -> Result<()> {
        info!(transport_id = %self.id, topic = %request.topic, "broadcast");
        self.send_request(request.into()).await
    }

    async fn send_to(&self, request: SendToRequest) -> Result<()> {
        info!(transport_id = %self.id, recipient_id = %request.recipient_id, "send to recipient");
        self.send_request(request.into()).await
    }

    async fn close(&self) {
        if self.flags.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(transport_id = %self.id, "closing websocket");
        // A full queue still closes: dropping the last sender ends the
        // task's command stream, which runs the same close handshake.
        let commands = self.commands.lock().take();
        if let Some(commands) = commands {
            let _ = commands.try_send(Command::Close);
        }
    }

    fn is_connected(&self) -> bool {
        self.flags.connected.load(Ordering::Acquire)
    }
}

/// Per-connection task state.
struct Connection {
    id: TransportId,
    sink: TransportSink,
    metrics: Arc<dyn Metrics>,
    flags: Arc<Flags>,
}

/// Outcome of one socket write.
enum Write {
    Done,
    Failed(WsError),
    /// The write did not finish before the watchdog's write deadline.
    Stalled,
}

impl Connection {
    async fn run(self, ws: WsStream, mut commands: mpsc::Receiver<Command>, keepalive: Keepalive) {
        let (mut writer, mut reader) = ws.split();
        let mut ticker = keepalive.ticker();
        let mut watchdog = keepalive.watchdog();

        let close = loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Send { text, reply }) => {
                        match write(&mut writer, Message::Text(text.into()), watchdog.as_ref()).await {
                            Write::Done => {
                                let _ = reply.send(Ok(()));
                            }
                            Write::Failed(error) => {
                                warn!(transport_id = %self.id, %error, "failed to write request");
                                let _ = reply.send(Err(MessagingError::Send(error.to_string())));
                            }
                            Write::Stalled => {
                                let _ = reply.send(Err(MessagingError::Send(
                                    "write did not complete before the pong deadline".into(),
                                )));
                                break self.declare_dead();
                            }
                        }
                    }
                    Some(Command::Close) | None => {
                        break self.close_handshake(&mut writer, &mut reader).await;
                    }
                },
                frame = reader.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.deliver(&text),
                    Some(Ok(Message::Pong(_))) => {
                        debug!(transport_id = %self.id, "received pong");
                        if let Some(w) = watchdog.as_mut() {
                            w.pong_received();
                        }
                    }
                    Some(Ok(Message::Close(frame))) => break close_event(frame),
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        warn!(transport_id = %self.id, %error, "websocket error");
                        self.metrics.increment_counter(WS_ERROR_COUNT);
                        break CloseEvent::new(ABNORMAL_CLOSURE, error.to_string());
                    }
                    None => break CloseEvent::new(ABNORMAL_CLOSURE, "connection ended without a close frame"),
                },
                _ = ticker.tick() => {
                    if self.keepalive(&keepalive, &mut writer, watchdog.as_mut()).await {
                        break self.declare_dead();
                    }
                }
                () = watchdog_expired(watchdog.as_ref()) => break self.declare_dead(),
            }
        };

        self.flags.connected.store(false, Ordering::Release);
        info!(transport_id = %self.id, code = close.code, reason = %close.reason, "websocket closed");
        self.metrics.increment_counter(&ws_close_count(close.code));
        let _ = self.sink.closed(close.code, close.reason);
        // Fails queued requests now rather than after the flush.
        drop(commands);

        // Flushes any queued close reply; bounded because the peer may be gone.
        let _ = tokio::time::timeout(CLOSE_HANDSHAKE_TIMEOUT, writer.close()).await;
    }

    fn declare_dead(&self) -> CloseEvent {
        warn!(transport_id = %self.id, "no pong received within the timeout");
        CloseEvent::new(ABNORMAL_CLOSURE, PING_PONG_CLOSE_REASON)
    }

    /// Sends one keepalive. Returns true when the write stalled.
    async fn keepalive(
        &self,
        keepalive: &Keepalive,
        writer: &mut WsWriter,
        mut watchdog: Option<&mut Watchdog>,
    ) -> bool {
        let message = match keepalive {
            Keepalive::ProtocolPing { .. } => {
                debug!(transport_id = %self.id, "sending ping");
                if let Some(w) = watchdog.as_deref_mut() {
                    w.ping_sent();
                }
                Message::Ping(Vec::new().into())
            }
            Keepalive::ApplicationPing { .. } => match SubscriberRequest::ping().to_json() {
                Ok(text) => {
                    debug!(transport_id = %self.id, "sending application ping");
                    Message::Text(text.into())
                }
                Err(error) => {
                    warn!(transport_id = %self.id, %error, "failed to encode ping");
                    return false;
                }
            },
        };
        match write(writer, message, watchdog.as_deref()).await {
            Write::Done => false,
            Write::Failed(error) => {
                warn!(transport_id = %self.id, %error, "failed to send keepalive");
                false
            }
            Write::Stalled => true,
        }
    }

    async fn close_handshake(&self, writer: &mut WsWriter, reader: &mut WsReader) -> CloseEvent {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: NORMAL_CLOSURE_REASON.into(),
        };
        match tokio::time::timeout(CLOSE_HANDSHAKE_TIMEOUT, writer.send(Message::Close(Some(frame))))
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                debug!(transport_id = %self.id, %error, "close frame not sent");
                return CloseEvent::new(NORMAL_CLOSURE, NORMAL_CLOSURE_REASON);
            }
            Err(_) => {
                debug!(transport_id = %self.id, "close frame write timed out");
                return CloseEvent::new(NORMAL_CLOSURE, NORMAL_CLOSURE_REASON);
            }
        }
        let reply = tokio::time::timeout(CLOSE_HANDSHAKE_TIMEOUT, async {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(Message::Close(frame)) => return Some(close_event(frame)),
                    Ok(_) => {}
                    Err(_) => return None,
                }
            }
            None
        })
        .await;
        match reply {
            Ok(Some(event)) => event,
            _ => CloseEvent::new(NORMAL_CLOSURE, NORMAL_CLOSURE_REASON),
        }
    }

    fn deliver(&self, text: &str) {
        let Some(envelope) = Envelope::parse(text) else {
            warn!(transport_id = %self.id, len = text.len(), "dropping frame that is not a JSON object");
            return;
        };
        let now = now_millis();
        if let Some(ms) = envelope.total_latency_ms(now) {
            self.metrics.time(TOTAL_MESSAGE_LATENCY, ms);
        }
        if let Some(ms) = envelope.forward_latency_ms(now) {
            self.metrics.time(FORWARD_MESSAGE_LATENCY, ms);
        }
        match &envelope.sender_id {
            Some(sender) => debug!(transport_id = %self.id, sender_id = %sender, "received message"),
            None => debug!(transport_id = %self.id, "received message without sender id"),
        }
        self.sink.event(envelope.payload, envelope.sender_id);
    }
}

/// Write `message`, giving up at the watchdog's write deadline.
async fn write(writer: &mut WsWriter, message: Message, watchdog: Option<&Watchdog>) -> Write {
    tokio::select! {
        result = writer.send(message) => match result {
            Ok(()) => Write::Done,
            Err(error) => Write::Failed(error),
        },
        () = write_stalled(watchdog) => Write::Stalled,
    }
}

fn close_event(frame: Option<CloseFrame>) -> CloseEvent {
    match frame {
        Some(frame) => CloseEvent::new(u16::from(frame.code), frame.reason.as_str()),
        None => CloseEvent::new(NO_STATUS_RECEIVED, ""),
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
fn elapsed_millis(started: Instant) -> i64 {
    started.elapsed().as_millis() as i64
}

/// Creates a [`WsTransport`] per connect cycle.
pub struct WsTransportProvider {
    endpoint: String,
    options: WsOptions,
    metrics: Arc<dyn Metrics>,
}

impl WsTransportProvider {
    /// Provider for `endpoint`.
    pub fn new(endpoint: impl Into<String>, options: WsOptions, metrics: Arc<dyn Metrics>) -> Self {
        Self {
            endpoint: endpoint.into(),
            options,
            metrics,
        }
    }

    /// Provider configured from settings.
    pub fn from_settings(settings: &CloudkitSettings, metrics: Arc<dyn Metrics>) -> Self {
        Self::new(
            settings.connection.endpoint.clone(),
            WsOptions::from_settings(settings),
            metrics,
        )
    }
}

impl TransportProvider for WsTransportProvider {
    fn create(&self, sink: TransportSink) -> Arc<dyn Transport> {
        Arc::new(WsTransport::new(
            self.endpoint.clone(),
            self.options.clone(),
            sink,
            Arc::clone(&self.metrics),
        ))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use cloudkit_core::NoopMetrics;

    use super::*;
    use crate::transport::{TransportEvent, TransportNotice};

    fn transport(endpoint: &str) -> (WsTransport, mpsc::UnboundedReceiver<TransportNotice>) {
        let (sink, rx) = TransportSink::channel();
        let options = WsOptions {
            connect_timeout: Duration::from_millis(500),
            ..WsOptions::default()
        };
        (WsTransport::new(endpoint, options, sink, Arc::new(NoopMetrics)), rx)
    }

    #[test]
    fn close_event_without_frame_is_no_status() {
        assert_eq!(close_event(None), CloseEvent::new(1005, ""));
        let frame = CloseFrame {
            code: CloseCode::Away,
            reason: "bye".into(),
        };
        assert_eq!(close_event(Some(frame)), CloseEvent::new(1001, "bye"));
    }

    #[tokio::test]
    async fn requests_before_init_are_not_ready() {
        let (transport, _rx) = transport("ws://127.0.0.1:9");
        assert_matches!(
            transport.subscribe("a").await,
            Err(MessagingError::NotReady(_))
        );
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn requests_after_close_report_termination() {
        let (transport, _rx) = transport("ws://127.0.0.1:9");
        transport.close().await;
        let err = transport.subscribe("a").await.unwrap_err();
        assert_matches!(&err, MessagingError::NotReady(m) if m.contains("terminated"));
        assert_matches!(transport.init().await, Err(MessagingError::InvalidState(_)));
    }

    #[tokio::test]
    async fn failed_handshake_reports_abnormal_close() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (transport, mut rx) = transport(&format!("ws://127.0.0.1:{port}"));
        assert_matches!(transport.init().await, Err(MessagingError::Connection(_)));

        let notice = rx.recv().await.unwrap();
        assert_eq!(&notice.transport, transport.id());
        assert_matches!(notice.event, TransportEvent::Closed(close) if close.code == 1006);

        assert_matches!(transport.init().await, Err(MessagingError::InvalidState(_)));
    }

    #[test]
    fn options_follow_settings() {
        let mut settings = CloudkitSettings::default();
        settings.connection.connect_timeout_ms = 2500;
        settings.keepalive.mode = cloudkit_settings::KeepaliveMode::ApplicationPing;
        let options = WsOptions::from_settings(&settings);
        assert_eq!(options.connect_timeout, Duration::from_millis(2500));
        assert_matches!(options.keepalive, Keepalive::ApplicationPing { .. });
    }
}
