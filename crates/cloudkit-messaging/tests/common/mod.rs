//! Local WebSocket server for integration tests.

#![allow(dead_code)]

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

pub const WAIT: Duration = Duration::from_secs(5);

enum ServerCmd {
    Send(Message),
    Freeze,
}

/// Accepts connections and hands each one to the test.
pub struct TestServer {
    pub url: String,
    connections: mpsc::UnboundedReceiver<ServerConn>,
    _accept: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (tx, connections) = mpsc::unbounded_channel();
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(ws) = accept_async(stream).await else {
                    continue;
                };
                if tx.send(ServerConn::spawn(ws)).is_err() {
                    break;
                }
            }
        });
        Self {
            url,
            connections,
            _accept: accept,
        }
    }

    /// Next accepted connection.
    pub async fn accept(&mut self) -> ServerConn {
        tokio::time::timeout(WAIT, self.connections.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("accept loop ended")
    }

    /// Whether another connection arrives within `within`.
    pub async fn has_connection_within(&mut self, within: Duration) -> bool {
        matches!(
            tokio::time::timeout(within, self.connections.recv()).await,
            Ok(Some(_))
        )
    }
}

/// Server side of one accepted connection.
pub struct ServerConn {
    inbound: mpsc::UnboundedReceiver<Message>,
    commands: mpsc::UnboundedSender<ServerCmd>,
    task: JoinHandle<()>,
}

impl ServerConn {
    fn spawn(ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>) -> Self {
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (commands, mut command_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            let (mut writer, mut reader) = ws.split();
            loop {
                tokio::select! {
                    frame = reader.next() => match frame {
                        Some(Ok(message)) => {
                            let _ = inbound_tx.send(message);
                        }
                        _ => break,
                    },
                    command = command_rx.recv() => match command {
                        Some(ServerCmd::Send(message)) => {
                            if writer.send(message).await.is_err() {
                                break;
                            }
                        }
                        Some(ServerCmd::Freeze) => {
                            // Hold the socket open without reading, so pings
                            // are never answered.
                            std::future::pending::<()>().await;
                        }
                        None => break,
                    },
                }
            }
        });
        Self {
            inbound,
            commands,
            task,
        }
    }

    /// Next text frame from the client, parsed as JSON.
    pub async fn recv_json(&mut self) -> Value {
        loop {
            let message = tokio::time::timeout(WAIT, self.inbound.recv())
                .await
                .expect("timed out waiting for a frame")
                .expect("connection ended");
            if let Message::Text(text) = message {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    /// Next close frame from the client.
    pub async fn recv_close(&mut self) -> Option<CloseFrame> {
        loop {
            let message = tokio::time::timeout(WAIT, self.inbound.recv())
                .await
                .expect("timed out waiting for a close frame")
                .expect("connection ended");
            if let Message::Close(frame) = message {
                return frame;
            }
        }
    }

    pub fn send_text(&self, text: &str) {
        let _ = self
            .commands
            .send(ServerCmd::Send(Message::Text(text.to_string().into())));
    }

    pub fn send_json(&self, value: &Value) {
        self.send_text(&value.to_string());
    }

    pub fn close_with(&self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        let _ = self.commands.send(ServerCmd::Send(Message::Close(Some(frame))));
    }

    /// Stop reading, so protocol pings go unanswered.
    pub fn freeze(&self) {
        let _ = self.commands.send(ServerCmd::Freeze);
    }

    /// Drop the TCP connection without a close handshake.
    pub fn kill(&self) {
        self.task.abort();
    }
}
