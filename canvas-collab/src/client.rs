//! WebSocket client for the canvas relay.
//!
//! Provides:
//! - Connection lifecycle (connect + join, disconnect)
//! - Typed senders for every client → server message
//! - A receiver of decoded [`ServerMessage`]s, closed when the connection ends

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ClientMessage, JoinRequest, Point, PointerMove, ProtocolError, ServerMessage, StrokeDraft};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// A connected canvas client.
pub struct CanvasClient {
    /// Server URL
    server_url: String,

    /// Connection state, shared with the reader task
    state: Arc<RwLock<ConnectionState>>,

    /// Connection id announced by the server's `welcome`
    client_id: Arc<RwLock<Option<String>>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<String>>,

    /// Decoded server messages for the application
    event_rx: Option<mpsc::Receiver<ServerMessage>>,
}

impl CanvasClient {
    /// Connect to `url` and send `join` as the first message.
    ///
    /// Spawns background tasks for reading and writing WebSocket frames.
    pub async fn connect(url: impl Into<String>, join: JoinRequest) -> Result<Self, ProtocolError> {
        let server_url = url.into();
        let state = Arc::new(RwLock::new(ConnectionState::Connecting));

        let (ws_stream, _) = match tokio_tungstenite::connect_async(server_url.as_str()).await {
            Ok(conn) => conn,
            Err(e) => {
                log::debug!("Failed to connect to {server_url}: {e}");
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket, close when it ends
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::text(text)).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        // Reader task: decode incoming frames until the connection ends
        let (event_tx, event_rx) = mpsc::channel::<ServerMessage>(256);
        let client_id = Arc::new(RwLock::new(None));
        {
            let state = state.clone();
            let client_id = client_id.clone();
            tokio::spawn(async move {
                while let Some(msg) = ws_reader.next().await {
                    let text = match msg {
                        Ok(Message::Text(text)) => text,
                        Ok(Message::Close(_)) | Err(_) => break,
                        Ok(_) => continue,
                    };
                    let server_msg = match ServerMessage::decode(text.as_str()) {
                        Ok(server_msg) => server_msg,
                        Err(e) => {
                            log::warn!("Ignoring undecodable server frame: {e}");
                            continue;
                        }
                    };
                    if let ServerMessage::Welcome { client_id: id } = &server_msg {
                        *client_id.write().await = Some(id.clone());
                    }
                    if event_tx.send(server_msg).await.is_err() {
                        // Receiver dropped; keep draining so the socket stays serviced
                        continue;
                    }
                }

                // Connection lost
                *state.write().await = ConnectionState::Disconnected;
            });
        }

        *state.write().await = ConnectionState::Connected;
        let client = Self {
            server_url,
            state,
            client_id,
            outgoing_tx: Some(out_tx),
            event_rx: Some(event_rx),
        };
        client.join(join).await?;
        Ok(client)
    }

    /// Take the message receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ServerMessage>> {
        self.event_rx.take()
    }

    /// Encode and queue one message.
    pub async fn send(&self, msg: &ClientMessage) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }
        let encoded = msg.encode()?;
        match self.outgoing_tx {
            Some(ref tx) => tx.send(encoded).await.map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Join (or move to) a room.
    pub async fn join(&self, request: JoinRequest) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Join(request)).await
    }

    pub async fn send_pointer_move(&self, point: Point, color: Option<String>) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::PointerMove(PointerMove { point, color }))
            .await
    }

    pub async fn send_stroke_start(&self, body: Map<String, Value>) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::StrokeStart(body)).await
    }

    pub async fn send_stroke_update(&self, body: Map<String, Value>) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::StrokeUpdate(body)).await
    }

    /// Commit a finished stroke.
    pub async fn send_stroke_end(&self, draft: StrokeDraft) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::StrokeEnd(draft)).await
    }

    /// Ask for the full operation log.
    pub async fn request_log(&self) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::GetLog).await
    }

    pub async fn send_undo(&self, op_id: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Undo { op_id: op_id.into() }).await
    }

    pub async fn send_redo(&self, op_id: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Redo { op_id: op_id.into() }).await
    }

    /// Send an arbitrary envelope; the server relays unknown types as `message`.
    pub async fn send_raw(&self, envelope: Value) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Other(envelope)).await
    }

    /// Close the connection. Queued messages are flushed first.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Connection id from the server's `welcome`, once received.
    pub async fn client_id(&self) -> Option<String> {
        self.client_id.read().await.clone()
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
