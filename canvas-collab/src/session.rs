//! Per-connection protocol state machine.
//!
//! ```text
//!            join                 join (other room)
//! Connected ──────► Joined{room} ───────────────────► Joined{room'}
//!     │                  │
//!     └──── close ───────┴──► (terminal, user_left broadcast)
//! ```
//!
//! A [`Session`] owns the connection's reply sink and routes each parsed
//! [`ClientMessage`] to its room. The caller feeds frames one at a time, so
//! messages from one connection are handled strictly in order.

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::broadcast::{ClientId, SinkHandle};
use crate::protocol::{ClientMessage, JoinRequest, PointerMove, ProtocolError, ServerMessage, UserInfo};
use crate::room::{Room, RoomRegistry};
use crate::server::ServerConfig;

/// Room membership of a joined connection.
#[derive(Clone)]
pub struct Membership {
    pub room: Arc<Room>,
    pub user_id: String,
    pub name: String,
    pub color: String,
}

/// Connection lifecycle state.
#[derive(Clone, Default)]
pub enum SessionState {
    /// Transport established, no room or identity yet.
    #[default]
    Connected,
    Joined(Membership),
}

/// Who a message acts as, and in which room.
struct Actor {
    room: Arc<Room>,
    user_id: String,
    name: String,
    color: Option<String>,
}

/// Dispatcher for one connection.
pub struct Session {
    client_id: ClientId,
    sink: SinkHandle,
    registry: Arc<RoomRegistry>,
    config: Arc<ServerConfig>,
    state: SessionState,
}

impl Session {
    pub fn new(
        client_id: ClientId,
        sink: SinkHandle,
        registry: Arc<RoomRegistry>,
        config: Arc<ServerConfig>,
    ) -> Self {
        Self {
            client_id,
            sink,
            registry,
            config,
            state: SessionState::Connected,
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_joined(&self) -> bool {
        matches!(self.state, SessionState::Joined(_))
    }

    pub fn user_id(&self) -> Option<&str> {
        match &self.state {
            SessionState::Joined(m) => Some(&m.user_id),
            SessionState::Connected => None,
        }
    }

    pub fn room_id(&self) -> Option<&str> {
        match &self.state {
            SessionState::Joined(m) => Some(m.room.id()),
            SessionState::Connected => None,
        }
    }

    /// Greet the connection with its client id.
    pub fn open(&self) -> Result<(), ProtocolError> {
        self.reply(&ServerMessage::Welcome {
            client_id: self.client_id.to_string(),
        })
    }

    /// Parse and handle one text frame.
    ///
    /// Malformed frames return the parse error and change nothing; the
    /// connection stays open and the sender is not told.
    pub async fn handle_text(&mut self, text: &str) -> Result<(), ProtocolError> {
        let msg = ClientMessage::parse(text)?;
        self.handle(msg).await
    }

    /// Route one parsed message.
    pub async fn handle(&mut self, msg: ClientMessage) -> Result<(), ProtocolError> {
        if let ClientMessage::Join(request) = msg {
            return self.join(request).await;
        }

        let Some(actor) = self.actor().await else {
            log::warn!(
                "Dropping {} from {}: connection has not joined a room",
                msg.type_name(),
                self.client_id
            );
            return Ok(());
        };

        match msg {
            ClientMessage::Join(_) => unreachable!("join handled above"),

            ClientMessage::PointerMove(PointerMove { point, color }) => {
                log::trace!("Pointer move from {} in room {}", actor.user_id, actor.room.id());
                let msg = ServerMessage::PointerMove {
                    user_id: actor.user_id,
                    point,
                    name: actor.name,
                    color: actor.color.or(color),
                };
                actor.room.broadcast(&msg, Some(self.client_id)).await?;
            }

            ClientMessage::StrokeStart(mut body) => {
                body.insert("userId".into(), Value::String(actor.user_id));
                actor
                    .room
                    .broadcast(&ServerMessage::StrokeStart(body), Some(self.client_id))
                    .await?;
            }

            ClientMessage::StrokeUpdate(mut body) => {
                body.insert("userId".into(), Value::String(actor.user_id));
                actor
                    .room
                    .broadcast(&ServerMessage::StrokeUpdate(body), Some(self.client_id))
                    .await?;
            }

            ClientMessage::StrokeEnd(draft) => {
                let op = actor.room.commit_stroke(draft, &actor.user_id, &self.sink).await?;
                log::debug!(
                    "Stroke {} (seq {}) by {} in room {}",
                    op.id,
                    op.seq,
                    actor.user_id,
                    actor.room.id()
                );
            }

            ClientMessage::GetLog => {
                let log = actor.room.log().await;
                self.reply(&ServerMessage::Log { log })?;
            }

            ClientMessage::Undo { op_id } => {
                let op = actor.room.commit_undo(&actor.user_id, &op_id).await?;
                log::debug!("Undo of {op_id} (seq {}) by {} in room {}", op.seq, actor.user_id, actor.room.id());
            }

            ClientMessage::Redo { op_id } => {
                let op = actor.room.commit_redo(&actor.user_id, &op_id).await?;
                log::debug!("Redo of {op_id} (seq {}) by {} in room {}", op.seq, actor.user_id, actor.room.id());
            }

            ClientMessage::Other(raw) => {
                log::debug!("Passing through unknown message type from {}", self.client_id);
                actor
                    .room
                    .broadcast(&ServerMessage::Message(raw), Some(self.client_id))
                    .await?;
            }
        }
        Ok(())
    }

    /// Attach to a room, leaving the current one first if joined.
    async fn join(&mut self, request: JoinRequest) -> Result<(), ProtocolError> {
        let previous = match std::mem::take(&mut self.state) {
            SessionState::Joined(m) => Some(m),
            SessionState::Connected => None,
        };

        let room_id = request
            .room_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| self.config.default_room.clone());
        let user_id = request
            .user_id
            .filter(|id| !id.is_empty())
            .or_else(|| previous.as_ref().map(|m| m.user_id.clone()))
            .unwrap_or_else(generate_user_id);
        let name = request
            .name
            .filter(|name| !name.is_empty())
            .or_else(|| previous.as_ref().map(|m| m.name.clone()))
            .unwrap_or_else(generate_name);
        let color = request
            .color
            .filter(|color| !color.is_empty())
            .or_else(|| previous.as_ref().map(|m| m.color.clone()))
            .unwrap_or_else(|| UserInfo::color_for(&user_id));

        if let Some(prev) = previous {
            prev.room.leave(&self.client_id, &prev.user_id).await?;
            log::info!("{} left room {} to join {room_id}", prev.user_id, prev.room.id());
        }

        // An evicted room refuses joins; the registry hands out a fresh one.
        let room = loop {
            let room = self.registry.get_or_create(&room_id).await;
            let info = UserInfo::new(name.clone(), color.clone());
            if room.join(self.client_id, self.sink.clone(), &user_id, info).await? {
                break room;
            }
        };

        log::info!("User {user_id} ({name}) joined room {room_id} as {}", self.client_id);
        self.state = SessionState::Joined(Membership {
            room,
            user_id,
            name,
            color,
        });
        Ok(())
    }

    /// Resolve the acting identity and room for a non-join message.
    ///
    /// Unjoined connections act in the fallback room under their client id,
    /// without being attached to it, unless no fallback is configured.
    async fn actor(&self) -> Option<Actor> {
        match &self.state {
            SessionState::Joined(m) => Some(Actor {
                room: m.room.clone(),
                user_id: m.user_id.clone(),
                name: m.name.clone(),
                color: Some(m.color.clone()),
            }),
            SessionState::Connected => {
                let room_id = self.config.fallback_room.as_deref()?;
                Some(Actor {
                    room: self.registry.get_or_create(room_id).await,
                    user_id: self.client_id.to_string(),
                    name: "anonymous".to_string(),
                    color: None,
                })
            }
        }
    }

    /// Detach from the room, announcing `user_left`. Terminal.
    pub async fn close(self) {
        if let SessionState::Joined(m) = self.state {
            match m.room.leave(&self.client_id, &m.user_id).await {
                Ok(_) => log::info!("User {} left room {}", m.user_id, m.room.id()),
                Err(e) => log::error!("Failed to announce departure of {}: {e}", m.user_id),
            }
        }
    }

    fn reply(&self, msg: &ServerMessage) -> Result<(), ProtocolError> {
        let frame: Arc<str> = Arc::from(msg.encode()?);
        if let Err(e) = self.sink.deliver(frame) {
            log::warn!("Failed to deliver {} to {}: {e}", msg.type_name(), self.client_id);
        }
        Ok(())
    }
}

fn generate_user_id() -> String {
    let raw = Uuid::new_v4().simple().to_string();
    format!("u_{}", &raw[..6])
}

fn generate_name() -> String {
    format!("anon{}", Uuid::new_v4().as_u128() % 1000)
}
