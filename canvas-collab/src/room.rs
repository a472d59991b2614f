//! Rooms and the room registry.
//!
//! ```text
//! RoomRegistry ── room_id ──► Room
//!                              ├── OperationLog   (authoritative history)
//!                              ├── clients        (client_id → sink)
//!                              ├── users          (user_id → {name, color})
//!                              └── Relay          (fan-out)
//! ```
//!
//! All room state sits behind one lock. A log mutation and the broadcasts
//! it triggers run under that lock, so every connection in a room sees
//! log-affecting frames in `seq` order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};

use crate::broadcast::{BroadcastReport, BroadcastStats, ClientId, Relay, SinkHandle};
use crate::oplog::OperationLog;
use crate::protocol::{Operation, ProtocolError, ServerMessage, StrokeDraft, UserDirectory, UserInfo};

struct RoomState {
    log: OperationLog,
    clients: HashMap<ClientId, SinkHandle>,
    /// Never pruned on disconnect; several tabs may share a user id.
    users: UserDirectory,
    /// When the last client left, `None` while occupied.
    idle_since: Option<Instant>,
    /// Set once the registry has evicted this room.
    closed: bool,
}

/// One collaboration scope: a log, its connections and its known users.
pub struct Room {
    id: String,
    state: Mutex<RoomState>,
    relay: Relay,
}

impl Room {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: Mutex::new(RoomState {
                log: OperationLog::new(),
                clients: HashMap::new(),
                users: UserDirectory::new(),
                idle_since: Some(Instant::now()),
                closed: false,
            }),
            relay: Relay::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Register a connection and, if the user id is new, its presence
    /// metadata. Existing metadata is kept (first write wins).
    ///
    /// Returns `true` if the user id was not known before.
    pub async fn add_client(
        &self,
        client_id: ClientId,
        sink: SinkHandle,
        user_id: &str,
        info: UserInfo,
    ) -> bool {
        let mut state = self.state.lock().await;
        Self::attach(&mut state, client_id, sink, user_id, info)
    }

    fn attach(
        state: &mut RoomState,
        client_id: ClientId,
        sink: SinkHandle,
        user_id: &str,
        info: UserInfo,
    ) -> bool {
        state.clients.insert(client_id, sink);
        state.idle_since = None;
        if state.users.contains_key(user_id) {
            return false;
        }
        state.users.insert(user_id.to_string(), info);
        true
    }

    /// Detach a connection. The user directory is untouched.
    pub async fn remove_client(&self, client_id: &ClientId) -> bool {
        let mut state = self.state.lock().await;
        Self::detach(&mut state, client_id)
    }

    fn detach(state: &mut RoomState, client_id: &ClientId) -> bool {
        let removed = state.clients.remove(client_id).is_some();
        if removed && state.clients.is_empty() {
            state.idle_since = Some(Instant::now());
        }
        removed
    }

    /// Deliver `msg` to every connection except `exclude`.
    pub async fn broadcast(
        &self,
        msg: &ServerMessage,
        exclude: Option<ClientId>,
    ) -> Result<BroadcastReport, ProtocolError> {
        let state = self.state.lock().await;
        self.fan_out(&state, msg, exclude)
    }

    fn fan_out(
        &self,
        state: &RoomState,
        msg: &ServerMessage,
        exclude: Option<ClientId>,
    ) -> Result<BroadcastReport, ProtocolError> {
        let report = self.relay.broadcast(msg, &state.clients, exclude)?;
        report.log_failures(&self.id, msg.type_name());
        Ok(report)
    }

    /// Attach a connection and announce it.
    ///
    /// The joiner gets `join{userId, users, log}` on `sink`; everyone else
    /// gets the `users` snapshot. Returns `Ok(false)` without attaching if
    /// the room has been evicted.
    pub async fn join(
        &self,
        client_id: ClientId,
        sink: SinkHandle,
        user_id: &str,
        info: UserInfo,
    ) -> Result<bool, ProtocolError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(false);
        }
        Self::attach(&mut state, client_id, sink.clone(), user_id, info);

        let welcome = ServerMessage::Join {
            user_id: user_id.to_string(),
            users: state.users.clone(),
            log: state.log.log(),
        };
        deliver_reply(&sink, &welcome, &self.id)?;
        self.fan_out(&state, &ServerMessage::Users(state.users.clone()), Some(client_id))?;
        Ok(true)
    }

    /// Detach a connection and tell the rest of the room.
    pub async fn leave(&self, client_id: &ClientId, user_id: &str) -> Result<bool, ProtocolError> {
        let mut state = self.state.lock().await;
        if !Self::detach(&mut state, client_id) {
            return Ok(false);
        }
        let msg = ServerMessage::UserLeft {
            user_id: user_id.to_string(),
        };
        self.fan_out(&state, &msg, None)?;
        Ok(true)
    }

    /// Append a stroke, broadcast it to everyone and acknowledge on `reply`.
    pub async fn commit_stroke(
        &self,
        draft: StrokeDraft,
        user_id: &str,
        reply: &SinkHandle,
    ) -> Result<Operation, ProtocolError> {
        let mut state = self.state.lock().await;
        let op = state.log.append(draft, user_id);
        self.fan_out(&state, &ServerMessage::StrokeEnd { op: op.clone() }, None)?;
        deliver_reply(reply, &ServerMessage::StrokeAck { op: op.clone() }, &self.id)?;
        Ok(op)
    }

    /// Record an undo marker, then broadcast the full log and the marker.
    pub async fn commit_undo(&self, user_id: &str, target_id: &str) -> Result<Operation, ProtocolError> {
        let mut state = self.state.lock().await;
        let op = state.log.record_undo(user_id, target_id);
        self.fan_out(&state, &ServerMessage::Log { log: state.log.log() }, None)?;
        self.fan_out(&state, &ServerMessage::Undo { op: op.clone() }, None)?;
        Ok(op)
    }

    /// Record a redo marker, then broadcast the marker and the full log.
    ///
    /// The marker travels in an `undo` frame; its `kind` tells them apart.
    pub async fn commit_redo(&self, user_id: &str, target_id: &str) -> Result<Operation, ProtocolError> {
        let mut state = self.state.lock().await;
        let op = state.log.record_redo(user_id, target_id);
        self.fan_out(&state, &ServerMessage::Undo { op: op.clone() }, None)?;
        self.fan_out(&state, &ServerMessage::Log { log: state.log.log() }, None)?;
        Ok(op)
    }

    /// Full log snapshot.
    pub async fn log(&self) -> Vec<Operation> {
        self.state.lock().await.log.log()
    }

    pub async fn replay_set(&self) -> Vec<Operation> {
        self.state.lock().await.log.replay_set()
    }

    pub async fn users(&self) -> UserDirectory {
        self.state.lock().await.users.clone()
    }

    pub async fn client_count(&self) -> usize {
        self.state.lock().await.clients.len()
    }

    pub async fn has_client(&self, client_id: &ClientId) -> bool {
        self.state.lock().await.clients.contains_key(client_id)
    }

    /// Reset the log. Connections and users are kept.
    pub async fn clear(&self) {
        self.state.lock().await.log.clear();
    }

    /// How long the room has had no connections, `None` while occupied.
    pub async fn idle_for(&self) -> Option<Duration> {
        self.state.lock().await.idle_since.map(|t| t.elapsed())
    }

    pub fn stats(&self) -> BroadcastStats {
        self.relay.stats()
    }

    /// Mark closed if empty for at least `ttl`. Returns whether it closed.
    async fn close_if_idle(&self, ttl: Duration) -> bool {
        let mut state = self.state.lock().await;
        let idle = state
            .idle_since
            .is_some_and(|since| state.clients.is_empty() && since.elapsed() >= ttl);
        if idle {
            state.closed = true;
        }
        idle
    }
}

/// Send a reply to a single connection, logging delivery failure.
fn deliver_reply(sink: &SinkHandle, msg: &ServerMessage, room_id: &str) -> Result<(), ProtocolError> {
    let frame: Arc<str> = Arc::from(msg.encode()?);
    if let Err(e) = sink.deliver(frame) {
        log::warn!("Failed to deliver {} reply in room {room_id}: {e}", msg.type_name());
    }
    Ok(())
}

/// Maps room ids to rooms. Rooms are created on first reference.
///
/// Constructed once per server and shared by every connection.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Get the room for `room_id`, creating an empty one on first use.
    pub async fn get_or_create(&self, room_id: &str) -> Arc<Room> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(room_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(room_id) {
            return room.clone();
        }

        log::info!("Creating room {room_id}");
        let room = Arc::new(Room::new(room_id));
        rooms.insert(room_id.to_string(), room.clone());
        room
    }

    pub async fn get(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn room_ids(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }

    /// Drop rooms that have had no connections for at least `ttl`.
    ///
    /// Occupied rooms are never evicted. Returns the evicted room ids.
    pub async fn evict_idle(&self, ttl: Duration) -> Vec<String> {
        let mut rooms = self.rooms.write().await;
        let mut evicted = Vec::new();
        for (room_id, room) in rooms.iter() {
            if room.close_if_idle(ttl).await {
                evicted.push(room_id.clone());
            }
        }
        for room_id in &evicted {
            rooms.remove(room_id);
            log::info!("Evicted idle room {room_id}");
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Point;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn client() -> (ClientId, SinkHandle, mpsc::UnboundedReceiver<Arc<str>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Uuid::new_v4(), Arc::new(tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Arc<str>>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(ServerMessage::decode(&frame).unwrap());
        }
        out
    }

    fn types(msgs: &[ServerMessage]) -> Vec<&'static str> {
        msgs.iter().map(ServerMessage::type_name).collect()
    }

    fn stroke(id: &str) -> StrokeDraft {
        StrokeDraft::new(vec![Point::new(0.0, 0.0)]).with_id(id)
    }

    #[tokio::test]
    async fn test_registry_get_or_create_idempotent() {
        let registry = RoomRegistry::new();
        let a = registry.get_or_create("r1").await;
        let b = registry.get_or_create("r1").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.room_count().await, 1);

        registry.get_or_create("r2").await;
        let mut ids = registry.room_ids().await;
        ids.sort();
        assert_eq!(ids, vec!["r1", "r2"]);
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let registry = RoomRegistry::new();
        let r1 = registry.get_or_create("r1").await;
        let r2 = registry.get_or_create("r2").await;
        let (_, sink, _rx) = client();

        r1.commit_stroke(stroke("s1"), "u1", &sink).await.unwrap();
        assert_eq!(r1.log().await.len(), 1);
        assert!(r2.log().await.is_empty());
    }

    #[tokio::test]
    async fn test_user_directory_first_write_wins_and_survives_leave() {
        let room = Room::new("r1");
        let (id_a, sink_a, _rx_a) = client();
        let (id_b, sink_b, _rx_b) = client();

        assert!(room.add_client(id_a, sink_a, "u1", UserInfo::new("Ada", "#111111")).await);
        assert!(!room.add_client(id_b, sink_b, "u1", UserInfo::new("Other", "#222222")).await);
        assert_eq!(room.users().await["u1"], UserInfo::new("Ada", "#111111"));

        assert!(room.remove_client(&id_a).await);
        assert!(!room.remove_client(&id_a).await);
        assert_eq!(room.client_count().await, 1);
        assert!(room.users().await.contains_key("u1"));
    }

    #[tokio::test]
    async fn test_join_replies_and_announces() {
        let room = Room::new("r1");
        let (id_a, sink_a, mut rx_a) = client();
        let (id_b, sink_b, mut rx_b) = client();
        let ack = sink_a.clone();

        room.join(id_a, sink_a, "u1", UserInfo::new("Ada", "#111111")).await.unwrap();
        room.commit_stroke(stroke("s1"), "u1", &ack).await.unwrap();
        drain(&mut rx_a);

        room.join(id_b, sink_b, "u2", UserInfo::new("Bob", "#222222")).await.unwrap();
        match drain(&mut rx_b).as_slice() {
            [ServerMessage::Join { user_id, users, log }] => {
                assert_eq!(user_id, "u2");
                assert_eq!(users.len(), 2);
                assert_eq!(log.len(), 1);
                assert_eq!(log[0].seq, 1);
            }
            other => panic!("unexpected frames {other:?}"),
        }
        assert_eq!(types(&drain(&mut rx_a)), vec!["users"]);
    }

    #[tokio::test]
    async fn test_commit_stroke_broadcasts_to_all_and_acks_sender() {
        let room = Room::new("r1");
        let (id_a, sink_a, mut rx_a) = client();
        let (id_b, sink_b, mut rx_b) = client();
        room.add_client(id_a, sink_a.clone(), "u1", UserInfo::new("Ada", "#1")).await;
        room.add_client(id_b, sink_b, "u2", UserInfo::new("Bob", "#2")).await;

        let op = room.commit_stroke(stroke("s1"), "u1", &sink_a).await.unwrap();
        assert_eq!(op.seq, 1);
        assert_eq!(types(&drain(&mut rx_a)), vec!["stroke_end", "stroke_ack"]);
        assert_eq!(types(&drain(&mut rx_b)), vec!["stroke_end"]);
    }

    #[tokio::test]
    async fn test_undo_and_redo_frame_order() {
        let room = Room::new("r1");
        let (id_a, sink_a, mut rx_a) = client();
        room.add_client(id_a, sink_a.clone(), "u1", UserInfo::new("Ada", "#1")).await;
        room.commit_stroke(stroke("s1"), "u1", &sink_a).await.unwrap();
        drain(&mut rx_a);

        let undo = room.commit_undo("u1", "s1").await.unwrap();
        assert_eq!(undo.seq, 2);
        assert!(room.replay_set().await.is_empty());
        let frames = drain(&mut rx_a);
        assert_eq!(types(&frames), vec!["log", "undo"]);
        match &frames[0] {
            ServerMessage::Log { log } => assert_eq!(log.len(), 2),
            other => panic!("expected log, got {other:?}"),
        }

        let redo = room.commit_redo("u1", "s1").await.unwrap();
        assert_eq!(redo.seq, 3);
        assert_eq!(room.replay_set().await.len(), 1);
        let frames = drain(&mut rx_a);
        assert_eq!(types(&frames), vec!["undo", "log"]);
        match &frames[0] {
            ServerMessage::Undo { op } => assert_eq!(op.id, redo.id),
            other => panic!("expected marker, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_leave_announces_to_remaining() {
        let room = Room::new("r1");
        let (id_a, sink_a, mut rx_a) = client();
        let (id_b, sink_b, mut rx_b) = client();
        room.add_client(id_a, sink_a, "u1", UserInfo::new("Ada", "#1")).await;
        room.add_client(id_b, sink_b, "u2", UserInfo::new("Bob", "#2")).await;

        assert!(room.leave(&id_a, "u1").await.unwrap());
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(
            drain(&mut rx_b),
            vec![ServerMessage::UserLeft { user_id: "u1".into() }]
        );
        assert!(!room.leave(&id_a, "u1").await.unwrap());
    }

    #[tokio::test]
    async fn test_evict_idle_spares_occupied_rooms() {
        let registry = RoomRegistry::new();
        let busy = registry.get_or_create("busy").await;
        let empty = registry.get_or_create("empty").await;
        let (id, sink, _rx) = client();
        busy.add_client(id, sink.clone(), "u1", UserInfo::new("Ada", "#1")).await;

        let evicted = registry.evict_idle(Duration::ZERO).await;
        assert_eq!(evicted, vec!["empty".to_string()]);
        assert!(registry.get("busy").await.is_some());
        assert!(registry.get("empty").await.is_none());

        // A stale handle to an evicted room refuses new joins.
        assert!(!empty.join(Uuid::new_v4(), sink, "u2", UserInfo::new("Bob", "#2")).await.unwrap());
    }

    #[tokio::test]
    async fn test_evict_idle_respects_ttl() {
        let registry = RoomRegistry::new();
        registry.get_or_create("r1").await;
        assert!(registry.evict_idle(Duration::from_secs(3600)).await.is_empty());
        assert_eq!(registry.room_count().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_commits_are_dense_and_broadcast_in_seq_order() {
        const WRITERS: usize = 64;
        let room = Arc::new(Room::new("r1"));
        let (watcher, watcher_sink, mut watcher_rx) = client();
        room.add_client(watcher, watcher_sink, "watcher", UserInfo::new("W", "#0")).await;

        let handles: Vec<_> = (0..WRITERS)
            .map(|i| {
                let room = room.clone();
                tokio::spawn(async move {
                    let (_, reply, _rx) = client();
                    let user_id = format!("u{i}");
                    room.commit_stroke(stroke(&format!("s{i}")), &user_id, &reply)
                        .await
                        .unwrap()
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let seqs: Vec<u64> = room.log().await.iter().map(|op| op.seq).collect();
        assert_eq!(seqs, (1..=WRITERS as u64).collect::<Vec<_>>());

        let broadcast_seqs: Vec<u64> = drain(&mut watcher_rx)
            .into_iter()
            .map(|msg| match msg {
                ServerMessage::StrokeEnd { op } => op.seq,
                other => panic!("unexpected frame {other:?}"),
            })
            .collect();
        assert_eq!(broadcast_seqs, seqs);
    }

    #[tokio::test]
    async fn test_clear_keeps_connections() {
        let room = Room::new("r1");
        let (id, sink, _rx) = client();
        room.add_client(id, sink.clone(), "u1", UserInfo::new("Ada", "#1")).await;
        room.commit_stroke(stroke("s1"), "u1", &sink).await.unwrap();

        room.clear().await;
        assert!(room.log().await.is_empty());
        assert!(room.has_client(&id).await);
        let op = room.commit_stroke(stroke("s2"), "u1", &sink).await.unwrap();
        assert_eq!(op.seq, 1);
    }
}
