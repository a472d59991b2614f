//! Client-side materialization of a room's canvas.
//!
//! A replica follows the live message stream (`stroke_end`, `stroke_ack` and
//! `undo` frames) incrementally, and can be rebuilt from scratch whenever a
//! full `log` arrives. Both paths produce the same visible stroke set as
//! [`replay`](crate::oplog::replay) over the server's log.

use std::collections::HashSet;

use crate::protocol::{OpBody, Operation, ServerMessage, UserDirectory};

/// Local copy of the strokes and tombstones of one room.
#[derive(Debug, Clone, Default)]
pub struct CanvasReplica {
    /// Every stroke seen, in `seq` order.
    strokes: Vec<Operation>,
    tombstoned: HashSet<String>,
    /// Highest `seq` applied.
    last_seq: u64,
    /// Our user id, learned from `join`.
    user_id: Option<String>,
    users: UserDirectory,
    /// Target of our most recent undo not yet redone.
    last_undone: Option<String>,
}

impl CanvasReplica {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one server message. Returns true when visible state changed.
    pub fn apply(&mut self, msg: &ServerMessage) -> bool {
        match msg {
            ServerMessage::Join { user_id, users, log } => {
                self.user_id = Some(user_id.clone());
                self.users = users.clone();
                self.rebuild_from_log(log);
                true
            }
            ServerMessage::Log { log } => {
                self.rebuild_from_log(log);
                true
            }
            ServerMessage::StrokeEnd { op } | ServerMessage::StrokeAck { op } | ServerMessage::Undo { op } => {
                self.apply_op(op)
            }
            ServerMessage::Users(users) => {
                self.users = users.clone();
                false
            }
            // Another connection may still share the user id; the
            // directory is only replaced by `users` and `join` snapshots.
            ServerMessage::UserLeft { .. } => false,
            _ => false,
        }
    }

    /// Apply one operation if it is newer than anything applied so far.
    ///
    /// Operations at or below the last applied `seq` are duplicates (a
    /// `stroke_ack` after its `stroke_end`, a marker already in a fetched
    /// log) and are ignored.
    pub fn apply_op(&mut self, op: &Operation) -> bool {
        if op.seq <= self.last_seq {
            return false;
        }
        self.last_seq = op.seq;

        match &op.body {
            OpBody::Stroke(_) => {
                self.strokes.push(op.clone());
            }
            OpBody::Undo(marker) => {
                self.tombstoned.insert(marker.target_id.clone());
                if self.is_own(op) {
                    self.last_undone = Some(marker.target_id.clone());
                }
            }
            OpBody::Redo(marker) => {
                self.tombstoned.remove(&marker.target_id);
                if self.last_undone.as_deref() == Some(marker.target_id.as_str()) {
                    self.last_undone = None;
                }
            }
        }
        true
    }

    /// Discard local state and re-derive it from a full log.
    pub fn rebuild_from_log(&mut self, log: &[Operation]) {
        self.strokes.clear();
        self.tombstoned.clear();
        self.last_undone = None;
        self.last_seq = 0;

        let mut ordered: Vec<&Operation> = log.iter().collect();
        ordered.sort_by_key(|op| op.seq);
        for op in ordered {
            self.apply_op(op);
        }
    }

    /// Visible strokes in `seq` order.
    pub fn visible_strokes(&self) -> Vec<&Operation> {
        self.strokes
            .iter()
            .filter(|op| !self.tombstoned.contains(&op.id))
            .collect()
    }

    pub fn is_visible(&self, op_id: &str) -> bool {
        self.strokes.iter().any(|op| op.id == op_id) && !self.tombstoned.contains(op_id)
    }

    /// Latest visible stroke by `user_id`; what an undo should target.
    pub fn last_stroke_by(&self, user_id: &str) -> Option<&Operation> {
        self.strokes
            .iter()
            .rev()
            .find(|op| op.user_id == user_id && !self.tombstoned.contains(&op.id))
    }

    /// Target of our most recent undo, if it has not been redone.
    pub fn redo_target(&self) -> Option<&str> {
        self.last_undone.as_deref()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn users(&self) -> &UserDirectory {
        &self.users
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    fn is_own(&self, op: &Operation) -> bool {
        match &self.user_id {
            Some(own) => *own == op.user_id,
            None => true,
        }
    }
}
