//! Append-only operation log for one room.
//!
//! Strokes and undo/redo markers share one sequence space. Markers never
//! touch the stroke they reference; visibility is derived on demand by
//! [`replay`], a pure function over a log slice:
//!
//! ```text
//! seq:   1         2          3          4
//!        stroke s1 undo(s1)   redo(s1)   undo(s1)
//! tombstones after scan: {s1}  →  replay set: []
//! ```
//!
//! Because tombstones are a set, the most recent marker naming a target
//! decides whether it is visible.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::protocol::{
    Marker, OpBody, Operation, Stroke, StrokeDraft, DEFAULT_STROKE_COLOR, DEFAULT_STROKE_WIDTH,
};

/// Current wall-clock time in Unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Fresh opaque operation id.
pub fn new_op_id() -> String {
    Uuid::new_v4().to_string()
}

/// Strokes of `ops` that are not tombstoned, in log order.
///
/// Scans the whole slice once to build the tombstone set, then filters.
/// No state survives between calls.
pub fn replay(ops: &[Operation]) -> Vec<Operation> {
    let mut tombstoned: HashSet<&str> = HashSet::new();
    for op in ops {
        match &op.body {
            OpBody::Undo(marker) => {
                tombstoned.insert(marker.target_id.as_str());
            }
            OpBody::Redo(marker) => {
                tombstoned.remove(marker.target_id.as_str());
            }
            OpBody::Stroke(_) => {}
        }
    }

    ops.iter()
        .filter(|op| matches!(op.body, OpBody::Stroke(_)) && !tombstoned.contains(op.id.as_str()))
        .cloned()
        .collect()
}

/// Room-scoped, append-only operation log.
#[derive(Debug, Clone)]
pub struct OperationLog {
    ops: Vec<Operation>,
    next_seq: u64,
}

impl Default for OperationLog {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationLog {
    pub fn new() -> Self {
        Self {
            ops: Vec::new(),
            next_seq: 1,
        }
    }

    /// Finalize a stroke draft and append it.
    ///
    /// Assigns an id when the draft has none and always assigns the next
    /// sequence number. Empty `points` are stored as-is.
    pub fn append(&mut self, draft: StrokeDraft, user_id: &str) -> Operation {
        let stroke_width = draft.resolved_width().unwrap_or(DEFAULT_STROKE_WIDTH);
        let timestamp = draft.resolved_timestamp().unwrap_or_else(now_millis);
        let body = OpBody::Stroke(Stroke {
            points: draft.points,
            color: draft.color.unwrap_or_else(|| DEFAULT_STROKE_COLOR.to_string()),
            stroke_width,
            mode: draft.mode.unwrap_or_default(),
            timestamp,
        });
        let id = draft.id.filter(|id| !id.is_empty()).unwrap_or_else(new_op_id);
        self.push(id, user_id, body)
    }

    /// Append an undo marker for `target_id`. The target is not validated.
    pub fn record_undo(&mut self, user_id: &str, target_id: &str) -> Operation {
        let body = OpBody::Undo(Marker {
            target_id: target_id.to_string(),
            timestamp: now_millis(),
        });
        self.push(new_op_id(), user_id, body)
    }

    /// Append a redo marker for `target_id`. The target is not validated.
    pub fn record_redo(&mut self, user_id: &str, target_id: &str) -> Operation {
        let body = OpBody::Redo(Marker {
            target_id: target_id.to_string(),
            timestamp: now_millis(),
        });
        self.push(new_op_id(), user_id, body)
    }

    fn push(&mut self, id: String, user_id: &str, body: OpBody) -> Operation {
        let op = Operation {
            id,
            seq: self.next_seq,
            user_id: user_id.to_string(),
            body,
        };
        self.next_seq += 1;
        self.ops.push(op.clone());
        op
    }

    /// Owned snapshot of every operation ever appended.
    pub fn log(&self) -> Vec<Operation> {
        self.ops.clone()
    }

    /// Borrowed view of the log.
    pub fn ops(&self) -> &[Operation] {
        &self.ops
    }

    /// Currently visible strokes in `seq` order.
    pub fn replay_set(&self) -> Vec<Operation> {
        replay(&self.ops)
    }

    /// Replay set of the log prefix with `seq <= seq`.
    pub fn replay_through(&self, seq: u64) -> Vec<Operation> {
        let end = self.ops.partition_point(|op| op.seq <= seq);
        replay(&self.ops[..end])
    }

    /// Most recently appended operation with the given id.
    pub fn get(&self, id: &str) -> Option<&Operation> {
        self.ops.iter().rev().find(|op| op.id == id)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Sequence number the next append will receive.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Drop every operation and restart sequencing at 1.
    ///
    /// Full room reset only; undo/redo never call this.
    pub fn clear(&mut self) {
        self.ops.clear();
        self.next_seq = 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{OpKind, Point, StrokeMode};

    fn draft(id: &str) -> StrokeDraft {
        StrokeDraft::new(vec![Point::new(0.0, 0.0), Point::new(5.0, 5.0)]).with_id(id)
    }

    fn ids(ops: &[Operation]) -> Vec<&str> {
        ops.iter().map(|op| op.id.as_str()).collect()
    }

    #[test]
    fn test_seq_starts_at_one_and_is_dense() {
        let mut log = OperationLog::new();
        let a = log.append(draft("a"), "u1");
        let m = log.record_undo("u1", "a");
        let b = log.append(draft("b"), "u2");
        let r = log.record_redo("u2", "a");

        assert_eq!(
            [a.seq, m.seq, b.seq, r.seq],
            [1, 2, 3, 4]
        );
        assert_eq!(log.next_seq(), 5);
        let seqs: Vec<u64> = log.log().iter().map(|op| op.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_append_fills_defaults() {
        let mut log = OperationLog::new();
        let op = log.append(StrokeDraft::new(vec![Point::new(1.0, 1.0)]), "u1");

        assert!(!op.id.is_empty());
        assert_eq!(op.user_id, "u1");
        let stroke = op.as_stroke().unwrap();
        assert_eq!(stroke.color, DEFAULT_STROKE_COLOR);
        assert_eq!(stroke.stroke_width, DEFAULT_STROKE_WIDTH);
        assert_eq!(stroke.mode, StrokeMode::Brush);
        assert!(stroke.timestamp > 0);
    }

    #[test]
    fn test_append_uses_legacy_width_and_ts() {
        let mut log = OperationLog::new();
        let draft: StrokeDraft =
            serde_json::from_str(r#"{"points":[{"x":1,"y":1}],"width":9,"ts":1700000000000}"#).unwrap();
        let op = log.append(draft, "u1");
        let stroke = op.as_stroke().unwrap();
        assert_eq!(stroke.stroke_width, 9.0);
        assert_eq!(stroke.timestamp, 1_700_000_000_000);
    }

    #[test]
    fn test_append_accepts_empty_points() {
        let mut log = OperationLog::new();
        let op = log.append(StrokeDraft::default(), "u1");
        assert_eq!(log.len(), 1);
        assert!(op.as_stroke().unwrap().points.is_empty());
        assert_eq!(log.replay_set().len(), 1);
    }

    #[test]
    fn test_snapshot_does_not_alias() {
        let mut log = OperationLog::new();
        log.append(draft("a"), "u1");
        let snapshot = log.log();
        log.append(draft("b"), "u1");
        log.record_undo("u1", "a");

        assert_eq!(ids(&snapshot), vec!["a"]);
        assert_eq!(snapshot[0], log.log()[0]);
    }

    #[test]
    fn test_last_marker_wins() {
        let mut log = OperationLog::new();
        log.append(draft("s"), "u1");
        log.record_undo("u1", "s");
        log.record_redo("u1", "s");
        log.record_undo("u1", "s");
        assert!(log.replay_set().is_empty());

        log.record_redo("u1", "s");
        assert_eq!(ids(&log.replay_set()), vec!["s"]);
    }

    #[test]
    fn test_repeated_undo_needs_one_redo() {
        let mut log = OperationLog::new();
        log.append(draft("s"), "u1");
        log.record_undo("u1", "s");
        log.record_undo("u2", "s");
        log.record_redo("u1", "s");
        assert_eq!(ids(&log.replay_set()), vec!["s"]);
    }

    #[test]
    fn test_dangling_undo_is_inert() {
        let mut log = OperationLog::new();
        log.append(draft("a"), "u1");
        let before = log.replay_set();

        let marker = log.record_undo("u1", "nonexistent-id");
        assert_eq!(marker.kind(), OpKind::Undo);
        assert_eq!(log.len(), 2);
        assert_eq!(log.replay_set(), before);
    }

    #[test]
    fn test_replay_is_deterministic_and_ordered() {
        let mut log = OperationLog::new();
        for id in ["a", "b", "c", "d"] {
            log.append(draft(id), "u1");
        }
        log.record_undo("u1", "b");

        let first = log.replay_set();
        let second = log.replay_set();
        assert_eq!(first, second);
        assert_eq!(ids(&first), vec!["a", "c", "d"]);
        assert!(first.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[test]
    fn test_replay_through_reconstructs_past_states() {
        let mut log = OperationLog::new();
        log.append(draft("a"), "u1"); // 1
        log.append(draft("b"), "u1"); // 2
        log.record_undo("u1", "a"); // 3
        log.record_redo("u1", "a"); // 4

        assert!(log.replay_through(0).is_empty());
        assert_eq!(ids(&log.replay_through(2)), vec!["a", "b"]);
        assert_eq!(ids(&log.replay_through(3)), vec!["b"]);
        assert_eq!(ids(&log.replay_through(4)), vec!["a", "b"]);
        assert_eq!(log.replay_through(100), log.replay_set());
    }

    #[test]
    fn test_get_finds_by_id() {
        let mut log = OperationLog::new();
        log.append(draft("a"), "u1");
        let marker = log.record_undo("u1", "a");
        assert_eq!(log.get("a").unwrap().seq, 1);
        assert_eq!(log.get(&marker.id).unwrap().target_id(), Some("a"));
        assert!(log.get("zzz").is_none());
    }

    #[test]
    fn test_clear_resets_sequence() {
        let mut log = OperationLog::new();
        log.append(draft("a"), "u1");
        log.record_undo("u1", "a");
        log.clear();

        assert!(log.is_empty());
        assert_eq!(log.append(draft("b"), "u1").seq, 1);
    }
}
