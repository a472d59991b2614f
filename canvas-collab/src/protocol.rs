//! JSON wire protocol for the shared canvas.
//!
//! Every frame is a newline-free JSON envelope:
//! ```text
//! { "type": "<message type>", "payload": { ... } }
//! ```
//!
//! Operations travel in their log form, tagged by `kind`:
//! ```text
//! stroke: { id, seq, kind:"stroke", userId, points:[{x,y},...], color, strokeWidth, mode, timestamp }
//! undo:   { id, seq, kind:"undo",   userId, targetId, timestamp }
//! redo:   { id, seq, kind:"redo",   userId, targetId, timestamp }
//! ```
//!
//! Inbound frames are parsed in two phases: the envelope first, then the
//! typed payload for known message types. Unknown types are kept raw so the
//! dispatcher can pass them through.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Stroke color used when a draft carries none.
pub const DEFAULT_STROKE_COLOR: &str = "#000000";

/// Stroke width used when a draft carries none.
pub const DEFAULT_STROKE_WIDTH: f64 = 4.0;

// ───────────────────────────────────────────────────────────────────
// Operations
// ───────────────────────────────────────────────────────────────────

/// 2D point in canvas coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// How a stroke is composited by the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrokeMode {
    #[default]
    Brush,
    Eraser,
}

/// A committed freehand stroke.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stroke {
    pub points: Vec<Point>,
    pub color: String,
    pub stroke_width: f64,
    pub mode: StrokeMode,
    /// Unix milliseconds.
    pub timestamp: u64,
}

/// Body of an undo/redo tombstone marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Marker {
    /// Id of the operation being toggled. Never validated.
    pub target_id: String,
    pub timestamp: u64,
}

/// Kind-specific part of an operation, tagged by `kind` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OpBody {
    Stroke(Stroke),
    Undo(Marker),
    Redo(Marker),
}

/// Operation kind without its body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Stroke,
    Undo,
    Redo,
}

/// One immutable entry of a room's operation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: String,
    /// Room-local sequence number, starting at 1.
    pub seq: u64,
    pub user_id: String,
    #[serde(flatten)]
    pub body: OpBody,
}

impl Operation {
    pub fn kind(&self) -> OpKind {
        match self.body {
            OpBody::Stroke(_) => OpKind::Stroke,
            OpBody::Undo(_) => OpKind::Undo,
            OpBody::Redo(_) => OpKind::Redo,
        }
    }

    pub fn as_stroke(&self) -> Option<&Stroke> {
        match &self.body {
            OpBody::Stroke(stroke) => Some(stroke),
            _ => None,
        }
    }

    /// Target id for undo/redo markers, `None` for strokes.
    pub fn target_id(&self) -> Option<&str> {
        match &self.body {
            OpBody::Undo(marker) | OpBody::Redo(marker) => Some(&marker.target_id),
            OpBody::Stroke(_) => None,
        }
    }
}

/// A stroke as submitted by a client in `stroke_end`.
///
/// Only `points` is meaningful on its own; everything else is filled in at
/// append time. Client-supplied `seq`, `userId` and `kind` are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrokeDraft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub points: Vec<Point>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stroke_width: Option<f64>,
    /// Older clients send `width`; used only when `strokeWidth` is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<StrokeMode>,
    #[serde(
        default,
        deserialize_with = "lenient_millis",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<u64>,
    /// Older clients send `ts`; used only when `timestamp` is absent.
    #[serde(
        default,
        deserialize_with = "lenient_millis",
        skip_serializing_if = "Option::is_none"
    )]
    pub ts: Option<u64>,
}

impl StrokeDraft {
    pub fn new(points: Vec<Point>) -> Self {
        Self {
            points,
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// `strokeWidth`, else `width`.
    pub fn resolved_width(&self) -> Option<f64> {
        self.stroke_width.or(self.width)
    }

    /// `timestamp`, else `ts`.
    pub fn resolved_timestamp(&self) -> Option<u64> {
        self.timestamp.or(self.ts)
    }
}

/// Unix milliseconds from any JSON number. Fractions are truncated;
/// negative or non-finite values count as absent.
fn lenient_millis<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<f64>::deserialize(deserializer)?;
    Ok(value.filter(|v| v.is_finite() && *v >= 0.0).map(|v| v as u64))
}

// ───────────────────────────────────────────────────────────────────
// Users
// ───────────────────────────────────────────────────────────────────

/// Presence metadata for one participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub name: String,
    pub color: String,
}

impl UserInfo {
    pub fn new(name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: color.into(),
        }
    }

    /// Stable, vivid `#rrggbb` color derived from a user id.
    ///
    /// The hue comes from an FNV-1a hash of the id so the same user gets the
    /// same color across connections and process restarts.
    pub fn color_for(user_id: &str) -> String {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in user_id.bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        let hue = (hash % 360) as f32 / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.5);
        format!(
            "#{:02x}{:02x}{:02x}",
            (r * 255.0).round() as u8,
            (g * 255.0).round() as u8,
            (b * 255.0).round() as u8
        )
    }
}

/// Known users of a room, keyed by user id.
pub type UserDirectory = BTreeMap<String, UserInfo>;

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Client → server
// ───────────────────────────────────────────────────────────────────

/// Payload of a `join` request. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl JoinRequest {
    pub fn room(room_id: impl Into<String>) -> Self {
        Self {
            room_id: Some(room_id.into()),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointerMove {
    pub point: Point,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpRef {
    op_id: String,
}

/// A parsed inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Join(JoinRequest),
    PointerMove(PointerMove),
    /// In-progress stroke preview; forwarded verbatim plus `userId`.
    StrokeStart(Map<String, Value>),
    StrokeUpdate(Map<String, Value>),
    StrokeEnd(StrokeDraft),
    GetLog,
    Undo { op_id: String },
    Redo { op_id: String },
    /// Unrecognised type; holds the whole raw envelope.
    Other(Value),
}

impl ClientMessage {
    /// Parse one inbound text frame.
    ///
    /// When the envelope has no `payload`, the envelope object itself is
    /// used as the payload.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let Value::Object(fields) = envelope else {
            return Err(ProtocolError::Malformed("envelope is not an object".into()));
        };
        let kind = match fields.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            _ => return Err(ProtocolError::MissingType),
        };
        let payload = match fields.get("payload") {
            Some(payload) if !payload.is_null() => payload.clone(),
            _ => Value::Object(fields.clone()),
        };

        match kind.as_str() {
            "join" => typed_payload(&kind, payload).map(Self::Join),
            "pointer_move" => typed_payload(&kind, payload).map(Self::PointerMove),
            "stroke_start" => typed_payload(&kind, payload).map(Self::StrokeStart),
            "stroke_update" => typed_payload(&kind, payload).map(Self::StrokeUpdate),
            "stroke_end" => {
                let draft = match payload {
                    Value::Object(mut body) => match body.remove("op") {
                        Some(op @ Value::Object(_)) => op,
                        _ => Value::Object(body),
                    },
                    other => other,
                };
                typed_payload(&kind, draft).map(Self::StrokeEnd)
            }
            "get_log" => Ok(Self::GetLog),
            "undo" => typed_payload::<OpRef>(&kind, payload).map(|r| Self::Undo { op_id: r.op_id }),
            "redo" => typed_payload::<OpRef>(&kind, payload).map(|r| Self::Redo { op_id: r.op_id }),
            _ => Ok(Self::Other(Value::Object(fields))),
        }
    }

    /// Wire type name of this message.
    pub fn type_name(&self) -> &str {
        match self {
            Self::Join(_) => "join",
            Self::PointerMove(_) => "pointer_move",
            Self::StrokeStart(_) => "stroke_start",
            Self::StrokeUpdate(_) => "stroke_update",
            Self::StrokeEnd(_) => "stroke_end",
            Self::GetLog => "get_log",
            Self::Undo { .. } => "undo",
            Self::Redo { .. } => "redo",
            Self::Other(raw) => raw.get("type").and_then(Value::as_str).unwrap_or("unknown"),
        }
    }

    /// Encode to a text frame (client side).
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let frame = match self {
            Self::Join(request) => json!({ "type": "join", "payload": request }),
            Self::PointerMove(pointer) => json!({ "type": "pointer_move", "payload": pointer }),
            Self::StrokeStart(body) => json!({ "type": "stroke_start", "payload": body }),
            Self::StrokeUpdate(body) => json!({ "type": "stroke_update", "payload": body }),
            Self::StrokeEnd(draft) => json!({ "type": "stroke_end", "payload": { "op": draft } }),
            Self::GetLog => json!({ "type": "get_log", "payload": {} }),
            Self::Undo { op_id } => json!({ "type": "undo", "payload": { "opId": op_id } }),
            Self::Redo { op_id } => json!({ "type": "redo", "payload": { "opId": op_id } }),
            Self::Other(raw) => raw.clone(),
        };
        serde_json::to_string(&frame).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

fn typed_payload<T: DeserializeOwned>(kind: &str, payload: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(payload).map_err(|e| ProtocolError::InvalidPayload {
        kind: kind.to_string(),
        reason: e.to_string(),
    })
}

// ───────────────────────────────────────────────────────────────────
// Server → client
// ───────────────────────────────────────────────────────────────────

/// Outbound message, encoded as `{type, payload}`.
///
/// `redo` has no frame of its own: a recorded redo marker is announced in an
/// `undo` frame whose `op.kind` is `"redo"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    Welcome {
        client_id: String,
    },
    Join {
        user_id: String,
        users: UserDirectory,
        log: Vec<Operation>,
    },
    Users(UserDirectory),
    PointerMove {
        user_id: String,
        point: Point,
        name: String,
        color: Option<String>,
    },
    StrokeStart(Map<String, Value>),
    StrokeUpdate(Map<String, Value>),
    StrokeEnd {
        op: Operation,
    },
    StrokeAck {
        op: Operation,
    },
    Log {
        log: Vec<Operation>,
    },
    Undo {
        op: Operation,
    },
    UserLeft {
        user_id: String,
    },
    /// Generic passthrough of an unrecognised inbound envelope.
    Message(Value),
}

impl ServerMessage {
    /// Serialize to a text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from a text frame (client side).
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Welcome { .. } => "welcome",
            Self::Join { .. } => "join",
            Self::Users(_) => "users",
            Self::PointerMove { .. } => "pointer_move",
            Self::StrokeStart(_) => "stroke_start",
            Self::StrokeUpdate(_) => "stroke_update",
            Self::StrokeEnd { .. } => "stroke_end",
            Self::StrokeAck { .. } => "stroke_ack",
            Self::Log { .. } => "log",
            Self::Undo { .. } => "undo",
            Self::UserLeft { .. } => "user_left",
            Self::Message(_) => "message",
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("message has no string `type`")]
    MissingType,
    #[error("invalid `{kind}` payload: {reason}")]
    InvalidPayload { kind: String, reason: String },
    #[error("connection closed")]
    ConnectionClosed,
}
