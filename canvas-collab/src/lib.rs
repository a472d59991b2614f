//! # canvas-collab: Real-time collaborative drawing relay
//!
//! Clients draw on a shared canvas per room. The server keeps one
//! append-only operation log per room and relays live events to everyone
//! in it. Undo and redo are tombstone markers in the same log, so any
//! client can rebuild the canvas from the log alone.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ CanvasClient │ ◄────────────────► │ RelayServer  │
//! │ (per user)   │    JSON frames     │ (central)    │
//! └──────┬───────┘                    └──────┬───────┘
//!        │                                   │ Session (per connection)
//!        ▼                                   ▼
//! ┌──────────────┐                    ┌──────────────┐
//! │ CanvasReplica│                    │ RoomRegistry │
//! │ (local view) │                    └──────┬───────┘
//! └──────────────┘                           │
//!                                    ┌───────┴───────┐
//!                                    │ Room          │
//!                                    │ OperationLog  │
//!                                    │ Relay fan-out │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire envelopes and operation types
//! - [`oplog`]: Per-room operation log and replay
//! - [`broadcast`]: Fan-out with per-recipient failure isolation
//! - [`room`]: Room state and the room registry
//! - [`session`]: Per-connection message dispatch
//! - [`server`]: WebSocket relay server
//! - [`client`]: WebSocket client
//! - [`replica`]: Client-side canvas materialization

pub mod protocol;
pub mod oplog;
pub mod broadcast;
pub mod room;
pub mod session;
pub mod server;
pub mod client;
pub mod replica;

// Re-exports for convenience
pub use protocol::{
    ClientMessage, JoinRequest, Marker, OpBody, OpKind, Operation, Point, ProtocolError,
    ServerMessage, Stroke, StrokeDraft, StrokeMode, UserDirectory, UserInfo,
};
pub use oplog::{replay, OperationLog};
pub use broadcast::{BroadcastReport, BroadcastStats, ClientId, ClientSink, DeliveryError, Relay};
pub use room::{Room, RoomRegistry};
pub use session::{Session, SessionState};
pub use server::{ConfigError, RelayServer, ServerConfig, ServerStats};
pub use client::{CanvasClient, ConnectionState};
pub use replica::CanvasReplica;
