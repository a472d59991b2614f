//! Room fan-out with per-recipient failure isolation.
//!
//! A message is serialized once and handed to every recipient's
//! [`ClientSink`] independently. A failed delivery is recorded in the
//! returned [`BroadcastReport`] and never stops delivery to the rest.
//!
//! Connection sinks are bounded queues drained by the connection's writer
//! task. Delivery is a non-blocking `try_send`, so a slow consumer shows up
//! as [`DeliveryError::QueueFull`] instead of stalling the room.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{ProtocolError, ServerMessage};

/// Transport-level connection id, unique per WebSocket.
pub type ClientId = Uuid;

/// Shared handle to a connection's outbound queue.
pub type SinkHandle = Arc<dyn ClientSink>;

/// Why a single delivery failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("outbound queue full")]
    QueueFull,
    #[error("connection closed")]
    Closed,
}

/// Destination for encoded frames.
pub trait ClientSink: Send + Sync {
    fn deliver(&self, frame: Arc<str>) -> Result<(), DeliveryError>;
}

impl ClientSink for mpsc::Sender<Arc<str>> {
    fn deliver(&self, frame: Arc<str>) -> Result<(), DeliveryError> {
        self.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

impl ClientSink for mpsc::UnboundedSender<Arc<str>> {
    fn deliver(&self, frame: Arc<str>) -> Result<(), DeliveryError> {
        self.send(frame).map_err(|_| DeliveryError::Closed)
    }
}

/// Result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub client_id: ClientId,
    pub result: Result<(), DeliveryError>,
}

/// Per-recipient outcomes of one broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub outcomes: Vec<DeliveryOutcome>,
}

impl BroadcastReport {
    /// Number of recipients that accepted the frame.
    pub fn delivered(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = (ClientId, DeliveryError)> + '_ {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.err().map(|e| (o.client_id, e)))
    }

    pub fn is_clean(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    /// Log every failed delivery.
    pub fn log_failures(&self, room_id: &str, msg_type: &str) {
        for (client_id, err) in self.failures() {
            log::warn!("Failed to deliver {msg_type} to {client_id} in room {room_id}: {err}");
        }
    }
}

/// Snapshot of relay counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub deliveries: u64,
    pub delivery_failures: u64,
}

#[derive(Debug, Default)]
struct AtomicBroadcastStats {
    frames_sent: AtomicU64,
    deliveries: AtomicU64,
    delivery_failures: AtomicU64,
}

/// Fan-out engine for one room.
#[derive(Debug, Default)]
pub struct Relay {
    stats: AtomicBroadcastStats,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize `msg` once and deliver it to every recipient except `exclude`.
    pub fn broadcast<'a, I>(
        &self,
        msg: &ServerMessage,
        recipients: I,
        exclude: Option<ClientId>,
    ) -> Result<BroadcastReport, ProtocolError>
    where
        I: IntoIterator<Item = (&'a ClientId, &'a SinkHandle)>,
    {
        let frame: Arc<str> = Arc::from(msg.encode()?);
        Ok(self.fan_out(frame, recipients, exclude))
    }

    /// Deliver a pre-encoded frame. Each recipient is attempted independently.
    pub fn fan_out<'a, I>(
        &self,
        frame: Arc<str>,
        recipients: I,
        exclude: Option<ClientId>,
    ) -> BroadcastReport
    where
        I: IntoIterator<Item = (&'a ClientId, &'a SinkHandle)>,
    {
        let outcomes: Vec<DeliveryOutcome> = recipients
            .into_iter()
            .filter(|(client_id, _)| Some(**client_id) != exclude)
            .map(|(client_id, sink)| DeliveryOutcome {
                client_id: *client_id,
                result: sink.deliver(frame.clone()),
            })
            .collect();

        let failed = outcomes.iter().filter(|o| o.result.is_err()).count() as u64;
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.stats
            .deliveries
            .fetch_add(outcomes.len() as u64 - failed, Ordering::Relaxed);
        self.stats.delivery_failures.fetch_add(failed, Ordering::Relaxed);

        BroadcastReport { outcomes }
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            deliveries: self.stats.deliveries.load(Ordering::Relaxed),
            delivery_failures: self.stats.delivery_failures.load(Ordering::Relaxed),
        }
    }
}
