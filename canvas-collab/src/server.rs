//! WebSocket relay server with room-based routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                       ┌── OperationLog (seq, tombstones)
//!            ├── Session ── Room ────┤
//! Client B ──┘   (per conn)          └── Relay ──► Client A, Client B, ...
//!                    │
//!                    └── RoomRegistry (shared, created once per server)
//! ```
//!
//! Each connection runs in its own task: inbound frames are handled one at
//! a time by its [`Session`], and outbound frames are drained from a
//! bounded queue that the room's relay fills.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::room::RoomRegistry;
use crate::session::Session;

/// Server configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Room used by `join` requests without a `roomId`
    pub default_room: String,
    /// Room that messages from connections that never joined act in.
    /// `None` drops such messages instead.
    pub fallback_room: Option<String>,
    /// Outbound frames buffered per connection before deliveries fail
    pub outbound_queue_capacity: usize,
    /// Evict rooms that have had no connections for this long (None = never)
    pub idle_room_ttl: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
            default_room: "default".to_string(),
            fallback_room: Some("default".to_string()),
            outbound_queue_capacity: 256,
            idle_room_ttl: None,
        }
    }
}

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid value {value:?} for {key}")]
pub struct ConfigError {
    pub key: String,
    pub value: String,
}

impl ServerConfig {
    /// Defaults overridden by `CANVAS_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns.
    ///
    /// Keys: `CANVAS_BIND_ADDR` (or `PORT`, binding all interfaces),
    /// `CANVAS_DEFAULT_ROOM`, `CANVAS_QUEUE_CAPACITY`, `CANVAS_ROOM_TTL_SECS`
    /// and `CANVAS_STRICT_JOIN` (`1`/`true` disables the fallback room).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("CANVAS_BIND_ADDR") {
            config.bind_addr = addr;
        } else if let Some(port) = lookup("PORT") {
            let port: u16 = parse_value("PORT", &port)?;
            config.bind_addr = format!("0.0.0.0:{port}");
        }
        if let Some(room) = lookup("CANVAS_DEFAULT_ROOM") {
            config.fallback_room = Some(room.clone());
            config.default_room = room;
        }
        if let Some(capacity) = lookup("CANVAS_QUEUE_CAPACITY") {
            let capacity: usize = parse_value("CANVAS_QUEUE_CAPACITY", &capacity)?;
            if capacity == 0 {
                return Err(ConfigError {
                    key: "CANVAS_QUEUE_CAPACITY".into(),
                    value: "0".into(),
                });
            }
            config.outbound_queue_capacity = capacity;
        }
        if let Some(secs) = lookup("CANVAS_ROOM_TTL_SECS") {
            let secs: u64 = parse_value("CANVAS_ROOM_TTL_SECS", &secs)?;
            config.idle_room_ttl = Some(Duration::from_secs(secs));
        }
        if let Some(strict) = lookup("CANVAS_STRICT_JOIN") {
            if parse_flag("CANVAS_STRICT_JOIN", &strict)? {
                config.fallback_room = None;
            }
        }
        Ok(config)
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub malformed_messages: u64,
    pub active_rooms: usize,
}

#[derive(Debug, Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    malformed_messages: AtomicU64,
}

/// The relay server.
pub struct RelayServer {
    config: Arc<ServerConfig>,
    registry: Arc<RoomRegistry>,
    stats: Arc<AtomicServerStats>,
}

impl RelayServer {
    /// Create a server with its own empty room registry.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_registry(config, Arc::new(RoomRegistry::new()))
    }

    /// Create a server around an existing registry.
    pub fn with_registry(config: ServerConfig, registry: Arc<RoomRegistry>) -> Self {
        Self {
            config: Arc::new(config),
            registry,
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind and serve forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.run_until(std::future::pending()).await
    }

    /// Bind and serve until `shutdown` resolves.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Canvas relay listening on {}", self.config.bind_addr);
        self.serve(listener, shutdown).await
    }

    /// Accept connections on `listener` until `shutdown` resolves.
    ///
    /// Connections already accepted keep running until their peers close.
    pub async fn serve<F>(
        &self,
        listener: TcpListener,
        shutdown: F,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()>,
    {
        let janitor = self
            .config
            .idle_room_ttl
            .map(|ttl| spawn_janitor(self.registry.clone(), ttl));

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Shutdown requested, no longer accepting connections");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            log::error!("Failed to accept connection: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");

                    let registry = self.registry.clone();
                    let config = self.config.clone();
                    let stats = self.stats.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, addr, registry, config, stats).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
            }
        }

        if let Some(janitor) = janitor {
            janitor.abort();
        }
        Ok(())
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<RoomRegistry>,
        config: Arc<ServerConfig>,
        stats: Arc<AtomicServerStats>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let client_id = Uuid::new_v4();
        log::info!("WebSocket connection {client_id} established from {addr}");
        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);

        let (out_tx, mut out_rx) = mpsc::channel::<Arc<str>>(config.outbound_queue_capacity);
        let mut session = Session::new(client_id, Arc::new(out_tx), registry, config);

        let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = match session.open() {
            Err(e) => Err(e.into()),
            Ok(()) => loop {
                tokio::select! {
                    // Incoming WebSocket message
                    msg = ws_receiver.next() => {
                        let text = match msg {
                            Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                            Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                                Ok(text) => text,
                                Err(_) => {
                                    log::warn!("Dropping non-UTF-8 binary frame from {client_id}");
                                    stats.malformed_messages.fetch_add(1, Ordering::Relaxed);
                                    continue;
                                }
                            },
                            Some(Ok(Message::Ping(data))) => {
                                if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                    break Err(e.into());
                                }
                                continue;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection {client_id} closed from {addr}");
                                break Ok(());
                            }
                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break Ok(());
                            }
                            Some(Ok(_)) => continue,
                        };

                        stats.total_messages.fetch_add(1, Ordering::Relaxed);
                        if let Err(e) = session.handle_text(&text).await {
                            stats.malformed_messages.fetch_add(1, Ordering::Relaxed);
                            log::warn!("Dropping message from {client_id}: {e}");
                        }
                    }

                    // Outgoing frame queued by this session or its room
                    frame = out_rx.recv() => {
                        let Some(frame) = frame else { break Ok(()) };
                        if let Err(e) = ws_sender.send(Message::text(frame.to_string())).await {
                            break Err(e.into());
                        }
                    }
                }
            },
        };

        // Cleanup: leave the room whatever ended the connection
        session.close().await;
        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        result
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
            malformed_messages: self.stats.malformed_messages.load(Ordering::Relaxed),
            active_rooms: self.registry.room_count().await,
        }
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get the shared room registry.
    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }
}

/// Periodically evict rooms idle for longer than `ttl`.
fn spawn_janitor(registry: Arc<RoomRegistry>, ttl: Duration) -> JoinHandle<()> {
    let period = ttl.clamp(Duration::from_secs(1), Duration::from_secs(60));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let evicted = registry.evict_idle(ttl).await;
            if !evicted.is_empty() {
                log::debug!("Janitor evicted {} idle rooms", evicted.len());
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:3000");
        assert_eq!(config.default_room, "default");
        assert_eq!(config.fallback_room.as_deref(), Some("default"));
        assert_eq!(config.outbound_queue_capacity, 256);
        assert!(config.idle_room_ttl.is_none());
    }

    #[test]
    fn test_config_from_empty_lookup_is_default() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn test_config_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("PORT", "8080"),
            ("CANVAS_DEFAULT_ROOM", "lobby"),
            ("CANVAS_QUEUE_CAPACITY", "32"),
            ("CANVAS_ROOM_TTL_SECS", "600"),
        ]))
        .unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.default_room, "lobby");
        assert_eq!(config.fallback_room.as_deref(), Some("lobby"));
        assert_eq!(config.outbound_queue_capacity, 32);
        assert_eq!(config.idle_room_ttl, Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_config_bind_addr_wins_over_port() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("CANVAS_BIND_ADDR", "127.0.0.1:9999"),
            ("PORT", "8080"),
        ]))
        .unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9999");
    }

    #[test]
    fn test_config_strict_join() {
        let config = ServerConfig::from_lookup(lookup(&[("CANVAS_STRICT_JOIN", "true")])).unwrap();
        assert!(config.fallback_room.is_none());
    }

    #[test]
    fn test_config_rejects_bad_values() {
        let err = ServerConfig::from_lookup(lookup(&[("PORT", "http")])).unwrap_err();
        assert_eq!(err.key, "PORT");
        assert!(ServerConfig::from_lookup(lookup(&[("CANVAS_QUEUE_CAPACITY", "0")])).is_err());
        assert!(ServerConfig::from_lookup(lookup(&[("CANVAS_STRICT_JOIN", "maybe")])).is_err());
    }

    #[test]
    fn test_server_creation() {
        let server = RelayServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:3000");
        assert_eq!(server.config().outbound_queue_capacity, 256);
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = RelayServer::with_defaults();
        assert_eq!(server.stats().await, ServerStats::default());
    }

    #[tokio::test]
    async fn test_shared_registry_is_injected() {
        let registry = Arc::new(RoomRegistry::new());
        registry.get_or_create("r1").await;
        let server = RelayServer::with_registry(ServerConfig::default(), registry.clone());
        assert!(Arc::ptr_eq(server.registry(), &registry));
        assert_eq!(server.stats().await.active_rooms, 1);
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let server = RelayServer::with_defaults();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let result = tokio::time::timeout(
            Duration::from_secs(2),
            server.serve(listener, async {}),
        )
        .await;
        assert!(matches!(result, Ok(Ok(()))));
    }
}
