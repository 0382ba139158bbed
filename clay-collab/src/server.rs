//! WebSocket front end for the session engine.
//!
//! Architecture:
//! ```text
//! Participant A ──┐                       ┌── RoomManager ── room (session id) ──► A, B
//!                 ├── connection task ────┤
//! Participant B ──┘   (select! loop)      └── SessionEngine ── Session ── MeshStore
//!                                                   │                 (RocksDB / memory)
//!                                                   └── phase timers
//! ```
//!
//! Each connection runs one task that multiplexes three sources: inbound
//! frames, the direct channel for replies addressed to it, and the room of
//! the session it is attached to. The first inbound frame fixes the codec:
//! binary frames speak bincode, text frames speak JSON.
//!
//! A connection holds no session state beyond the id it is attached to;
//! disconnecting never changes a session.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use futures_util::{Sink, SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{Broadcaster, Envelope, RoomManager};
use crate::protocol::{ClientMessage, Codec, ProtocolError, ServerMessage};
use crate::registry::{EngineStats, SessionEngine};
use crate::session::CycleConfig;
use crate::storage::{MemoryMeshStore, MeshStore, RocksMeshStore, StoreConfig, StoreError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per session room
    pub broadcast_capacity: usize,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Phase lengths and persistence debounce
    pub cycle: CycleConfig,
    /// Evict sessions idle this long (None = keep forever)
    pub session_idle_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            storage_path: None,
            cycle: CycleConfig::default(),
            session_idle_timeout: None,
        }
    }
}

/// Invalid configuration input.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} must be a non-negative integer, got '{value}'")]
    InvalidNumber { name: &'static str, value: String },
}

impl ServerConfig {
    /// Defaults overridden by `CLAY_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(addr) = lookup("CLAY_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(path) = lookup("CLAY_STORAGE_PATH").filter(|p| !p.is_empty()) {
            config.storage_path = Some(PathBuf::from(path));
        }
        if let Some(secs) = parse_number(&lookup, "CLAY_EDIT_SECS")? {
            config.cycle.edit_duration = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_number(&lookup, "CLAY_FREEZE_SECS")? {
            config.cycle.freeze_duration = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_number(&lookup, "CLAY_PERSIST_DEBOUNCE_MS")? {
            config.cycle.persist_debounce = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_number(&lookup, "CLAY_IDLE_TIMEOUT_SECS")? {
            config.session_idle_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        Ok(config)
    }
}

fn parse_number(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<u64>, ConfigError> {
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber { name, value }),
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub decode_errors: u64,
    pub active_rooms: usize,
    pub engine: EngineStats,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    engine: SessionEngine,
    /// Room manager for broadcast routing
    room_manager: Arc<RoomManager>,
    /// Server-wide statistics
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a server, opening RocksDB when a storage path is configured.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn MeshStore> = match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                Arc::new(RocksMeshStore::open(store_config)?)
            }
            None => Arc::new(MemoryMeshStore::new()),
        };
        Ok(Self::with_store(config, store))
    }

    /// Create a server over an existing store.
    pub fn with_store(config: ServerConfig, store: Arc<dyn MeshStore>) -> Self {
        let room_manager = Arc::new(RoomManager::new(config.broadcast_capacity));
        let engine = SessionEngine::new(store, room_manager.clone(), config.cycle);
        Self {
            config,
            engine,
            room_manager,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        Self::with_store(ServerConfig::default(), Arc::new(MemoryMeshStore::new()))
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!(
            "Clay server listening on {} (edit {:?}, freeze {:?})",
            self.config.bind_addr,
            self.config.cycle.edit_duration,
            self.config.cycle.freeze_duration
        );

        if let Some(max_idle) = self.config.session_idle_timeout {
            self.spawn_reaper(max_idle);
        }

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let engine = self.engine.clone();
            let room_manager = self.room_manager.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, engine, room_manager, stats).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    fn spawn_reaper(&self, max_idle: Duration) {
        let engine = self.engine.clone();
        let period = (max_idle / 2).max(Duration::from_secs(1));
        log::info!("Evicting sessions idle for {max_idle:?}");
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let evicted = engine.evict_idle(max_idle);
                if !evicted.is_empty() {
                    log::info!("Evicted {} idle sessions", evicted.len());
                }
            }
        });
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        engine: SessionEngine,
        room_manager: Arc<RoomManager>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let conn = Uuid::new_v4();
        log::info!("WebSocket connection {conn} established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // State for this connection
        let mut direct_rx = room_manager.register_connection(conn);
        let mut session_id: Option<String> = None;
        let mut room_rx: Option<broadcast::Receiver<Arc<Envelope>>> = None;
        let mut codec: Option<Codec> = None;

        let result = async {
            loop {
                tokio::select! {
                    // Replies queued before a room message must leave first
                    biased;

                    msg = ws_receiver.next() => {
                        let decoded = match msg {
                            Some(Ok(Message::Binary(data))) => {
                                codec.get_or_insert(Codec::Binary);
                                Self::count_inbound(&stats, data.len()).await;
                                ClientMessage::decode(&data)
                            }
                            Some(Ok(Message::Text(text))) => {
                                codec.get_or_insert(Codec::Json);
                                Self::count_inbound(&stats, text.len()).await;
                                ClientMessage::from_json(text.as_str())
                            }
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                                continue;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection {conn} closed from {addr}");
                                break;
                            }
                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }
                            Some(Ok(_)) => continue,
                        };

                        match decoded {
                            Ok(message) => {
                                if let ClientMessage::Attach { session_id: target } = &message {
                                    if let Some(previous) = session_id.take() {
                                        room_manager.leave(&previous, &conn);
                                    }
                                    // Join the room first so nothing broadcast during attach is missed
                                    room_rx = Some(room_manager.join(target, conn));
                                    session_id = Some(target.clone());
                                    let active_rooms = room_manager.room_count();
                                    stats.write().await.active_rooms = active_rooms;
                                    log::info!("Connection {conn} attached to session {target}");
                                }

                                if matches!(message, ClientMessage::Ping) {
                                    room_manager.send_to(conn, ServerMessage::Pong);
                                } else if let Some(id) = &session_id {
                                    engine.dispatch(conn, id, message);
                                } else {
                                    log::warn!("Connection {conn} sent {} before attaching", message.event_name());
                                    room_manager.send_to(conn, ServerMessage::Rejected {
                                        reason: "attach to a session first".to_string(),
                                    });
                                }
                            }
                            Err(e) => {
                                stats.write().await.decode_errors += 1;
                                log::warn!("Failed to decode message from {addr}: {e}");
                            }
                        }
                    }

                    // Replies addressed to this connection only
                    Some(message) = direct_rx.recv() => {
                        Self::send(&mut ws_sender, &message, codec).await?;
                    }

                    // Session-wide messages
                    msg = async {
                        if let Some(ref mut rx) = room_rx {
                            rx.recv().await
                        } else {
                            // Not attached yet: wait forever
                            std::future::pending().await
                        }
                    } => {
                        match msg {
                            Ok(envelope) => {
                                if envelope.is_for(conn) {
                                    Self::send(&mut ws_sender, &envelope.message, codec).await?;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("Connection {conn} lagged by {n} messages");
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                room_rx = None;
                            }
                        }
                    }
                }
            }
            Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
        }
        .await;

        // Cleanup: session state is untouched
        room_manager.unregister_connection(&conn);
        if let Some(id) = session_id {
            room_manager.leave(&id, &conn);
        }
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_rooms = room_manager.room_count();
        }

        result
    }

    async fn count_inbound(stats: &RwLock<ServerStats>, bytes: usize) {
        let mut s = stats.write().await;
        s.total_messages += 1;
        s.total_bytes += bytes as u64;
    }

    async fn send<S>(
        sink: &mut S,
        message: &ServerMessage,
        codec: Option<Codec>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        S: Sink<Message> + Unpin,
        S::Error: std::error::Error + Send + Sync + 'static,
    {
        let frame = encode_frame(message, codec.unwrap_or(Codec::Binary))?;
        sink.send(frame).await?;
        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.engine = self.engine.stats();
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn engine(&self) -> &SessionEngine {
        &self.engine
    }

    /// Get room manager reference.
    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.room_manager
    }
}

/// Encode an outbound message for the connection's codec.
pub fn encode_frame(message: &ServerMessage, codec: Codec) -> Result<Message, ProtocolError> {
    Ok(match codec {
        Codec::Binary => Message::Binary(message.encode()?.into()),
        Codec::Json => Message::Text(message.to_json()?.into()),
    })
}
