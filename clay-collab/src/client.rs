//! WebSocket client for the clay server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - Attach plus edit/export/reset/status requests
//! - A local replica of the session mesh, kept current from snapshots and
//!   relays, and the last phase status seen
//! - Every inbound message on an event channel for the application

use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::mesh::{MeshState, Vec3};
use crate::protocol::{ClientMessage, Codec, PhaseStatus, ProtocolError, ServerMessage, VertexUpdate};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// A message from the server, already applied to the local replica
    Message(ServerMessage),
}

/// Local view of the attached session.
#[derive(Debug, Default)]
struct Replica {
    mesh: Option<MeshState>,
    status: Option<PhaseStatus>,
}

impl Replica {
    fn apply(&mut self, message: &ServerMessage) {
        match message {
            ServerMessage::MeshSnapshot { mesh } => self.mesh = Some(mesh.clone()),
            ServerMessage::VertexRelay {
                vertex_index,
                position,
            } => {
                if let Some(mesh) = self.mesh.as_mut() {
                    mesh.set_vertex(*vertex_index as usize, *position);
                }
            }
            ServerMessage::BatchRelay { updates } => {
                if let Some(mesh) = self.mesh.as_mut() {
                    for update in updates {
                        mesh.set_vertex(update.vertex_index as usize, update.position);
                    }
                }
            }
            ServerMessage::PhaseStatus(status) => self.status = Some(*status),
            _ => {}
        }
    }
}

/// The clay client.
pub struct ClayClient {
    server_url: String,
    codec: Codec,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Mesh and status as last reported by the server
    replica: Arc<RwLock<Replica>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Message>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<ClientEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<ClientEvent>,

    session_id: Option<String>,
}

impl ClayClient {
    /// Client speaking the binary (bincode) codec.
    pub fn new(server_url: impl Into<String>) -> Self {
        Self::with_codec(server_url, Codec::Binary)
    }

    pub fn with_codec(server_url: impl Into<String>, codec: Codec) -> Self {
        let (event_tx, event_rx) = mpsc::channel(1024);
        Self {
            server_url: server_url.into(),
            codec,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            replica: Arc::new(RwLock::new(Replica::default())),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            session_id: None,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok(connected) => connected,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if ws_writer.send(frame).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(ClientEvent::Connected).await;

        // Reader task: decode, update the replica, forward as events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let replica = self.replica.clone();
        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                let decoded = match frame {
                    Ok(Message::Binary(data)) => ServerMessage::decode(&data),
                    Ok(Message::Text(text)) => ServerMessage::from_json(text.as_str()),
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                match decoded {
                    Ok(message) => {
                        replica.write().await.apply(&message);
                        let _ = event_tx.send(ClientEvent::Message(message)).await;
                    }
                    Err(e) => log::warn!("Dropping undecodable server frame: {e}"),
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        log::debug!("Connected to {}", self.server_url);
        Ok(())
    }

    /// Attach to a session. The server answers with a snapshot and status.
    pub async fn attach(&mut self, session_id: impl Into<String>) -> Result<(), ProtocolError> {
        let session_id = session_id.into();
        self.send(&ClientMessage::attach(session_id.clone())).await?;
        self.session_id = Some(session_id);
        Ok(())
    }

    /// Move one vertex. Applied locally right away; the server relays it to
    /// everyone else.
    pub async fn send_vertex_edit(&self, vertex_index: u32, position: Vec3) -> Result<(), ProtocolError> {
        self.apply_locally(&[VertexUpdate::new(vertex_index, position)])
            .await;
        self.send(&ClientMessage::vertex_edit(vertex_index, position))
            .await
    }

    pub async fn send_batch(&self, updates: Vec<VertexUpdate>) -> Result<(), ProtocolError> {
        self.apply_locally(&updates).await;
        self.send(&ClientMessage::BatchEdit { updates }).await
    }

    pub async fn request_export(&self) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::ExportRequest).await
    }

    pub async fn request_reset(&self) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::ResetRequest).await
    }

    pub async fn request_status(&self) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::StatusRequest).await
    }

    /// Send a ping to the server.
    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Ping).await
    }

    /// Close the connection. Pending outgoing frames are flushed first.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        self.session_id = None;
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Copy of the local mesh replica, once a snapshot arrived.
    pub async fn local_mesh(&self) -> Option<MeshState> {
        self.replica.read().await.mesh.clone()
    }

    /// Last phase status received.
    pub async fn last_status(&self) -> Option<PhaseStatus> {
        self.replica.read().await.status
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    async fn apply_locally(&self, updates: &[VertexUpdate]) {
        let mut replica = self.replica.write().await;
        if let Some(mesh) = replica.mesh.as_mut() {
            for update in updates {
                if let Some(position) = update.position {
                    mesh.set_vertex(update.vertex_index as usize, position);
                }
            }
        }
    }

    async fn send(&self, message: &ClientMessage) -> Result<(), ProtocolError> {
        let frame = match self.codec {
            Codec::Binary => Message::Binary(message.encode()?.into()),
            Codec::Json => Message::Text(message.to_json()?.into()),
        };
        let tx = self
            .outgoing_tx
            .as_ref()
            .ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(frame)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }
}
