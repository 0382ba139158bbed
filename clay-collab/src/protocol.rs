//! Wire protocol between participants and the session engine.
//!
//! Two encodings share one message model:
//! ```text
//! Binary frame ── bincode (standard config) ── ClientMessage / ServerMessage
//! Text frame   ── JSON, externally tagged   ── {"vertex-edit": {…}}
//! ```
//!
//! Every message carries a stable kebab-case event name
//! ([`ClientMessage::event_name`], [`ServerMessage::event_name`]) used for
//! logging and as the JSON tag.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::mesh::{MeshState, Vec3};

/// Opaque identity of a participant connection.
pub type ConnectionId = Uuid;

/// Session phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Editing,
    Frozen,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Editing => "editing",
            Phase::Frozen => "frozen",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase announcement. Always computed at send time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseStatus {
    pub phase: Phase,
    pub time_remaining_ms: u64,
    pub edit_duration_ms: u64,
    pub freeze_duration_ms: u64,
}

/// One entry of an inbound edit. `position` may be absent in malformed input.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VertexUpdate {
    pub vertex_index: u32,
    pub position: Option<Vec3>,
}

impl VertexUpdate {
    pub fn new(vertex_index: u32, position: Vec3) -> Self {
        Self {
            vertex_index,
            position: Some(position),
        }
    }
}

/// A validated vertex write, as relayed to other participants.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VertexWrite {
    pub vertex_index: u32,
    pub position: Vec3,
}

/// Participant → server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Join a session; must precede every other session-scoped message.
    Attach { session_id: String },
    VertexEdit {
        vertex_index: u32,
        position: Option<Vec3>,
    },
    BatchEdit { updates: Vec<VertexUpdate> },
    ExportRequest,
    ResetRequest,
    StatusRequest,
    Ping,
}

impl ClientMessage {
    pub fn attach(session_id: impl Into<String>) -> Self {
        Self::Attach {
            session_id: session_id.into(),
        }
    }

    pub fn vertex_edit(vertex_index: u32, position: Vec3) -> Self {
        Self::VertexEdit {
            vertex_index,
            position: Some(position),
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Attach { .. } => "attach",
            Self::VertexEdit { .. } => "vertex-edit",
            Self::BatchEdit { .. } => "batch-edit",
            Self::ExportRequest => "export-request",
            Self::ResetRequest => "reset-request",
            Self::StatusRequest => "status-request",
            Self::Ping => "ping",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_binary(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_binary(bytes)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        encode_json(self)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        decode_json(text)
    }
}

/// Server → participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Full mesh, sent on attach and after every reset.
    MeshSnapshot { mesh: MeshState },
    VertexRelay {
        vertex_index: u32,
        position: Vec3,
    },
    BatchRelay { updates: Vec<VertexWrite> },
    PhaseStatus(PhaseStatus),
    Exported { obj: String },
    Rejected { reason: String },
    Pong,
}

impl ServerMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::MeshSnapshot { .. } => "mesh-snapshot",
            Self::VertexRelay { .. } => "vertex-relay",
            Self::BatchRelay { .. } => "batch-relay",
            Self::PhaseStatus(_) => "phase-status",
            Self::Exported { .. } => "exported",
            Self::Rejected { .. } => "rejected",
            Self::Pong => "pong",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_binary(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_binary(bytes)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        encode_json(self)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        decode_json(text)
    }
}

/// Frame encoding chosen per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Binary,
    Json,
}

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Connection closed")]
    ConnectionClosed,
}

fn encode_binary<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode_binary<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(value)
}

fn encode_json<T: Serialize>(value: &T) -> Result<String, ProtocolError> {
    serde_json::to_string(value).map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode_json<T: DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
}
