//! # clay-collab: Timed multiplayer mesh sculpting sessions
//!
//! Participants attached to a named session move vertices of one shared
//! triangle mesh. Each session cycles through a timed editing phase and a
//! shorter frozen phase in which the mesh can be exported as OBJ; when the
//! freeze ends the session starts over from a fresh sphere.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ ClayClient  │ ◄─────────────────► │ SyncServer  │
//! │ (replica)   │  bincode or JSON    │             │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ SessionEngine │── phase timers
//!                                    │  Session ×N   │
//!                                    └───┬───────┬───┘
//!                                        │       │
//!                               RoomManager     MeshStore
//!                               (fan-out)       (RocksDB / memory)
//! ```
//!
//! ## Modules
//!
//! - [`mesh`]: Mesh state, UV sphere generator, OBJ text export
//! - [`protocol`]: Client/server messages and their encodings
//! - [`session`]: Phase machine and edit/export/reset handlers
//! - [`registry`]: Session engine: creation, timers, effect execution
//! - [`broadcast`]: Session rooms and direct channels
//! - [`storage`]: Mesh persistence backends
//! - [`server`]: WebSocket server and configuration
//! - [`client`]: WebSocket client with a local mesh replica

pub mod mesh;
pub mod protocol;
pub mod session;
pub mod registry;
pub mod broadcast;
pub mod storage;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use mesh::{MeshError, MeshState, Vec3};
pub use protocol::{
    ClientMessage, Codec, ConnectionId, Phase, PhaseStatus, ProtocolError, ServerMessage,
    VertexUpdate, VertexWrite,
};
pub use session::{CycleConfig, Effect, Session, SessionError};
pub use registry::{EngineStats, MeshFactory, SessionEngine};
pub use broadcast::{BroadcastGroup, BroadcastStats, Broadcaster, Envelope, RoomManager};
pub use storage::{
    MemoryMeshStore, MeshMetadata, MeshStore, RocksMeshStore, StoreConfig, StoreError,
};
pub use server::{ConfigError, ServerConfig, ServerStats, SyncServer};
pub use client::{ClayClient, ClientEvent, ConnectionState};
