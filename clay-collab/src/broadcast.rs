//! Broadcast gateway: fan-out to a session, to everyone but the sender, or
//! to one connection.
//!
//! ```text
//!                       ┌───────────── RoomManager ─────────────┐
//! send_to_session ────► │ rooms: session id → BroadcastGroup    │ ──► every member
//! send_to_others  ────► │        (tokio broadcast, Envelope)    │ ──► members ≠ exclude
//! send_to         ────► │ connections: id → unbounded mpsc      │ ──► one connection
//!                       └───────────────────────────────────────┘
//! ```
//!
//! Delivery is fire-and-forget. A room receiver that falls more than
//! `capacity` messages behind observes `Lagged` and skips ahead; the engine
//! never waits on a participant.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, mpsc};

use crate::protocol::{ConnectionId, ServerMessage};

/// Outbound half of the engine. Implementations must not block.
pub trait Broadcaster: Send + Sync {
    /// Deliver to every participant of the session.
    fn send_to_session(&self, session_id: &str, message: ServerMessage);

    /// Deliver to every participant of the session except `exclude`.
    fn send_to_others(&self, session_id: &str, exclude: ConnectionId, message: ServerMessage);

    /// Deliver to a single connection.
    fn send_to(&self, conn: ConnectionId, message: ServerMessage);

    /// Whether any connection is currently joined to the session.
    fn has_participants(&self, session_id: &str) -> bool;
}

/// A message published to a room, with the connection that must not see it.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub exclude: Option<ConnectionId>,
    pub message: ServerMessage,
}

impl Envelope {
    /// Whether `conn` should receive this envelope.
    pub fn is_for(&self, conn: ConnectionId) -> bool {
        self.exclude != Some(conn)
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_members: usize,
}

/// Lock-free counters for the publish path.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Broadcast channel shared by all connections attached to one session.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Envelope>>,
    members: RwLock<HashSet<ConnectionId>>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` is the number of messages buffered per receiver before a
    /// slow receiver starts lagging.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            members: RwLock::new(HashSet::new()),
            capacity,
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Add a member and hand back its receiver.
    pub fn join(&self, conn: ConnectionId) -> broadcast::Receiver<Arc<Envelope>> {
        self.members
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(conn);
        self.sender.subscribe()
    }

    pub fn leave(&self, conn: &ConnectionId) -> bool {
        self.members
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(conn)
    }

    /// Publish to every receiver. Returns the number of receivers reached.
    pub fn publish(&self, envelope: Envelope) -> usize {
        match self.sender.send(Arc::new(envelope)) {
            Ok(count) => {
                self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                count
            }
            Err(_) => {
                // No live receivers
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub fn member_count(&self) -> usize {
        self.members.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn has_member(&self, conn: &ConnectionId) -> bool {
        self.members
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(conn)
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_members: self.member_count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Session-addressed rooms plus direct per-connection channels.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<BroadcastGroup>>>,
    connections: RwLock<HashMap<ConnectionId, mpsc::UnboundedSender<ServerMessage>>>,
    default_capacity: usize,
    direct_dropped: AtomicU64,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            default_capacity,
            direct_dropped: AtomicU64::new(0),
        }
    }

    /// Get or create the room for a session.
    pub fn get_or_create(&self, session_id: &str) -> Arc<BroadcastGroup> {
        // Fast path: read lock
        if let Some(room) = self.get(session_id) {
            return room;
        }

        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        rooms
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.default_capacity)))
            .clone()
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<BroadcastGroup>> {
        self.rooms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .cloned()
    }

    /// Join `conn` to the session's room. Membership is recorded under the
    /// rooms lock, so a concurrent last leave cannot drop the room in between.
    pub fn join(&self, session_id: &str, conn: ConnectionId) -> broadcast::Receiver<Arc<Envelope>> {
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        rooms
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.default_capacity)))
            .join(conn)
    }

    /// Remove `conn` from the room and drop the room once it is empty.
    pub fn leave(&self, session_id: &str, conn: &ConnectionId) {
        if let Some(room) = self.get(session_id) {
            room.leave(conn);
        }
        self.remove_if_empty(session_id);
    }

    /// Remove a room with no members.
    pub fn remove_if_empty(&self, session_id: &str) -> bool {
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        let empty = rooms
            .get(session_id)
            .is_some_and(|room| room.member_count() == 0);
        if empty {
            rooms.remove(session_id);
        }
        empty
    }

    /// Open the direct channel for a connection.
    pub fn register_connection(&self, conn: ConnectionId) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(conn, tx);
        rx
    }

    pub fn unregister_connection(&self, conn: &ConnectionId) {
        self.connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(conn);
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Session ids with an open room.
    pub fn active_sessions(&self) -> Vec<String> {
        self.rooms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Direct messages that found no open channel.
    pub fn direct_dropped(&self) -> u64 {
        self.direct_dropped.load(Ordering::Relaxed)
    }

    fn publish(&self, session_id: &str, envelope: Envelope) {
        match self.get(session_id) {
            Some(room) => {
                let reached = room.publish(envelope);
                log::trace!("Published to session {session_id}: {reached} receivers");
            }
            None => log::trace!("No room for session {session_id}, message dropped"),
        }
    }
}

impl Broadcaster for RoomManager {
    fn send_to_session(&self, session_id: &str, message: ServerMessage) {
        self.publish(
            session_id,
            Envelope {
                exclude: None,
                message,
            },
        );
    }

    fn send_to_others(&self, session_id: &str, exclude: ConnectionId, message: ServerMessage) {
        self.publish(
            session_id,
            Envelope {
                exclude: Some(exclude),
                message,
            },
        );
    }

    fn send_to(&self, conn: ConnectionId, message: ServerMessage) {
        let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
        let delivered = connections
            .get(&conn)
            .map(|tx| tx.send(message).is_ok())
            .unwrap_or(false);
        if !delivered {
            self.direct_dropped.fetch_add(1, Ordering::Relaxed);
            log::debug!("Connection {conn} gone, direct message dropped");
        }
    }

    fn has_participants(&self, session_id: &str) -> bool {
        self.get(session_id)
            .is_some_and(|room| room.member_count() > 0)
    }
}
