//! Session registry and engine: owns every live [`Session`], arms phase
//! timers and executes the effects handlers return.
//!
//! ```text
//!  dispatch / timer ──► SessionSlot (Mutex<Session>) ──► Vec<Effect>
//!                              │                            │
//!                  sends run under the lock         store writes run after
//!                              ▼                            ▼
//!                         Broadcaster                   MeshStore
//! ```
//!
//! Sends are non-blocking and go out while the session lock is held, so
//! relays leave in the order edits were applied. Store I/O never runs under
//! the session lock; a per-session write sequence keeps concurrent writes
//! from landing out of order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::time::Instant;

use crate::broadcast::Broadcaster;
use crate::mesh::{MeshState, Vec3};
use crate::protocol::{ClientMessage, ConnectionId, Phase, PhaseStatus, ServerMessage, VertexUpdate};
use crate::session::{CycleConfig, Effect, Session, SessionError};
use crate::storage::MeshStore;

/// Produces the mesh a session starts from (and returns to on every cycle).
pub type MeshFactory = Arc<dyn Fn() -> MeshState + Send + Sync>;

/// Engine counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub active_sessions: usize,
    pub sessions_created: u64,
    pub sessions_evicted: u64,
    pub exports: u64,
    pub resets: u64,
    pub store_writes: u64,
    pub store_clears: u64,
    pub store_failures: u64,
}

#[derive(Default)]
struct AtomicEngineStats {
    sessions_created: AtomicU64,
    sessions_evicted: AtomicU64,
    exports: AtomicU64,
    resets: AtomicU64,
    store_writes: AtomicU64,
    store_clears: AtomicU64,
    store_failures: AtomicU64,
}

/// Registry entry. The session is built at most once, on first access.
struct SessionSlot {
    session: OnceLock<Mutex<Session>>,
    /// Highest write sequence handed to the store
    persisted_seq: Mutex<u64>,
}

impl SessionSlot {
    fn new() -> Self {
        Self {
            session: OnceLock::new(),
            persisted_seq: Mutex::new(0),
        }
    }

    fn lock(&self) -> Option<MutexGuard<'_, Session>> {
        self.session
            .get()
            .map(|m| m.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

struct EngineInner {
    sessions: RwLock<HashMap<String, Arc<SessionSlot>>>,
    store: Arc<dyn MeshStore>,
    broadcaster: Arc<dyn Broadcaster>,
    cycle: CycleConfig,
    factory: MeshFactory,
    stats: AtomicEngineStats,
}

/// The session engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SessionEngine {
    inner: Arc<EngineInner>,
}

impl SessionEngine {
    /// Engine whose sessions start from the default sphere.
    pub fn new(
        store: Arc<dyn MeshStore>,
        broadcaster: Arc<dyn Broadcaster>,
        cycle: CycleConfig,
    ) -> Self {
        Self::with_mesh_factory(store, broadcaster, cycle, Arc::new(MeshState::default))
    }

    pub fn with_mesh_factory(
        store: Arc<dyn MeshStore>,
        broadcaster: Arc<dyn Broadcaster>,
        cycle: CycleConfig,
        factory: MeshFactory,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                sessions: RwLock::new(HashMap::new()),
                store,
                broadcaster,
                cycle,
                factory,
                stats: AtomicEngineStats::default(),
            }),
        }
    }

    pub fn cycle(&self) -> &CycleConfig {
        &self.inner.cycle
    }

    /// Ensure the session exists, loading persisted state the first time.
    /// Concurrent callers for the same id observe one creation.
    ///
    /// Must be called from within a tokio runtime (it arms the phase timer).
    pub fn get_or_create(&self, session_id: &str) {
        loop {
            let slot = self.slot(session_id);
            self.init_slot(&slot, session_id);
            if self.is_registered(session_id, &slot) {
                return;
            }
            log::debug!("Session {session_id} was evicted while being looked up, retrying");
        }
    }

    /// Attach a participant: the session is created if needed, caught up,
    /// its timer re-armed, and the participant gets the mesh and status.
    pub fn attach(&self, conn: ConnectionId, session_id: &str) {
        self.get_or_create(session_id);
        let cycle = self.inner.cycle;
        self.with_session(session_id, |session, now| {
            let effects = session.attach(conn, now, &cycle, &*self.inner.factory);
            self.arm_timer(session, now);
            ((), effects)
        });
        log::debug!("Connection {conn} attached to session {session_id}");
    }

    /// Apply one vertex edit on behalf of `conn`.
    pub fn vertex_edit(
        &self,
        conn: ConnectionId,
        session_id: &str,
        vertex_index: u32,
        position: Option<Vec3>,
    ) {
        let cycle = self.inner.cycle;
        let found = self.with_session(session_id, |session, now| {
            let effects = session.apply_vertex_edit(
                conn,
                vertex_index,
                position,
                now,
                &cycle,
                &*self.inner.factory,
            );
            ((), effects)
        });
        if found.is_none() {
            self.reject_unknown(conn, session_id);
        }
    }

    /// Apply a batch of edits on behalf of `conn`.
    pub fn batch_edit(&self, conn: ConnectionId, session_id: &str, updates: &[VertexUpdate]) {
        let cycle = self.inner.cycle;
        let found = self.with_session(session_id, |session, now| {
            let effects = session.apply_batch(conn, updates, now, &cycle, &*self.inner.factory);
            ((), effects)
        });
        if found.is_none() {
            self.reject_unknown(conn, session_id);
        }
    }

    /// OBJ export of a frozen session.
    pub fn export(&self, session_id: &str) -> Result<String, SessionError> {
        let cycle = self.inner.cycle;
        let result = self
            .with_session(session_id, |session, now| {
                session.export(now, &cycle, &*self.inner.factory)
            })
            .ok_or_else(|| SessionError::UnknownSession(session_id.to_string()))?;

        match &result {
            Ok(obj) => {
                self.inner.stats.exports.fetch_add(1, Ordering::Relaxed);
                log::info!("Session {session_id} exported ({} bytes)", obj.len());
            }
            Err(e) => log::debug!("Export of session {session_id} refused: {e}"),
        }
        result
    }

    /// Restart the session from a fresh mesh in the editing phase. Creates
    /// the session if it does not exist yet.
    pub fn reset(&self, session_id: &str) {
        self.get_or_create(session_id);
        let cycle = self.inner.cycle;
        self.with_session(session_id, |session, now| {
            let effects = session.reset(now, &cycle, (self.inner.factory)());
            ((), effects)
        });
        self.inner.stats.resets.fetch_add(1, Ordering::Relaxed);
    }

    /// Current phase status, after catching up on elapsed time.
    pub fn status(&self, session_id: &str) -> Option<PhaseStatus> {
        let cycle = self.inner.cycle;
        self.with_session(session_id, |session, now| {
            let mut effects = Vec::new();
            session.advance(now, &cycle, &*self.inner.factory, &mut effects);
            (session.status(now, &cycle), effects)
        })
    }

    /// Route one inbound message. `session_id` is the session the
    /// connection is attached to; `Attach` carries its own target.
    pub fn dispatch(&self, conn: ConnectionId, session_id: &str, message: ClientMessage) {
        log::trace!("{conn} -> {session_id}: {}", message.event_name());
        match message {
            ClientMessage::Attach { session_id: target } => self.attach(conn, &target),
            ClientMessage::VertexEdit {
                vertex_index,
                position,
            } => self.vertex_edit(conn, session_id, vertex_index, position),
            ClientMessage::BatchEdit { updates } => self.batch_edit(conn, session_id, &updates),
            ClientMessage::ExportRequest => match self.export(session_id) {
                Ok(obj) => self
                    .inner
                    .broadcaster
                    .send_to(conn, ServerMessage::Exported { obj }),
                Err(e) => {
                    self.inner.broadcaster.send_to(
                        conn,
                        ServerMessage::Rejected {
                            reason: e.to_string(),
                        },
                    );
                    // Tell the requester when the freeze starts
                    if let Some(status) = self.status(session_id) {
                        self.inner
                            .broadcaster
                            .send_to(conn, ServerMessage::PhaseStatus(status));
                    }
                }
            },
            ClientMessage::ResetRequest => self.reset(session_id),
            ClientMessage::StatusRequest => {
                let cycle = self.inner.cycle;
                let found = self.with_session(session_id, |session, now| {
                    ((), session.status_for(conn, now, &cycle, &*self.inner.factory))
                });
                if found.is_none() {
                    self.reject_unknown(conn, session_id);
                }
            }
            ClientMessage::Ping => self.inner.broadcaster.send_to(conn, ServerMessage::Pong),
        }
    }

    /// Copy of the session's current mesh.
    pub fn mesh(&self, session_id: &str) -> Option<MeshState> {
        let slot = self.existing(session_id)?;
        let session = slot.lock()?;
        Some(session.mesh().clone())
    }

    /// Phase as stored, without catching up.
    pub fn phase(&self, session_id: &str) -> Option<Phase> {
        let slot = self.existing(session_id)?;
        let session = slot.lock()?;
        Some(session.phase())
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.existing(session_id).is_some()
    }

    pub fn session_count(&self) -> usize {
        self.read_sessions()
            .values()
            .filter(|slot| slot.session.get().is_some())
            .count()
    }

    /// Drop sessions nobody has touched for `max_idle` and nobody is joined
    /// to. Their mesh is written out first unless storage was cleared by an
    /// export.
    pub fn evict_idle(&self, max_idle: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut evicted = Vec::new();
        {
            let mut sessions = self
                .inner
                .sessions
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            sessions.retain(|id, slot| {
                let Some(mut session) = slot.lock() else {
                    return true;
                };
                if !session.is_idle(now, max_idle) || self.inner.broadcaster.has_participants(id) {
                    return true;
                }
                session.cancel_timer();
                let write = session.flush(now);
                evicted.push((id.clone(), Arc::clone(slot), write));
                false
            });

            // Written before the map is unlocked, so a re-creation loads the flushed mesh
            for (id, slot, write) in &mut evicted {
                self.persist(slot, id, write.take().into_iter().collect());
            }
        }

        let mut ids = Vec::with_capacity(evicted.len());
        for (id, _, _) in evicted {
            self.inner.stats.sessions_evicted.fetch_add(1, Ordering::Relaxed);
            log::info!("Session {id} evicted after {max_idle:?} idle");
            ids.push(id);
        }
        ids
    }

    /// Write every session's current mesh now, ignoring the debounce.
    /// Returns the number of sessions written.
    pub fn persist_all(&self) -> usize {
        let slots: Vec<(String, Arc<SessionSlot>)> = self
            .read_sessions()
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
            .collect();

        let mut written = 0;
        for (id, slot) in slots {
            let write = match slot.lock() {
                Some(mut session) => session.flush(Instant::now()),
                None => continue,
            };
            if let Some(write) = write {
                self.persist(&slot, &id, vec![write]);
                written += 1;
            }
        }
        log::info!("Persisted {written} sessions");
        written
    }

    pub fn stats(&self) -> EngineStats {
        let s = &self.inner.stats;
        EngineStats {
            active_sessions: self.session_count(),
            sessions_created: s.sessions_created.load(Ordering::Relaxed),
            sessions_evicted: s.sessions_evicted.load(Ordering::Relaxed),
            exports: s.exports.load(Ordering::Relaxed),
            resets: s.resets.load(Ordering::Relaxed),
            store_writes: s.store_writes.load(Ordering::Relaxed),
            store_clears: s.store_clears.load(Ordering::Relaxed),
            store_failures: s.store_failures.load(Ordering::Relaxed),
        }
    }

    /// Timer callback. Stale epochs are ignored; otherwise catch up and arm
    /// the next timer.
    fn on_timer(&self, session_id: &str, epoch: u64) {
        let cycle = self.inner.cycle;
        self.with_session(session_id, |session, now| {
            if session.epoch() != epoch {
                log::trace!("Session {session_id}: stale timer for epoch {epoch}");
                return ((), Vec::new());
            }
            let mut effects = Vec::new();
            session.advance(now, &cycle, &*self.inner.factory, &mut effects);
            self.arm_timer(session, now);
            ((), effects)
        });
    }

    /// Schedule the next transition check for the session's current phase.
    fn arm_timer(&self, session: &mut Session, now: Instant) {
        let remaining = session.time_remaining(now, &self.inner.cycle);
        let epoch = session.epoch();
        let id = session.id().to_string();
        let weak: Weak<EngineInner> = Arc::downgrade(&self.inner);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            if let Some(inner) = weak.upgrade() {
                SessionEngine { inner }.on_timer(&id, epoch);
            }
        });
        session.set_timer(handle);
        log::trace!("Session {}: timer armed for {remaining:?}", session.id());
    }

    /// Lock an existing session, run `f`, deliver its sends under the lock
    /// and its store writes after. Re-arms the timer when the epoch moved.
    fn with_session<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut Session, Instant) -> (T, Vec<Effect>),
    ) -> Option<T> {
        let slot = self.existing(session_id)?;
        let mut session = slot.lock()?;
        let now = Instant::now();
        let epoch = session.epoch();

        let (value, effects) = f(&mut *session, now);
        if session.epoch() != epoch && session.timer_epoch() != Some(session.epoch()) {
            self.arm_timer(&mut *session, now);
        }

        let writes = self.deliver(session_id, effects);
        drop(session);
        self.persist(&slot, session_id, writes);
        Some(value)
    }

    /// Perform send effects; hand back the persistence ones.
    fn deliver(&self, session_id: &str, effects: Vec<Effect>) -> Vec<Effect> {
        let broadcaster = &self.inner.broadcaster;
        let mut writes = Vec::new();
        for effect in effects {
            match effect {
                Effect::SendToSession(message) => broadcaster.send_to_session(session_id, message),
                Effect::SendToOthers { exclude, message } => {
                    broadcaster.send_to_others(session_id, exclude, message)
                }
                Effect::SendTo { conn, message } => broadcaster.send_to(conn, message),
                write => writes.push(write),
            }
        }
        writes
    }

    /// Apply store writes in sequence order. Failures are logged and never
    /// surface to participants.
    fn persist(&self, slot: &SessionSlot, session_id: &str, writes: Vec<Effect>) {
        if writes.is_empty() {
            return;
        }
        let stats = &self.inner.stats;
        let mut last = slot
            .persisted_seq
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        for write in writes {
            match write {
                Effect::Store { seq, mesh } if seq > *last => {
                    *last = seq;
                    match self.store_io(|store| store.store(session_id, &mesh)) {
                        Ok(()) => {
                            stats.store_writes.fetch_add(1, Ordering::Relaxed);
                            log::debug!("Session {session_id}: mesh persisted (seq {seq})");
                        }
                        Err(e) => {
                            stats.store_failures.fetch_add(1, Ordering::Relaxed);
                            log::error!("Failed to persist session {session_id}: {e}");
                        }
                    }
                }
                Effect::Clear { seq } if seq > *last => {
                    *last = seq;
                    match self.store_io(|store| store.clear(session_id)) {
                        Ok(()) => {
                            stats.store_clears.fetch_add(1, Ordering::Relaxed);
                            log::debug!("Session {session_id}: storage cleared (seq {seq})");
                        }
                        Err(e) => {
                            stats.store_failures.fetch_add(1, Ordering::Relaxed);
                            log::error!("Failed to clear storage for session {session_id}: {e}");
                        }
                    }
                }
                superseded => log::trace!("Session {session_id}: skipped {superseded:?}"),
            }
        }
    }

    fn load_initial(&self, session_id: &str) -> MeshState {
        match self.store_io(|store| store.load(session_id)) {
            Ok(Some(mesh)) => {
                log::info!(
                    "Session {session_id}: restored {} vertices from storage",
                    mesh.vertex_count()
                );
                mesh
            }
            Ok(None) => (self.inner.factory)(),
            Err(e) => {
                log::error!("Failed to load session {session_id}, starting fresh: {e}");
                (self.inner.factory)()
            }
        }
    }

    /// Run a store call. On a multi-threaded runtime, blocking backends run
    /// through `block_in_place` so the worker's other tasks move elsewhere.
    fn store_io<T>(&self, f: impl FnOnce(&dyn MeshStore) -> T) -> T {
        let store = &*self.inner.store;
        let multi_thread = Handle::try_current()
            .is_ok_and(|handle| handle.runtime_flavor() == RuntimeFlavor::MultiThread);
        if multi_thread && store.is_blocking() {
            tokio::task::block_in_place(|| f(store))
        } else {
            f(store)
        }
    }

    fn reject_unknown(&self, conn: ConnectionId, session_id: &str) {
        log::debug!("Connection {conn} addressed unknown session {session_id}");
        self.inner.broadcaster.send_to(
            conn,
            ServerMessage::Rejected {
                reason: SessionError::UnknownSession(session_id.to_string()).to_string(),
            },
        );
    }

    fn read_sessions(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<SessionSlot>>> {
        self.inner
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, session_id: &str) -> Arc<SessionSlot> {
        // Fast path: read lock
        if let Some(slot) = self.read_sessions().get(session_id) {
            return Arc::clone(slot);
        }
        let mut sessions = self
            .inner
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            sessions
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(SessionSlot::new())),
        )
    }

    /// Build the slot's session unless it already has one.
    fn init_slot(&self, slot: &SessionSlot, session_id: &str) {
        slot.session.get_or_init(|| {
            let mesh = self.load_initial(session_id);
            let now = Instant::now();
            let mut session = Session::new(session_id, mesh, now);
            self.arm_timer(&mut session, now);
            self.inner.stats.sessions_created.fetch_add(1, Ordering::Relaxed);
            log::info!("Session {session_id} created");
            Mutex::new(session)
        });
    }

    /// Whether `slot` is still the registered slot for `session_id`.
    fn is_registered(&self, session_id: &str, slot: &Arc<SessionSlot>) -> bool {
        self.read_sessions()
            .get(session_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    fn existing(&self, session_id: &str) -> Option<Arc<SessionSlot>> {
        self.read_sessions()
            .get(session_id)
            .filter(|slot| slot.session.get().is_some())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::RoomManager;
    use crate::storage::MemoryMeshStore;
    use uuid::Uuid;

    fn small() -> MeshState {
        MeshState::uv_sphere(1.0, 4, 6)
    }

    fn cycle() -> CycleConfig {
        CycleConfig {
            edit_duration: Duration::from_secs(10),
            freeze_duration: Duration::from_secs(2),
            persist_debounce: Duration::from_millis(2000),
        }
    }

    fn engine() -> (SessionEngine, Arc<MemoryMeshStore>, Arc<RoomManager>) {
        let store = Arc::new(MemoryMeshStore::default());
        let rooms = Arc::new(RoomManager::new(64));
        let engine = SessionEngine::with_mesh_factory(
            store.clone(),
            rooms.clone(),
            cycle(),
            Arc::new(small),
        );
        (engine, store, rooms)
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_or_create_is_idempotent() {
        let (engine, store, _) = engine();
        engine.get_or_create("s1");
        engine.get_or_create("s1");

        assert_eq!(engine.session_count(), 1);
        assert_eq!(engine.stats().sessions_created, 1);
        assert_eq!(store.load_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_restored_from_store() {
        let (engine, store, _) = engine();
        let mut saved = small();
        saved.set_vertex(0, [4.0, 4.0, 4.0]);
        store.insert("s1", saved.clone());

        engine.get_or_create("s1");
        assert_eq!(engine.mesh("s1"), Some(saved));
        assert_eq!(engine.phase("s1"), Some(Phase::Editing));
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_failure_falls_back_to_default() {
        let (engine, store, _) = engine();
        store.set_failing(true);
        engine.get_or_create("s1");
        assert_eq!(engine.mesh("s1"), Some(small()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_session_queries() {
        let (engine, _, rooms) = engine();
        let conn = Uuid::new_v4();
        let mut rx = rooms.register_connection(conn);

        assert!(engine.status("nope").is_none());
        assert_eq!(
            engine.export("nope"),
            Err(SessionError::UnknownSession("nope".into()))
        );
        engine.vertex_edit(conn, "nope", 0, Some([1.0; 3]));
        assert!(matches!(rx.try_recv(), Ok(ServerMessage::Rejected { .. })));
        assert!(!engine.contains("nope"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_drives_cycle() {
        let (engine, store, _) = engine();
        engine.get_or_create("s1");
        engine.vertex_edit(Uuid::new_v4(), "s1", 0, Some([9.0, 9.0, 9.0]));

        tokio::time::sleep(Duration::from_millis(10_050)).await;
        assert_eq!(engine.phase("s1"), Some(Phase::Frozen));
        assert_eq!(engine.mesh("s1").unwrap().vertex(0), Some([9.0, 9.0, 9.0]));

        tokio::time::sleep(Duration::from_millis(2_050)).await;
        assert_eq!(engine.phase("s1"), Some(Phase::Editing));
        assert_eq!(engine.mesh("s1"), Some(small()));
        assert_eq!(store.get("s1"), Some(small()));
        assert_eq!(store.clear_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failure_does_not_block_edits() {
        let (engine, store, _) = engine();
        engine.get_or_create("s1");
        store.set_failing(true);

        engine.vertex_edit(Uuid::new_v4(), "s1", 0, Some([2.0, 0.0, 0.0]));

        assert_eq!(engine.mesh("s1").unwrap().vertex(0), Some([2.0, 0.0, 0.0]));
        assert_eq!(engine.stats().store_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_ping_and_export_rejection() {
        let (engine, _, rooms) = engine();
        let conn = Uuid::new_v4();
        let mut rx = rooms.register_connection(conn);
        engine.attach(conn, "s1");
        // Snapshot + status
        assert!(matches!(rx.try_recv(), Ok(ServerMessage::MeshSnapshot { .. })));
        assert!(matches!(rx.try_recv(), Ok(ServerMessage::PhaseStatus(_))));

        engine.dispatch(conn, "s1", ClientMessage::Ping);
        assert_eq!(rx.try_recv().ok(), Some(ServerMessage::Pong));

        engine.dispatch(conn, "s1", ClientMessage::ExportRequest);
        match rx.try_recv() {
            Ok(ServerMessage::Rejected { reason }) => assert!(reason.contains("frozen")),
            other => panic!("expected rejection, got {other:?}"),
        }
        match rx.try_recv() {
            Ok(ServerMessage::PhaseStatus(status)) => assert_eq!(status.phase, Phase::Editing),
            other => panic!("expected status, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_idle_persists_mesh() {
        let (engine, store, _) = engine();
        engine.get_or_create("s1");
        engine.vertex_edit(Uuid::new_v4(), "s1", 1, Some([3.0, 3.0, 3.0]));
        // Second edit inside the debounce window is not written
        engine.vertex_edit(Uuid::new_v4(), "s1", 2, Some([3.0, 3.0, 3.0]));
        assert_eq!(store.get("s1").unwrap().vertex(2), small().vertex(2));

        tokio::time::advance(Duration::from_secs(5)).await;
        let evicted = engine.evict_idle(Duration::from_secs(5));

        assert_eq!(evicted, vec!["s1".to_string()]);
        assert!(!engine.contains("s1"));
        assert_eq!(store.get("s1").unwrap().vertex(2), Some([3.0, 3.0, 3.0]));
        assert_eq!(engine.stats().sessions_evicted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persist_all_bypasses_debounce() {
        let (engine, store, _) = engine();
        let conn = Uuid::new_v4();
        engine.get_or_create("s1");
        engine.get_or_create("s2");
        engine.vertex_edit(conn, "s1", 0, Some([1.0, 1.0, 1.0]));
        engine.vertex_edit(conn, "s1", 1, Some([1.0, 1.0, 1.0]));

        assert_eq!(engine.persist_all(), 2);
        assert_eq!(store.get("s1").unwrap().vertex(1), Some([1.0, 1.0, 1.0]));
        assert_eq!(store.get("s2"), Some(small()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_with_participants_not_evicted() {
        let (engine, _, rooms) = engine();
        let watcher = Uuid::new_v4();
        let mut direct = rooms.register_connection(watcher);
        let _room = rooms.join("s1", watcher);
        engine.attach(watcher, "s1");
        while direct.try_recv().is_ok() {}

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(engine.evict_idle(Duration::from_secs(5)).is_empty());

        engine.vertex_edit(watcher, "s1", 0, Some([1.0, 2.0, 3.0]));
        assert_eq!(engine.mesh("s1").unwrap().vertex(0), Some([1.0, 2.0, 3.0]));
        assert!(direct.try_recv().is_err());

        rooms.leave("s1", &watcher);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(engine.evict_idle(Duration::from_secs(5)), vec!["s1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_of_evicted_slot_recreates_session() {
        let (engine, _, _) = engine();
        let conn = Uuid::new_v4();
        engine.get_or_create("s1");
        engine.vertex_edit(conn, "s1", 0, Some([1.0, 1.0, 1.0]));
        engine.vertex_edit(conn, "s1", 1, Some([2.0, 2.0, 2.0]));
        let held = engine.slot("s1");

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(engine.evict_idle(Duration::from_secs(5)), vec!["s1".to_string()]);

        // A caller still holding the old slot sees it is no longer registered
        engine.init_slot(&held, "s1");
        assert!(!engine.is_registered("s1", &held));

        engine.get_or_create("s1");
        assert!(engine.contains("s1"));
        let mesh = engine.mesh("s1").unwrap();
        assert_eq!(mesh.vertex(1), Some([2.0, 2.0, 2.0]));
        assert_eq!(engine.stats().sessions_created, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_sessions_not_evicted() {
        let (engine, _, _) = engine();
        engine.get_or_create("s1");
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(engine.evict_idle(Duration::from_secs(5)).is_empty());
        assert_eq!(engine.session_count(), 1);
    }
}
