//! Per-session phase machine and edit handlers.
//!
//! ```text
//!            edit_duration elapsed
//!   ┌─────────┐ ─────────────────► ┌─────────┐
//!   │ Editing │                    │ Frozen  │  export allowed, clears storage once
//!   └─────────┘ ◄───────────────── └─────────┘
//!        ▲     freeze_duration elapsed:
//!        │     fresh mesh, clear + rewrite storage, broadcast snapshot
//!        └── reset (any phase)
//! ```
//!
//! Handlers are plain functions over `&mut Session` that return the
//! [`Effect`]s to perform. They never touch a socket or the store
//! themselves; [`SessionEngine`](crate::registry::SessionEngine) executes
//! the effects at the boundary.

use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::mesh::{MeshState, Vec3};
use crate::protocol::{ConnectionId, Phase, PhaseStatus, ServerMessage, VertexUpdate, VertexWrite};

pub const DEFAULT_EDIT_DURATION: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_FREEZE_DURATION: Duration = Duration::from_secs(60);
pub const DEFAULT_PERSIST_DEBOUNCE: Duration = Duration::from_millis(2000);

/// Phase lengths and persistence debounce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleConfig {
    pub edit_duration: Duration,
    pub freeze_duration: Duration,
    /// Minimum gap between two debounced writes of the same session
    pub persist_debounce: Duration,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            edit_duration: DEFAULT_EDIT_DURATION,
            freeze_duration: DEFAULT_FREEZE_DURATION,
            persist_debounce: DEFAULT_PERSIST_DEBOUNCE,
        }
    }
}

impl CycleConfig {
    /// Length of `phase`. Never zero, so the cycle always makes progress
    /// between two transitions.
    pub fn phase_duration(&self, phase: Phase) -> Duration {
        let d = match phase {
            Phase::Editing => self.edit_duration,
            Phase::Frozen => self.freeze_duration,
        };
        d.max(Duration::from_millis(1))
    }
}

/// Session-level rejections.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("export is only available while frozen (session is {phase})")]
    NotReady { phase: Phase },
    #[error("unknown session '{0}'")]
    UnknownSession(String),
}

/// Side effect requested by a handler.
///
/// `Store`/`Clear` carry a per-session sequence number so that writes issued
/// concurrently land in the order they were decided.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    SendToSession(ServerMessage),
    SendToOthers {
        exclude: ConnectionId,
        message: ServerMessage,
    },
    SendTo {
        conn: ConnectionId,
        message: ServerMessage,
    },
    Store { seq: u64, mesh: MeshState },
    Clear { seq: u64 },
}

impl Effect {
    /// Whether this effect goes to the store (and so must run unlocked).
    pub fn is_persistence(&self) -> bool {
        matches!(self, Effect::Store { .. } | Effect::Clear { .. })
    }
}

/// One-shot phase timer. Aborted when dropped or replaced.
struct PhaseTimer {
    epoch: u64,
    handle: JoinHandle<()>,
}

impl Drop for PhaseTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A live collaboration session.
pub struct Session {
    id: String,
    mesh: MeshState,
    phase: Phase,
    phase_started_at: Instant,
    last_persisted_at: Option<Instant>,
    storage_cleared: bool,
    /// Bumped on every transition and reset; timers armed for an older
    /// epoch are stale.
    epoch: u64,
    write_seq: u64,
    last_activity: Instant,
    timer: Option<PhaseTimer>,
}

impl Session {
    pub fn new(id: impl Into<String>, mesh: MeshState, now: Instant) -> Self {
        Self {
            id: id.into(),
            mesh,
            phase: Phase::Editing,
            phase_started_at: now,
            last_persisted_at: None,
            storage_cleared: false,
            epoch: 0,
            write_seq: 0,
            last_activity: now,
            timer: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mesh(&self) -> &MeshState {
        &self.mesh
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn phase_started_at(&self) -> Instant {
        self.phase_started_at
    }

    pub fn last_persisted_at(&self) -> Option<Instant> {
        self.last_persisted_at
    }

    pub fn storage_cleared(&self) -> bool {
        self.storage_cleared
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Time left in the current phase, zero once it has logically ended.
    pub fn time_remaining(&self, now: Instant, cycle: &CycleConfig) -> Duration {
        let elapsed = now.saturating_duration_since(self.phase_started_at);
        cycle.phase_duration(self.phase).saturating_sub(elapsed)
    }

    /// Phase status as of `now`.
    pub fn status(&self, now: Instant, cycle: &CycleConfig) -> PhaseStatus {
        PhaseStatus {
            phase: self.phase,
            time_remaining_ms: self.time_remaining(now, cycle).as_millis() as u64,
            edit_duration_ms: cycle.edit_duration.as_millis() as u64,
            freeze_duration_ms: cycle.freeze_duration.as_millis() as u64,
        }
    }

    /// Run every transition that is due at `now`. Returns whether any ran.
    pub fn advance(
        &mut self,
        now: Instant,
        cycle: &CycleConfig,
        fresh: &dyn Fn() -> MeshState,
        effects: &mut Vec<Effect>,
    ) -> bool {
        let mut transitioned = false;
        while self.time_remaining(now, cycle).is_zero() {
            self.transition(now, cycle, fresh, effects);
            transitioned = true;
        }
        transitioned
    }

    fn transition(
        &mut self,
        now: Instant,
        cycle: &CycleConfig,
        fresh: &dyn Fn() -> MeshState,
        effects: &mut Vec<Effect>,
    ) {
        let from = self.phase;
        self.phase_started_at = now;
        self.epoch += 1;

        match from {
            // The frozen mesh is the last edited state; it is what gets exported.
            Phase::Editing => {
                self.phase = Phase::Frozen;
            }
            Phase::Frozen => {
                self.phase = Phase::Editing;
                self.mesh = fresh();
                self.storage_cleared = false;
                self.last_persisted_at = Some(now);
                let clear = self.next_write_seq();
                effects.push(Effect::Clear { seq: clear });
                let store = self.next_write_seq();
                effects.push(Effect::Store {
                    seq: store,
                    mesh: self.mesh.clone(),
                });
                effects.push(Effect::SendToSession(self.snapshot()));
            }
        }

        log::info!("Session {} moved {} -> {}", self.id, from, self.phase);
        effects.push(Effect::SendToSession(ServerMessage::PhaseStatus(
            self.status(now, cycle),
        )));
    }

    /// A participant attached: catch up, then send it the mesh and status.
    pub fn attach(
        &mut self,
        conn: ConnectionId,
        now: Instant,
        cycle: &CycleConfig,
        fresh: &dyn Fn() -> MeshState,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.advance(now, cycle, fresh, &mut effects);
        self.last_activity = now;
        effects.push(Effect::SendTo {
            conn,
            message: self.snapshot(),
        });
        effects.push(Effect::SendTo {
            conn,
            message: ServerMessage::PhaseStatus(self.status(now, cycle)),
        });
        effects
    }

    /// Single-vertex edit. Out-of-range indices and absent or non-finite
    /// positions are dropped without a reply.
    pub fn apply_vertex_edit(
        &mut self,
        conn: ConnectionId,
        vertex_index: u32,
        position: Option<Vec3>,
        now: Instant,
        cycle: &CycleConfig,
        fresh: &dyn Fn() -> MeshState,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();
        if !self.admit_edit(conn, now, cycle, fresh, &mut effects) {
            return effects;
        }

        let Some(position) = position.filter(is_finite) else {
            log::debug!("Session {}: dropped edit without a usable position", self.id);
            return effects;
        };
        if !self.mesh.set_vertex(vertex_index as usize, position) {
            log::debug!(
                "Session {}: dropped edit for vertex {vertex_index} (mesh has {})",
                self.id,
                self.mesh.vertex_count()
            );
            return effects;
        }

        effects.push(Effect::SendToOthers {
            exclude: conn,
            message: ServerMessage::VertexRelay {
                vertex_index,
                position,
            },
        });
        effects.extend(self.debounced_store(now, cycle));
        effects
    }

    /// Batched edit. Valid entries are applied in order (later entries win)
    /// and relayed together; invalid ones are skipped.
    pub fn apply_batch(
        &mut self,
        conn: ConnectionId,
        updates: &[VertexUpdate],
        now: Instant,
        cycle: &CycleConfig,
        fresh: &dyn Fn() -> MeshState,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();
        if !self.admit_edit(conn, now, cycle, fresh, &mut effects) {
            return effects;
        }

        let mut applied = Vec::with_capacity(updates.len());
        for update in updates {
            let Some(position) = update.position.filter(is_finite) else {
                continue;
            };
            if self.mesh.set_vertex(update.vertex_index as usize, position) {
                applied.push(VertexWrite {
                    vertex_index: update.vertex_index,
                    position,
                });
            }
        }

        if applied.len() < updates.len() {
            log::debug!(
                "Session {}: batch applied {}/{} entries",
                self.id,
                applied.len(),
                updates.len()
            );
        }
        if applied.is_empty() {
            return effects;
        }

        effects.push(Effect::SendToOthers {
            exclude: conn,
            message: ServerMessage::BatchRelay { updates: applied },
        });
        effects.extend(self.debounced_store(now, cycle));
        effects
    }

    /// Export the frozen mesh as OBJ text. The first export of a freeze
    /// phase also clears the persisted copy.
    pub fn export(
        &mut self,
        now: Instant,
        cycle: &CycleConfig,
        fresh: &dyn Fn() -> MeshState,
    ) -> (Result<String, SessionError>, Vec<Effect>) {
        let mut effects = Vec::new();
        self.advance(now, cycle, fresh, &mut effects);

        if self.phase != Phase::Frozen {
            return (Err(SessionError::NotReady { phase: self.phase }), effects);
        }

        if !self.storage_cleared {
            self.storage_cleared = true;
            let seq = self.next_write_seq();
            effects.push(Effect::Clear { seq });
        }
        (Ok(self.mesh.to_obj()), effects)
    }

    /// Start over: fresh mesh, editing phase, clock restarted.
    pub fn reset(&mut self, now: Instant, cycle: &CycleConfig, mesh: MeshState) -> Vec<Effect> {
        self.mesh = mesh;
        self.phase = Phase::Editing;
        self.phase_started_at = now;
        self.storage_cleared = false;
        self.last_persisted_at = Some(now);
        self.last_activity = now;
        self.epoch += 1;
        log::info!("Session {} reset", self.id);

        let seq = self.next_write_seq();
        vec![
            Effect::Store {
                seq,
                mesh: self.mesh.clone(),
            },
            Effect::SendToSession(self.snapshot()),
            Effect::SendToSession(ServerMessage::PhaseStatus(self.status(now, cycle))),
        ]
    }

    /// Catch up and report the status to one participant.
    pub fn status_for(
        &mut self,
        conn: ConnectionId,
        now: Instant,
        cycle: &CycleConfig,
        fresh: &dyn Fn() -> MeshState,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.advance(now, cycle, fresh, &mut effects);
        effects.push(Effect::SendTo {
            conn,
            message: ServerMessage::PhaseStatus(self.status(now, cycle)),
        });
        effects
    }

    /// Write the current mesh regardless of the debounce window. Nothing is
    /// written while a cleared freeze is in effect.
    pub fn flush(&mut self, now: Instant) -> Option<Effect> {
        if self.phase == Phase::Frozen && self.storage_cleared {
            return None;
        }
        self.last_persisted_at = Some(now);
        let seq = self.next_write_seq();
        Some(Effect::Store {
            seq,
            mesh: self.mesh.clone(),
        })
    }

    /// Whether nobody touched the session for at least `max_idle`.
    pub fn is_idle(&self, now: Instant, max_idle: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) >= max_idle
    }

    pub(crate) fn set_timer(&mut self, handle: JoinHandle<()>) {
        // Dropping the previous timer aborts it
        self.timer = Some(PhaseTimer {
            epoch: self.epoch,
            handle,
        });
    }

    pub(crate) fn cancel_timer(&mut self) {
        self.timer = None;
    }

    /// Epoch the live timer was armed for, if any.
    pub fn timer_epoch(&self) -> Option<u64> {
        self.timer.as_ref().map(|t| t.epoch)
    }

    fn snapshot(&self) -> ServerMessage {
        ServerMessage::MeshSnapshot {
            mesh: self.mesh.clone(),
        }
    }

    /// Gate for both edit kinds: catch up first, then require `Editing`
    /// with no transition having just happened.
    fn admit_edit(
        &mut self,
        conn: ConnectionId,
        now: Instant,
        cycle: &CycleConfig,
        fresh: &dyn Fn() -> MeshState,
        effects: &mut Vec<Effect>,
    ) -> bool {
        let transitioned = self.advance(now, cycle, fresh, effects);
        self.last_activity = now;
        if transitioned || self.phase != Phase::Editing {
            log::debug!("Session {}: edit from {conn} rejected ({})", self.id, self.phase);
            effects.push(Effect::SendTo {
                conn,
                message: ServerMessage::PhaseStatus(self.status(now, cycle)),
            });
            return false;
        }
        true
    }

    fn debounced_store(&mut self, now: Instant, cycle: &CycleConfig) -> Option<Effect> {
        let due = self
            .last_persisted_at
            .map_or(true, |at| now.saturating_duration_since(at) > cycle.persist_debounce);
        if !due {
            return None;
        }
        self.last_persisted_at = Some(now);
        let seq = self.next_write_seq();
        Some(Effect::Store {
            seq,
            mesh: self.mesh.clone(),
        })
    }

    fn next_write_seq(&mut self) -> u64 {
        self.write_seq += 1;
        self.write_seq
    }
}

fn is_finite(p: &Vec3) -> bool {
    p.iter().all(|c| c.is_finite())
}
