//! Room service: one actor task per live board.
//!
//! ARCHITECTURE
//! ============
//! A room owns its document store, member list, awareness table and flush
//! schedule. Connection tasks talk to it only through a bounded command
//! queue, so every mutation of a board is serialized through one task and
//! unrelated boards run in parallel.
//!
//! LIFECYCLE
//! =========
//! 1. First join for a board hydrates from the snapshot store (single-flight
//!    through the registry) and spawns the actor.
//! 2. Each join receives `doc:snapshot`, then the awareness of its peers,
//!    then live traffic, all through the member's outbound queue.
//! 3. When the last member leaves, a grace timer starts. A join during the
//!    grace period cancels it.
//! 4. When it fires the room flushes, removes itself from the registry,
//!    closes its queue and answers any join still queued with `RoomClosed`
//!    so the joiner retries against a fresh room.
//!
//! ERROR HANDLING
//! ==============
//! If the final flush fails the room stays alive, keeps its dirty state and
//! retries; a board is never evicted with unflushed edits. A member whose
//! outbound queue is full is dropped from the room rather than silently
//! missing fragments.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior, sleep_until};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::doc::codec::{Fragment, MutationBatch, encode_fragment};
use crate::doc::snapshot::{self, SnapshotError};
use crate::doc::store::DocStore;
use crate::frame::{Data, ErrorCode, Frame};
use crate::services::access::Role;
use crate::services::awareness::{self, AwarenessState, AwarenessTable};
use crate::services::persistence::{self, FlushError, FlushSchedule, Hydrated, HydrationError};
use crate::services::registry::RoomRegistry;
use crate::services::snapshot_store::{SnapshotStats, SnapshotStore};
use frames::syscall;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("{0}")]
    Hydration(#[from] HydrationError),
    #[error("room for board {0} is closing")]
    Closed(Uuid),
    #[error("room for board {0} is busy")]
    Busy(Uuid),
    #[error("not a member of board {0}")]
    NotMember(Uuid),
    #[error("read-only access to board {0}")]
    PermissionDenied(Uuid),
    #[error("snapshot encode failed: {0}")]
    Snapshot(#[from] SnapshotError),
}

impl ErrorCode for RoomError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Hydration(_) => "E_HYDRATION_FAILURE",
            Self::Closed(_) => "E_ROOM_CLOSED",
            Self::Busy(_) => "E_RATE_LIMITED",
            Self::NotMember(_) => "E_NOT_MEMBER",
            Self::PermissionDenied(_) => "E_PERMISSION_DENIED",
            Self::Snapshot(_) => "E_INTERNAL",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Hydration(_) | Self::Closed(_) | Self::Busy(_))
    }
}

/// Out-of-band notice to a connection about one of its room links.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The room removed this member; it must rejoin to resync.
    Dropped { board_id: Uuid, code: &'static str, reason: String },
}

/// A connection's membership in one room.
#[derive(Debug, Clone)]
pub struct Member {
    pub client_id: Uuid,
    pub user_id: Uuid,
    pub role: Role,
    pub tx: mpsc::Sender<Frame>,
    pub events: mpsc::UnboundedSender<LinkEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinAck {
    pub entry_count: usize,
    pub members: usize,
    pub clock: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct RoomStats {
    pub live: bool,
    pub members: usize,
    pub entry_count: u64,
    pub last_flushed_at: Option<i64>,
    pub dirty: bool,
}

pub enum RoomCommand {
    Join { member: Member, reply: oneshot::Sender<Result<JoinAck, RoomError>> },
    Leave { client_id: Uuid },
    /// A decoded fragment; `request.payload` holds the original bytes.
    Update { client_id: Uuid, request: Frame, fragment: Fragment },
    Mutate { client_id: Uuid, request: Frame, batch: MutationBatch },
    Awareness { client_id: Uuid, state: AwarenessState },
    AwarenessRemove { client_id: Uuid },
    Stats { reply: oneshot::Sender<RoomStats> },
}

#[derive(Debug, Clone)]
pub struct RoomHandle {
    pub board_id: Uuid,
    pub generation: u64,
    tx: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    /// Enqueue without waiting. A full queue is backpressure, not a wait.
    ///
    /// # Errors
    ///
    /// Returns [`RoomError::Busy`] on a full queue and [`RoomError::Closed`]
    /// once the room has shut down.
    pub fn try_send(&self, cmd: RoomCommand) -> Result<(), RoomError> {
        self.tx.try_send(cmd).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RoomError::Busy(self.board_id),
            mpsc::error::TrySendError::Closed(_) => RoomError::Closed(self.board_id),
        })
    }

    /// Enqueue, waiting for queue space.
    ///
    /// # Errors
    ///
    /// Returns [`RoomError::Closed`] once the room has shut down.
    pub async fn send(&self, cmd: RoomCommand) -> Result<(), RoomError> {
        self.tx.send(cmd).await.map_err(|_| RoomError::Closed(self.board_id))
    }

    /// Deliver a leave even when the queue is momentarily full.
    pub fn leave(&self, client_id: Uuid) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(RoomCommand::Leave { client_id }).await;
        });
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// A handle whose actor is already gone.
    #[cfg(test)]
    pub(crate) fn detached(board_id: Uuid, generation: u64) -> Self {
        let (tx, _) = mpsc::channel(1);
        Self { board_id, generation, tx }
    }
}

/// What a room needs from the process beyond its own state.
#[derive(Clone)]
pub struct RoomDeps {
    pub config: Arc<SyncConfig>,
    pub store: Arc<dyn SnapshotStore>,
    pub registry: RoomRegistry,
}

struct FlushOutcome {
    version: u64,
    result: Result<SnapshotStats, FlushError>,
}

// =============================================================================
// SPAWN
// =============================================================================

/// Start the actor for a freshly hydrated board.
#[must_use]
pub fn spawn(deps: RoomDeps, board_id: Uuid, generation: u64, hydrated: Hydrated) -> RoomHandle {
    let (tx, rx) = mpsc::channel(deps.config.room_queue_capacity);
    let now = Instant::now();

    let mut doc = DocStore::new(Uuid::new_v4());
    let entries = hydrated.snapshot.entry_count();
    doc.hydrate(hydrated.snapshot);

    let mut schedule = FlushSchedule::new(deps.config.flush);
    if hydrated.migrated {
        // Rewrite migrated state in the current format.
        schedule.mark_dirty(now);
    }

    let room = Room {
        board_id,
        generation,
        awareness: AwarenessTable::new(deps.config.awareness_timeout),
        grace_deadline: Some(now + deps.config.room_grace),
        deps,
        doc,
        members: HashMap::new(),
        schedule,
        flushes: JoinSet::new(),
        stats: hydrated.stats,
    };

    info!(%board_id, generation, entries, "room: hydrated");
    tokio::spawn(room.run(rx));
    RoomHandle { board_id, generation, tx }
}

// =============================================================================
// ACTOR
// =============================================================================

struct Room {
    board_id: Uuid,
    generation: u64,
    deps: RoomDeps,
    doc: DocStore,
    members: HashMap<Uuid, Member>,
    awareness: AwarenessTable,
    schedule: FlushSchedule,
    flushes: JoinSet<FlushOutcome>,
    stats: Option<SnapshotStats>,
    grace_deadline: Option<Instant>,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl Room {
    async fn run(mut self, mut rx: mpsc::Receiver<RoomCommand>) {
        let mut sweep = tokio::time::interval(self.deps.config.awareness_sweep);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let flush_due = self.schedule.due_at();
            let grace_due = self.grace_deadline;

            tokio::select! {
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    self.handle(cmd);
                }
                Some(joined) = self.flushes.join_next() => {
                    self.finish_flush(joined);
                }
                () = sleep_until_opt(flush_due) => {
                    self.start_flush();
                }
                () = sleep_until_opt(grace_due) => {
                    if self.shutdown_if_idle(&mut rx).await {
                        return;
                    }
                }
                _ = sweep.tick() => {
                    self.sweep();
                }
            }
        }
    }

    fn handle(&mut self, cmd: RoomCommand) {
        match cmd {
            RoomCommand::Join { member, reply } => self.join(member, reply),
            RoomCommand::Leave { client_id } => self.leave(client_id),
            RoomCommand::Update { client_id, request, fragment } => self.update(client_id, &request, &fragment),
            RoomCommand::Mutate { client_id, request, batch } => self.mutate(client_id, &request, batch),
            RoomCommand::Awareness { client_id, state } => self.set_awareness(client_id, state),
            RoomCommand::AwarenessRemove { client_id } => {
                if self.awareness.remove(client_id) {
                    let frame = self.removal_frame(client_id);
                    self.broadcast(&frame, Some(client_id));
                }
            }
            RoomCommand::Stats { reply } => {
                let _ = reply.send(self.room_stats());
            }
        }
    }

    // -------------------------------------------------------------------------
    // MEMBERSHIP
    // -------------------------------------------------------------------------

    fn join(&mut self, member: Member, reply: oneshot::Sender<Result<JoinAck, RoomError>>) {
        let client_id = member.client_id;

        // PHASE: SNAPSHOT FIRST
        // WHY: the joiner must hold full state before any live fragment.
        let snapshot = self.doc.snapshot();
        let bytes = match snapshot::encode_snapshot(&snapshot) {
            Ok(b) => b,
            Err(e) => {
                error!(board_id = %self.board_id, error = %e, "room: snapshot encode failed");
                let _ = reply.send(Err(RoomError::Snapshot(e)));
                return;
            }
        };
        let snapshot_frame = Frame::request(syscall::DOC_SNAPSHOT, Data::new())
            .with_board_id(self.board_id)
            .with_data("entry_count", snapshot.entry_count())
            .with_data("clock", snapshot.clock)
            .with_payload(bytes);
        if member.tx.try_send(snapshot_frame).is_err() {
            let _ = reply.send(Err(RoomError::Busy(self.board_id)));
            return;
        }

        // PHASE: PEER PRESENCE
        for data in self.awareness.states_except(client_id) {
            let frame = Frame::request(syscall::AWARENESS_UPDATE, data).with_board_id(self.board_id);
            if member.tx.try_send(frame).is_err() {
                break;
            }
        }

        self.members.insert(client_id, member);
        self.grace_deadline = None;
        let ack = JoinAck { entry_count: snapshot.entry_count(), members: self.members.len(), clock: snapshot.clock };

        // EDGE: the joiner gave up (timeout or disconnect) before the ack.
        if reply.send(Ok(ack)).is_err() {
            self.leave(client_id);
            return;
        }
        info!(board_id = %self.board_id, %client_id, members = self.members.len(), "room: member joined");
    }

    fn leave(&mut self, client_id: Uuid) {
        if self.members.remove(&client_id).is_none() {
            return;
        }
        self.awareness.remove(client_id);
        info!(board_id = %self.board_id, %client_id, remaining = self.members.len(), "room: member left");
        let frame = self.removal_frame(client_id);
        self.broadcast(&frame, None);
        self.arm_grace_if_empty();
    }

    fn arm_grace_if_empty(&mut self) {
        if self.members.is_empty() && self.grace_deadline.is_none() {
            self.grace_deadline = Some(Instant::now() + self.deps.config.room_grace);
            debug!(board_id = %self.board_id, "room: empty; grace period started");
        }
    }

    /// Editor gate for document traffic. Sends the error frame itself.
    fn editor(&mut self, client_id: Uuid, request: &Frame) -> bool {
        let Some(member) = self.members.get(&client_id) else {
            debug!(board_id = %self.board_id, %client_id, "room: command from non-member ignored");
            return false;
        };
        if !member.role.can_mutate() {
            warn!(board_id = %self.board_id, %client_id, "room: mutation from viewer rejected");
            self.reply(client_id, request.error_from(&RoomError::PermissionDenied(self.board_id)));
            return false;
        }
        true
    }

    // -------------------------------------------------------------------------
    // DOCUMENT
    // -------------------------------------------------------------------------

    fn update(&mut self, client_id: Uuid, request: &Frame, fragment: &Fragment) {
        if !self.editor(client_id, request) {
            return;
        }

        let applied = self.doc.merge(fragment);
        let mut reply = Data::new();
        reply.insert("applied".into(), serde_json::json!(applied.len()));
        self.reply(client_id, request.done_with(reply));

        if applied.is_empty() {
            return;
        }
        self.schedule.mark_dirty(Instant::now());

        // Relay the sender's bytes verbatim.
        let relay = Frame::request(syscall::DOC_UPDATE, Data::new())
            .with_board_id(self.board_id)
            .with_from(client_id.to_string())
            .with_payload(request.payload.clone());
        self.broadcast(&relay, Some(client_id));
    }

    fn mutate(&mut self, client_id: Uuid, request: &Frame, batch: MutationBatch) {
        if !self.editor(client_id, request) {
            return;
        }

        let before = self.doc.version();
        let fragment = match self.doc.apply_local_as(client_id, batch) {
            Ok(fragment) => fragment,
            Err(e) => {
                error!(board_id = %self.board_id, %client_id, error = %e, "room: mutation rejected");
                self.reply(client_id, request.error_from(&e));
                return;
            }
        };
        let mut reply = Data::new();
        reply.insert("clock".into(), serde_json::json!(fragment.clock));
        reply.insert("ops".into(), serde_json::json!(fragment.ops.len()));
        self.reply(client_id, request.done_with(reply));

        if fragment.is_empty() || self.doc.version() == before {
            return;
        }
        self.schedule.mark_dirty(Instant::now());

        let relay = Frame::request(syscall::DOC_UPDATE, Data::new())
            .with_board_id(self.board_id)
            .with_from(client_id.to_string())
            .with_payload(encode_fragment(&fragment));
        self.broadcast(&relay, None);
    }

    // -------------------------------------------------------------------------
    // AWARENESS
    // -------------------------------------------------------------------------

    fn set_awareness(&mut self, client_id: Uuid, state: AwarenessState) {
        let Some(member) = self.members.get(&client_id) else {
            return;
        };
        let data = state.to_data(client_id, member.user_id);
        self.awareness.update(client_id, member.user_id, state, Instant::now());
        let frame = Frame::request(syscall::AWARENESS_UPDATE, data).with_board_id(self.board_id);
        self.broadcast(&frame, Some(client_id));
    }

    fn removal_frame(&self, client_id: Uuid) -> Frame {
        Frame::request(syscall::AWARENESS_REMOVE, awareness::removal_data(client_id)).with_board_id(self.board_id)
    }

    fn sweep(&mut self) {
        // Members whose connection is gone never sent a leave.
        let gone: Vec<Uuid> = self
            .members
            .iter()
            .filter(|(_, m)| m.tx.is_closed())
            .map(|(id, _)| *id)
            .collect();
        for client_id in gone {
            self.leave(client_id);
        }

        for client_id in self.awareness.sweep(Instant::now()) {
            debug!(board_id = %self.board_id, %client_id, "room: awareness expired");
            let frame = self.removal_frame(client_id);
            self.broadcast(&frame, None);
        }
    }

    // -------------------------------------------------------------------------
    // BROADCAST
    // -------------------------------------------------------------------------

    /// Send to every member except `exclude`. Members that cannot take the
    /// frame are dropped, and their presence retraction is sent in turn.
    fn broadcast(&mut self, frame: &Frame, exclude: Option<Uuid>) {
        let mut pending = vec![(frame.clone(), exclude)];

        while let Some((frame, exclude)) = pending.pop() {
            let mut dropped = Vec::new();
            for (client_id, member) in &self.members {
                if exclude == Some(*client_id) {
                    continue;
                }
                match member.tx.try_send(frame.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => dropped.push((*client_id, true)),
                    Err(mpsc::error::TrySendError::Closed(_)) => dropped.push((*client_id, false)),
                }
            }

            for (client_id, slow) in dropped {
                if self.detach(client_id, slow) {
                    pending.push((self.removal_frame(client_id), None));
                }
            }
        }

        self.arm_grace_if_empty();
    }

    /// Send to one member. A member that cannot take its own reply is
    /// dropped the same way `broadcast` drops it.
    fn reply(&mut self, client_id: Uuid, frame: Frame) {
        let Some(member) = self.members.get(&client_id) else {
            return;
        };
        let slow = match member.tx.try_send(frame) {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        };
        if self.detach(client_id, slow) {
            let frame = self.removal_frame(client_id);
            self.broadcast(&frame, None);
        }
    }

    /// Remove a member that can no longer receive. Slow members are told to
    /// resync through their link events.
    fn detach(&mut self, client_id: Uuid, slow: bool) -> bool {
        let Some(member) = self.members.remove(&client_id) else {
            return false;
        };
        if slow {
            warn!(board_id = %self.board_id, %client_id, "room: outbound queue full; member dropped");
            let _ = member.events.send(LinkEvent::Dropped {
                board_id: self.board_id,
                code: "E_SLOW_CONSUMER",
                reason: "outbound queue full; rejoin to resync".into(),
            });
        }
        self.awareness.remove(client_id);
        true
    }

    // -------------------------------------------------------------------------
    // PERSISTENCE
    // -------------------------------------------------------------------------

    fn start_flush(&mut self) {
        if self.schedule.in_flight() {
            return;
        }
        // PHASE: COPY-ON-READ
        // WHY: the write runs off-actor while edits keep landing.
        let snapshot = self.doc.snapshot();
        let version = self.doc.version();
        self.schedule.begin();

        let store = Arc::clone(&self.deps.store);
        let board_id = self.board_id;
        self.flushes.spawn(async move {
            let result = persistence::write_snapshot(store.as_ref(), board_id, &snapshot).await;
            FlushOutcome { version, result }
        });
    }

    fn finish_flush(&mut self, joined: Result<FlushOutcome, JoinError>) {
        let now = Instant::now();
        match joined {
            Ok(FlushOutcome { version, result: Ok(stats) }) => {
                self.stats = Some(stats);
                // EDGE: keep dirty if the store changed after the snapshot.
                self.schedule.succeeded(self.doc.version() != version, now);
            }
            Ok(FlushOutcome { result: Err(e), .. }) => {
                self.schedule.failed(now, persistence::jitter());
                error!(
                    board_id = %self.board_id,
                    error = %e,
                    code = e.error_code(),
                    failures = self.schedule.failures(),
                    "room: flush failed; retrying"
                );
            }
            Err(e) => {
                self.schedule.failed(now, persistence::jitter());
                error!(board_id = %self.board_id, error = %e, "room: flush task aborted; retrying");
            }
        }
    }

    fn room_stats(&self) -> RoomStats {
        RoomStats {
            live: true,
            members: self.members.len(),
            entry_count: u64::try_from(self.doc.entry_count()).unwrap_or(u64::MAX),
            last_flushed_at: self.stats.map(|s| s.flushed_at),
            dirty: self.schedule.is_dirty(),
        }
    }

    // -------------------------------------------------------------------------
    // SHUTDOWN
    // -------------------------------------------------------------------------

    /// Returns true when the room has shut down and the actor must exit.
    async fn shutdown_if_idle(&mut self, rx: &mut mpsc::Receiver<RoomCommand>) -> bool {
        self.grace_deadline = None;
        if !self.members.is_empty() {
            return false;
        }

        // PHASE: FINAL FLUSH
        while let Some(joined) = self.flushes.join_next().await {
            self.finish_flush(joined);
        }
        if self.schedule.is_dirty() {
            let snapshot = self.doc.snapshot();
            let version = self.doc.version();
            self.schedule.begin();
            let result = persistence::write_snapshot(self.deps.store.as_ref(), self.board_id, &snapshot).await;
            self.finish_flush(Ok(FlushOutcome { version, result }));
        }
        if self.schedule.is_dirty() {
            error!(board_id = %self.board_id, "room: final flush failed; room retained for retry");
            self.grace_deadline = Some(Instant::now() + self.deps.config.room_grace);
            return false;
        }

        // PHASE: DEREGISTER, THEN CLOSE
        // WHY: once deregistered, new joiners build a fresh room from the
        // flushed snapshot; anything already queued here is told to retry.
        self.deps.registry.remove(self.board_id, self.generation);
        rx.close();
        while let Some(cmd) = rx.recv().await {
            match cmd {
                RoomCommand::Join { reply, .. } => {
                    let _ = reply.send(Err(RoomError::Closed(self.board_id)));
                }
                RoomCommand::Stats { reply } => {
                    let _ = reply.send(RoomStats { live: false, ..self.room_stats() });
                }
                _ => {}
            }
        }
        info!(board_id = %self.board_id, generation = self.generation, "room: closed");
        true
    }
}

#[cfg(test)]
#[path = "room_test.rs"]
mod tests;
