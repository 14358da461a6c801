//! Room registry: which board has a live room, and getting one.
//!
//! DESIGN
//! ======
//! Each board maps to a slot holding a `OnceCell`. Concurrent first joins
//! for the same board share one hydration: the first caller loads the
//! snapshot and spawns the actor, the rest await the same cell. A failed
//! hydration leaves the cell empty and removes the slot so the next join
//! starts over.
//!
//! Slots carry a generation. A room removes its own slot on shutdown only
//! if the generation still matches, so a stale room can never evict its
//! successor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{OnceCell, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::services::persistence;
use crate::services::room::{self, JoinAck, Member, RoomCommand, RoomDeps, RoomError, RoomHandle, RoomStats};
use crate::services::snapshot_store::StoreError;

/// Joins racing a room shutdown retry this many times.
const JOIN_ATTEMPTS: usize = 3;

struct RoomSlot {
    generation: u64,
    cell: OnceCell<RoomHandle>,
}

#[derive(Default)]
struct Slots {
    by_board: HashMap<Uuid, Arc<RoomSlot>>,
    next_generation: u64,
}

#[derive(Clone, Default)]
pub struct RoomRegistry {
    inner: Arc<Mutex<Slots>>,
}

impl RoomRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, board_id: Uuid) -> Arc<RoomSlot> {
        let mut slots = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = slots.by_board.get(&board_id) {
            return Arc::clone(slot);
        }
        slots.next_generation += 1;
        let slot = Arc::new(RoomSlot { generation: slots.next_generation, cell: OnceCell::new() });
        slots.by_board.insert(board_id, Arc::clone(&slot));
        slot
    }

    /// Handle of the live room for `board_id`, if one is running.
    #[must_use]
    pub fn get(&self, board_id: Uuid) -> Option<RoomHandle> {
        let slots = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        slots.by_board.get(&board_id).and_then(|s| s.cell.get().cloned())
    }

    /// Deregister a room that is shutting down.
    pub(crate) fn remove(&self, board_id: Uuid, generation: u64) {
        let mut slots = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if slots.by_board.get(&board_id).is_some_and(|s| s.generation == generation) {
            slots.by_board.remove(&board_id);
        }
    }

    fn discard_failed(&self, board_id: Uuid, slot: &Arc<RoomSlot>) {
        let mut slots = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if slots
            .by_board
            .get(&board_id)
            .is_some_and(|s| Arc::ptr_eq(s, slot) && !s.cell.initialized())
        {
            slots.by_board.remove(&board_id);
        }
    }

    /// Drop `slot` if it is still the one registered for `board_id`.
    fn remove_slot(&self, board_id: Uuid, slot: &Arc<RoomSlot>) {
        let mut slots = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if slots.by_board.get(&board_id).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            slots.by_board.remove(&board_id);
        }
    }

    /// Number of boards with a live room.
    #[must_use]
    pub fn live_count(&self) -> usize {
        let slots = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        slots.by_board.values().filter(|s| s.cell.initialized()).count()
    }
}

// =============================================================================
// OPERATIONS
// =============================================================================

/// Return the live room for `board_id`, hydrating it first if needed.
///
/// # Errors
///
/// Returns [`RoomError::Hydration`] when the snapshot store fails or is too
/// slow. The failure is shared by every join waiting on the same hydration.
pub async fn ensure_room(deps: &RoomDeps, board_id: Uuid) -> Result<RoomHandle, RoomError> {
    loop {
        let slot = deps.registry.slot(board_id);
        let result = slot
            .cell
            .get_or_try_init(|| async {
                let hydrated =
                    persistence::load_for_hydration(deps.store.as_ref(), board_id, deps.config.hydration_timeout)
                        .await?;
                Ok::<_, RoomError>(room::spawn(deps.clone(), board_id, slot.generation, hydrated))
            })
            .await;

        match result {
            // EDGE: an actor that exited without deregistering (it panicked)
            // leaves a dead handle behind; replace the room.
            Ok(handle) if handle.is_closed() => {
                warn!(%board_id, generation = slot.generation, "registry: room handle closed; replacing room");
                deps.registry.remove_slot(board_id, &slot);
            }
            Ok(handle) => return Ok(handle.clone()),
            Err(e) => {
                warn!(%board_id, error = %e, "registry: hydration failed");
                deps.registry.discard_failed(board_id, &slot);
                return Err(e);
            }
        }
    }
}

/// Add `member` to the board's room, creating the room if needed. The
/// member's queue receives `doc:snapshot` before this returns.
///
/// # Errors
///
/// Returns [`RoomError`] on hydration failure, a room too busy to take the
/// join, or a room that kept closing underneath the join.
pub async fn join(deps: &RoomDeps, board_id: Uuid, member: Member) -> Result<(RoomHandle, JoinAck), RoomError> {
    for attempt in 1..=JOIN_ATTEMPTS {
        let handle = ensure_room(deps, board_id).await?;
        let (reply_tx, reply_rx) = oneshot::channel();
        let cmd = RoomCommand::Join { member: member.clone(), reply: reply_tx };

        match tokio::time::timeout(deps.config.hydration_timeout, handle.send(cmd)).await {
            Ok(Ok(())) => {}
            Ok(Err(RoomError::Closed(_))) => {
                debug!(%board_id, attempt, "registry: room closed before join; retrying");
                continue;
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(RoomError::Busy(board_id)),
        }

        match reply_rx.await {
            Ok(Ok(ack)) => return Ok((handle, ack)),
            Ok(Err(RoomError::Closed(_))) | Err(_) => {
                debug!(%board_id, attempt, "registry: room closed during join; retrying");
            }
            Ok(Err(e)) => return Err(e),
        }
    }
    Err(RoomError::Closed(board_id))
}

/// Stats for a board: from the live room when there is one, otherwise from
/// the store's metadata without decoding the blob.
///
/// # Errors
///
/// Returns [`StoreError`] if the store cannot be read.
pub async fn stats(deps: &RoomDeps, board_id: Uuid) -> Result<RoomStats, StoreError> {
    if let Some(handle) = deps.registry.get(board_id) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if handle.try_send(RoomCommand::Stats { reply: reply_tx }).is_ok() {
            if let Ok(Ok(stats)) = tokio::time::timeout(deps.config.hydration_timeout, reply_rx).await {
                return Ok(stats);
            }
        }
    }

    let stored = deps.store.stats(board_id).await?;
    Ok(RoomStats {
        live: false,
        members: 0,
        entry_count: stored.map_or(0, |s| s.entry_count),
        last_flushed_at: stored.map(|s| s.flushed_at),
        dirty: false,
    })
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod tests;
