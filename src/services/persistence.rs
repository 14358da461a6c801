//! Persistence service: debounced snapshot flushes and hydration loads.
//!
//! DESIGN
//! ======
//! Each room owns a [`FlushSchedule`] and asks it when the next flush is
//! due. A flush is due after a quiet interval with no edits, or once the
//! oldest unflushed edit reaches the staleness bound, whichever comes first.
//! The write itself ([`write_snapshot`]) runs on a spawned task so the room
//! keeps serving edits; the schedule allows one write in flight.
//!
//! ERROR HANDLING
//! ==============
//! Dirty state is cleared only after a successful write, and only if no edit
//! landed after the snapshot was taken. A failed write keeps the previous
//! durable copy and retries with exponential backoff plus jitter. On load,
//! an unreadable blob is quarantined and the board starts empty; the
//! failure is logged as a data-integrity error, never swallowed. A store
//! that cannot be reached fails the join instead.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::FlushConfig;
use crate::doc::snapshot::{self, FORMAT_CURRENT, SnapshotError};
use crate::doc::store::DocSnapshot;
use crate::services::snapshot_store::{SnapshotStats, SnapshotStore, StoreError, StoredSnapshot};

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum FlushError {
    #[error("flush encode failed: {0}")]
    Encode(#[from] SnapshotError),
    #[error("flush write failed: {0}")]
    Store(#[from] StoreError),
}

impl crate::frame::ErrorCode for FlushError {
    fn error_code(&self) -> &'static str {
        "E_FLUSH_FAILURE"
    }

    fn retryable(&self) -> bool {
        true
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HydrationError {
    #[error("snapshot store unavailable: {0}")]
    Unavailable(#[from] StoreError),
    #[error("snapshot load timed out after {0:?}")]
    TimedOut(Duration),
}

impl crate::frame::ErrorCode for HydrationError {
    fn error_code(&self) -> &'static str {
        "E_HYDRATION_FAILURE"
    }

    fn retryable(&self) -> bool {
        true
    }
}

// =============================================================================
// SCHEDULE
// =============================================================================

/// Debounce bookkeeping for one room. Pure state; the caller owns the clock.
#[derive(Debug)]
pub struct FlushSchedule {
    config: FlushConfig,
    /// First edit not covered by a durable or in-flight snapshot.
    dirty_since: Option<Instant>,
    last_edit: Option<Instant>,
    /// `dirty_since` as it was when the in-flight write started.
    flushing_since: Option<Instant>,
    in_flight: bool,
    failures: u32,
    retry_at: Option<Instant>,
}

impl FlushSchedule {
    #[must_use]
    pub fn new(config: FlushConfig) -> Self {
        Self {
            config,
            dirty_since: None,
            last_edit: None,
            flushing_since: None,
            in_flight: false,
            failures: 0,
            retry_at: None,
        }
    }

    pub fn mark_dirty(&mut self, now: Instant) {
        self.dirty_since.get_or_insert(now);
        self.last_edit = Some(now);
    }

    /// True while any edit is not yet durable.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty_since.is_some() || self.in_flight
    }

    #[must_use]
    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    #[must_use]
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// When the next write should start, or `None` if nothing is pending.
    #[must_use]
    pub fn due_at(&self) -> Option<Instant> {
        if self.in_flight {
            return None;
        }
        let dirty_since = self.dirty_since?;
        if let Some(retry_at) = self.retry_at {
            return Some(retry_at);
        }
        let quiet = self.last_edit.unwrap_or(dirty_since) + self.config.quiet;
        let stale = dirty_since + self.config.max_staleness;
        Some(quiet.min(stale))
    }

    /// A write has started with a snapshot taken now.
    pub fn begin(&mut self) {
        self.in_flight = true;
        self.flushing_since = self.dirty_since.take();
    }

    /// The in-flight write succeeded. `edited_since` reports whether the
    /// store changed after the snapshot was taken.
    pub fn succeeded(&mut self, edited_since: bool, now: Instant) {
        self.in_flight = false;
        self.failures = 0;
        self.retry_at = None;
        self.flushing_since = None;
        if edited_since {
            self.dirty_since.get_or_insert(now);
        } else {
            self.dirty_since = None;
            self.last_edit = None;
        }
    }

    /// The in-flight write failed. `jitter` is in `[0, 1)`.
    pub fn failed(&mut self, now: Instant, jitter: f64) {
        self.in_flight = false;
        self.failures = self.failures.saturating_add(1);
        self.dirty_since = match (self.flushing_since.take(), self.dirty_since) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b).or(Some(now)),
        };
        self.retry_at = Some(now + self.backoff(jitter));
    }

    /// Exponential delay for the current failure count, scaled into
    /// `[delay / 2, delay)` by `jitter`.
    #[must_use]
    pub fn backoff(&self, jitter: f64) -> Duration {
        let exp = self.failures.saturating_sub(1).min(16);
        let delay = self
            .config
            .retry_base
            .saturating_mul(1_u32 << exp)
            .min(self.config.retry_max);
        delay.mul_f64(0.5 + jitter.clamp(0.0, 1.0) * 0.5)
    }
}

/// Uniform jitter source for [`FlushSchedule::failed`].
#[must_use]
pub fn jitter() -> f64 {
    rand::rng().random::<f64>()
}

// =============================================================================
// FLUSH
// =============================================================================

/// Serialize and durably replace the board's snapshot.
///
/// # Errors
///
/// Returns [`FlushError`] if encoding or the store write fails. The previous
/// durable copy is untouched in that case.
pub async fn write_snapshot(
    store: &dyn SnapshotStore,
    board_id: Uuid,
    snapshot: &DocSnapshot,
) -> Result<SnapshotStats, FlushError> {
    let data = snapshot::encode_snapshot(snapshot)?;
    let row = StoredSnapshot {
        format: FORMAT_CURRENT,
        data,
        entry_count: u64::try_from(snapshot.entry_count()).unwrap_or(u64::MAX),
        flushed_at: crate::frame::now_ms(),
    };
    store.put(board_id, &row).await?;
    info!(%board_id, entry_count = row.entry_count, bytes = row.data.len(), "persistence: snapshot flushed");
    Ok(row.stats())
}

// =============================================================================
// HYDRATION
// =============================================================================

/// State a new room starts from.
#[derive(Debug, Default)]
pub struct Hydrated {
    pub snapshot: DocSnapshot,
    /// Metadata of the row it came from, if any.
    pub stats: Option<SnapshotStats>,
    /// The row was in an older format and should be rewritten.
    pub migrated: bool,
}

/// Load a board's durable state for a new room.
///
/// # Errors
///
/// Returns [`HydrationError`] when the store fails or does not answer in
/// time. A row that exists but cannot be decoded is not an error: it is
/// quarantined and the board starts empty.
pub async fn load_for_hydration(
    store: &dyn SnapshotStore,
    board_id: Uuid,
    timeout: Duration,
) -> Result<Hydrated, HydrationError> {
    let row = match tokio::time::timeout(timeout, store.get(board_id)).await {
        Ok(result) => result?,
        Err(_) => return Err(HydrationError::TimedOut(timeout)),
    };
    let Some(row) = row else {
        return Ok(Hydrated::default());
    };

    match snapshot::decode_snapshot(row.format, &row.data) {
        Ok(snapshot) => {
            let migrated = row.format != FORMAT_CURRENT;
            if migrated {
                info!(%board_id, format = row.format, entries = snapshot.entry_count(), "persistence: migrated legacy snapshot");
            }
            Ok(Hydrated { snapshot, stats: Some(row.stats()), migrated })
        }
        Err(e) => {
            error!(
                %board_id,
                format = row.format,
                bytes = row.data.len(),
                error = %e,
                data_integrity = true,
                "persistence: snapshot unreadable; starting board empty"
            );
            if let Err(qe) = store.quarantine(board_id, &row, &e.to_string()).await {
                warn!(%board_id, error = %qe, data_integrity = true, "persistence: quarantine copy failed");
            }
            Ok(Hydrated::default())
        }
    }
}

#[cfg(test)]
#[path = "persistence_test.rs"]
mod tests;
