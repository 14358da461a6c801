//! Durable snapshot storage, one row per board.
//!
//! DESIGN
//! ======
//! A board's durable state is a single blob that is replaced atomically on
//! every flush (`INSERT ... ON CONFLICT DO UPDATE`). Metadata columns
//! (`entry_count`, `flushed_at_ms`) sit beside the blob so stats can be
//! served without decoding it.
//!
//! Blobs that fail to decode are copied to a quarantine table before the
//! board is reset, so a bad migration never destroys the only copy.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("snapshot store unavailable: {0}")]
    Unavailable(String),
}

/// One stored snapshot row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSnapshot {
    pub format: i32,
    pub data: Vec<u8>,
    pub entry_count: u64,
    /// Milliseconds since Unix epoch.
    pub flushed_at: i64,
}

/// Metadata of the last successful flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct SnapshotStats {
    pub entry_count: u64,
    pub flushed_at: i64,
}

impl StoredSnapshot {
    #[must_use]
    pub fn stats(&self) -> SnapshotStats {
        SnapshotStats { entry_count: self.entry_count, flushed_at: self.flushed_at }
    }
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn get(&self, board_id: Uuid) -> Result<Option<StoredSnapshot>, StoreError>;

    /// Replace the board's snapshot. Either the whole row is written or the
    /// previous one survives.
    async fn put(&self, board_id: Uuid, snapshot: &StoredSnapshot) -> Result<(), StoreError>;

    async fn stats(&self, board_id: Uuid) -> Result<Option<SnapshotStats>, StoreError>;

    /// Keep a copy of an undecodable blob for manual recovery.
    async fn quarantine(&self, board_id: Uuid, snapshot: &StoredSnapshot, reason: &str) -> Result<(), StoreError>;
}

// =============================================================================
// POSTGRES
// =============================================================================

pub struct PgSnapshotStore {
    pool: PgPool,
}

impl PgSnapshotStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn count_to_db(count: u64) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

fn count_from_db(count: i64) -> u64 {
    u64::try_from(count).unwrap_or(0)
}

#[async_trait]
impl SnapshotStore for PgSnapshotStore {
    async fn get(&self, board_id: Uuid) -> Result<Option<StoredSnapshot>, StoreError> {
        let row = sqlx::query(
            "SELECT format, data, entry_count, flushed_at_ms FROM board_snapshots WHERE board_id = $1",
        )
        .bind(board_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| StoredSnapshot {
            format: r.get("format"),
            data: r.get("data"),
            entry_count: count_from_db(r.get("entry_count")),
            flushed_at: r.get("flushed_at_ms"),
        }))
    }

    async fn put(&self, board_id: Uuid, snapshot: &StoredSnapshot) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO board_snapshots (board_id, format, data, entry_count, flushed_at_ms) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (board_id) DO UPDATE SET \
                 format = EXCLUDED.format, data = EXCLUDED.data, \
                 entry_count = EXCLUDED.entry_count, flushed_at_ms = EXCLUDED.flushed_at_ms",
        )
        .bind(board_id)
        .bind(snapshot.format)
        .bind(&snapshot.data)
        .bind(count_to_db(snapshot.entry_count))
        .bind(snapshot.flushed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn stats(&self, board_id: Uuid) -> Result<Option<SnapshotStats>, StoreError> {
        let row = sqlx::query_as::<_, (i64, i64)>(
            "SELECT entry_count, flushed_at_ms FROM board_snapshots WHERE board_id = $1",
        )
        .bind(board_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(entry_count, flushed_at)| SnapshotStats { entry_count: count_from_db(entry_count), flushed_at }))
    }

    async fn quarantine(&self, board_id: Uuid, snapshot: &StoredSnapshot, reason: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO board_snapshot_quarantine (id, board_id, format, data, reason) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(Uuid::new_v4())
        .bind(board_id)
        .bind(snapshot.format)
        .bind(&snapshot.data)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// =============================================================================
// IN-MEMORY
// =============================================================================

/// Process-local store for development without a database, and for tests.
#[derive(Default)]
pub struct MemorySnapshotStore {
    rows: Mutex<HashMap<Uuid, StoredSnapshot>>,
    quarantined: Mutex<Vec<(Uuid, StoredSnapshot, String)>>,
}

impl MemorySnapshotStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a row directly, bypassing the flush path.
    pub fn insert(&self, board_id: Uuid, snapshot: StoredSnapshot) {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(board_id, snapshot);
    }

    #[must_use]
    pub fn quarantined(&self) -> Vec<(Uuid, StoredSnapshot, String)> {
        self.quarantined
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn get(&self, board_id: Uuid) -> Result<Option<StoredSnapshot>, StoreError> {
        let rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(rows.get(&board_id).cloned())
    }

    async fn put(&self, board_id: Uuid, snapshot: &StoredSnapshot) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        rows.insert(board_id, snapshot.clone());
        Ok(())
    }

    async fn stats(&self, board_id: Uuid) -> Result<Option<SnapshotStats>, StoreError> {
        let rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(rows.get(&board_id).map(StoredSnapshot::stats))
    }

    async fn quarantine(&self, board_id: Uuid, snapshot: &StoredSnapshot, reason: &str) -> Result<(), StoreError> {
        self.quarantined
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((board_id, snapshot.clone(), reason.to_owned()));
        Ok(())
    }
}

#[cfg(test)]
#[path = "snapshot_store_test.rs"]
mod tests;
