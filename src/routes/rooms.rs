//! Room metrics routes.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use tracing::warn;
use uuid::Uuid;

use crate::services::registry;
use crate::services::room::RoomStats;
use crate::state::AppState;

/// `GET /api/rooms/:id/stats`: entry count and flush time for one board.
///
/// Live rooms answer from memory; idle boards answer from the store's
/// metadata columns without decoding the snapshot.
pub async fn room_stats(
    State(state): State<AppState>,
    Path(board_id): Path<Uuid>,
) -> Result<Json<RoomStats>, StatusCode> {
    registry::stats(&state.room_deps(), board_id)
        .await
        .map(Json)
        .map_err(|e| {
            warn!(%board_id, error = %e, "rooms: stats unavailable");
            StatusCode::SERVICE_UNAVAILABLE
        })
}
