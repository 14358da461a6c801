//! WebSocket handler: session manager between one socket and its rooms.
//!
//! DESIGN
//! ======
//! On upgrade, authenticates the ticket, generates a client ID and enters a
//! `select!` loop:
//! - Incoming client frames → decode + dispatch by syscall prefix
//! - Frames queued by rooms (snapshots, peer fragments, replies) → socket
//! - Link events from rooms (member dropped) → `board:part` to the client
//! - Finished joins → link the room, queue the `board:join` reply
//!
//! Joins may wait on hydration, so they run on their own task; the loop
//! keeps draining the shared queue for rooms already linked meanwhile.
//!
//! One connection may be linked to several boards at once. Handlers validate,
//! charge the rate limiter and enqueue a command on the room; the room does
//! the work and replies through the connection's queue, so per-room ordering
//! is the room's ordering.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → send `session:connected` with `client_id`
//! 2. `board:join` → room pushes `doc:snapshot`, then live traffic
//! 3. `doc:update` / `doc:mutate` / `awareness:*` → room command
//! 4. Close → leave every linked room → forget rate-limit buckets

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::doc::codec::{self, MutationBatch};
use crate::frame::{Data, ErrorCode, Frame, Status};
use crate::rate_limit::TrafficClass;
use crate::services::access::Role;
use crate::services::awareness::AwarenessState;
use crate::services::registry;
use crate::services::room::{JoinAck, LinkEvent, Member, RoomCommand, RoomError, RoomHandle};
use crate::state::AppState;
use frames::syscall;

// =============================================================================
// TYPES
// =============================================================================

/// Result returned by handler functions. Replies produced by a room arrive
/// through the connection queue instead.
#[derive(Debug)]
enum Outcome {
    /// The room will answer.
    Queued,
    /// Send empty done to sender only.
    Done,
    /// Nothing goes back to the sender.
    Silent,
}

/// Request problems detected before a room is involved.
#[derive(Debug, thiserror::Error)]
enum RequestError {
    #[error("board_id required")]
    MissingBoardId,
    #[error("unknown syscall: {0}")]
    UnknownSyscall(String),
    #[error("invalid ops: {0}")]
    InvalidOps(#[from] serde_json::Error),
    #[error("{count} operations exceeds limit {max}")]
    TooManyOps { count: usize, max: usize },
    #[error("empty entry id")]
    EmptyEntryId,
    #[error("field {field} is {size} bytes (limit {max})")]
    FieldTooLarge { field: String, size: usize, max: usize },
    #[error("join of board {0} already in progress")]
    JoinPending(Uuid),
}

impl ErrorCode for RequestError {
    fn error_code(&self) -> &'static str {
        "E_BAD_REQUEST"
    }
}

/// Outbound encoding, fixed per connection at upgrade time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WireFormat {
    /// Protobuf `frames::Frame` in binary messages.
    Binary,
    /// The same envelope as JSON in text messages.
    Json,
}

impl WireFormat {
    fn from_query(params: &HashMap<String, String>) -> Self {
        match params.get("format").map(String::as_str) {
            Some("json") => Self::Json,
            _ => Self::Binary,
        }
    }
}

/// A `board:join` resolved off the socket loop.
struct JoinResult {
    req: Frame,
    board_id: Uuid,
    result: Result<(Role, RoomHandle, JoinAck), Frame>,
}

/// Per-socket session state.
struct Connection {
    client_id: Uuid,
    user_id: Uuid,
    client_tx: mpsc::Sender<Frame>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    joins_tx: mpsc::UnboundedSender<JoinResult>,
    links: HashMap<Uuid, RoomHandle>,
    /// Boards with a join in flight, and the request id of that join.
    pending: HashMap<Uuid, Uuid>,
}

impl Connection {
    fn new(
        user_id: Uuid,
        client_tx: mpsc::Sender<Frame>,
        events_tx: mpsc::UnboundedSender<LinkEvent>,
        joins_tx: mpsc::UnboundedSender<JoinResult>,
    ) -> Self {
        Self {
            client_id: Uuid::new_v4(),
            user_id,
            client_tx,
            events_tx,
            joins_tx,
            links: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    fn member(&self, role: Role) -> Member {
        Member {
            client_id: self.client_id,
            user_id: self.user_id,
            role,
            tx: self.client_tx.clone(),
            events: self.events_tx.clone(),
        }
    }

    /// The room this request targets. The connection must have joined it.
    fn linked(&self, req: &Frame) -> Result<RoomHandle, Frame> {
        let board_id = board_id_of(req).ok_or_else(|| req.error_from(&RequestError::MissingBoardId))?;
        self.links
            .get(&board_id)
            .cloned()
            .ok_or_else(|| req.error_from(&RoomError::NotMember(board_id)))
    }

    fn unlink(&mut self, board_id: Uuid) {
        if let Some(handle) = self.links.remove(&board_id) {
            handle.leave(self.client_id);
        }
    }

    fn leave_all(&mut self) {
        for (_, handle) in self.links.drain() {
            handle.leave(self.client_id);
        }
    }
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(ticket) = params.get("ticket") else {
        return (StatusCode::UNAUTHORIZED, "ticket required").into_response();
    };

    let user_id = match state.access.authenticate(ticket).await {
        Ok(Some(uid)) => uid,
        Ok(None) => return (StatusCode::UNAUTHORIZED, "invalid or expired ticket").into_response(),
        Err(e) => {
            tracing::error!(error = %e, "ws ticket validation failed");
            return (StatusCode::SERVICE_UNAVAILABLE, "ticket validation error").into_response();
        }
    };

    let format = WireFormat::from_query(&params);
    ws.on_upgrade(move |socket| run_ws(socket, state, user_id, format))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, user_id: Uuid, format: WireFormat) {
    // Per-connection queue shared by every room this client joins.
    let (client_tx, mut client_rx) = mpsc::channel::<Frame>(state.config.client_queue_capacity);
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<LinkEvent>();
    let (joins_tx, mut joins_rx) = mpsc::unbounded_channel::<JoinResult>();
    let mut conn = Connection::new(user_id, client_tx, events_tx, joins_tx);
    let client_id = conn.client_id;

    let welcome = Frame::request(syscall::SESSION_CONNECTED, Data::new())
        .with_data("client_id", client_id.to_string())
        .with_data("user_id", user_id.to_string());
    if send_frame(&mut socket, format, &welcome).await.is_err() {
        return;
    }

    info!(%client_id, %user_id, "ws: client connected");

    'conn: loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                let req = match msg {
                    Message::Binary(bytes) => decode_binary(&bytes),
                    Message::Text(text) => decode_text(text.as_str()),
                    Message::Close(_) => break,
                    _ => continue,
                };
                let replies = match req {
                    Ok(req) => process_frame(&state, &mut conn, req).await,
                    Err(reply) => {
                        warn!(%client_id, "ws: invalid inbound frame");
                        vec![reply]
                    }
                };
                for frame in replies {
                    if send_frame(&mut socket, format, &frame).await.is_err() {
                        break 'conn;
                    }
                }
            }
            Some(frame) = client_rx.recv() => {
                if send_frame(&mut socket, format, &frame).await.is_err() {
                    break;
                }
            }
            Some(event) = events_rx.recv() => {
                let frame = handle_link_event(&mut conn, event);
                if send_frame(&mut socket, format, &frame).await.is_err() {
                    break;
                }
            }
            Some(joined) = joins_rx.recv() => {
                let Some(frame) = finish_join(&mut conn, joined) else { continue };
                if send_frame(&mut socket, format, &frame).await.is_err() {
                    break;
                }
            }
        }
    }

    conn.leave_all();
    state.rate_limiter.forget(client_id);
    info!(%client_id, "ws: client disconnected");
}

fn decode_binary(bytes: &[u8]) -> Result<Frame, Frame> {
    let wire = frames::decode_frame(bytes).map_err(|e| gateway_error(&format!("invalid frame: {e}")))?;
    Frame::try_from(wire).map_err(|e| gateway_error(&e.to_string()))
}

fn decode_text(text: &str) -> Result<Frame, Frame> {
    serde_json::from_str(text).map_err(|e| gateway_error(&format!("invalid json: {e}")))
}

fn gateway_error(message: &str) -> Frame {
    Frame::request("gateway:error", Data::new())
        .with_data("code", "E_BAD_REQUEST")
        .with_data("message", message)
}

/// The room removed this member; tell the client so it can rejoin.
fn handle_link_event(conn: &mut Connection, event: LinkEvent) -> Frame {
    match event {
        LinkEvent::Dropped { board_id, code, reason } => {
            // The room already forgot us; no leave needed.
            conn.links.remove(&board_id);
            warn!(client_id = %conn.client_id, %board_id, code, "ws: link dropped by room");
            part_notice(board_id, code, &reason)
        }
    }
}

fn part_notice(board_id: Uuid, code: &str, message: &str) -> Frame {
    Frame::request(syscall::BOARD_PART, Data::new())
        .with_board_id(board_id)
        .with_data("code", code)
        .with_data("message", message)
        .with_data("resync", true)
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Process one inbound frame and return frames for the sender.
///
/// Kept apart from the socket so tests can drive dispatch without a
/// websocket.
async fn process_frame(state: &AppState, conn: &mut Connection, mut req: Frame) -> Vec<Frame> {
    // Stamp the authenticated user as `from`.
    req.from = Some(conn.user_id.to_string());

    let prefix = req.prefix().to_owned();
    if prefix != "awareness" {
        debug!(client_id = %conn.client_id, id = %req.id, syscall = %req.syscall, "ws: recv frame");
    }

    let result = match prefix.as_str() {
        "board" => handle_board(state, conn, &req),
        "doc" => handle_doc(state, conn, &req),
        "awareness" => handle_awareness(state, conn, &req),
        _ => Err(req.error_from(&RequestError::UnknownSyscall(req.syscall.clone()))),
    };

    match result {
        Ok(Outcome::Queued | Outcome::Silent) => vec![],
        Ok(Outcome::Done) => vec![req.done()],
        Err(frame) => vec![frame],
    }
}

// =============================================================================
// BOARD HANDLERS
// =============================================================================

fn handle_board(state: &AppState, conn: &mut Connection, req: &Frame) -> Result<Outcome, Frame> {
    match req.op() {
        "join" => {
            let board_id = board_id_of(req).ok_or_else(|| req.error_from(&RequestError::MissingBoardId))?;
            if conn.pending.contains_key(&board_id) {
                return Err(req.error_from(&RequestError::JoinPending(board_id)));
            }
            conn.pending.insert(board_id, req.id);
            // The role is settled once access answers.
            let member = conn.member(Role::Viewer);
            tokio::spawn(resolve_join(state.clone(), member, req.clone(), board_id, conn.joins_tx.clone()));
            Ok(Outcome::Queued)
        }
        "part" => {
            let board_id = board_id_of(req).ok_or_else(|| req.error_from(&RequestError::MissingBoardId))?;
            // EDGE: parting a join still in flight cancels it.
            if conn.pending.remove(&board_id).is_some() {
                info!(client_id = %conn.client_id, %board_id, "ws: pending join cancelled");
                return Ok(Outcome::Done);
            }
            let handle = conn.linked(req)?;
            conn.unlink(handle.board_id);
            info!(client_id = %conn.client_id, board_id = %handle.board_id, "ws: parted board");
            Ok(Outcome::Done)
        }
        _ => Err(req.error_from(&RequestError::UnknownSyscall(req.syscall.clone()))),
    }
}

/// Look up the role and enter the room, then hand the result back to the
/// connection loop.
async fn resolve_join(
    state: AppState,
    member: Member,
    req: Frame,
    board_id: Uuid,
    joins: mpsc::UnboundedSender<JoinResult>,
) {
    let client_id = member.client_id;
    let result = enter_room(&state, member, &req, board_id).await;
    if let Err(mpsc::error::SendError(orphan)) = joins.send(JoinResult { req, board_id, result }) {
        // EDGE: the socket closed while the join was in flight.
        if let Ok((_, handle, _)) = orphan.result {
            handle.leave(client_id);
        }
    }
}

async fn enter_room(
    state: &AppState,
    mut member: Member,
    req: &Frame,
    board_id: Uuid,
) -> Result<(Role, RoomHandle, JoinAck), Frame> {
    member.role = match state.access.role(member.user_id, board_id).await {
        Ok(Some(role)) => role,
        Ok(None) => return Err(req.error_from(&RoomError::NotMember(board_id))),
        Err(e) => return Err(req.error_from(&e)),
    };
    let role = member.role;
    let (handle, ack) = registry::join(&state.room_deps(), board_id, member)
        .await
        .map_err(|e| req.error_from(&e))?;
    Ok((role, handle, ack))
}

/// Link a finished join. Returns a frame for the socket when the reply
/// cannot go through the queue.
fn finish_join(conn: &mut Connection, joined: JoinResult) -> Option<Frame> {
    let JoinResult { req, board_id, result } = joined;
    let wanted = conn.pending.get(&board_id) == Some(&req.id);
    if wanted {
        conn.pending.remove(&board_id);
    }
    let (role, handle, ack) = match result {
        Ok(entered) => entered,
        Err(frame) => return wanted.then_some(frame),
    };
    if !wanted {
        // EDGE: cancelled by a part. A newer join for the same board owns
        // the membership now, so only leave when nothing else claims it.
        if !conn.pending.contains_key(&board_id) && !conn.links.contains_key(&board_id) {
            handle.leave(conn.client_id);
        }
        return None;
    }

    // EDGE: a repeated join replaces the membership and resyncs.
    conn.links.insert(board_id, handle);
    info!(client_id = %conn.client_id, %board_id, ?role, "ws: joined board");

    // Queued behind the snapshot the room already pushed.
    let done = req
        .done()
        .with_board_id(board_id)
        .with_data("role", serde_json::to_value(role).unwrap_or_default())
        .with_data("entry_count", ack.entry_count)
        .with_data("members", ack.members)
        .with_data("clock", ack.clock);
    conn.client_tx.try_send(done).err().map(mpsc::error::TrySendError::into_inner)
}

// =============================================================================
// DOCUMENT HANDLERS
// =============================================================================

fn handle_doc(state: &AppState, conn: &mut Connection, req: &Frame) -> Result<Outcome, Frame> {
    let handle = conn.linked(req)?;
    let limits = &state.config.fragment_limits;

    let cmd = match req.op() {
        "update" => {
            let fragment = match codec::decode_fragment(&req.payload, limits) {
                Ok(f) => f,
                Err(e) => {
                    // PHASE: CLOSE LINK
                    // WHY: the client's replica can no longer be trusted to
                    // match the room; it must rejoin from a snapshot.
                    warn!(client_id = %conn.client_id, board_id = %handle.board_id, error = %e, "ws: malformed fragment");
                    conn.unlink(handle.board_id);
                    return Err(req.error_from(&e));
                }
            };
            charge(state, conn, req, TrafficClass::Mutation, fragment.ops.len())?;
            let mut request = req.clone();
            request.board_id = Some(handle.board_id);
            RoomCommand::Update { client_id: conn.client_id, request, fragment }
        }
        "mutate" => {
            let ops = req.data.get("ops").cloned().unwrap_or(serde_json::Value::Null);
            let batch = MutationBatch::from_json(&ops).map_err(|e| req.error_from(&RequestError::from(e)))?;
            check_batch(&batch, limits).map_err(|e| req.error_from(&e))?;
            charge(state, conn, req, TrafficClass::Mutation, batch.ops.len())?;
            let mut request = req.clone();
            request.board_id = Some(handle.board_id);
            RoomCommand::Mutate { client_id: conn.client_id, request, batch }
        }
        _ => return Err(req.error_from(&RequestError::UnknownSyscall(req.syscall.clone()))),
    };

    enqueue(conn, &handle, req, cmd)?;
    Ok(Outcome::Queued)
}

/// Bounds for thin-client batches; fragments get the same from the codec.
fn check_batch(batch: &MutationBatch, limits: &codec::FragmentLimits) -> Result<(), RequestError> {
    if batch.ops.len() > limits.max_ops {
        return Err(RequestError::TooManyOps { count: batch.ops.len(), max: limits.max_ops });
    }
    for op in &batch.ops {
        if op.entry_id().is_empty() {
            return Err(RequestError::EmptyEntryId);
        }
        if let codec::Op::Upsert { fields, .. } = op {
            for write in fields {
                let size = write.value.as_ref().map_or(0, Vec::len);
                if size > limits.max_field_bytes {
                    return Err(RequestError::FieldTooLarge {
                        field: write.name.clone(),
                        size,
                        max: limits.max_field_bytes,
                    });
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// AWARENESS HANDLERS
// =============================================================================

fn handle_awareness(state: &AppState, conn: &mut Connection, req: &Frame) -> Result<Outcome, Frame> {
    let handle = conn.linked(req)?;
    let cmd = match req.op() {
        "update" => {
            let awareness = AwarenessState::from_data(&req.data).map_err(|e| req.error_from(&e))?;
            charge(state, conn, req, TrafficClass::Awareness, 1)?;
            RoomCommand::Awareness { client_id: conn.client_id, state: awareness }
        }
        "remove" => RoomCommand::AwarenessRemove { client_id: conn.client_id },
        _ => return Err(req.error_from(&RequestError::UnknownSyscall(req.syscall.clone()))),
    };

    match handle.try_send(cmd) {
        Ok(()) => Ok(Outcome::Silent),
        // Presence is superseded by the next update; drop it quietly.
        Err(RoomError::Busy(_)) => Ok(Outcome::Silent),
        Err(e) => {
            conn.links.remove(&handle.board_id);
            Err(req.error_from(&e))
        }
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn board_id_of(req: &Frame) -> Option<Uuid> {
    req.board_id.or_else(|| {
        req.data
            .get("board_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
    })
}

fn charge(state: &AppState, conn: &Connection, req: &Frame, class: TrafficClass, ops: usize) -> Result<(), Frame> {
    let cost = u64::try_from(ops.max(1)).unwrap_or(u64::MAX);
    state.rate_limiter.check(conn.client_id, class, cost).map_err(|e| {
        debug!(client_id = %conn.client_id, error = %e, "ws: rate limited");
        let Some(retry_after_ms) = e.retry_after_ms() else {
            return req.error_from(&e);
        };
        let resync = class == TrafficClass::Mutation;
        req.error_from(&e)
            .with_data("retry_after_ms", retry_after_ms)
            .with_data("resync", resync)
    })
}

fn enqueue(conn: &mut Connection, handle: &RoomHandle, req: &Frame, cmd: RoomCommand) -> Result<(), Frame> {
    match handle.try_send(cmd) {
        Ok(()) => Ok(()),
        Err(e @ RoomError::Busy(_)) => {
            warn!(client_id = %conn.client_id, board_id = %handle.board_id, "ws: room queue full; mutation rejected");
            Err(req.error_from(&e).with_data("resync", true))
        }
        Err(e) => {
            conn.links.remove(&handle.board_id);
            Err(req.error_from(&e).with_data("resync", true))
        }
    }
}

async fn send_frame(socket: &mut WebSocket, format: WireFormat, frame: &Frame) -> Result<(), ()> {
    let message = match format {
        WireFormat::Binary => Message::Binary(frames::encode_frame(&frames::Frame::from(frame)).into()),
        WireFormat::Json => match serde_json::to_string(frame) {
            Ok(json) => Message::Text(json.into()),
            Err(e) => {
                warn!(error = %e, "ws: failed to serialize frame");
                return Err(());
            }
        },
    };

    if frame.status == Status::Error {
        let code = frame.error_code().unwrap_or("-");
        let message = frame
            .data
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("-");
        warn!(id = %frame.id, syscall = %frame.syscall, code, message, "ws: send frame status=Error");
    } else if !frame.syscall.starts_with("awareness:") {
        debug!(id = %frame.id, syscall = %frame.syscall, status = ?frame.status, "ws: send frame");
    }

    socket.send(message).await.map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
