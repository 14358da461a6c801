//! Connection authentication and per-board role lookup.
//!
//! ARCHITECTURE
//! ============
//! Policy lives outside this server. Tickets are minted by the auth service
//! and rows in `board_members` are maintained by the access-control service;
//! this module only reads them. The room layer enforces whatever role it is
//! handed at join time.
//!
//! TRADE-OFFS
//! ==========
//! Ticket consumption is destructive (`DELETE ... RETURNING`) so a ticket
//! leaked through a URL cannot be replayed.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Editor,
    Viewer,
}

impl Role {
    #[must_use]
    pub fn can_mutate(self) -> bool {
        matches!(self, Self::Editor)
    }

    /// Map a `board_members.role` value. Owners edit; unknown roles get nothing.
    #[must_use]
    pub fn from_db(role: &str) -> Option<Self> {
        match role {
            "owner" | "editor" => Some(Self::Editor),
            "viewer" => Some(Self::Viewer),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl crate::frame::ErrorCode for AccessError {
    fn error_code(&self) -> &'static str {
        "E_ACCESS_UNAVAILABLE"
    }

    fn retryable(&self) -> bool {
        true
    }
}

#[async_trait]
pub trait AccessResolver: Send + Sync {
    /// Consume a websocket ticket and return the user it was issued to.
    async fn authenticate(&self, ticket: &str) -> Result<Option<Uuid>, AccessError>;

    /// Role of `user_id` on `board_id`, or `None` when the user has no access.
    async fn role(&self, user_id: Uuid, board_id: Uuid) -> Result<Option<Role>, AccessError>;
}

// =============================================================================
// POSTGRES
// =============================================================================

pub struct PgAccessResolver {
    pool: PgPool,
}

impl PgAccessResolver {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccessResolver for PgAccessResolver {
    async fn authenticate(&self, ticket: &str) -> Result<Option<Uuid>, AccessError> {
        let user_id = sqlx::query_scalar::<_, Uuid>(
            "DELETE FROM ws_tickets WHERE ticket = $1 AND expires_at > now() RETURNING user_id",
        )
        .bind(ticket)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user_id)
    }

    async fn role(&self, user_id: Uuid, board_id: Uuid) -> Result<Option<Role>, AccessError> {
        let role = sqlx::query_scalar::<_, String>(
            "SELECT role FROM board_members WHERE board_id = $1 AND user_id = $2",
        )
        .bind(board_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(role.as_deref().and_then(Role::from_db))
    }
}

// =============================================================================
// STATIC
// =============================================================================

/// In-memory resolver for development and tests.
///
/// In open mode any non-empty ticket is accepted (a ticket that parses as a
/// UUID becomes that user id) and every user gets the default role.
#[derive(Default)]
pub struct StaticAccessResolver {
    open: bool,
    default_role: Option<Role>,
    tickets: Mutex<HashMap<String, Uuid>>,
    roles: Mutex<HashMap<(Uuid, Uuid), Role>>,
}

impl StaticAccessResolver {
    /// Accept every ticket; everyone edits every board.
    #[must_use]
    pub fn open() -> Self {
        Self { open: true, default_role: Some(Role::Editor), ..Self::default() }
    }

    /// Only registered tickets and roles are honored.
    #[must_use]
    pub fn closed() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_ticket(self, ticket: impl Into<String>, user_id: Uuid) -> Self {
        self.tickets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ticket.into(), user_id);
        self
    }

    #[must_use]
    pub fn with_role(self, user_id: Uuid, board_id: Uuid, role: Role) -> Self {
        self.roles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((user_id, board_id), role);
        self
    }
}

#[async_trait]
impl AccessResolver for StaticAccessResolver {
    async fn authenticate(&self, ticket: &str) -> Result<Option<Uuid>, AccessError> {
        let registered = self
            .tickets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(ticket);
        if registered.is_some() {
            return Ok(registered);
        }
        if self.open && !ticket.is_empty() {
            return Ok(Some(ticket.parse().unwrap_or_else(|_| Uuid::new_v4())));
        }
        Ok(None)
    }

    async fn role(&self, user_id: Uuid, board_id: Uuid) -> Result<Option<Role>, AccessError> {
        let roles = self.roles.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(roles.get(&(user_id, board_id)).copied().or(self.default_role))
    }
}
