//! Awareness service: ephemeral presence per connection.
//!
//! DESIGN
//! ======
//! One entry per connection id. A new state replaces the old one outright;
//! there is no merge and no history. Entries carry the time they were last
//! refreshed and the room sweeps them on a fixed tick, retracting any that
//! outlived the liveness timeout. Nothing here is ever persisted.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::frame::Data;

const MAX_LABEL_CHARS: usize = 64;
const MAX_SELECTION: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum AwarenessError {
    #[error("invalid awareness state: {0}")]
    Invalid(#[from] serde_json::Error),
    #[error("awareness label longer than {MAX_LABEL_CHARS} characters")]
    LabelTooLong,
    #[error("awareness selection larger than {MAX_SELECTION} entries")]
    SelectionTooLarge,
}

impl crate::frame::ErrorCode for AwarenessError {
    fn error_code(&self) -> &'static str {
        "E_BAD_REQUEST"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub x: f64,
    pub y: f64,
}

/// Presence as a client reports it. Coordinates are in document space.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AwarenessState {
    #[serde(default)]
    pub cursor: Option<Cursor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selection: Vec<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
}

impl AwarenessState {
    /// Parse and bound a state from frame data.
    ///
    /// # Errors
    ///
    /// Returns [`AwarenessError`] for a wrong shape or oversized fields.
    pub fn from_data(data: &Data) -> Result<Self, AwarenessError> {
        let value = serde_json::Value::Object(data.clone().into_iter().collect());
        let state: Self = serde_json::from_value(value)?;
        if state.label.as_ref().is_some_and(|l| l.chars().count() > MAX_LABEL_CHARS) {
            return Err(AwarenessError::LabelTooLong);
        }
        if state.selection.len() > MAX_SELECTION {
            return Err(AwarenessError::SelectionTooLarge);
        }
        Ok(state)
    }

    /// Frame data for an `awareness:update` push about `client_id`.
    #[must_use]
    pub fn to_data(&self, client_id: Uuid, user_id: Uuid) -> Data {
        let mut data = Data::new();
        data.insert("client_id".into(), serde_json::json!(client_id));
        data.insert("user_id".into(), serde_json::json!(user_id));
        data.insert("state".into(), serde_json::to_value(self).unwrap_or_default());
        data
    }
}

#[derive(Debug, Clone)]
struct Entry {
    user_id: Uuid,
    state: AwarenessState,
    refreshed_at: Instant,
}

/// Presence of every member of one room.
#[derive(Debug)]
pub struct AwarenessTable {
    timeout: Duration,
    entries: HashMap<Uuid, Entry>,
}

impl AwarenessTable {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout, entries: HashMap::new() }
    }

    /// Replace the connection's state.
    pub fn update(&mut self, client_id: Uuid, user_id: Uuid, state: AwarenessState, now: Instant) {
        self.entries.insert(client_id, Entry { user_id, state, refreshed_at: now });
    }

    /// Drop the connection's state. Returns whether there was one.
    pub fn remove(&mut self, client_id: Uuid) -> bool {
        self.entries.remove(&client_id).is_some()
    }

    /// Retract every entry not refreshed within the timeout.
    pub fn sweep(&mut self, now: Instant) -> Vec<Uuid> {
        let timeout = self.timeout;
        let mut expired: Vec<Uuid> = self
            .entries
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.refreshed_at) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.entries.remove(id);
        }
        expired.sort();
        expired
    }

    /// Current states of everyone except `client_id`, as push data.
    #[must_use]
    pub fn states_except(&self, client_id: Uuid) -> Vec<Data> {
        self.entries
            .iter()
            .filter(|(id, _)| **id != client_id)
            .map(|(id, e)| e.state.to_data(*id, e.user_id))
            .collect()
    }

    #[must_use]
    pub fn get(&self, client_id: Uuid) -> Option<&AwarenessState> {
        self.entries.get(&client_id).map(|e| &e.state)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Frame data for an `awareness:remove` push.
#[must_use]
pub fn removal_data(client_id: Uuid) -> Data {
    let mut data = Data::new();
    data.insert("client_id".into(), serde_json::json!(client_id));
    data
}

#[cfg(test)]
#[path = "awareness_test.rs"]
mod tests;
