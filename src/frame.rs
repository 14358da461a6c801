//! Frame: the universal message type for the sync server.
//!
//! ARCHITECTURE
//! ============
//! Every message on a connection is a Frame. Clients send request frames,
//! the server dispatches by syscall prefix, and responses flow back as
//! item/done/error frames correlated by `parent_id`. Pushes from a room
//! (peer fragments, awareness) are plain request frames with no parent.
//!
//! DESIGN
//! ======
//! - Control data is a flat `Map<String, Value>`.
//! - Document bytes (fragments, snapshots) ride in `payload` and are never
//!   parsed by the dispatch layer.
//! - Binary websocket messages carry the protobuf form from the `frames`
//!   crate; text messages carry this struct as JSON.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// FIELD CONSTANTS
// =============================================================================

/// Frame data key for error messages.
pub const FRAME_MESSAGE: &str = "message";

/// Frame data key for grepable error codes.
pub const FRAME_CODE: &str = "code";

/// Frame data key for the retryable flag on error frames.
pub const FRAME_RETRYABLE: &str = "retryable";

// =============================================================================
// TYPES
// =============================================================================

/// Flat key-value control data.
pub type Data = HashMap<String, serde_json::Value>;

pub use frames::Status;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    /// Milliseconds since Unix epoch. Set automatically at construction.
    pub ts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub board_id: Option<Uuid>,
    pub from: Option<String>,
    pub syscall: String,
    pub status: Status,
    #[serde(default)]
    pub data: Data,
    /// Opaque document bytes. JSON clients see a byte array.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<u8>,
}

// =============================================================================
// ERROR CODES
// =============================================================================

/// Grepable error code and retryable flag for structured error frames.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

// =============================================================================
// CONSTRUCTORS
// =============================================================================

/// Current time as milliseconds since Unix epoch.
pub(crate) fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

impl Frame {
    /// Create a request frame. Also used for unsolicited pushes.
    pub fn request(syscall: impl Into<String>, data: Data) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id: None,
            ts: now_ms(),
            board_id: None,
            from: None,
            syscall: syscall.into(),
            status: Status::Request,
            data,
            payload: Vec::new(),
        }
    }

    /// Create a done response. Terminal, carries no data.
    #[must_use]
    pub fn done(&self) -> Self {
        self.reply(Status::Done, Data::new())
    }

    /// Create a done response carrying data. Terminal.
    #[must_use]
    pub fn done_with(&self, data: Data) -> Self {
        self.reply(Status::Done, data)
    }

    /// Create a structured error response from a typed error. Terminal.
    #[must_use]
    pub fn error_from(&self, err: &(impl ErrorCode + ?Sized)) -> Self {
        let mut data = Data::new();
        data.insert(FRAME_CODE.into(), serde_json::Value::String(err.error_code().to_string()));
        data.insert(FRAME_MESSAGE.into(), serde_json::Value::String(err.to_string()));
        data.insert(FRAME_RETRYABLE.into(), serde_json::Value::Bool(err.retryable()));
        self.reply(Status::Error, data)
    }

    /// Build a reply frame. Inherits `board_id` and `syscall`.
    fn reply(&self, status: Status, data: Data) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id: Some(self.id),
            ts: now_ms(),
            board_id: self.board_id,
            from: None,
            syscall: self.syscall.clone(),
            status,
            data,
            payload: Vec::new(),
        }
    }
}

// =============================================================================
// BUILDERS
// =============================================================================

impl Frame {
    #[must_use]
    pub fn with_board_id(mut self, board_id: Uuid) -> Self {
        self.board_id = Some(board_id);
        self
    }

    #[must_use]
    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }
}

// =============================================================================
// ROUTING
// =============================================================================

impl Frame {
    /// Extract the syscall prefix (everything before the first ':').
    #[must_use]
    pub fn prefix(&self) -> &str {
        let Some((prefix, _)) = self.syscall.split_once(':') else {
            return &self.syscall;
        };
        prefix
    }

    /// Extract the syscall operation (everything after the first ':').
    #[must_use]
    pub fn op(&self) -> &str {
        self.syscall.split_once(':').map_or("", |(_, op)| op)
    }

    /// Error code carried by an error frame, if any.
    #[must_use]
    pub fn error_code(&self) -> Option<&str> {
        self.data.get(FRAME_CODE).and_then(serde_json::Value::as_str)
    }
}

// =============================================================================
// WIRE CONVERSION
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("invalid {field} uuid: {value}")]
    InvalidUuid { field: &'static str, value: String },
    #[error("frame data must be an object")]
    DataNotObject,
}

impl ErrorCode for WireError {
    fn error_code(&self) -> &'static str {
        "E_BAD_REQUEST"
    }
}

impl From<&Frame> for frames::Frame {
    fn from(frame: &Frame) -> Self {
        Self {
            id: frame.id.to_string(),
            parent_id: frame.parent_id.map(|id| id.to_string()),
            ts: frame.ts,
            board_id: frame.board_id.map(|id| id.to_string()),
            from: frame.from.clone(),
            syscall: frame.syscall.clone(),
            status: frame.status,
            data: serde_json::Value::Object(frame.data.clone().into_iter().collect()),
            payload: frame.payload.clone(),
        }
    }
}

fn parse_uuid(field: &'static str, value: &str) -> Result<Uuid, WireError> {
    value
        .parse()
        .map_err(|_| WireError::InvalidUuid { field, value: value.to_owned() })
}

impl TryFrom<frames::Frame> for Frame {
    type Error = WireError;

    fn try_from(wire: frames::Frame) -> Result<Self, Self::Error> {
        // EDGE: clients that never set an id still get a correlatable reply.
        let id = if wire.id.is_empty() { Uuid::new_v4() } else { parse_uuid("id", &wire.id)? };
        let parent_id = wire.parent_id.as_deref().map(|s| parse_uuid("parent_id", s)).transpose()?;
        let board_id = wire.board_id.as_deref().map(|s| parse_uuid("board_id", s)).transpose()?;
        let data = match wire.data {
            serde_json::Value::Object(map) => map.into_iter().collect(),
            serde_json::Value::Null => Data::new(),
            _ => return Err(WireError::DataNotObject),
        };

        Ok(Self {
            id,
            parent_id,
            ts: wire.ts,
            board_id,
            from: wire.from,
            syscall: wire.syscall,
            status: wire.status,
            data,
            payload: wire.payload,
        })
    }
}

#[cfg(test)]
#[path = "frame_test.rs"]
mod tests;
