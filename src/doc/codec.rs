//! Update log: mutation batches, fragments, and their wire encoding.
//!
//! DESIGN
//! ======
//! A fragment is one logical clock, one origin, and a list of self-contained
//! ops. Every op names its entry id and (for upserts) its kind, so a fragment
//! can be merged on its own, in any order, any number of times.
//!
//! Fragments are encoded with protobuf (`prost`). Decoding is also the
//! validation gate: anything that reaches the store has passed it.

use std::collections::{BTreeMap, BTreeSet};

use prost::Message;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::clock::MAX_COUNTER;
use super::store::EntryKind;

const DEFAULT_MAX_FRAGMENT_OPS: usize = 500;
const DEFAULT_MAX_FIELD_BYTES: usize = 256 * 1024;

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum FragmentError {
    #[error("malformed fragment: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("malformed fragment: origin must be a non-nil uuid")]
    InvalidOrigin,
    #[error("malformed fragment: clock must be positive")]
    ZeroClock,
    #[error("malformed fragment: clock {0} exceeds {max}", max = MAX_COUNTER)]
    ClockOutOfRange(u64),
    #[error("malformed fragment: no operations")]
    Empty,
    #[error("malformed fragment: {count} operations exceeds limit {max}")]
    TooManyOps { count: usize, max: usize },
    #[error("malformed fragment: empty entry id")]
    EmptyEntryId,
    #[error("malformed fragment: entry {0} appears more than once")]
    DuplicateEntry(String),
    #[error("malformed fragment: unknown entry kind {0}")]
    UnknownKind(i32),
    #[error("malformed fragment: delete of {0} carries fields")]
    FieldsOnDelete(String),
    #[error("malformed fragment: empty or duplicate field name on {0}")]
    BadFieldName(String),
    #[error("malformed fragment: field {field} is {size} bytes (limit {max})")]
    FieldTooLarge { field: String, size: usize, max: usize },
}

impl crate::frame::ErrorCode for FragmentError {
    fn error_code(&self) -> &'static str {
        "E_MALFORMED_FRAGMENT"
    }
}

// =============================================================================
// OPERATIONS
// =============================================================================

/// One field write. `None` removes the field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldWrite {
    pub name: String,
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Op {
    /// Create the entry or overwrite some of its fields.
    Upsert { id: String, kind: EntryKind, fields: Vec<FieldWrite> },
    /// Tombstone the entry. Terminal for that id.
    Delete { id: String },
}

impl Op {
    #[must_use]
    pub fn entry_id(&self) -> &str {
        match self {
            Self::Upsert { id, .. } | Self::Delete { id } => id,
        }
    }
}

/// A unit of replication: every op shares the fragment's clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub origin: Uuid,
    pub clock: u64,
    pub ops: Vec<Op>,
}

impl Fragment {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

// =============================================================================
// MUTATION BATCH
// =============================================================================

enum Pending {
    Upsert { kind: EntryKind, fields: BTreeMap<String, Option<Vec<u8>>> },
    Delete,
}

/// Local mutations collected between two broadcasts (typically one frame).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationBatch {
    pub ops: Vec<Op>,
}

impl MutationBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn upsert(mut self, id: impl Into<String>, kind: EntryKind, fields: Vec<FieldWrite>) -> Self {
        self.ops.push(Op::Upsert { id: id.into(), kind, fields });
        self
    }

    #[must_use]
    pub fn delete(mut self, id: impl Into<String>) -> Self {
        self.ops.push(Op::Delete { id: id.into() });
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Collapse the batch to at most one op per entry.
    ///
    /// Later field writes replace earlier ones; a delete absorbs every write
    /// to that entry, before or after it. Output is sorted by entry id.
    #[must_use]
    pub fn coalesce(self) -> Vec<Op> {
        let mut pending: BTreeMap<String, Pending> = BTreeMap::new();

        for op in self.ops {
            match op {
                Op::Delete { id } => {
                    pending.insert(id, Pending::Delete);
                }
                Op::Upsert { id, kind, fields } => match pending.entry(id).or_insert_with(|| Pending::Upsert {
                    kind,
                    fields: BTreeMap::new(),
                }) {
                    Pending::Delete => {}
                    Pending::Upsert { kind: current_kind, fields: current } => {
                        *current_kind = kind;
                        for write in fields {
                            current.insert(write.name, write.value);
                        }
                    }
                },
            }
        }

        pending
            .into_iter()
            .map(|(id, p)| match p {
                Pending::Delete => Op::Delete { id },
                Pending::Upsert { kind, fields } => Op::Upsert {
                    id,
                    kind,
                    fields: fields
                        .into_iter()
                        .map(|(name, value)| FieldWrite { name, value })
                        .collect(),
                },
            })
            .collect()
    }

    /// Parse a thin-client batch from JSON.
    ///
    /// Field values are arbitrary JSON stored as their serialized bytes;
    /// `null` removes the field.
    ///
    /// # Errors
    ///
    /// Returns a `serde_json` error if the shape of `ops` is wrong.
    pub fn from_json(ops: &serde_json::Value) -> Result<Self, serde_json::Error> {
        #[derive(Deserialize)]
        #[serde(tag = "op", rename_all = "lowercase")]
        enum JsonOp {
            Upsert {
                id: String,
                kind: EntryKind,
                #[serde(default)]
                fields: serde_json::Map<String, serde_json::Value>,
            },
            Delete {
                id: String,
            },
        }

        let parsed: Vec<JsonOp> = serde_json::from_value(ops.clone())?;
        let mut batch = Self::new();
        for op in parsed {
            batch = match op {
                JsonOp::Delete { id } => batch.delete(id),
                JsonOp::Upsert { id, kind, fields } => {
                    let mut writes = Vec::with_capacity(fields.len());
                    for (name, value) in fields {
                        let value = if value.is_null() { None } else { Some(serde_json::to_vec(&value)?) };
                        writes.push(FieldWrite { name, value });
                    }
                    batch.upsert(id, kind, writes)
                }
            };
        }
        Ok(batch)
    }
}

// =============================================================================
// LIMITS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentLimits {
    pub max_ops: usize,
    pub max_field_bytes: usize,
}

impl Default for FragmentLimits {
    fn default() -> Self {
        Self { max_ops: DEFAULT_MAX_FRAGMENT_OPS, max_field_bytes: DEFAULT_MAX_FIELD_BYTES }
    }
}

// =============================================================================
// ENCODE / DECODE
// =============================================================================

#[must_use]
pub fn encode_fragment(fragment: &Fragment) -> Vec<u8> {
    WireFragment {
        origin: fragment.origin.as_bytes().to_vec(),
        clock: fragment.clock,
        ops: fragment.ops.iter().map(op_to_wire).collect(),
    }
    .encode_to_vec()
}

/// Decode and validate a fragment.
///
/// # Errors
///
/// Returns a [`FragmentError`] for truncated bytes or any structural
/// violation; callers treat every variant as `MalformedFragment`.
pub fn decode_fragment(bytes: &[u8], limits: &FragmentLimits) -> Result<Fragment, FragmentError> {
    let wire = WireFragment::decode(bytes)?;

    let origin = Uuid::from_slice(&wire.origin).map_err(|_| FragmentError::InvalidOrigin)?;
    if origin.is_nil() {
        return Err(FragmentError::InvalidOrigin);
    }
    if wire.clock == 0 {
        return Err(FragmentError::ZeroClock);
    }
    if wire.clock > MAX_COUNTER {
        return Err(FragmentError::ClockOutOfRange(wire.clock));
    }
    if wire.ops.is_empty() {
        return Err(FragmentError::Empty);
    }
    if wire.ops.len() > limits.max_ops {
        return Err(FragmentError::TooManyOps { count: wire.ops.len(), max: limits.max_ops });
    }

    let mut seen = BTreeSet::new();
    let mut ops = Vec::with_capacity(wire.ops.len());
    for op in wire.ops {
        if op.entry_id.is_empty() {
            return Err(FragmentError::EmptyEntryId);
        }
        if !seen.insert(op.entry_id.clone()) {
            return Err(FragmentError::DuplicateEntry(op.entry_id));
        }
        ops.push(wire_to_op(op, limits)?);
    }

    Ok(Fragment { origin, clock: wire.clock, ops })
}

fn op_to_wire(op: &Op) -> WireOp {
    match op {
        Op::Upsert { id, kind, fields } => WireOp {
            entry_id: id.clone(),
            kind: kind_to_wire(*kind) as i32,
            delete: false,
            fields: fields
                .iter()
                .map(|f| WireField { name: f.name.clone(), value: f.value.clone() })
                .collect(),
        },
        Op::Delete { id } => WireOp {
            entry_id: id.clone(),
            kind: WireKind::Unspecified as i32,
            delete: true,
            fields: Vec::new(),
        },
    }
}

fn wire_to_op(op: WireOp, limits: &FragmentLimits) -> Result<Op, FragmentError> {
    if op.delete {
        if !op.fields.is_empty() {
            return Err(FragmentError::FieldsOnDelete(op.entry_id));
        }
        return Ok(Op::Delete { id: op.entry_id });
    }

    let kind = match WireKind::try_from(op.kind) {
        Ok(WireKind::Shape) => EntryKind::Shape,
        Ok(WireKind::Asset) => EntryKind::Asset,
        Ok(WireKind::Binding) => EntryKind::Binding,
        Ok(WireKind::Unspecified) | Err(_) => return Err(FragmentError::UnknownKind(op.kind)),
    };

    let mut names = BTreeSet::new();
    let mut fields = Vec::with_capacity(op.fields.len());
    for field in op.fields {
        if field.name.is_empty() || !names.insert(field.name.clone()) {
            return Err(FragmentError::BadFieldName(op.entry_id));
        }
        let size = field.value.as_ref().map_or(0, Vec::len);
        if size > limits.max_field_bytes {
            return Err(FragmentError::FieldTooLarge { field: field.name, size, max: limits.max_field_bytes });
        }
        fields.push(FieldWrite { name: field.name, value: field.value });
    }

    Ok(Op::Upsert { id: op.entry_id, kind, fields })
}

fn kind_to_wire(kind: EntryKind) -> WireKind {
    match kind {
        EntryKind::Shape => WireKind::Shape,
        EntryKind::Asset => WireKind::Asset,
        EntryKind::Binding => WireKind::Binding,
    }
}

#[derive(Clone, PartialEq, Message)]
struct WireFragment {
    #[prost(bytes = "vec", tag = "1")]
    origin: Vec<u8>,
    #[prost(uint64, tag = "2")]
    clock: u64,
    #[prost(message, repeated, tag = "3")]
    ops: Vec<WireOp>,
}

#[derive(Clone, PartialEq, Message)]
struct WireOp {
    #[prost(string, tag = "1")]
    entry_id: String,
    #[prost(enumeration = "WireKind", tag = "2")]
    kind: i32,
    #[prost(bool, tag = "3")]
    delete: bool,
    #[prost(message, repeated, tag = "4")]
    fields: Vec<WireField>,
}

#[derive(Clone, PartialEq, Message)]
struct WireField {
    #[prost(string, tag = "1")]
    name: String,
    #[prost(bytes = "vec", optional, tag = "2")]
    value: Option<Vec<u8>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
enum WireKind {
    Unspecified = 0,
    Shape = 1,
    Asset = 2,
    Binding = 3,
}

#[cfg(test)]
#[path = "codec_test.rs"]
mod tests;
