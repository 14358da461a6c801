//! Snapshot blob encoding and legacy format migration.
//!
//! FORMATS
//! =======
//! - `1` legacy: `{"objects": [{"id", "kind", ...columns}]}` rows written by
//!   the old per-object persistence, no clocks.
//! - `2` current: serialized [`DocSnapshot`] with clocks and tombstones.
//! - `0` unknown: sniffed from the JSON shape (rows imported without a format
//!   column).

use std::collections::BTreeMap;

use serde::Deserialize;

use super::clock::Clock;
use super::store::{DocSnapshot, EntryKind, EntryState, LiveEntry, Register};

pub const FORMAT_UNKNOWN: i32 = 0;
pub const FORMAT_LEGACY_OBJECTS: i32 = 1;
pub const FORMAT_CURRENT: i32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported snapshot format {0}")]
    UnsupportedFormat(i32),
    #[error("legacy object at index {index} has no usable id")]
    LegacyMissingId { index: usize },
    #[error("snapshot shape not recognized")]
    Unrecognized,
}

/// Serialize in the current format.
///
/// # Errors
///
/// Returns a `serde_json` error if serialization fails.
pub fn encode_snapshot(snapshot: &DocSnapshot) -> Result<Vec<u8>, SnapshotError> {
    Ok(serde_json::to_vec(snapshot)?)
}

/// Decode a stored blob, migrating older formats.
///
/// # Errors
///
/// Returns a [`SnapshotError`] when the bytes cannot be read in the given
/// format or no migration applies.
pub fn decode_snapshot(format: i32, bytes: &[u8]) -> Result<DocSnapshot, SnapshotError> {
    match format {
        FORMAT_CURRENT => Ok(serde_json::from_slice(bytes)?),
        FORMAT_LEGACY_OBJECTS => migrate_legacy_objects(bytes),
        FORMAT_UNKNOWN => {
            let value: serde_json::Value = serde_json::from_slice(bytes)?;
            if value.get("entries").is_some() {
                Ok(serde_json::from_value(value)?)
            } else if value.get("objects").is_some() {
                migrate_legacy_objects(bytes)
            } else {
                Err(SnapshotError::Unrecognized)
            }
        }
        other => Err(SnapshotError::UnsupportedFormat(other)),
    }
}

#[derive(Deserialize)]
struct LegacyDoc {
    objects: Vec<serde_json::Map<String, serde_json::Value>>,
}

/// Legacy rows become live entries stamped with the floor clock; every
/// column other than `id` and `kind` becomes a field holding its JSON bytes.
fn migrate_legacy_objects(bytes: &[u8]) -> Result<DocSnapshot, SnapshotError> {
    let legacy: LegacyDoc = serde_json::from_slice(bytes)?;
    let clock = Clock::floor();

    let mut entries = BTreeMap::new();
    for (index, mut object) in legacy.objects.into_iter().enumerate() {
        let id = match object.remove("id") {
            Some(serde_json::Value::String(s)) if !s.is_empty() => s,
            _ => return Err(SnapshotError::LegacyMissingId { index }),
        };
        let kind = object
            .remove("kind")
            .as_ref()
            .and_then(serde_json::Value::as_str)
            .map_or(EntryKind::Shape, legacy_kind);

        let mut fields = BTreeMap::new();
        for (name, value) in object {
            if value.is_null() {
                continue;
            }
            fields.insert(name, Register { clock, value: Some(serde_json::to_vec(&value)?) });
        }
        entries.insert(id, EntryState::Live(LiveEntry { kind, kind_clock: clock, fields }));
    }

    Ok(DocSnapshot { clock: 0, entries })
}

fn legacy_kind(kind: &str) -> EntryKind {
    match kind {
        "image" | "video" | "asset" | "file" => EntryKind::Asset,
        "connector" | "arrow" | "binding" => EntryKind::Binding,
        _ => EntryKind::Shape,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc::codec::{FieldWrite, MutationBatch};
    use crate::doc::store::DocStore;
    use uuid::Uuid;

    #[test]
    fn current_format_round_trips() {
        let mut store = DocStore::new(Uuid::from_u128(1));
        store.apply_local(MutationBatch::new().upsert(
            "s1",
            EntryKind::Shape,
            vec![FieldWrite { name: "x".into(), value: Some(b"3".to_vec()) }],
        )).expect("clock");
        store.apply_local(MutationBatch::new().delete("s0")).expect("clock");

        let snap = store.snapshot();
        let bytes = encode_snapshot(&snap).expect("encode");
        assert_eq!(decode_snapshot(FORMAT_CURRENT, &bytes).expect("decode"), snap);
        assert_eq!(decode_snapshot(FORMAT_UNKNOWN, &bytes).expect("sniffed"), snap);
    }

    #[test]
    fn legacy_objects_migrate_with_floor_clock() {
        let legacy = serde_json::json!({
            "objects": [
                {"id": "a", "kind": "sticky_note", "x": 10.0, "props": {"text": "hi"}, "width": null},
                {"id": "b", "kind": "connector", "props": {"from": "a"}},
                {"id": "c", "kind": "image"}
            ]
        });
        let snap = decode_snapshot(FORMAT_LEGACY_OBJECTS, &serde_json::to_vec(&legacy).expect("json"))
            .expect("migrate");

        assert_eq!(snap.entry_count(), 3);
        let Some(EntryState::Live(a)) = snap.entries.get("a") else {
            panic!("a should be live");
        };
        assert_eq!(a.kind, EntryKind::Shape);
        assert_eq!(a.kind_clock, Clock::floor());
        assert_eq!(a.field("x"), Some(&b"10.0"[..]));
        assert!(a.field("width").is_none());
        assert!(matches!(snap.entries.get("b"), Some(EntryState::Live(e)) if e.kind == EntryKind::Binding));
        assert!(matches!(snap.entries.get("c"), Some(EntryState::Live(e)) if e.kind == EntryKind::Asset));
    }

    #[test]
    fn migrated_state_loses_to_any_live_edit() {
        let legacy = serde_json::json!({"objects": [{"id": "a", "kind": "rectangle", "x": 1}]});
        let snap = decode_snapshot(FORMAT_UNKNOWN, &serde_json::to_vec(&legacy).expect("json")).expect("migrate");

        let mut store = DocStore::new(Uuid::from_u128(1));
        store.hydrate(snap);
        store.apply_local(MutationBatch::new().upsert(
            "a",
            EntryKind::Shape,
            vec![FieldWrite { name: "x".into(), value: Some(b"2".to_vec()) }],
        )).expect("clock");
        assert_eq!(store.get("a").and_then(|e| e.field("x")), Some(&b"2"[..]));
    }

    #[test]
    fn legacy_row_without_id_fails_migration() {
        let legacy = serde_json::json!({"objects": [{"kind": "rectangle"}]});
        let err = decode_snapshot(FORMAT_LEGACY_OBJECTS, &serde_json::to_vec(&legacy).expect("json"))
            .expect_err("missing id");
        assert!(matches!(err, SnapshotError::LegacyMissingId { index: 0 }));
    }

    #[test]
    fn unknown_shapes_and_formats_fail() {
        assert!(matches!(decode_snapshot(FORMAT_UNKNOWN, b"{\"foo\":1}"), Err(SnapshotError::Unrecognized)));
        assert!(matches!(decode_snapshot(9, b"{}"), Err(SnapshotError::UnsupportedFormat(9))));
        assert!(matches!(decode_snapshot(FORMAT_CURRENT, b"{not json"), Err(SnapshotError::Json(_))));
    }
}
