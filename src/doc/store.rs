//! Replicated document store: the merged state of one board.
//!
//! DESIGN
//! ======
//! Entries live in a `BTreeMap` keyed by entry id so snapshots serialize in
//! a stable order. Each live entry is a bag of last-writer-wins registers:
//! one for the kind and one per payload field, each stamped with the clock
//! of the fragment that wrote it.
//!
//! Deletes leave a tombstone carrying the highest delete clock seen. A
//! tombstone is terminal: later upserts for that id are ignored and fields
//! written before it are dropped when it lands. Every merge is therefore a
//! join, and replicas that saw the same fragments hold identical maps.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::clock::{Clock, MAX_COUNTER, wins};
use super::codec::{Fragment, MutationBatch, Op};

/// The store's counter reached [`MAX_COUNTER`]; no further local edit can
/// be ordered after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("logical clock exhausted at {0}")]
pub struct ClockExhausted(pub u64);

impl crate::frame::ErrorCode for ClockExhausted {
    fn error_code(&self) -> &'static str {
        "E_CLOCK_EXHAUSTED"
    }
}

// =============================================================================
// ENTRY TYPES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Shape,
    Asset,
    Binding,
}

impl EntryKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Shape => "shape",
            Self::Asset => "asset",
            Self::Binding => "binding",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shape" => Ok(Self::Shape),
            "asset" => Ok(Self::Asset),
            "binding" => Ok(Self::Binding),
            other => Err(format!("unknown entry kind: {other}")),
        }
    }
}

/// One LWW register. `value: None` is a removed field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Register {
    pub clock: Clock,
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveEntry {
    pub kind: EntryKind,
    pub kind_clock: Clock,
    pub fields: BTreeMap<String, Register>,
}

impl LiveEntry {
    /// Current value of a payload field, if set.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&[u8]> {
        self.fields.get(name).and_then(|r| r.value.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum EntryState {
    Live(LiveEntry),
    Deleted { clock: Clock },
}

// =============================================================================
// SNAPSHOT BLOB
// =============================================================================

/// Point-in-time copy of a store, including tombstones and clocks so a
/// hydrated replica keeps merging correctly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocSnapshot {
    pub clock: u64,
    pub entries: BTreeMap<String, EntryState>,
}

impl DocSnapshot {
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| matches!(e, EntryState::Live(_)))
            .count()
    }
}

// =============================================================================
// STORE
// =============================================================================

pub struct DocStore {
    replica: Uuid,
    clock: u64,
    entries: BTreeMap<String, EntryState>,
    /// Bumped on every state change; persistence compares it to decide
    /// whether a flushed snapshot is still current.
    version: u64,
}

impl DocStore {
    #[must_use]
    pub fn new(replica: Uuid) -> Self {
        Self { replica, clock: 0, entries: BTreeMap::new(), version: 0 }
    }

    #[must_use]
    pub fn replica(&self) -> Uuid {
        self.replica
    }

    #[must_use]
    pub fn clock(&self) -> u64 {
        self.clock
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Apply a local batch under this store's replica id.
    ///
    /// # Errors
    ///
    /// See [`Self::apply_local_as`].
    pub fn apply_local(&mut self, batch: MutationBatch) -> Result<Fragment, ClockExhausted> {
        self.apply_local_as(self.replica, batch)
    }

    /// Apply a local batch on behalf of `origin` and return the fragment to
    /// broadcast. The state changes immediately. An empty batch produces an
    /// empty fragment that must not be sent.
    ///
    /// # Errors
    ///
    /// Returns [`ClockExhausted`] when the next counter would pass
    /// [`MAX_COUNTER`]; the store is left untouched.
    pub fn apply_local_as(&mut self, origin: Uuid, batch: MutationBatch) -> Result<Fragment, ClockExhausted> {
        let ops = batch.coalesce();
        if ops.is_empty() {
            return Ok(Fragment { origin, clock: self.clock, ops });
        }
        let clock = self
            .clock
            .checked_add(1)
            .filter(|c| *c <= MAX_COUNTER)
            .ok_or(ClockExhausted(self.clock))?;
        let fragment = Fragment { origin, clock, ops };
        self.merge(&fragment);
        Ok(fragment)
    }

    /// Merge a fragment and return the ids whose state changed, sorted.
    pub fn merge(&mut self, fragment: &Fragment) -> Vec<String> {
        self.clock = self.clock.max(fragment.clock);
        let clock = Clock::new(fragment.clock, fragment.origin);

        let mut applied = Vec::new();
        for op in &fragment.ops {
            let changed = match op {
                Op::Delete { id } => self.merge_delete(id, clock),
                Op::Upsert { id, kind, fields } => self.merge_upsert(id, *kind, fields, clock),
            };
            if changed {
                applied.push(op.entry_id().to_owned());
            }
        }

        if !applied.is_empty() {
            self.version += 1;
            applied.sort();
            applied.dedup();
        }
        applied
    }

    fn merge_delete(&mut self, id: &str, clock: Clock) -> bool {
        match self.entries.get_mut(id) {
            Some(EntryState::Deleted { clock: current }) => {
                if clock > *current {
                    *current = clock;
                    true
                } else {
                    false
                }
            }
            Some(state @ EntryState::Live(_)) => {
                *state = EntryState::Deleted { clock };
                true
            }
            None => {
                self.entries.insert(id.to_owned(), EntryState::Deleted { clock });
                true
            }
        }
    }

    fn merge_upsert(&mut self, id: &str, kind: EntryKind, fields: &[super::codec::FieldWrite], clock: Clock) -> bool {
        let Some(state) = self.entries.get_mut(id) else {
            let entry = LiveEntry {
                kind,
                kind_clock: clock,
                fields: fields
                    .iter()
                    .map(|f| (f.name.clone(), Register { clock, value: f.value.clone() }))
                    .collect(),
            };
            self.entries.insert(id.to_owned(), EntryState::Live(entry));
            return true;
        };

        let EntryState::Live(entry) = state else {
            // Delete wins over any upsert, whatever its clock.
            return false;
        };

        let mut changed = false;
        if wins(clock, &kind, entry.kind_clock, &entry.kind) {
            entry.kind = kind;
            entry.kind_clock = clock;
            changed = true;
        }
        for write in fields {
            match entry.fields.get_mut(&write.name) {
                Some(register) => {
                    if wins(clock, &write.value, register.clock, &register.value) {
                        register.clock = clock;
                        register.value.clone_from(&write.value);
                        changed = true;
                    }
                }
                None => {
                    entry
                        .fields
                        .insert(write.name.clone(), Register { clock, value: write.value.clone() });
                    changed = true;
                }
            }
        }
        changed
    }

    /// Copy of the full state. The caller owns the copy, so a flush can
    /// serialize it while the store keeps taking edits.
    #[must_use]
    pub fn snapshot(&self) -> DocSnapshot {
        DocSnapshot { clock: self.clock, entries: self.entries.clone() }
    }

    /// Replace all state. Only valid before the room has members.
    pub fn hydrate(&mut self, snapshot: DocSnapshot) {
        self.clock = snapshot.clock;
        self.entries = snapshot.entries;
        self.version = 0;
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&LiveEntry> {
        match self.entries.get(id) {
            Some(EntryState::Live(entry)) => Some(entry),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_deleted(&self, id: &str) -> bool {
        matches!(self.entries.get(id), Some(EntryState::Deleted { .. }))
    }

    /// Live entries in id order.
    pub fn live_entries(&self) -> impl Iterator<Item = (&str, &LiveEntry)> {
        self.entries.iter().filter_map(|(id, state)| match state {
            EntryState::Live(entry) => Some((id.as_str(), entry)),
            EntryState::Deleted { .. } => None,
        })
    }

    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.live_entries().count()
    }
}

#[cfg(test)]
#[path = "store_test.rs"]
mod tests;
