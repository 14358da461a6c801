use super::*;
use crate::doc::codec::FieldWrite;

fn field(name: &str, value: &str) -> FieldWrite {
    FieldWrite { name: name.into(), value: Some(value.as_bytes().to_vec()) }
}

fn peer(n: u128) -> DocStore {
    DocStore::new(Uuid::from_u128(n))
}

fn fragment(origin: u128, clock: u64, ops: Vec<Op>) -> Fragment {
    Fragment { origin: Uuid::from_u128(origin), clock, ops }
}

fn upsert(id: &str, fields: Vec<FieldWrite>) -> Op {
    Op::Upsert { id: id.into(), kind: EntryKind::Shape, fields }
}

fn delete(id: &str) -> Op {
    Op::Delete { id: id.into() }
}

// =============================================================================
// LOCAL APPLY
// =============================================================================

#[test]
fn apply_local_updates_state_and_returns_fragment() {
    let mut store = peer(1);
    let frag = store.apply_local(MutationBatch::new().upsert("s1", EntryKind::Shape, vec![field("x", "1")])).expect("clock");

    assert_eq!(frag.origin, Uuid::from_u128(1));
    assert_eq!(frag.clock, 1);
    assert_eq!(store.get("s1").and_then(|e| e.field("x")), Some(&b"1"[..]));
    assert_eq!(store.version(), 1);
}

#[test]
fn apply_local_clock_is_monotonic_after_merge() {
    let mut store = peer(1);
    store.merge(&fragment(2, 40, vec![upsert("s9", vec![])]));
    let frag = store.apply_local(MutationBatch::new().delete("s9")).expect("clock");
    assert_eq!(frag.clock, 41);
}

#[test]
fn apply_local_at_counter_ceiling_fails_without_changes() {
    let mut store = peer(1);
    store.merge(&fragment(2, MAX_COUNTER, vec![upsert("s1", vec![])]));
    let version = store.version();

    let err = store.apply_local(MutationBatch::new().upsert("s2", EntryKind::Shape, vec![])).expect_err("exhausted");
    assert_eq!(err, ClockExhausted(MAX_COUNTER));
    assert_eq!(store.version(), version);
    assert_eq!(store.clock(), MAX_COUNTER);
    assert!(store.get("s2").is_none());
}

#[test]
fn apply_local_empty_batch_changes_nothing() {
    let mut store = peer(1);
    let frag = store.apply_local(MutationBatch::new()).expect("clock");
    assert!(frag.is_empty());
    assert_eq!(store.version(), 0);
    assert_eq!(store.clock(), 0);
}

#[test]
fn apply_local_as_stamps_given_origin() {
    let mut store = peer(1);
    let conn = Uuid::from_u128(77);
    let frag = store.apply_local_as(conn, MutationBatch::new().upsert("a1", EntryKind::Asset, vec![])).expect("clock");
    assert_eq!(frag.origin, conn);
    assert_eq!(store.get("a1").map(|e| e.kind), Some(EntryKind::Asset));
}

// =============================================================================
// MERGE PROPERTIES
// =============================================================================

#[test]
fn concurrent_creates_converge_to_both_entries() {
    let mut a = peer(1);
    let mut b = peer(2);

    let fa = a.apply_local(MutationBatch::new().upsert("s1", EntryKind::Shape, vec![field("x", "0")])).expect("clock");
    let fb = b.apply_local(MutationBatch::new().upsert("s2", EntryKind::Shape, vec![field("x", "9")])).expect("clock");

    a.merge(&fb);
    b.merge(&fa);

    let ids_a: Vec<_> = a.live_entries().map(|(id, _)| id.to_owned()).collect();
    let ids_b: Vec<_> = b.live_entries().map(|(id, _)| id.to_owned()).collect();
    assert_eq!(ids_a, vec!["s1", "s2"]);
    assert_eq!(ids_a, ids_b);
    assert_eq!(a.snapshot(), b.snapshot());
}

#[test]
fn higher_clock_wins_field_conflict() {
    let from_a = fragment(1, 10, vec![upsert("s1", vec![field("x", "5")])]);
    let from_b = fragment(2, 9, vec![upsert("s1", vec![field("x", "7")])]);

    let mut a = peer(1);
    a.merge(&from_a);
    a.merge(&from_b);

    let mut b = peer(2);
    b.merge(&from_b);
    b.merge(&from_a);

    assert_eq!(a.get("s1").and_then(|e| e.field("x")), Some(&b"5"[..]));
    assert_eq!(a.snapshot(), b.snapshot());
}

#[test]
fn equal_counters_tie_break_on_origin() {
    let low = fragment(1, 5, vec![upsert("s1", vec![field("color", "red")])]);
    let high = fragment(2, 5, vec![upsert("s1", vec![field("color", "blue")])]);

    for order in [[&low, &high], [&high, &low]] {
        let mut store = peer(3);
        for f in order {
            store.merge(f);
        }
        assert_eq!(store.get("s1").and_then(|e| e.field("color")), Some(&b"blue"[..]));
    }
}

#[test]
fn merging_same_fragment_twice_is_idempotent() {
    let frag = fragment(1, 3, vec![upsert("s1", vec![field("x", "1")]), delete("s2")]);
    let mut store = peer(2);

    let first = store.merge(&frag);
    let after_first = store.snapshot();
    let version = store.version();

    let second = store.merge(&frag);
    assert_eq!(first, vec!["s1", "s2"]);
    assert!(second.is_empty());
    assert_eq!(store.snapshot(), after_first);
    assert_eq!(store.version(), version);
}

#[test]
fn every_arrival_order_converges_bit_identically() {
    let frags = [
        fragment(1, 1, vec![upsert("s1", vec![field("x", "1"), field("y", "1")])]),
        fragment(2, 2, vec![upsert("s1", vec![field("x", "2")])]),
        fragment(3, 2, vec![upsert("s1", vec![field("y", "3")]), upsert("b1", vec![field("from", "s1")])]),
        fragment(1, 4, vec![delete("b1")]),
        fragment(2, 3, vec![upsert("b1", vec![field("to", "s9")])]),
    ];
    let orders: [[usize; 5]; 4] = [[0, 1, 2, 3, 4], [4, 3, 2, 1, 0], [2, 0, 4, 1, 3], [3, 4, 0, 2, 1]];

    let encoded: Vec<Vec<u8>> = orders
        .iter()
        .map(|order| {
            let mut store = peer(9);
            for &i in order {
                store.merge(&frags[i]);
            }
            serde_json::to_vec(&store.snapshot()).expect("snapshot serializes")
        })
        .collect();

    assert!(encoded.windows(2).all(|w| w[0] == w[1]));
}

// =============================================================================
// DELETE WINS
// =============================================================================

#[test]
fn delete_wins_over_concurrent_update_in_either_order() {
    let update = fragment(1, 8, vec![upsert("s1", vec![field("x", "5")])]);
    let remove = fragment(2, 6, vec![delete("s1")]);

    let mut a = peer(3);
    a.merge(&update);
    a.merge(&remove);

    let mut b = peer(4);
    b.merge(&remove);
    b.merge(&update);

    assert!(a.is_deleted("s1"));
    assert!(b.is_deleted("s1"));
    assert_eq!(a.snapshot(), b.snapshot());
}

#[test]
fn delayed_create_cannot_resurrect_deleted_entry() {
    let mut store = peer(1);
    store.merge(&fragment(2, 1, vec![upsert("s1", vec![])]));
    store.merge(&fragment(3, 2, vec![delete("s1")]));

    let applied = store.merge(&fragment(4, 50, vec![upsert("s1", vec![field("x", "1")])]));
    assert!(applied.is_empty());
    assert!(store.get("s1").is_none());
    assert_eq!(store.entry_count(), 0);
}

#[test]
fn tombstone_keeps_highest_delete_clock() {
    let mut a = peer(1);
    a.merge(&fragment(2, 3, vec![delete("s1")]));
    a.merge(&fragment(3, 7, vec![delete("s1")]));

    let mut b = peer(1);
    b.merge(&fragment(3, 7, vec![delete("s1")]));
    b.merge(&fragment(2, 3, vec![delete("s1")]));

    assert_eq!(a.snapshot(), b.snapshot());
    let snapshot = a.snapshot();
    let Some(EntryState::Deleted { clock }) = snapshot.entries.get("s1") else {
        panic!("s1 should be a tombstone");
    };
    assert_eq!(clock.counter, 7);
}

// =============================================================================
// SNAPSHOT / HYDRATE
// =============================================================================

#[test]
fn hydrate_snapshot_reproduces_state() {
    let mut original = peer(1);
    original.apply_local(
        MutationBatch::new()
            .upsert("s1", EntryKind::Shape, vec![field("x", "1")])
            .upsert("img", EntryKind::Asset, vec![field("src", "blob:1")])
            .upsert("b1", EntryKind::Binding, vec![field("from", "s1"), field("to", "gone")]),
    ).expect("clock");
    original.apply_local(MutationBatch::new().delete("img")).expect("clock");

    let mut fresh = peer(2);
    fresh.hydrate(original.snapshot());

    assert_eq!(fresh.snapshot(), original.snapshot());
    assert_eq!(fresh.entry_count(), 2);
    assert_eq!(fresh.clock(), original.clock());
    assert_eq!(fresh.get("b1").and_then(|e| e.field("to")), Some(&b"gone"[..]));
    assert!(fresh.is_deleted("img"));
}

#[test]
fn snapshot_is_a_detached_copy() {
    let mut store = peer(1);
    store.apply_local(MutationBatch::new().upsert("s1", EntryKind::Shape, vec![])).expect("clock");
    let snap = store.snapshot();
    store.apply_local(MutationBatch::new().upsert("s2", EntryKind::Shape, vec![])).expect("clock");

    assert_eq!(snap.entry_count(), 1);
    assert_eq!(store.entry_count(), 2);
}

#[test]
fn removed_field_reads_as_absent() {
    let mut store = peer(1);
    store.apply_local(MutationBatch::new().upsert("s1", EntryKind::Shape, vec![field("label", "hi")])).expect("clock");
    store.apply_local(MutationBatch::new().upsert(
        "s1",
        EntryKind::Shape,
        vec![FieldWrite { name: "label".into(), value: None }],
    )).expect("clock");
    assert_eq!(store.get("s1").and_then(|e| e.field("label")), None);
}

#[test]
fn entry_kind_parses_and_displays() {
    assert_eq!("binding".parse::<EntryKind>(), Ok(EntryKind::Binding));
    assert!("sticky".parse::<EntryKind>().is_err());
    assert_eq!(EntryKind::Asset.to_string(), "asset");
}
