use super::*;
use crate::doc::codec::{FieldWrite, MutationBatch};
use crate::doc::snapshot::FORMAT_LEGACY_OBJECTS;
use crate::doc::store::{DocStore, EntryKind};
use crate::services::snapshot_store::MemorySnapshotStore;
use crate::state::test_helpers::FlakyStore;

fn config() -> FlushConfig {
    FlushConfig {
        quiet: Duration::from_secs(2),
        max_staleness: Duration::from_secs(30),
        retry_base: Duration::from_millis(500),
        retry_max: Duration::from_secs(30),
    }
}

fn sample_snapshot() -> DocSnapshot {
    let mut store = DocStore::new(Uuid::new_v4());
    store.apply_local(
        MutationBatch::new()
            .upsert("s1", EntryKind::Shape, vec![FieldWrite { name: "x".into(), value: Some(b"1".to_vec()) }])
            .upsert("s2", EntryKind::Shape, vec![]),
    ).expect("clock");
    store.apply_local(MutationBatch::new().delete("s2")).expect("clock");
    store.snapshot()
}

// =============================================================================
// SCHEDULE
// =============================================================================

#[test]
fn clean_schedule_has_nothing_due() {
    let schedule = FlushSchedule::new(config());
    assert!(!schedule.is_dirty());
    assert_eq!(schedule.due_at(), None);
}

#[test]
fn single_edit_flushes_after_quiet_interval() {
    let t0 = Instant::now();
    let mut schedule = FlushSchedule::new(config());
    schedule.mark_dirty(t0);
    assert_eq!(schedule.due_at(), Some(t0 + Duration::from_secs(2)));
}

#[test]
fn each_edit_pushes_quiet_deadline_but_not_past_staleness() {
    let t0 = Instant::now();
    let mut schedule = FlushSchedule::new(config());
    schedule.mark_dirty(t0);

    schedule.mark_dirty(t0 + Duration::from_secs(1));
    assert_eq!(schedule.due_at(), Some(t0 + Duration::from_secs(3)));

    schedule.mark_dirty(t0 + Duration::from_secs(29));
    assert_eq!(schedule.due_at(), Some(t0 + Duration::from_secs(30)));
}

#[test]
fn nothing_due_while_write_in_flight() {
    let t0 = Instant::now();
    let mut schedule = FlushSchedule::new(config());
    schedule.mark_dirty(t0);
    schedule.begin();

    assert!(schedule.in_flight());
    assert!(schedule.is_dirty());
    schedule.mark_dirty(t0 + Duration::from_secs(1));
    assert_eq!(schedule.due_at(), None);
}

#[test]
fn success_without_later_edits_clears_dirty() {
    let t0 = Instant::now();
    let mut schedule = FlushSchedule::new(config());
    schedule.mark_dirty(t0);
    schedule.begin();
    schedule.succeeded(false, t0 + Duration::from_secs(3));

    assert!(!schedule.is_dirty());
    assert_eq!(schedule.due_at(), None);
}

#[test]
fn success_with_later_edits_stays_dirty() {
    let t0 = Instant::now();
    let mut schedule = FlushSchedule::new(config());
    schedule.mark_dirty(t0);
    schedule.begin();
    let t1 = t0 + Duration::from_secs(3);
    schedule.mark_dirty(t1);
    schedule.succeeded(true, t1);

    assert!(schedule.is_dirty());
    assert_eq!(schedule.due_at(), Some(t1 + Duration::from_secs(2)));
}

#[test]
fn failure_schedules_retry_and_keeps_oldest_edit() {
    let t0 = Instant::now();
    let mut schedule = FlushSchedule::new(config());
    schedule.mark_dirty(t0);
    schedule.begin();

    let t1 = t0 + Duration::from_secs(2);
    schedule.failed(t1, 0.0);
    assert_eq!(schedule.failures(), 1);
    assert!(schedule.is_dirty());
    assert_eq!(schedule.due_at(), Some(t1 + Duration::from_millis(250)));

    // New edits do not pull the retry earlier.
    schedule.mark_dirty(t1 + Duration::from_millis(10));
    assert_eq!(schedule.due_at(), Some(t1 + Duration::from_millis(250)));
}

#[test]
fn backoff_grows_and_caps() {
    let t0 = Instant::now();
    let mut schedule = FlushSchedule::new(config());
    schedule.mark_dirty(t0);

    let mut delays = Vec::new();
    for _ in 0..10 {
        schedule.begin();
        schedule.failed(t0, 0.999_999);
        delays.push(schedule.backoff(0.999_999));
    }
    assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    assert!(delays[0] < Duration::from_millis(500));
    assert!(*delays.last().expect("ten delays") <= Duration::from_secs(30));
}

#[test]
fn success_resets_backoff() {
    let t0 = Instant::now();
    let mut schedule = FlushSchedule::new(config());
    schedule.mark_dirty(t0);
    schedule.begin();
    schedule.failed(t0, 0.5);
    schedule.begin();
    schedule.succeeded(false, t0);
    assert_eq!(schedule.failures(), 0);

    schedule.mark_dirty(t0);
    assert_eq!(schedule.due_at(), Some(t0 + Duration::from_secs(2)));
}

// =============================================================================
// WRITE
// =============================================================================

#[tokio::test]
async fn write_snapshot_stores_current_format_with_entry_count() {
    let store = MemorySnapshotStore::new();
    let board_id = Uuid::new_v4();
    let snap = sample_snapshot();

    let stats = write_snapshot(&store, board_id, &snap).await.expect("flush");
    assert_eq!(stats.entry_count, 1);
    assert!(stats.flushed_at > 0);

    let row = store.get(board_id).await.expect("get").expect("row");
    assert_eq!(row.format, FORMAT_CURRENT);
    assert_eq!(snapshot::decode_snapshot(row.format, &row.data).expect("decode"), snap);
}

#[tokio::test]
async fn failed_write_keeps_previous_copy() {
    let store = FlakyStore::new();
    let board_id = Uuid::new_v4();
    let first = sample_snapshot();
    write_snapshot(&store, board_id, &first).await.expect("first flush");

    store.fail_next_puts(1);
    let err = write_snapshot(&store, board_id, &DocSnapshot::default())
        .await
        .expect_err("second flush fails");
    assert_eq!(crate::frame::ErrorCode::error_code(&err), "E_FLUSH_FAILURE");

    let row = store.get(board_id).await.expect("get").expect("row");
    assert_eq!(snapshot::decode_snapshot(row.format, &row.data).expect("decode"), first);
}

// =============================================================================
// HYDRATION
// =============================================================================

#[tokio::test]
async fn missing_row_hydrates_empty() {
    let store = MemorySnapshotStore::new();
    let hydrated = load_for_hydration(&store, Uuid::new_v4(), Duration::from_secs(1))
        .await
        .expect("load");
    assert_eq!(hydrated.snapshot, DocSnapshot::default());
    assert!(hydrated.stats.is_none());
    assert!(!hydrated.migrated);
}

#[tokio::test]
async fn stored_row_hydrates_with_stats() {
    let store = MemorySnapshotStore::new();
    let board_id = Uuid::new_v4();
    let snap = sample_snapshot();
    let stats = write_snapshot(&store, board_id, &snap).await.expect("flush");

    let hydrated = load_for_hydration(&store, board_id, Duration::from_secs(1))
        .await
        .expect("load");
    assert_eq!(hydrated.snapshot, snap);
    assert_eq!(hydrated.stats, Some(stats));
}

#[tokio::test]
async fn legacy_row_is_migrated_and_flagged() {
    let store = MemorySnapshotStore::new();
    let board_id = Uuid::new_v4();
    let legacy = serde_json::json!({"objects": [{"id": "n1", "kind": "sticky_note", "props": {"text": "hi"}}]});
    store.insert(
        board_id,
        StoredSnapshot {
            format: FORMAT_LEGACY_OBJECTS,
            data: serde_json::to_vec(&legacy).expect("json"),
            entry_count: 1,
            flushed_at: 5,
        },
    );

    let hydrated = load_for_hydration(&store, board_id, Duration::from_secs(1))
        .await
        .expect("load");
    assert!(hydrated.migrated);
    assert_eq!(hydrated.snapshot.entry_count(), 1);
}

#[tokio::test]
async fn corrupt_row_hydrates_empty_and_is_quarantined() {
    let store = MemorySnapshotStore::new();
    let board_id = Uuid::new_v4();
    let bad = StoredSnapshot { format: FORMAT_CURRENT, data: b"{truncated".to_vec(), entry_count: 9, flushed_at: 1 };
    store.insert(board_id, bad.clone());

    let hydrated = load_for_hydration(&store, board_id, Duration::from_secs(1))
        .await
        .expect("corrupt data is not a join failure");
    assert_eq!(hydrated.snapshot, DocSnapshot::default());

    let quarantined = store.quarantined();
    assert_eq!(quarantined.len(), 1);
    assert_eq!(quarantined[0].1, bad);
}

#[tokio::test]
async fn unreachable_store_fails_hydration() {
    let store = FlakyStore::new();
    store.set_gets_failing(true);

    let err = load_for_hydration(&store, Uuid::new_v4(), Duration::from_secs(1))
        .await
        .expect_err("store down");
    assert!(matches!(err, HydrationError::Unavailable(_)));
    assert_eq!(crate::frame::ErrorCode::error_code(&err), "E_HYDRATION_FAILURE");
}

#[tokio::test(start_paused = true)]
async fn slow_store_times_out() {
    let store = FlakyStore::new();
    store.set_get_delay(Duration::from_secs(60));

    let err = load_for_hydration(&store, Uuid::new_v4(), Duration::from_secs(5))
        .await
        .expect_err("too slow");
    assert!(matches!(err, HydrationError::TimedOut(d) if d == Duration::from_secs(5)));
}
