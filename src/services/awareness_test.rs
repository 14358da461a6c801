use super::*;

fn cursor(x: f64, y: f64) -> AwarenessState {
    AwarenessState { cursor: Some(Cursor { x, y }), ..AwarenessState::default() }
}

fn data(value: serde_json::Value) -> Data {
    match value {
        serde_json::Value::Object(map) => map.into_iter().collect(),
        _ => panic!("expected object"),
    }
}

#[test]
fn update_replaces_previous_state() {
    let mut table = AwarenessTable::new(Duration::from_secs(30));
    let client = Uuid::new_v4();
    let now = Instant::now();

    table.update(client, Uuid::new_v4(), cursor(1.0, 1.0), now);
    table.update(client, Uuid::new_v4(), cursor(5.0, 6.0), now);

    assert_eq!(table.len(), 1);
    assert_eq!(table.get(client), Some(&cursor(5.0, 6.0)));
}

#[test]
fn remove_reports_presence() {
    let mut table = AwarenessTable::new(Duration::from_secs(30));
    let client = Uuid::new_v4();
    table.update(client, Uuid::new_v4(), cursor(0.0, 0.0), Instant::now());

    assert!(table.remove(client));
    assert!(!table.remove(client));
    assert!(table.is_empty());
}

#[test]
fn sweep_retracts_only_stale_entries() {
    let mut table = AwarenessTable::new(Duration::from_secs(30));
    let stale = Uuid::new_v4();
    let fresh = Uuid::new_v4();
    let t0 = Instant::now();

    table.update(stale, Uuid::new_v4(), cursor(0.0, 0.0), t0);
    table.update(fresh, Uuid::new_v4(), cursor(0.0, 0.0), t0 + Duration::from_secs(20));

    assert!(table.sweep(t0 + Duration::from_secs(29)).is_empty());
    assert_eq!(table.sweep(t0 + Duration::from_secs(30)), vec![stale]);
    assert!(table.get(fresh).is_some());
    assert_eq!(table.sweep(t0 + Duration::from_secs(50)), vec![fresh]);
}

#[test]
fn refresh_postpones_expiry() {
    let mut table = AwarenessTable::new(Duration::from_secs(30));
    let client = Uuid::new_v4();
    let user = Uuid::new_v4();
    let t0 = Instant::now();

    table.update(client, user, cursor(0.0, 0.0), t0);
    table.update(client, user, cursor(1.0, 0.0), t0 + Duration::from_secs(25));
    assert!(table.sweep(t0 + Duration::from_secs(40)).is_empty());
}

#[test]
fn states_except_skips_requester() {
    let mut table = AwarenessTable::new(Duration::from_secs(30));
    let me = Uuid::new_v4();
    let peer = Uuid::new_v4();
    let now = Instant::now();
    table.update(me, Uuid::new_v4(), cursor(0.0, 0.0), now);
    table.update(peer, Uuid::new_v4(), cursor(2.0, 3.0), now);

    let states = table.states_except(me);
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].get("client_id"), Some(&serde_json::json!(peer)));
    assert_eq!(states[0]["state"]["cursor"]["x"], serde_json::json!(2.0));
}

#[test]
fn from_data_parses_full_state() {
    let state = AwarenessState::from_data(&data(serde_json::json!({
        "cursor": {"x": 10.5, "y": -3.0},
        "selection": ["s1", "s2"],
        "label": "Ada",
        "color": "#ff0000"
    })))
    .expect("valid");

    assert_eq!(state.cursor, Some(Cursor { x: 10.5, y: -3.0 }));
    assert_eq!(state.selection, vec!["s1", "s2"]);
    assert_eq!(state.label.as_deref(), Some("Ada"));
}

#[test]
fn from_data_accepts_empty_state() {
    let state = AwarenessState::from_data(&Data::new()).expect("valid");
    assert_eq!(state, AwarenessState::default());
}

#[test]
fn from_data_rejects_bad_shapes_and_sizes() {
    assert!(matches!(
        AwarenessState::from_data(&data(serde_json::json!({"cursor": "here"}))),
        Err(AwarenessError::Invalid(_))
    ));
    assert!(matches!(
        AwarenessState::from_data(&data(serde_json::json!({"label": "x".repeat(65)}))),
        Err(AwarenessError::LabelTooLong)
    ));
    let selection: Vec<String> = (0..1001).map(|i| format!("s{i}")).collect();
    assert!(matches!(
        AwarenessState::from_data(&data(serde_json::json!({"selection": selection}))),
        Err(AwarenessError::SelectionTooLarge)
    ));
}
