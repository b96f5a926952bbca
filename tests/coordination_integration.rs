//! Agent lifecycle, messaging, and reservations as one coordination flow,
//! plus replay parity for the coordination projections.

use hive::HiveError;
use hive::model::DecisionType;
use hive::store::HiveStore;
use hive::store::coordination::NewDecision;

#[test]
fn a_small_fleet_coordinates_through_the_store() {
    let store = HiveStore::open_memory().unwrap();

    store
        .register_agent("/repo", "coordinator", Some("claude-code"), Some("opus"))
        .unwrap();
    store
        .register_agent("/repo", "builder-1", Some("claude-code"), Some("sonnet"))
        .unwrap();
    assert_eq!(store.list_agents("/repo").unwrap().len(), 2);

    // The coordinator parcels out work and reserves nothing itself.
    let lease = store
        .reserve("/repo", "builder-1", "src/parser/**", 900)
        .unwrap();
    let err = store
        .reserve("/repo", "coordinator", "src/**", 900)
        .unwrap_err();
    assert!(matches!(err, HiveError::ReservationConflict { .. }));

    let message = store
        .send_message(
            "/repo",
            "coordinator",
            &["builder-1".into()],
            Some("assignment"),
            "take the parser rewrite; everything else is reserved",
        )
        .unwrap();

    let decision = NewDecision::new(
        DecisionType::WorkerSpawn,
        "coordinator",
        serde_json::json!({ "worker": "builder-1", "scope": "src/parser" }),
    );
    store.record_decision("/repo", decision).unwrap();

    // The worker reads its inbox and acknowledges.
    let inbox = store
        .list_messages("/repo", Some("builder-1"), true)
        .unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].subject.as_deref(), Some("assignment"));
    store
        .mark_message_read("/repo", message.id, "builder-1")
        .unwrap();
    assert!(store
        .list_messages("/repo", Some("builder-1"), true)
        .unwrap()
        .is_empty());

    // Work done: release the lease, record the trace trail.
    store.release_reservation("/repo", lease.id).unwrap();
    assert!(store.list_reservations("/repo", true).unwrap().is_empty());
    assert_eq!(store.list_decisions("/repo", None).unwrap().len(), 1);
}

#[test]
fn coordination_projections_survive_replay() {
    let store = HiveStore::open_memory().unwrap();
    store
        .register_agent("/repo", "builder-1", None, None)
        .unwrap();
    let message = store
        .send_message("/repo", "builder-1", &["*".into()], None, "checkpoint")
        .unwrap();
    store
        .mark_message_read("/repo", message.id, "builder-2")
        .unwrap();
    store.reserve("/repo", "builder-1", "docs/**", 3600).unwrap();

    store.replay("/repo", true).unwrap();

    assert_eq!(store.list_agents("/repo").unwrap().len(), 1);
    let messages = store.list_messages("/repo", None, false).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].read_by, vec!["builder-2"]);
    assert_eq!(store.list_reservations("/repo", true).unwrap().len(), 1);
}
