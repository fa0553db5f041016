use pipetrace::event::{AspirationEvent, DispensingEvent};
use pipetrace::{
    CheckpointStore, EventBatch, EventKind, ExperimentState, LabEvent, Reagent, ReplayEngine, StateError,
    TimelineEvent,
};
use serde_json::json;
use tempfile::TempDir;

fn transfer(start: u32, reagent: &str, well: &str) -> Vec<TimelineEvent> {
    vec![
        TimelineEvent::from_event(LabEvent::Aspiration(AspirationEvent {
            thinking: String::new(),
            timestamp_range: format!("0:{:02}", start),
            reagent_name: reagent.to_string(),
            volume_ul: 25.0,
            source_container: "TUBE".to_string(),
        }))
        .unwrap(),
        TimelineEvent::from_event(LabEvent::Dispensing(DispensingEvent {
            thinking: String::new(),
            timestamp_range: format!("0:{:02}", start + 1),
            reagent: Reagent::new(reagent, 25.0),
            volume_ul: 25.0,
            destination_well: well.to_string(),
        }))
        .unwrap(),
    ]
}

#[test]
fn test_resume_from_checkpoint_matches_single_pass() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::open(dir.path()).unwrap();
    let engine = ReplayEngine::default();

    let first = transfer(1, "Reagent A", "A1");
    let second = transfer(5, "Reagent A", "A2");

    let after_first = engine.replay(ExperimentState::new("resume"), &first).unwrap().final_state;
    store.save(0, &after_first).unwrap();

    let resumed = store.load_latest_before(1).unwrap().unwrap();
    let resumed_state = engine.replay(resumed.state, &second).unwrap().final_state;

    let all: Vec<TimelineEvent> = first.into_iter().chain(second).collect();
    let single_pass = engine.replay(ExperimentState::new("resume"), &all).unwrap().final_state;

    assert_eq!(resumed_state, single_pass);
}

#[test]
fn test_rounds_with_checkpoints() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::open(dir.path().join("cache")).unwrap();
    let engine = ReplayEngine::default();

    let rounds = vec![
        vec![EventBatch::new(
            "aspirations",
            Some(EventKind::Aspiration),
            vec![json!({"timestamp_range": "0:01", "reagent_name": "Reagent A", "volume_ul": 10.0})],
        )],
        vec![EventBatch::new(
            "dispensing",
            Some(EventKind::Dispensing),
            vec![json!({"timestamp_range": "0:02", "reagent_name": "Reagent A", "destination_well": "C1"})],
        )],
    ];

    for (index, batches) in rounds.iter().enumerate() {
        let state = match store.load_latest_before(index).unwrap() {
            Some(checkpoint) => checkpoint.state,
            None => ExperimentState::new("rounds"),
        };
        let round = engine.process_round(state, None, batches).unwrap();
        store.save(index, &round.state).unwrap();
    }

    let last = store.load(1).unwrap().unwrap();
    assert_eq!(last.state.wells["C1"].total_volume_ul, 10.0);
    assert_eq!(store.indices().unwrap(), vec![0, 1]);
}

#[test]
fn test_missing_and_tampered_checkpoints() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::open(dir.path()).unwrap();
    assert!(store.load(4).unwrap().is_none());

    let state = ExperimentState::new("tamper");
    store.save(4, &state).unwrap();

    let path = store.path_for(4);
    let mut document: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    document["state"]["events_applied"] = json!(99);
    std::fs::write(&path, document.to_string()).unwrap();

    assert!(matches!(store.load(4), Err(StateError::CheckpointMismatch { .. })));

    std::fs::write(&path, "not json").unwrap();
    assert!(matches!(store.load(4), Err(StateError::CheckpointError { .. })));
}
