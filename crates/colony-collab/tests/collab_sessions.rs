#![allow(clippy::unwrap_used, clippy::expect_used)]

use colony_collab::{
    Assignment, CollabEvent, CollaborationEngine, NewSession, Participant, SessionSnapshot,
    SessionStatus,
};
use colony_core::{collab_events, ClusterBroadcast};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Records every cluster event instead of sending it.
#[derive(Default)]
struct RecordingCluster {
    sent: Mutex<Vec<(String, Value)>>,
}

impl RecordingCluster {
    fn types(&self) -> Vec<String> {
        self.sent.lock().iter().map(|(t, _)| t.clone()).collect()
    }
}

impl ClusterBroadcast for RecordingCluster {
    fn broadcast_cluster_event(&self, event_type: &str, payload: Value) -> usize {
        self.sent.lock().push((event_type.to_string(), payload));
        1
    }
}

fn engine() -> (CollaborationEngine, Arc<RecordingCluster>) {
    let cluster = Arc::new(RecordingCluster::default());
    let engine = CollaborationEngine::new().with_cluster(cluster.clone());
    (engine, cluster)
}

fn work_area(x0: i64, x1: i64) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert(
        "workArea".into(),
        json!({"start": {"x": x0, "y": 64, "z": 0}, "end": {"x": x1, "y": 64, "z": 0}}),
    );
    metadata
}

fn x_range(assignments: &BTreeMap<String, Assignment>, agent: &str) -> (f64, f64) {
    let area = assignments[agent].area.unwrap();
    (area.start.x, area.end.x)
}

// ---------------------------------------------------------------------------
// Partitioning
// ---------------------------------------------------------------------------

#[test]
fn test_spatial_partition_covers_area_in_participant_order() {
    let (engine, _) = engine();
    let session = engine.create_session(NewSession {
        participants: vec![
            Participant::new("steve", "builder"),
            Participant::new("alex", "builder"),
            Participant::new("nova", "builder"),
        ],
        metadata: work_area(0, 8),
        ..Default::default()
    });

    let assignments = engine.allocate_work(session.id, &Map::new()).unwrap();
    assert_eq!(x_range(&assignments, "steve"), (0.0, 2.0));
    assert_eq!(x_range(&assignments, "alex"), (3.0, 5.0));
    assert_eq!(x_range(&assignments, "nova"), (6.0, 8.0));

    let stored = engine.get(session.id).unwrap();
    for participant in &stored.participants {
        assert_eq!(
            participant.assignment.as_ref(),
            stored.assignments.get(&participant.agent_id)
        );
    }
}

#[test]
fn test_allocation_overwrites_previous_assignments() {
    let (engine, _) = engine();
    let session = engine.create_session(NewSession {
        participants: vec![Participant::new("a", "builder"), Participant::new("b", "builder")],
        metadata: work_area(0, 9),
        ..Default::default()
    });
    engine.allocate_work(session.id, &Map::new()).unwrap();
    engine.remove_participant(session.id, "b").unwrap();
    let assignments = engine.allocate_work(session.id, &Map::new()).unwrap();
    assert_eq!(assignments.len(), 1);
    assert_eq!(x_range(&assignments, "a"), (0.0, 9.0));
}

#[test]
fn test_per_session_partitioner_override() {
    let (engine, _) = engine();
    let session = engine.create_session(NewSession {
        participants: vec![Participant::new("a", "miner"), Participant::new("b", "miner")],
        metadata: work_area(0, 8),
        ..Default::default()
    });
    let other = engine.create_session(NewSession {
        participants: vec![Participant::new("c", "miner")],
        metadata: work_area(0, 8),
        ..Default::default()
    });

    let by_role = |session: &SessionSnapshot, _: &Map<String, Value>| {
        session
            .participants
            .iter()
            .map(|p| {
                let mut assignment = Assignment::slot(0);
                assignment.details.insert("role".into(), json!(p.role));
                (p.agent_id.clone(), assignment)
            })
            .collect::<BTreeMap<_, _>>()
    };
    engine
        .set_session_partitioner(session.id, Arc::new(by_role))
        .unwrap();

    let custom = engine.allocate_work(session.id, &Map::new()).unwrap();
    assert!(custom.values().all(|a| a.area.is_none() && a.details["role"] == "miner"));

    let default = engine.allocate_work(other.id, &Map::new()).unwrap();
    assert_eq!(x_range(&default, "c"), (0.0, 8.0));
}

// ---------------------------------------------------------------------------
// Lifecycle and broadcasts
// ---------------------------------------------------------------------------

#[test]
fn test_every_mutation_is_broadcast() {
    let (engine, cluster) = engine();
    let session = engine.create_session(NewSession {
        plan: Some(json!({"steps": ["dig", "build"]})),
        ..Default::default()
    });
    engine
        .add_participant(session.id, Participant::new("a", "builder"))
        .unwrap();
    engine.allocate_work(session.id, &Map::new()).unwrap();
    engine.update_progress(session.id, "a", 60, None).unwrap();
    engine.remove_participant(session.id, "a").unwrap();
    engine.complete_session(session.id, None).unwrap();

    assert_eq!(
        cluster.types(),
        vec![
            collab_events::SESSION_CREATED,
            collab_events::PARTICIPANT_ADDED,
            collab_events::ASSIGNMENTS_UPDATED,
            collab_events::PROGRESS_UPDATED,
            collab_events::PARTICIPANT_REMOVED,
            collab_events::SESSION_COMPLETED,
        ]
    );
    let sent = cluster.sent.lock();
    assert_eq!(sent[0].1["plan"]["steps"][1], "build");
    assert_eq!(sent[3].1["progress"], 60);
    assert_eq!(sent[3].1["agentId"], "a");
}

#[test]
fn test_removing_absent_participant_is_silent() {
    let (engine, cluster) = engine();
    let session = engine.create_session(NewSession::default());
    assert!(engine.remove_participant(session.id, "nobody").unwrap().is_none());
    assert_eq!(cluster.types(), vec![collab_events::SESSION_CREATED]);
}

#[test]
fn test_plan_is_copied() {
    let (engine, _) = engine();
    let mut plan = json!({"steps": ["a"]});
    let session = engine.create_session(NewSession {
        plan: Some(plan.clone()),
        ..Default::default()
    });
    plan["steps"] = json!([]);
    assert_eq!(engine.get(session.id).unwrap().plan.unwrap()["steps"][0], "a");
}

#[test]
fn test_session_progress_and_completion() {
    let (engine, _) = engine();
    let session = engine.create_session(NewSession {
        participants: vec![Participant::new("a", "miner"), Participant::new("b", "miner")],
        ..Default::default()
    });
    engine.update_progress(session.id, "a", 100, None).unwrap();
    engine.update_progress(session.id, "b", 20, None).unwrap();
    assert!((engine.get(session.id).unwrap().progress() - 60.0).abs() < f64::EPSILON);

    let mut meta = Map::new();
    meta.insert("outcome".into(), json!("partial"));
    let done = engine.complete_session(session.id, Some(meta)).unwrap();
    assert_eq!(done.status, SessionStatus::Completed);
    assert_eq!(done.metadata["outcome"], "partial");
    // Completed sessions are kept.
    assert_eq!(engine.list_sessions().len(), 1);
}

#[tokio::test]
async fn test_remote_events_do_not_touch_local_sessions() {
    let (engine, cluster) = engine();
    let session = engine.create_session(NewSession::default());
    let mut events = engine.subscribe();

    engine.observe_remote(
        collab_events::SESSION_COMPLETED,
        Some("node-b".to_string()),
        json!({"sessionId": session.id}),
    );

    match events.recv().await.unwrap() {
        CollabEvent::RemoteObserved { event_type, from, .. } => {
            assert_eq!(event_type, collab_events::SESSION_COMPLETED);
            assert_eq!(from.as_deref(), Some("node-b"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(engine.get(session.id).unwrap().is_active());
    assert_eq!(cluster.types().len(), 1);
}

#[test]
fn test_engine_without_cluster_still_works() {
    let engine = CollaborationEngine::new();
    let session = engine.create_session(NewSession {
        participants: vec![Participant::new("a", "scout")],
        ..Default::default()
    });
    let assignments = engine.allocate_work(session.id, &Map::new()).unwrap();
    assert_eq!(assignments["a"], Assignment::slot(0));
}
