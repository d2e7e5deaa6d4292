#![allow(clippy::unwrap_used, clippy::expect_used)]

use colony_core::*;
use serde_json::json;

// ---------------------------------------------------------------------------
// 1. Wire JSON -> admitted task
// ---------------------------------------------------------------------------

#[test]
fn wire_json_admits_into_typed_task() {
    let request: TaskRequest = serde_json::from_value(json!({
        "action": "mine",
        "details": "stone",
        "target": {"x": 10, "y": 64, "z": 5, "dimension": "overworld"},
        "metadata": {"resource": "stone", "hazards": ["lava"]},
        "priority": "high",
        "sender": "dashboard"
    }))
    .unwrap();

    let task = Task::admit(request).unwrap();
    assert_eq!(task.action, TaskAction::Mine);
    assert_eq!(task.priority, Priority::High);
    assert_eq!(task.sender, "dashboard");
    assert_eq!(
        task.target.as_ref().unwrap().dimension.as_deref(),
        Some("overworld")
    );
    assert_eq!(
        task.spec,
        ActionSpec::Mine {
            resource: "stone".into(),
            hazards: vec!["lava".into()],
            quantity: None,
        }
    );
}

// ---------------------------------------------------------------------------
// 2. Every action has a role preference and a minimal valid form
// ---------------------------------------------------------------------------

#[test]
fn every_action_has_default_roles() {
    for action in TaskAction::ALL {
        assert!(!action.default_roles().is_empty(), "{action} has no roles");
    }
}

#[test]
fn minimal_requests_per_action() {
    let cases = vec![
        ("build", json!({})),
        ("mine", json!({"resource": "coal", "hazards": []})),
        ("explore", json!({"radius": 32})),
        ("gather", json!({"resource": "wood"})),
        ("guard", json!({"radius": 8, "durationSecs": 60})),
        ("craft", json!({"output": "torch", "recipe": ["coal", "stick"]})),
        ("interact", json!({"entity": "villager"})),
        ("combat", json!({"target": "zombie", "style": "melee"})),
        ("support", json!({})),
        ("deliver", json!({"item": "bread", "recipient": "alex"})),
    ];
    for (action, metadata) in cases {
        let request: TaskRequest = serde_json::from_value(json!({
            "action": action,
            "details": format!("do {action}"),
            "metadata": metadata,
        }))
        .unwrap();
        let result = validate(&request);
        assert!(result.valid, "{action}: {:?}", result.errors);
    }
}

// ---------------------------------------------------------------------------
// 3. Rejection surfaces the enumerated error list
// ---------------------------------------------------------------------------

#[test]
fn rejection_carries_every_error() {
    let err = TaskRequest::new("deliver", "")
        .with_metadata("quantity", json!(-1))
        .admit()
        .unwrap_err();
    match err {
        ColonyError::ValidationFailed { errors } => {
            assert_eq!(errors.len(), 3, "{errors:?}");
        }
        other => panic!("unexpected error {other:?}"),
    }
}
