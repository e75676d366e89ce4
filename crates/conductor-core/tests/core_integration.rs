#![allow(clippy::unwrap_used, clippy::expect_used)]

use conductor_core::*;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// 1. Error Display and From impls
// ---------------------------------------------------------------------------

#[test]
fn error_display_and_from_impls() {
    let already = ConductorError::AlreadyDeployed("code-reviewer".to_string());
    assert_eq!(already.to_string(), "Agent code-reviewer is already deployed");

    let not_deployed = ConductorError::NotDeployed("builder".to_string());
    assert_eq!(not_deployed.to_string(), "Agent builder is not deployed");

    let timeout = ConductorError::Timeout {
        agent: "builder".to_string(),
        task: "compile".to_string(),
        timeout_ms: 250,
    };
    assert_eq!(
        timeout.to_string(),
        "Task compile on agent builder timed out after 250ms"
    );

    let exec = ConductorError::Execution("backend exploded".to_string());
    assert_eq!(exec.to_string(), "Execution error: backend exploded");

    let limit = ConductorError::DeploymentLimit {
        agent: "tester".to_string(),
        limit: 2,
    };
    assert_eq!(
        limit.to_string(),
        "Cannot deploy tester: 2 agents are already deployed"
    );

    // From<serde_json::Error> conversion
    let serde_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
    let err: ConductorError = serde_err.into();
    assert!(err.to_string().starts_with("JSON error:"));

    // From<std::io::Error> conversion
    let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
    let err: ConductorError = io_err.into();
    assert!(err.to_string().starts_with("IO error:"));
}

// ---------------------------------------------------------------------------
// 2. Event wire names survive a serde roundtrip
// ---------------------------------------------------------------------------

#[test]
fn event_serialization_uses_colon_names() {
    let execution_id = Uuid::new_v4();
    let event = Event::ExecutionFailed {
        execution_id,
        agent: "tester".to_string(),
        task: "run".to_string(),
        duration_ms: 12,
        error: "boom".to_string(),
    };

    let json = serde_json::to_string(&event).unwrap();
    assert!(json.contains("\"event\":\"agent:execution:error\""));

    let parsed: Event = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, event);
    assert_eq!(parsed.name(), "agent:execution:error");
}

// ---------------------------------------------------------------------------
// 3. Every subscriber sees every event, in emission order
// ---------------------------------------------------------------------------

#[tokio::test]
async fn event_bus_fans_out_in_order() {
    let bus = EventBus::new(16);
    let mut first = bus.subscribe();
    let mut second = bus.subscribe();
    assert_eq!(bus.subscriber_count(), 2);

    bus.emit(Event::AgentDeployed {
        agent: "a".to_string(),
        deployed_at: chrono::Utc::now(),
    });
    bus.emit(Event::AgentStopped {
        agent: "a".to_string(),
    });

    for rx in [&mut first, &mut second] {
        assert_eq!(rx.recv().await.unwrap().name(), "agent:deployed");
        assert_eq!(rx.recv().await.unwrap().name(), "agent:stopped");
    }
}
