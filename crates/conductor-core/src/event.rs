use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// Lifecycle notifications emitted by the engine for its host to observe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum Event {
    /// An agent became active.
    #[serde(rename = "agent:deployed")]
    AgentDeployed {
        /// Agent name.
        agent: String,
        /// When the deployment was created.
        deployed_at: DateTime<Utc>,
    },
    /// A deployment was removed.
    #[serde(rename = "agent:stopped")]
    AgentStopped {
        /// Agent name.
        agent: String,
    },
    /// A dispatch began.
    #[serde(rename = "agent:execution:start")]
    ExecutionStarted {
        /// Execution id.
        execution_id: Uuid,
        /// Agent name.
        agent: String,
        /// Requested task.
        task: String,
    },
    /// A dispatch settled successfully.
    #[serde(rename = "agent:execution:complete")]
    ExecutionCompleted {
        /// Execution id.
        execution_id: Uuid,
        /// Agent name.
        agent: String,
        /// Requested task.
        task: String,
        /// Wall-clock duration.
        duration_ms: u64,
        /// Task output.
        output: serde_json::Value,
    },
    /// A dispatch failed.
    #[serde(rename = "agent:execution:error")]
    ExecutionFailed {
        /// Execution id.
        execution_id: Uuid,
        /// Agent name.
        agent: String,
        /// Requested task.
        task: String,
        /// Wall-clock duration.
        duration_ms: u64,
        /// Rendered error.
        error: String,
    },
    /// A cross-agent workflow run completed.
    #[serde(rename = "workflow:complete")]
    WorkflowCompleted {
        /// Workflow run id.
        workflow_id: Uuid,
        /// Wall-clock duration.
        duration_ms: u64,
        /// Per-step results keyed by step key.
        results: serde_json::Map<String, serde_json::Value>,
    },
    /// A cross-agent workflow run failed.
    #[serde(rename = "workflow:error")]
    WorkflowFailed {
        /// Workflow run id.
        workflow_id: Uuid,
        /// Rendered error.
        error: String,
    },
    /// A shared context key was written or removed.
    #[serde(rename = "context:update")]
    ContextUpdated {
        /// Context key.
        key: String,
        /// New value, `None` when the key was removed.
        value: Option<serde_json::Value>,
    },
}

impl Event {
    /// The wire name of the event, e.g. `agent:execution:start`.
    pub fn name(&self) -> &'static str {
        match self {
            Event::AgentDeployed { .. } => "agent:deployed",
            Event::AgentStopped { .. } => "agent:stopped",
            Event::ExecutionStarted { .. } => "agent:execution:start",
            Event::ExecutionCompleted { .. } => "agent:execution:complete",
            Event::ExecutionFailed { .. } => "agent:execution:error",
            Event::WorkflowCompleted { .. } => "workflow:complete",
            Event::WorkflowFailed { .. } => "workflow:error",
            Event::ContextUpdated { .. } => "context:update",
        }
    }
}

/// Bounded fan-out of [`Event`]s to any number of host subscribers.
///
/// Slow subscribers lag and lose the oldest events rather than blocking the
/// engine. Emitting with no subscribers is not an error.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus retaining at most `capacity` undelivered events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to all events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publish an event.
    pub fn emit(&self, event: Event) {
        let name = event.name();
        if self.tx.send(event).is_err() {
            debug!(event = name, "No event subscribers");
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_match_serde_tags() {
        let event = Event::AgentStopped {
            agent: "builder".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], event.name());
        assert_eq!(json["agent"], "builder");
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(4);
        bus.emit(Event::AgentStopped { agent: "x".into() });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        bus.emit(Event::ContextUpdated {
            key: "current_feature".into(),
            value: Some(serde_json::json!("auth")),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "context:update");
    }
}
